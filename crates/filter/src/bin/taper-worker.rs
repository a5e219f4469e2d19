//! taper-worker — line-delimited JSON driver for the rate filter.
//!
//! Loads the filter configuration from a JSON file, reads readings as
//! JSON lines on stdin, and writes the filtered stream as JSON lines on
//! stdout. Logs go to stderr so the output stream stays clean.

use std::fs;
use std::io::{self, BufRead, Write};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use taper_core::Reading;
use taper_filter::RateFilter;

// ── CLI ─────────────────────────────────────────────────────────────

/// Rate-reduction filter worker: JSON lines in, JSON lines out.
#[derive(Parser, Debug)]
#[command(name = "taper-worker", version, about)]
struct Cli {
    /// Path to the filter configuration JSON file.
    #[arg(long, env = "TAPER_CONFIG")]
    config: String,

    /// Number of readings handed to the filter per ingest call.
    #[arg(long, env = "TAPER_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config_text = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read config file {}", cli.config))?;
    let filter = RateFilter::from_json(&config_text)?;
    info!(path = %cli.config, batch_size = cli.batch_size, "filter configured");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    let mut batch: Vec<Reading> = Vec::with_capacity(cli.batch_size);
    let mut out: Vec<Reading> = Vec::new();
    let mut readings_in = 0u64;
    let mut readings_out = 0u64;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Reading>(&line) {
            Ok(reading) => batch.push(reading),
            Err(e) => {
                warn!(error = %e, "skipping malformed reading");
                continue;
            }
        }
        if batch.len() >= cli.batch_size {
            readings_in += batch.len() as u64;
            filter.ingest(&mut batch, &mut out)?;
            readings_out += drain_output(&mut writer, &mut out)?;
        }
    }
    if !batch.is_empty() {
        readings_in += batch.len() as u64;
        filter.ingest(&mut batch, &mut out)?;
        readings_out += drain_output(&mut writer, &mut out)?;
    }

    info!(readings_in, readings_out, "input drained; worker exiting");
    Ok(())
}

/// Write and drain the filter output as one JSON line per reading.
fn drain_output(writer: &mut impl Write, out: &mut Vec<Reading>) -> anyhow::Result<u64> {
    let mut written = 0;
    for reading in out.drain(..) {
        serde_json::to_writer(&mut *writer, &reading)?;
        writeln!(writer)?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
