//! Incremental per-datapoint averaging with timed emission.
//!
//! While the filter is untriggered it folds every numeric data-point into
//! a running sum keyed by name. Once a folded reading's user timestamp
//! passes the last emission plus the configured interval, a synthetic
//! reading is emitted carrying one averaged data-point per key.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use taper_core::{Datapoint, DatapointValue, Reading};

/// Running sums and emission bookkeeping for the reduced-rate stream.
pub struct Averager {
    sums: BTreeMap<String, f64>,
    count: u64,
    last_emit: DateTime<Utc>,
    interval: Option<Duration>,
}

impl Averager {
    /// An accumulator emitting at most one average per `interval`.
    /// `None` disables averaging.
    ///
    /// The emission baseline starts at the Unix epoch, so the first
    /// folded reading always crosses the boundary and emits immediately.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            sums: BTreeMap::new(),
            count: 0,
            last_emit: DateTime::UNIX_EPOCH,
            interval,
        }
    }

    /// Replace the emission interval. Partial sums and the emission
    /// baseline carry over.
    pub fn set_interval(&mut self, interval: Option<Duration>) {
        self.interval = interval;
    }

    /// Whether averaging is configured at all.
    pub fn enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Fold every numeric data-point of `reading` into the running sums.
    pub fn fold(&mut self, reading: &Reading) {
        for (name, value) in reading.numeric_datapoints() {
            *self.sums.entry(name.to_string()).or_insert(0.0) += value;
        }
        self.count += 1;
    }

    /// Emit an averaged reading if `reading`'s user timestamp strictly
    /// exceeds the last emission plus the interval.
    ///
    /// The synthetic reading carries `reading`'s asset name and both of
    /// its timestamps, with one float data-point per accumulated key
    /// valued sum / fold-count. Sums and count restart at zero and the
    /// emission baseline moves to `reading`'s user timestamp.
    pub fn maybe_emit(&mut self, reading: &Reading) -> Option<Reading> {
        let interval = self.interval?;
        if reading.user_ts <= self.last_emit + interval {
            return None;
        }
        if self.count == 0 {
            return None;
        }

        let mut datapoints = Vec::with_capacity(self.sums.len());
        for (name, sum) in &mut self.sums {
            datapoints.push(Datapoint {
                name: name.clone(),
                value: DatapointValue::Float(*sum / self.count as f64),
            });
            *sum = 0.0;
        }
        self.count = 0;
        self.last_emit = reading.user_ts;

        Some(Reading {
            asset: reading.asset.clone(),
            datapoints,
            user_ts: reading.user_ts,
            ingest_ts: reading.ingest_ts,
        })
    }

    /// Zero every sum (keys are kept) and the fold count. Called on the
    /// transition into full-rate mode so a stale partial average never
    /// survives the switch.
    pub fn reset(&mut self) {
        for sum in self.sums.values_mut() {
            *sum = 0.0;
        }
        self.count = 0;
    }
}
