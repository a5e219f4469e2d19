//! Streaming rate-reduction filter for time-series readings.
//!
//! This crate provides:
//! - A trigger/untrigger state machine switching between downsampled
//!   averages and full-rate pass-through ([`filter::RateFilter`])
//! - Expression-driven triggering over reading data-points
//!   ([`expression::Evaluator`])
//! - An age-bounded pre-trigger history buffer flushed on trigger
//!   ([`pretrigger::PretriggerBuffer`])
//! - Incremental per-datapoint averaging with timed emission
//!   ([`average::Averager`])
//! - JSON configuration parsing with hot-reconfiguration support
//!   ([`config::RateFilterConfig`])

pub mod average;
pub mod config;
pub mod expression;
pub mod filter;
pub mod pretrigger;

pub use config::{RateFilterConfig, RateUnit};
pub use filter::{FilterState, RateFilter};
