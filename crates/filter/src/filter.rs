//! The rate filter state machine.
//!
//! Dispatches each batch of readings according to the current state:
//! untriggered readings are buffered and averaged, triggered readings
//! pass through at full rate. Trigger and untrigger expressions are
//! compiled lazily from the first reading of the batch that needs them,
//! so a reconfiguration only takes effect on the next ingest.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, warn};

use taper_core::{Reading, Result};

use crate::average::Averager;
use crate::config::RateFilterConfig;
use crate::expression::Evaluator;
use crate::pretrigger::PretriggerBuffer;

// ── State ───────────────────────────────────────────────────────────

/// Whether the filter is currently rate-reducing or passing readings
/// through at full rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    Untriggered,
    Triggered,
}

/// Lifecycle of the compiled expressions.
///
/// `PendingRebuild` is set by reconfiguration and downgraded to
/// `Uncompiled` by the next ingest, which then compiles from that
/// batch's first reading.
enum EvaluatorSlot {
    Uncompiled,
    PendingRebuild,
    Compiled(Evaluators),
}

/// Compiled trigger and untrigger expressions.
///
/// An absent untrigger means the configured default: the logical
/// negation of the trigger, sharing its variable bindings.
struct Evaluators {
    trigger: Evaluator,
    untrigger: Option<Evaluator>,
}

impl Evaluators {
    fn compile(config: &RateFilterConfig, sample: &Reading) -> Result<Self> {
        let trigger = Evaluator::compile(&config.trigger, sample)?;
        let untrigger = match &config.untrigger {
            Some(text) => Some(Evaluator::compile(text, sample)?),
            None => None,
        };
        Ok(Self { trigger, untrigger })
    }

    fn trigger_fires(&mut self, reading: &Reading) -> bool {
        self.trigger.evaluate(reading)
    }

    fn untrigger_fires(&mut self, reading: &Reading) -> bool {
        match &mut self.untrigger {
            Some(evaluator) => evaluator.evaluate(reading),
            None => !self.trigger.evaluate(reading),
        }
    }
}

// ── Filter ──────────────────────────────────────────────────────────

/// Streaming rate-reduction filter.
///
/// All mutable state lives behind one lock: `ingest` and `reconfigure`
/// serialize against each other and never interleave.
pub struct RateFilter {
    inner: Mutex<FilterInner>,
}

struct FilterInner {
    config: RateFilterConfig,
    state: FilterState,
    evaluators: EvaluatorSlot,
    buffer: PretriggerBuffer,
    averager: Averager,
}

impl RateFilter {
    pub fn new(config: RateFilterConfig) -> Self {
        let buffer = PretriggerBuffer::new(config.pretrigger_ms, config.pretrigger_filter.clone());
        let averager = Averager::new(config.rate_interval());
        Self {
            inner: Mutex::new(FilterInner {
                config,
                state: FilterState::Untriggered,
                evaluators: EvaluatorSlot::Uncompiled,
                buffer,
                averager,
            }),
        }
    }

    /// Build a filter from a configuration blob.
    pub fn from_json(config_text: &str) -> Result<Self> {
        Ok(Self::new(RateFilterConfig::from_json(config_text)?))
    }

    pub fn state(&self) -> FilterState {
        self.inner.lock().unwrap().state
    }

    /// Process a batch. On success the input is fully consumed and the
    /// output gains forwarded originals, flushed pre-trigger copies, and
    /// synthesized averages.
    ///
    /// A trigger or untrigger expression that fails to compile is
    /// returned as an error with the batch left untouched.
    pub fn ingest(&self, batch: &mut Vec<Reading>, out: &mut Vec<Reading>) -> Result<()> {
        self.inner.lock().unwrap().ingest(batch, out)
    }

    /// Apply a new configuration blob. Expressions are not recompiled
    /// here; the next ingest rebuilds them from its own first reading.
    pub fn reconfigure(&self, config_text: &str) -> Result<()> {
        self.inner.lock().unwrap().reconfigure(config_text)
    }
}

impl FilterInner {
    fn reconfigure(&mut self, config_text: &str) -> Result<()> {
        self.config.apply(config_text)?;
        self.buffer
            .configure(self.config.pretrigger_ms, self.config.pretrigger_filter.clone());
        self.averager.set_interval(self.config.rate_interval());
        self.evaluators = EvaluatorSlot::PendingRebuild;
        debug!("reconfigured; expressions marked for rebuild");
        Ok(())
    }

    fn ingest(&mut self, batch: &mut Vec<Reading>, out: &mut Vec<Reading>) -> Result<()> {
        let mut evaluators = match self.take_evaluators(batch)? {
            Some(evaluators) => evaluators,
            None => return Ok(()),
        };

        let mut pending: VecDeque<Reading> = batch.drain(..).collect();
        // Number of times the reading at the front has already crossed a
        // state boundary without being consumed.
        let mut bounced = 0u32;

        while let Some(reading) = pending.pop_front() {
            match self.state {
                FilterState::Untriggered => {
                    if self.config.exclusions.contains(&reading.asset) {
                        out.push(reading);
                        bounced = 0;
                        continue;
                    }
                    if bounced < 2 && evaluators.trigger_fires(&reading) {
                        debug!(asset = %reading.asset, "trigger fired; entering full-rate mode");
                        self.state = FilterState::Triggered;
                        self.averager.reset();
                        self.buffer.flush_filtered(&reading, out);
                        bounced += 1;
                        pending.push_front(reading);
                        continue;
                    }
                    if bounced >= 2 {
                        warn!(
                            asset = %reading.asset,
                            "trigger and untrigger oscillate on one reading; treating it as non-triggering"
                        );
                    }
                    self.buffer.push(&reading);
                    if self.averager.enabled() {
                        self.averager.fold(&reading);
                        if let Some(average) = self.averager.maybe_emit(&reading) {
                            out.push(average);
                        }
                    }
                    bounced = 0;
                }
                FilterState::Triggered => {
                    if bounced < 2 && evaluators.untrigger_fires(&reading) {
                        debug!(asset = %reading.asset, "untrigger fired; resuming rate reduction");
                        self.state = FilterState::Untriggered;
                        bounced += 1;
                        pending.push_front(reading);
                        continue;
                    }
                    if bounced >= 2 {
                        warn!(
                            asset = %reading.asset,
                            "trigger and untrigger oscillate on one reading; forwarding it"
                        );
                    }
                    out.push(reading);
                    bounced = 0;
                }
            }
        }

        self.evaluators = EvaluatorSlot::Compiled(evaluators);
        Ok(())
    }

    /// Resolve the evaluator slot for this ingest: hand back the
    /// compiled expressions, rebuilding from the batch's first reading
    /// when none exist or a reconfiguration discarded them. Returns
    /// `None` for an empty batch with nothing compiled (the pending
    /// flag is still consumed).
    fn take_evaluators(&mut self, batch: &[Reading]) -> Result<Option<Evaluators>> {
        match std::mem::replace(&mut self.evaluators, EvaluatorSlot::Uncompiled) {
            EvaluatorSlot::Compiled(evaluators) => Ok(Some(evaluators)),
            EvaluatorSlot::PendingRebuild => {
                debug!("rebuilding expressions after reconfiguration");
                self.compile_from(batch)
            }
            EvaluatorSlot::Uncompiled => self.compile_from(batch),
        }
    }

    fn compile_from(&self, batch: &[Reading]) -> Result<Option<Evaluators>> {
        match batch.first() {
            Some(first) => Ok(Some(Evaluators::compile(&self.config, first)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use taper_core::{DatapointValue, TaperError};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn reading(asset: &str, secs: i64, temp: f64) -> Reading {
        Reading::new(asset, ts(secs)).with_datapoint("temp", DatapointValue::Float(temp))
    }

    fn filter(config: &str) -> RateFilter {
        RateFilter::from_json(config).unwrap()
    }

    fn ingest(f: &RateFilter, mut batch: Vec<Reading>) -> Vec<Reading> {
        let mut out = Vec::new();
        f.ingest(&mut batch, &mut out).unwrap();
        assert!(batch.is_empty(), "ingest must consume the batch");
        out
    }

    #[test]
    fn starts_untriggered() {
        let f = filter(r#"{"trigger": "temp > 70"}"#);
        assert_eq!(f.state(), FilterState::Untriggered);
    }

    #[test]
    fn non_triggering_readings_are_dropped_at_rate_zero() {
        let f = filter(r#"{"trigger": "temp > 70"}"#);
        let out = ingest(&f, vec![reading("pump", 1, 20.0), reading("pump", 2, 30.0)]);
        assert!(out.is_empty());
        assert_eq!(f.state(), FilterState::Untriggered);
    }

    #[test]
    fn trigger_switches_to_full_rate() {
        let f = filter(r#"{"trigger": "temp > 70", "preTrigger": "0"}"#);
        let out = ingest(
            &f,
            vec![
                reading("pump", 1, 20.0),
                reading("pump", 2, 80.0),
                reading("pump", 3, 85.0),
            ],
        );
        // The triggering reading and everything after it pass through.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].user_ts, ts(2));
        assert_eq!(out[1].user_ts, ts(3));
        assert_eq!(f.state(), FilterState::Triggered);
    }

    #[test]
    fn untrigger_resumes_rate_reduction() {
        let f = filter(r#"{"trigger": "temp > 70", "untrigger": "temp < 60"}"#);
        let out = ingest(
            &f,
            vec![
                reading("pump", 1, 80.0),
                reading("pump", 2, 75.0),
                reading("pump", 3, 50.0),
                reading("pump", 4, 55.0),
            ],
        );
        // Readings 1 and 2 are forwarded; 3 untriggers and is averaged
        // away with 4 (rate 0 drops them).
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].user_ts, ts(1));
        assert_eq!(out[1].user_ts, ts(2));
        assert_eq!(f.state(), FilterState::Untriggered);
    }

    #[test]
    fn default_untrigger_is_negated_trigger() {
        let f = filter(r#"{"trigger": "temp > 70"}"#);
        let out = ingest(
            &f,
            vec![
                reading("pump", 1, 80.0),
                reading("pump", 2, 75.0),
                reading("pump", 3, 65.0),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(f.state(), FilterState::Untriggered);
    }

    #[test]
    fn state_alternates_across_batches() {
        let f = filter(r#"{"trigger": "temp > 70", "untrigger": "temp < 60"}"#);
        ingest(&f, vec![reading("pump", 1, 80.0)]);
        assert_eq!(f.state(), FilterState::Triggered);
        ingest(&f, vec![reading("pump", 2, 50.0)]);
        assert_eq!(f.state(), FilterState::Untriggered);
        ingest(&f, vec![reading("pump", 3, 90.0)]);
        assert_eq!(f.state(), FilterState::Triggered);
    }

    #[test]
    fn excluded_assets_pass_through_untriggered() {
        let f = filter(
            r#"{"trigger": "temp > 70", "exclusions": "{\"exclusions\": [\"boiler\"]}"}"#,
        );
        let out = ingest(
            &f,
            vec![reading("boiler", 1, 20.0), reading("boiler", 2, 99.0)],
        );
        // Excluded readings are forwarded unmodified and never trigger.
        assert_eq!(out.len(), 2);
        assert_eq!(f.state(), FilterState::Untriggered);
    }

    #[test]
    fn averaging_emits_at_the_reduced_rate() {
        // One average per minute, baseline at the epoch: the reading at
        // 70s crosses the first boundary on its own, then 80/90/140s
        // accumulate until 140s crosses 70s + 60s.
        let f = filter(r#"{"trigger": "temp > 70", "rate": "1", "rateUnit": "per minute"}"#);
        let out = ingest(
            &f,
            vec![
                reading("pump", 70, 10.0),
                reading("pump", 80, 20.0),
                reading("pump", 90, 30.0),
                reading("pump", 140, 40.0),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].datapoint("temp"), Some(&DatapointValue::Float(10.0)));
        assert_eq!(out[1].datapoint("temp"), Some(&DatapointValue::Float(30.0)));
    }

    #[test]
    fn trigger_transition_resets_partial_averages() {
        let f = filter(
            r#"{"trigger": "temp > 70", "untrigger": "temp < 60", "rate": "1", "rateUnit": "per minute"}"#,
        );
        // Leave a partial sum behind (no boundary crossed yet).
        ingest(&f, vec![reading("pump", 10, 10.0), reading("pump", 20, 999.0)]);
        // Trigger, then untrigger.
        ingest(&f, vec![reading("pump", 30, 80.0), reading("pump", 40, 50.0)]);
        assert_eq!(f.state(), FilterState::Untriggered);
        // The 999 partial must not pollute the next average: readings at
        // 40s (folded on untrigger) and 80s average to (50 + 70) / 2.
        let out = ingest(&f, vec![reading("pump", 80, 70.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].datapoint("temp"), Some(&DatapointValue::Float(60.0)));
    }

    #[test]
    fn pretrigger_window_is_flushed_on_trigger() {
        let f = filter(r#"{"trigger": "temp > 70", "preTrigger": "5000"}"#);
        let out = ingest(
            &f,
            vec![
                reading("pump", 1, 20.0),
                reading("pump", 2, 30.0),
                reading("pump", 3, 80.0),
            ],
        );
        // Two buffered readings, then the triggering one.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].user_ts, ts(1));
        assert_eq!(out[1].user_ts, ts(2));
        assert_eq!(out[2].user_ts, ts(3));
    }

    #[test]
    fn pretrigger_filter_narrows_the_flush() {
        let f = filter(
            r#"{"trigger": "temp > 70", "preTrigger": "60000", "pretriggerFilter": "mode"}"#,
        );
        let tagged = |secs: i64, temp: f64, mode: i64| {
            reading("pump", secs, temp).with_datapoint("mode", DatapointValue::Integer(mode))
        };
        let out = ingest(
            &f,
            vec![
                tagged(1, 20.0, 1),
                tagged(2, 25.0, 2),
                tagged(3, 30.0, 1),
                tagged(4, 80.0, 1),
            ],
        );
        // Only mode=1 history survives the flush.
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].user_ts, ts(1));
        assert_eq!(out[1].user_ts, ts(3));
        assert_eq!(out[2].user_ts, ts(4));
    }

    #[test]
    fn compile_error_surfaces_from_ingest_and_leaves_batch() {
        let f = filter(r#"{"trigger": "pressure > 1"}"#);
        let mut batch = vec![reading("pump", 1, 20.0)];
        let mut out = Vec::new();
        let err = f.ingest(&mut batch, &mut out).unwrap_err();
        assert!(matches!(err, TaperError::Expression { .. }));
        assert_eq!(batch.len(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn reconfigure_takes_effect_on_next_ingest() {
        let f = filter(r#"{"trigger": "temp > 70", "preTrigger": "0"}"#);
        ingest(&f, vec![reading("pump", 1, 50.0)]);
        assert_eq!(f.state(), FilterState::Untriggered);

        f.reconfigure(r#"{"trigger": "temp > 40"}"#).unwrap();
        let out = ingest(&f, vec![reading("pump", 2, 50.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(f.state(), FilterState::Triggered);
    }

    #[test]
    fn bad_expression_in_reconfigure_fails_on_next_ingest() {
        let f = filter(r#"{"trigger": "temp > 70"}"#);
        ingest(&f, vec![reading("pump", 1, 50.0)]);

        // Reconfiguration itself succeeds; compilation is lazy.
        f.reconfigure(r#"{"trigger": "temp >"}"#).unwrap();
        let mut batch = vec![reading("pump", 2, 50.0)];
        let mut out = Vec::new();
        assert!(f.ingest(&mut batch, &mut out).is_err());
    }

    #[test]
    fn pending_rebuild_is_cleared_exactly_once() {
        let f = filter(r#"{"trigger": "temp > 70"}"#);
        f.reconfigure(r#"{"trigger": "temp > 40"}"#).unwrap();
        {
            let inner = f.inner.lock().unwrap();
            assert!(matches!(inner.evaluators, EvaluatorSlot::PendingRebuild));
        }

        // An empty batch observes the flag, clears it, compiles nothing.
        let mut empty = Vec::new();
        let mut out = Vec::new();
        f.ingest(&mut empty, &mut out).unwrap();
        {
            let inner = f.inner.lock().unwrap();
            assert!(matches!(inner.evaluators, EvaluatorSlot::Uncompiled));
        }

        // The next non-empty batch compiles from its first reading.
        ingest(&f, vec![reading("pump", 1, 50.0)]);
        {
            let inner = f.inner.lock().unwrap();
            assert!(matches!(inner.evaluators, EvaluatorSlot::Compiled(_)));
        }
        assert_eq!(f.state(), FilterState::Triggered);
    }

    #[test]
    fn variable_set_is_fixed_by_the_compiling_batch() {
        let f = filter(r#"{"trigger": "rpm > 1000"}"#);
        // The first batch's first reading has no `rpm`, so compilation
        // fails; the batch is untouched.
        let mut batch = vec![reading("pump", 1, 20.0)];
        let mut out = Vec::new();
        assert!(f.ingest(&mut batch, &mut out).is_err());

        // A batch whose first reading carries `rpm` compiles and runs.
        let with_rpm = Reading::new("pump", ts(2))
            .with_datapoint("rpm", DatapointValue::Integer(1500));
        let out = ingest(&f, vec![with_rpm]);
        assert_eq!(out.len(), 1);
        assert_eq!(f.state(), FilterState::Triggered);
    }

    #[test]
    fn oscillating_expressions_terminate() {
        // Trigger and untrigger are both always true: the pathological
        // case that recursed forever in a naive implementation.
        let f = filter(r#"{"trigger": "temp > 0", "untrigger": "temp > 0", "preTrigger": "0"}"#);
        let out = ingest(
            &f,
            vec![reading("pump", 1, 10.0), reading("pump", 2, 20.0)],
        );
        // Each reading triggers, untriggers, and is finally disposed of
        // in the untriggered state (dropped at rate 0).
        assert!(out.is_empty());
    }

    #[test]
    fn exclusions_pass_through_while_triggered_too() {
        let f = filter(
            r#"{"trigger": "temp > 70", "untrigger": "temp < 0", "exclusions": "{\"exclusions\": [\"boiler\"]}"}"#,
        );
        ingest(&f, vec![reading("pump", 1, 80.0)]);
        assert_eq!(f.state(), FilterState::Triggered);
        // While triggered everything is forwarded anyway; the excluded
        // asset must come out unmodified.
        let out = ingest(&f, vec![reading("boiler", 2, 5.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].asset, "boiler");
        assert_eq!(f.state(), FilterState::Triggered);
    }
}
