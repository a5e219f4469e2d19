//! Filter configuration: JSON blob parsing, rate-to-interval conversion,
//! and the excluded-asset lookup.
//!
//! Configuration is delivered as a JSON object whose values arrive
//! string-typed (`"rate": "2"`); numeric JSON values are accepted too.
//! Fields absent from a blob keep their current value, so the same parser
//! serves initial configuration and hot reconfiguration.

use chrono::Duration;
use serde_json::Value;
use tracing::{error, warn};

use taper_core::{Result, TaperError};

// ── Rate unit ───────────────────────────────────────────────────────

/// Time base for the reduced emission rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateUnit {
    #[default]
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
}

impl RateUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "per second" => Some(RateUnit::PerSecond),
            "per minute" => Some(RateUnit::PerMinute),
            "per hour" => Some(RateUnit::PerHour),
            "per day" => Some(RateUnit::PerDay),
            _ => None,
        }
    }
}

// ── Exclusions ──────────────────────────────────────────────────────

/// Asset identifiers exempt from rate reduction and triggering.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    assets: Vec<String>,
}

impl ExclusionSet {
    pub fn from_assets(assets: Vec<String>) -> Self {
        Self { assets }
    }

    /// Linear membership test against the configured exclusion list.
    pub fn contains(&self, asset: &str) -> bool {
        self.assets.iter().any(|a| a == asset)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Parse an exclusions payload: an object with an `exclusions` field
    /// holding an array of strings. Non-string elements are logged and
    /// skipped; a structurally wrong payload yields `None`.
    fn parse(payload: &Value) -> Option<Vec<String>> {
        let values = payload.get("exclusions")?.as_array()?;
        let mut assets = Vec::with_capacity(values.len());
        for value in values {
            match value.as_str() {
                Some(s) => assets.push(s.to_string()),
                None => {
                    error!("the exclusions element should be an array of strings");
                }
            }
        }
        Some(assets)
    }
}

// ── Filter configuration ────────────────────────────────────────────

/// Everything the rate filter is configured with.
#[derive(Debug, Clone)]
pub struct RateFilterConfig {
    /// Expression that switches the filter into full-rate pass-through.
    pub trigger: String,
    /// Expression that switches it back; `None` means NOT(trigger).
    pub untrigger: Option<String>,
    /// Pre-trigger history window in milliseconds; 0 disables buffering.
    pub pretrigger_ms: i64,
    /// Averages emitted per `rate_unit` while untriggered; 0 disables
    /// averaging (non-triggering readings are dropped).
    pub rate: i64,
    pub rate_unit: RateUnit,
    /// Data-point name used to filter the buffered window on trigger.
    pub pretrigger_filter: Option<String>,
    pub exclusions: ExclusionSet,
}

impl Default for RateFilterConfig {
    fn default() -> Self {
        Self {
            trigger: String::new(),
            untrigger: None,
            pretrigger_ms: 1,
            rate: 0,
            rate_unit: RateUnit::default(),
            pretrigger_filter: None,
            exclusions: ExclusionSet::default(),
        }
    }
}

impl RateFilterConfig {
    /// Parse a configuration blob on top of the defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply(text)?;
        Ok(config)
    }

    /// Apply a configuration blob to this config. Fields absent from the
    /// blob are left untouched; a malformed exclusions payload is logged
    /// and the previous exclusion set is kept.
    pub fn apply(&mut self, text: &str) -> Result<()> {
        let doc: Value = serde_json::from_str(text)?;
        let obj = doc
            .as_object()
            .ok_or_else(|| TaperError::Config("configuration must be a JSON object".into()))?;

        if let Some(v) = string_field(obj, "trigger") {
            self.trigger = v;
        }
        if let Some(v) = string_field(obj, "untrigger") {
            self.untrigger = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = integer_field(obj, "preTrigger") {
            self.pretrigger_ms = v;
        }
        if let Some(v) = integer_field(obj, "rate") {
            self.rate = v;
        }
        if let Some(v) = string_field(obj, "rateUnit") {
            match RateUnit::parse(&v) {
                Some(unit) => self.rate_unit = unit,
                None => {
                    warn!(unit = %v, "unrecognized rate unit; using per second");
                    self.rate_unit = RateUnit::PerSecond;
                }
            }
        }
        if let Some(v) = string_field(obj, "pretriggerFilter") {
            self.pretrigger_filter = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(raw) = obj.get("exclusions") {
            self.apply_exclusions(raw);
        }
        Ok(())
    }

    fn apply_exclusions(&mut self, raw: &Value) {
        // The payload arrives as a JSON document embedded in a string
        // value; a plain object is accepted as well.
        let parsed: Option<Value> = match raw {
            Value::String(text) => serde_json::from_str(text).ok(),
            Value::Object(_) => Some(raw.clone()),
            _ => None,
        };
        match parsed.as_ref().and_then(ExclusionSet::parse) {
            Some(assets) => self.exclusions = ExclusionSet::from_assets(assets),
            None => {
                error!("error parsing the exclusions element; it should be an array of strings");
            }
        }
    }

    /// Emission interval for the configured rate, or `None` when the
    /// rate is zero (averaging disabled).
    ///
    /// "per second" divides a second in microseconds; the other units
    /// divide their span in whole seconds. The integer division (and its
    /// truncation, e.g. 7 per minute giving 8 seconds) is contractual.
    pub fn rate_interval(&self) -> Option<Duration> {
        if self.rate <= 0 {
            return None;
        }
        let interval = match self.rate_unit {
            RateUnit::PerSecond => Duration::microseconds(1_000_000 / self.rate),
            RateUnit::PerMinute => Duration::seconds(60 / self.rate),
            RateUnit::PerHour => Duration::seconds(3_600 / self.rate),
            RateUnit::PerDay => Duration::seconds(86_400 / self.rate),
        };
        Some(interval)
    }
}

/// Read a string-typed field.
fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Read an integer delivered either as a string value or a JSON number.
/// Garbage parses as 0, mirroring `strtol`.
fn integer_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match obj.get(key)? {
        Value::String(s) => Some(s.trim().parse().unwrap_or(0)),
        Value::Number(n) => Some(n.as_i64().unwrap_or(0)),
        _ => None,
    }
}
