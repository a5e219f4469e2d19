//! Age-bounded buffer of readings retained while untriggered.
//!
//! While the filter is downsampling, a copy of every non-excluded,
//! non-triggering reading is kept here so that a trigger event can be
//! prefixed with the short history that led up to it. Entries older than
//! the configured window (relative to the newest entry's user timestamp)
//! are evicted on every insert.

use std::collections::VecDeque;

use chrono::Duration;

use taper_core::{DatapointValue, Reading};

/// FIFO of owned reading copies, oldest first.
pub struct PretriggerBuffer {
    window: Duration,
    filter_datapoint: Option<String>,
    entries: VecDeque<Reading>,
}

impl PretriggerBuffer {
    /// A buffer holding `window_ms` of history. A zero window disables
    /// buffering entirely.
    pub fn new(window_ms: i64, filter_datapoint: Option<String>) -> Self {
        Self {
            window: Duration::milliseconds(window_ms),
            filter_datapoint,
            entries: VecDeque::new(),
        }
    }

    /// Apply a new window and filter name. Buffered entries are kept;
    /// the new window takes effect on the next insert.
    pub fn configure(&mut self, window_ms: i64, filter_datapoint: Option<String>) {
        self.window = Duration::milliseconds(window_ms);
        self.filter_datapoint = filter_datapoint;
    }

    /// Append a copy of `reading`, then evict entries whose age relative
    /// to it strictly exceeds the window. No-op when the window is zero.
    pub fn push(&mut self, reading: &Reading) {
        if self.window.is_zero() {
            return;
        }
        self.entries.push_back(reading.clone());
        while let Some(front) = self.entries.front() {
            if reading.user_ts - front.user_ts > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Drain every entry into `out` in FIFO order.
    pub fn flush_all(&mut self, out: &mut Vec<Reading>) {
        out.extend(self.entries.drain(..));
    }

    /// Drain the buffer, forwarding only entries that match the
    /// triggering reading on the configured filter data-point.
    ///
    /// The match value is the triggering reading's value for that name
    /// (last occurrence wins). An entry matches when it carries a
    /// same-named data-point equal in both kind and value; integer and
    /// float values never match each other. Non-matching entries are
    /// dropped. With no filter configured, or when the triggering reading
    /// lacks the named data-point, every entry is forwarded.
    pub fn flush_filtered(&mut self, trigger: &Reading, out: &mut Vec<Reading>) {
        let wanted = self
            .filter_datapoint
            .as_deref()
            .and_then(|name| trigger.datapoint(name).map(|value| (name, value)));

        let (name, wanted) = match wanted {
            Some(found) => found,
            None => return self.flush_all(out),
        };

        for entry in self.entries.drain(..) {
            let matched = entry
                .datapoints
                .iter()
                .any(|dp| dp.name == name && values_match(&dp.value, wanted));
            if matched {
                out.push(entry);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kind-sensitive equality: integer-vs-integer or float-vs-float only.
fn values_match(a: &DatapointValue, b: &DatapointValue) -> bool {
    match (a, b) {
        (DatapointValue::Integer(x), DatapointValue::Integer(y)) => x == y,
        (DatapointValue::Float(x), DatapointValue::Float(y)) => x == y,
        _ => false,
    }
}
