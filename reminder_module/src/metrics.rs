use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::{info, warn};

pub const SCHEDULED: &str = "reminder.scheduled";
pub const CANCELLED: &str = "reminder.cancelled";
pub const SCHEDULE_FAILED: &str = "reminder.schedule_failed";
pub const CANCEL_FAILED: &str = "reminder.cancel_failed";
pub const SNAPSHOT_INVALID: &str = "reminder.snapshot_invalid";
pub const FIRE_NOT_FOUND: &str = "reminder.fire.not_found";
pub const FIRE_CANCELLED: &str = "reminder.fire.cancelled";
pub const FIRE_SENT: &str = "reminder.fire.sent";
pub const FIRE_RESCHEDULED: &str = "reminder.fire.rescheduled";
pub const FIRE_INVALID_PAYLOAD: &str = "reminder.fire.invalid_payload";
pub const CALENDAR_SKIPPED: &str = "reminder.calendar_skipped";
pub const WEEKDAY_ADJUSTED: &str = "reminder.weekday_adjusted";

/// Process-local counters. Every bump is also emitted as a log event so the
/// hosting platform can scrape them from the log stream.
#[derive(Debug, Default)]
pub struct ReminderMetrics {
    counters: Mutex<HashMap<String, u64>>,
}

impl ReminderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        let count = match self.counters.lock() {
            Ok(mut counters) => {
                let entry = counters.entry(name.to_string()).or_insert(0);
                *entry += 1;
                *entry
            }
            Err(_) => {
                warn!("metrics lock poisoned; dropping {}", name);
                return;
            }
        };
        info!("metric name={} count={}", name, count);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sorted copy of every counter.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .map(|counters| {
                counters
                    .iter()
                    .map(|(name, count)| (name.clone(), *count))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_name() {
        let metrics = ReminderMetrics::new();
        metrics.incr(SCHEDULED);
        metrics.incr(SCHEDULED);
        metrics.incr(FIRE_SENT);

        assert_eq!(metrics.count(SCHEDULED), 2);
        assert_eq!(metrics.count(FIRE_SENT), 1);
        assert_eq!(metrics.count(CANCELLED), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.keys().next().map(String::as_str), Some(FIRE_SENT));
    }
}
