use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::recurrence::{parse_recurrence, RecurrencePattern};

/// Owner identity plus the root id of the conversation. Every reminder
/// snapshot is scoped under one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadKey {
    pub owner: String,
    pub thread_id: String,
}

impl ThreadKey {
    pub fn new(owner: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            thread_id: thread_id.into(),
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.owner, self.thread_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    #[default]
    New,
    Updated,
    Cancelled,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::New => "new",
            ReminderStatus::Updated => "updated",
            ReminderStatus::Cancelled => "cancelled",
        }
    }
}

/// One snapshot of a reminder as recorded on a single stored message.
///
/// Snapshots are never mutated once written. The authoritative state for a
/// uid is the snapshot carried by the newest message in the thread that
/// mentions it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub uid: String,
    #[serde(default)]
    pub text: String,
    /// ISO-8601 local time carrying an explicit UTC offset.
    pub date_time: String,
    #[serde(default = "default_recurrence")]
    pub recurrence: String,
    #[serde(default)]
    pub contextual_title: String,
    #[serde(default)]
    pub contextual_description: String,
    #[serde(default)]
    pub status: ReminderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    /// IANA zone name, preferred over the offset heuristic when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    /// Weekday names ("mon", "wednesday", ...). Empty means any day.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_days: Vec<String>,
}

fn default_recurrence() -> String {
    "once".to_string()
}

impl Reminder {
    /// Uids are compared without surrounding whitespace, the same way the
    /// engine names triggers.
    pub fn has_uid(&self, uid: &str) -> bool {
        self.uid.trim() == uid.trim()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ReminderStatus::Cancelled
    }

    pub fn recurrence_pattern(&self) -> RecurrencePattern {
        parse_recurrence(&self.recurrence)
    }

    pub fn explicit_time_zone(&self) -> Option<&str> {
        self.time_zone
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        if !self.is_cancelled() {
            return None;
        }
        self.cancellation_reason
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Parsed `allowed_days`; unknown names are skipped with a warning.
    pub fn allowed_weekdays(&self) -> Vec<Weekday> {
        parse_weekday_names(&self.allowed_days, &self.uid)
    }

    pub fn title(&self) -> &str {
        let title = self.contextual_title.trim();
        if !title.is_empty() {
            return title;
        }
        let text = self.text.trim();
        if !text.is_empty() {
            return text;
        }
        "Reminder"
    }
}

pub(crate) fn parse_weekday_names(names: &[String], context: &str) -> Vec<Weekday> {
    let mut days = Vec::with_capacity(names.len());
    for raw in names {
        match raw.trim().parse::<Weekday>() {
            Ok(day) => {
                if !days.contains(&day) {
                    days.push(day);
                }
            }
            Err(_) => warn!("ignoring unknown weekday '{}' for {}", raw, context),
        }
    }
    days
}

/// Where a logical reminder sits in its lifecycle after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderState {
    Unscheduled,
    Scheduled,
    Fired,
    Cancelled,
    Terminal,
}
