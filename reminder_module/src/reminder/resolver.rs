use chrono::{DateTime, FixedOffset};

use crate::thread_store::{StoredMessage, ThreadStore, ThreadStoreError};

use super::types::{Reminder, ThreadKey};

/// The authoritative snapshot of one uid within a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReminder {
    pub reminder: Reminder,
    pub message_id: String,
    pub email_date: DateTime<FixedOffset>,
    /// How many older messages in the thread also carried this uid.
    pub revision: u32,
}

/// Finds the snapshot of `uid` carried by the newest message of the thread.
/// Returns `Ok(None)` when no message mentions it.
pub fn resolve<T: ThreadStore + ?Sized>(
    store: &T,
    key: &ThreadKey,
    uid: &str,
) -> Result<Option<ResolvedReminder>, ThreadStoreError> {
    let messages = store.messages_by_thread_key(key)?;
    Ok(resolve_in(messages, uid))
}

/// Same as [`resolve`] over an already loaded history, in any order.
pub fn resolve_in(mut messages: Vec<StoredMessage>, uid: &str) -> Option<ResolvedReminder> {
    // Stable sort keeps the store's tie-break for equal instants.
    messages.sort_by(|a, b| b.email_date.cmp(&a.email_date));

    let mut found: Option<ResolvedReminder> = None;
    let mut revision = 0u32;
    for message in messages {
        let Some(reminder) = message.reminders.iter().find(|r| r.has_uid(uid)) else {
            continue;
        };
        if found.is_none() {
            found = Some(ResolvedReminder {
                reminder: reminder.clone(),
                message_id: message.message_id.clone(),
                email_date: message.email_date,
                revision: 0,
            });
        } else {
            revision = revision.saturating_add(1);
        }
    }
    found.map(|mut resolved| {
        resolved.revision = revision;
        resolved
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::ReminderStatus;

    fn snapshot(uid: &str, status: ReminderStatus, date_time: &str) -> Reminder {
        Reminder {
            uid: uid.to_string(),
            text: "water plants".to_string(),
            date_time: date_time.to_string(),
            recurrence: "weekly".to_string(),
            contextual_title: String::new(),
            contextual_description: String::new(),
            status,
            cancelled_at: None,
            cancellation_reason: None,
            time_zone: None,
            allowed_days: Vec::new(),
        }
    }

    fn message(id: &str, date: &str, reminders: Vec<Reminder>) -> StoredMessage {
        StoredMessage {
            message_id: id.to_string(),
            thread_key: ThreadKey::new("owner@example.com", "root"),
            email_date: DateTime::parse_from_rfc3339(date).unwrap(),
            reminders,
        }
    }

    #[test]
    fn newest_message_wins_regardless_of_input_order() {
        let history = vec![
            message(
                "m2",
                "2025-09-03T10:00:00-07:00",
                vec![snapshot("r1", ReminderStatus::Updated, "2025-09-06T10:00:00-07:00")],
            ),
            message(
                "m1",
                "2025-09-01T10:00:00-07:00",
                vec![snapshot("r1", ReminderStatus::New, "2025-09-05T09:00:00-07:00")],
            ),
            message(
                "m3",
                "2025-09-04T10:00:00-07:00",
                vec![snapshot("r2", ReminderStatus::New, "2025-09-07T09:00:00-07:00")],
            ),
        ];

        let resolved = resolve_in(history, "r1").expect("found");
        assert_eq!(resolved.message_id, "m2");
        assert_eq!(resolved.reminder.status, ReminderStatus::Updated);
        assert_eq!(resolved.revision, 1);
    }

    #[test]
    fn compares_email_dates_as_instants() {
        // 08:00+02:00 is 06:00Z, earlier than 01:00-07:00 (08:00Z).
        let history = vec![
            message(
                "late-local",
                "2025-09-02T08:00:00+02:00",
                vec![snapshot("r1", ReminderStatus::New, "2025-09-05T09:00:00-07:00")],
            ),
            message(
                "early-local",
                "2025-09-02T01:00:00-07:00",
                vec![snapshot("r1", ReminderStatus::Cancelled, "2025-09-05T09:00:00-07:00")],
            ),
        ];
        let resolved = resolve_in(history, "r1").expect("found");
        assert_eq!(resolved.message_id, "early-local");
        assert!(resolved.reminder.is_cancelled());
    }

    #[test]
    fn unknown_uid_is_none() {
        let history = vec![message("m1", "2025-09-01T10:00:00Z", vec![])];
        assert!(resolve_in(history, "missing").is_none());
    }

    #[test]
    fn stored_uid_whitespace_is_ignored() {
        let history = vec![
            message(
                "m1",
                "2025-09-01T10:00:00-07:00",
                vec![snapshot(" r1  ", ReminderStatus::New, "2025-09-05T09:00:00-07:00")],
            ),
            message(
                "m2",
                "2025-09-02T10:00:00-07:00",
                vec![snapshot("r1", ReminderStatus::Updated, "2025-09-06T09:00:00-07:00")],
            ),
        ];

        let resolved = resolve_in(history, " r1").expect("found");
        assert_eq!(resolved.message_id, "m2");
        assert_eq!(resolved.revision, 1);
    }
}
