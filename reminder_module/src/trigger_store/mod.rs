//! Self-hosted time-triggered invocation service backed by SQLite.
//!
//! Each trigger is a one-shot `at(...)` expression interpreted in an IANA
//! zone. The worker claims due rows, hands the payload to its target and
//! then either completes the trigger or records the failed attempt. Every
//! write bumps `revision`; completion and failure bookkeeping only apply to
//! the revision that was claimed, so a reschedule performed while the
//! payload was being handled survives.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::reminder::{
    parse_at_expression, parse_zone, RetryPolicy, TriggerRecord, TriggerService,
    TriggerServiceError, TriggerSpec,
};

mod migrations;
mod schema;

use migrations::ensure_trigger_columns;
use schema::TRIGGER_STORE_SCHEMA;

const DEFAULT_CLAIM_LEASE_SECS: i64 = 300;
const RETRY_BACKOFF_SECS: i64 = 30;

/// A claimed trigger whose fire time has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTrigger {
    pub group_name: String,
    pub name: String,
    pub payload: String,
    pub revision: i64,
    pub attempts: u32,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Left in place for another attempt after a backoff.
    Retrying { attempts: u32 },
    /// Attempts or event age exhausted; payload moved to the dead-letter table.
    DeadLettered,
    /// The trigger changed or vanished while it was being handled.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub target: String,
    pub group_name: String,
    pub name: String,
    pub payload: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SqliteTriggerService {
    path: PathBuf,
    claim_lease: ChronoDuration,
}

/// UTC instant of an `at(...)` expression in `time_zone`. A wall-clock time
/// that falls in a spring-forward gap fires one hour later.
pub fn fire_instant(expression: &str, time_zone: &str) -> Result<DateTime<Utc>, TriggerServiceError> {
    let fields = parse_at_expression(expression)
        .ok_or_else(|| TriggerServiceError::InvalidExpression(expression.to_string()))?;
    let zone =
        parse_zone(time_zone).ok_or_else(|| TriggerServiceError::InvalidZone(time_zone.to_string()))?;
    zone.from_local_datetime(&fields)
        .earliest()
        .or_else(|| {
            zone.from_local_datetime(&(fields + ChronoDuration::hours(1)))
                .earliest()
        })
        .map(|value| value.with_timezone(&Utc))
        .ok_or_else(|| {
            TriggerServiceError::Storage(format!(
                "{} does not exist in {}",
                fields, time_zone
            ))
        })
}

fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, TriggerServiceError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

impl SqliteTriggerService {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TriggerServiceError> {
        let store = Self {
            path: path.into(),
            claim_lease: ChronoDuration::seconds(DEFAULT_CLAIM_LEASE_SECS),
        };
        let _ = store.open()?;
        Ok(store)
    }

    /// How long a claimed trigger stays invisible to other pollers.
    pub fn with_claim_lease(mut self, lease: ChronoDuration) -> Self {
        self.claim_lease = lease;
        self
    }

    fn open(&self) -> Result<Connection, TriggerServiceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| TriggerServiceError::Storage(err.to_string()))?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(TRIGGER_STORE_SCHEMA)?;
        ensure_trigger_columns(&conn)?;
        Ok(conn)
    }

    /// Claims up to `limit` triggers due at `now`, oldest first.
    pub fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueTrigger>, TriggerServiceError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut due = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT group_name, name, payload, revision, attempts, fire_at
                 FROM triggers
                 WHERE fire_at_epoch <= ?1 AND next_attempt_epoch <= ?1
                 ORDER BY fire_at_epoch, group_name, name
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                params![now.timestamp(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )?;
            for row in rows {
                let (group_name, name, payload, revision, attempts, fire_at_raw) = row?;
                due.push(DueTrigger {
                    group_name,
                    name,
                    payload,
                    revision,
                    attempts: to_u32(attempts),
                    fire_at: parse_datetime(&fire_at_raw)?,
                });
            }
        }
        let lease_until = (now + self.claim_lease).timestamp();
        for trigger in &due {
            tx.execute(
                "UPDATE triggers SET next_attempt_epoch = ?1, last_attempt_at = ?2
                 WHERE group_name = ?3 AND name = ?4 AND revision = ?5",
                params![
                    lease_until,
                    format_datetime(now),
                    trigger.group_name,
                    trigger.name,
                    trigger.revision
                ],
            )?;
        }
        tx.commit()?;
        Ok(due)
    }

    /// Removes a delivered trigger unless it was rewritten since the claim.
    /// Returns whether the row was removed.
    pub fn complete(&self, trigger: &DueTrigger) -> Result<bool, TriggerServiceError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM triggers WHERE group_name = ?1 AND name = ?2 AND revision = ?3",
            params![trigger.group_name, trigger.name, trigger.revision],
        )?;
        if removed == 0 {
            info!(
                "trigger {}/{} was rescheduled during delivery; keeping new revision",
                trigger.group_name, trigger.name
            );
        }
        Ok(removed > 0)
    }

    /// Counts a failed delivery. Exhausted triggers are moved to their
    /// dead-letter target.
    pub fn record_failure(
        &self,
        trigger: &DueTrigger,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition, TriggerServiceError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                "SELECT attempts, max_attempts, max_event_age_secs, dead_letter_target, revision
                 FROM triggers WHERE group_name = ?1 AND name = ?2",
                params![trigger.group_name, trigger.name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((attempts, max_attempts, max_event_age_secs, dead_letter_target, revision)) = row
        else {
            return Ok(FailureDisposition::Superseded);
        };
        if revision != trigger.revision {
            return Ok(FailureDisposition::Superseded);
        }

        let attempts = attempts + 1;
        let age = now.signed_duration_since(trigger.fire_at).num_seconds();
        let exhausted = attempts >= max_attempts || age > max_event_age_secs;
        let disposition = if exhausted {
            let reason = if attempts >= max_attempts {
                format!("max attempts ({}) reached: {}", max_attempts, error)
            } else {
                format!("event older than {}s: {}", max_event_age_secs, error)
            };
            match dead_letter_target {
                Some(target) => {
                    tx.execute(
                        "INSERT INTO dead_letters (target, group_name, name, payload, attempts, reason, dead_lettered_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            target,
                            trigger.group_name,
                            trigger.name,
                            trigger.payload,
                            attempts,
                            reason,
                            format_datetime(now)
                        ],
                    )?;
                    warn!(
                        "trigger {}/{} dead-lettered to {}: {}",
                        trigger.group_name, trigger.name, target, reason
                    );
                }
                None => warn!(
                    "trigger {}/{} dropped without dead-letter target: {}",
                    trigger.group_name, trigger.name, reason
                ),
            }
            tx.execute(
                "DELETE FROM triggers WHERE group_name = ?1 AND name = ?2",
                params![trigger.group_name, trigger.name],
            )?;
            FailureDisposition::DeadLettered
        } else {
            let retry_at = now.timestamp() + RETRY_BACKOFF_SECS * attempts;
            tx.execute(
                "UPDATE triggers SET attempts = ?1, next_attempt_epoch = ?2, last_error = ?3
                 WHERE group_name = ?4 AND name = ?5",
                params![attempts, retry_at, error, trigger.group_name, trigger.name],
            )?;
            FailureDisposition::Retrying {
                attempts: to_u32(attempts),
            }
        };
        tx.commit()?;
        Ok(disposition)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, TriggerServiceError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT target, group_name, name, payload, attempts, reason, dead_lettered_at
             FROM dead_letters ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        let mut letters = Vec::new();
        for row in rows {
            let (target, group_name, name, payload, attempts, reason, at_raw) = row?;
            letters.push(DeadLetter {
                target,
                group_name,
                name,
                payload,
                attempts: to_u32(attempts),
                reason,
                dead_lettered_at: parse_datetime(&at_raw)?,
            });
        }
        Ok(letters)
    }

    /// Number of registered triggers in `group`.
    pub fn count(&self, group: &str) -> Result<usize, TriggerServiceError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM triggers WHERE group_name = ?1",
            params![group],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

impl TriggerService for SqliteTriggerService {
    fn get(&self, group: &str, name: &str) -> Result<Option<TriggerRecord>, TriggerServiceError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT provider_id, schedule_expression, time_zone, payload, max_attempts,
                        max_event_age_secs, dead_letter_target
                 FROM triggers WHERE group_name = ?1 AND name = ?2",
                params![group, name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(
            |(
                provider_id,
                schedule_expression,
                time_zone,
                payload,
                max_attempts,
                max_event_age_secs,
                dead_letter_target,
            )| TriggerRecord {
                provider_id,
                spec: TriggerSpec {
                    group_name: group.to_string(),
                    name: name.to_string(),
                    schedule_expression,
                    time_zone,
                    payload,
                    retry_policy: RetryPolicy {
                        max_attempts: to_u32(max_attempts),
                        max_event_age_secs: u64::try_from(max_event_age_secs.max(0))
                            .unwrap_or(0),
                    },
                    dead_letter_target,
                },
            },
        ))
    }

    fn create(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError> {
        let fire_at = fire_instant(&spec.schedule_expression, &spec.time_zone)?;
        let conn = self.open()?;
        let provider_id = format!("trg-{}", Uuid::new_v4());
        let now = format_datetime(Utc::now());
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO triggers (group_name, name, provider_id, schedule_expression, time_zone, payload,
                max_attempts, max_event_age_secs, dead_letter_target, fire_at, fire_at_epoch, next_attempt_epoch,
                revision, attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 0, 0, ?12, ?12)",
            params![
                spec.group_name,
                spec.name,
                provider_id,
                spec.schedule_expression,
                spec.time_zone,
                spec.payload,
                spec.retry_policy.max_attempts,
                i64::try_from(spec.retry_policy.max_event_age_secs).unwrap_or(i64::MAX),
                spec.dead_letter_target,
                format_datetime(fire_at),
                fire_at.timestamp(),
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(TriggerServiceError::Conflict {
                group: spec.group_name.clone(),
                name: spec.name.clone(),
            });
        }
        Ok(provider_id)
    }

    fn update(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError> {
        let fire_at = fire_instant(&spec.schedule_expression, &spec.time_zone)?;
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE triggers SET schedule_expression = ?3, time_zone = ?4, payload = ?5,
                max_attempts = ?6, max_event_age_secs = ?7, dead_letter_target = ?8,
                fire_at = ?9, fire_at_epoch = ?10, next_attempt_epoch = ?10,
                revision = revision + 1, attempts = 0, last_error = NULL, updated_at = ?11
             WHERE group_name = ?1 AND name = ?2",
            params![
                spec.group_name,
                spec.name,
                spec.schedule_expression,
                spec.time_zone,
                spec.payload,
                spec.retry_policy.max_attempts,
                i64::try_from(spec.retry_policy.max_event_age_secs).unwrap_or(i64::MAX),
                spec.dead_letter_target,
                format_datetime(fire_at),
                fire_at.timestamp(),
                format_datetime(Utc::now()),
            ],
        )?;
        if updated == 0 {
            return Err(TriggerServiceError::NotFound {
                group: spec.group_name.clone(),
                name: spec.name.clone(),
            });
        }
        let provider_id: String = conn.query_row(
            "SELECT provider_id FROM triggers WHERE group_name = ?1 AND name = ?2",
            params![spec.group_name, spec.name],
            |row| row.get(0),
        )?;
        Ok(provider_id)
    }

    fn delete(&self, group: &str, name: &str) -> Result<(), TriggerServiceError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM triggers WHERE group_name = ?1 AND name = ?2",
            params![group, name],
        )?;
        if removed == 0 {
            return Err(TriggerServiceError::NotFound {
                group: group.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(name: &str, expression: &str) -> TriggerSpec {
        TriggerSpec {
            group_name: "reminders".to_string(),
            name: name.to_string(),
            schedule_expression: expression.to_string(),
            time_zone: "America/Los_Angeles".to_string(),
            payload: format!(r#"{{"eventType":"reminder.fire","uid":"{}"}}"#, name),
            retry_policy: RetryPolicy {
                max_attempts: 2,
                max_event_age_secs: 3600,
            },
            dead_letter_target: Some("reminders-dlq".to_string()),
        }
    }

    fn utc(raw: &str) -> DateTime<Utc> {
        parse_datetime(raw).unwrap()
    }

    fn store(temp: &TempDir) -> SqliteTriggerService {
        SqliteTriggerService::new(temp.path().join("state").join("triggers.db")).expect("store")
    }

    #[test]
    fn fire_instant_uses_zone_rules() {
        // PDT in September, PST in November.
        assert_eq!(
            fire_instant("at(2025-09-12T09:00:00)", "America/Los_Angeles").unwrap(),
            utc("2025-09-12T16:00:00Z")
        );
        assert_eq!(
            fire_instant("at(2025-11-07T09:00:00)", "America/Los_Angeles").unwrap(),
            utc("2025-11-07T17:00:00Z")
        );
        // 02:30 does not exist on 2025-03-09 in Los Angeles.
        assert_eq!(
            fire_instant("at(2025-03-09T02:30:00)", "America/Los_Angeles").unwrap(),
            utc("2025-03-09T10:30:00Z")
        );
        assert!(matches!(
            fire_instant("at(2025-09-12T09:00:00)", "Mars/Olympus"),
            Err(TriggerServiceError::InvalidZone(_))
        ));
        assert!(matches!(
            fire_instant("cron(0 9 * * ? *)", "UTC"),
            Err(TriggerServiceError::InvalidExpression(_))
        ));
    }

    #[test]
    fn create_get_update_delete() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);

        let id = store.create(&spec("rem-1", "at(2025-09-12T09:00:00)")).expect("create");
        assert!(matches!(
            store.create(&spec("rem-1", "at(2025-09-12T09:00:00)")),
            Err(TriggerServiceError::Conflict { .. })
        ));

        let updated_id = store.update(&spec("rem-1", "at(2025-09-19T09:00:00)")).expect("update");
        assert_eq!(id, updated_id);
        let record = store.get("reminders", "rem-1").expect("get").expect("present");
        assert_eq!(record.spec.schedule_expression, "at(2025-09-19T09:00:00)");
        assert_eq!(record.spec.retry_policy.max_attempts, 2);
        assert_eq!(store.count("reminders").unwrap(), 1);

        store.delete("reminders", "rem-1").expect("delete");
        assert!(matches!(
            store.delete("reminders", "rem-1"),
            Err(TriggerServiceError::NotFound { .. })
        ));
        assert!(matches!(
            store.update(&spec("rem-1", "at(2025-09-19T09:00:00)")),
            Err(TriggerServiceError::NotFound { .. })
        ));
        assert!(store.get("reminders", "rem-1").unwrap().is_none());
    }

    #[test]
    fn claims_only_due_triggers_once_per_lease() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        store.create(&spec("due", "at(2025-09-12T09:00:00)")).unwrap();
        store.create(&spec("later", "at(2025-09-19T09:00:00)")).unwrap();

        let now = utc("2025-09-12T16:00:30Z");
        let due = store.claim_due(now, 10).expect("claim");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "due");
        assert_eq!(due[0].fire_at, utc("2025-09-12T16:00:00Z"));

        assert!(store.claim_due(now, 10).unwrap().is_empty());
        assert!(store.complete(&due[0]).unwrap());
        assert_eq!(store.count("reminders").unwrap(), 1);
    }

    #[test]
    fn reschedule_during_delivery_is_not_completed() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        store.create(&spec("rem-1", "at(2025-09-12T09:00:00)")).unwrap();

        let due = store.claim_due(utc("2025-09-12T16:01:00Z"), 10).unwrap();
        store.update(&spec("rem-1", "at(2025-09-19T09:00:00)")).unwrap();

        assert!(!store.complete(&due[0]).unwrap());
        let record = store.get("reminders", "rem-1").unwrap().expect("kept");
        assert_eq!(record.spec.schedule_expression, "at(2025-09-19T09:00:00)");
        assert_eq!(
            store
                .record_failure(&due[0], "late failure", utc("2025-09-12T16:02:00Z"))
                .unwrap(),
            FailureDisposition::Superseded
        );
    }

    #[test]
    fn failures_retry_then_dead_letter() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        store.create(&spec("rem-1", "at(2025-09-12T09:00:00)")).unwrap();

        let now = utc("2025-09-12T16:01:00Z");
        let due = store.claim_due(now, 10).unwrap();
        assert_eq!(
            store.record_failure(&due[0], "smtp down", now).unwrap(),
            FailureDisposition::Retrying { attempts: 1 }
        );

        let retry_at = now + ChronoDuration::seconds(RETRY_BACKOFF_SECS);
        let due = store.claim_due(retry_at, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(
            store.record_failure(&due[0], "smtp down", retry_at).unwrap(),
            FailureDisposition::DeadLettered
        );

        assert_eq!(store.count("reminders").unwrap(), 0);
        let letters = store.dead_letters().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].target, "reminders-dlq");
        assert_eq!(letters[0].attempts, 2);
        assert!(letters[0].reason.contains("smtp down"));
    }

    #[test]
    fn stale_events_dead_letter_early() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let mut stale = spec("rem-1", "at(2025-09-12T09:00:00)");
        stale.retry_policy.max_attempts = 10;
        store.create(&stale).unwrap();

        let now = utc("2025-09-12T18:00:00Z");
        let due = store.claim_due(now, 10).unwrap();
        assert_eq!(
            store.record_failure(&due[0], "boom", now).unwrap(),
            FailureDisposition::DeadLettered
        );
        assert!(store.dead_letters().unwrap()[0].reason.contains("older than"));
    }
}
