use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::local_time::{parse_zone, LocalTime};
use super::notification::FireNotification;

const AT_EXPRESSION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_event_age_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_event_age_secs: 3600,
        }
    }
}

/// Everything the trigger service needs to register one time-based
/// invocation. `name` is the reminder uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    pub group_name: String,
    pub name: String,
    /// `at(YYYY-MM-DDTHH:MM:SS)`, interpreted as wall-clock time in `time_zone`.
    pub schedule_expression: String,
    pub time_zone: String,
    pub payload: String,
    pub retry_policy: RetryPolicy,
    pub dead_letter_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRecord {
    pub provider_id: String,
    pub spec: TriggerSpec,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerServiceError {
    #[error("trigger {group}/{name} not found")]
    NotFound { group: String, name: String },
    #[error("trigger {group}/{name} already exists")]
    Conflict { group: String, name: String },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid time zone {0}")]
    InvalidZone(String),
    #[error("invalid schedule expression {0}")]
    InvalidExpression(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// The external time-triggered invocation service.
pub trait TriggerService {
    fn get(&self, group: &str, name: &str) -> Result<Option<TriggerRecord>, TriggerServiceError>;
    fn create(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError>;
    fn update(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError>;
    /// Returns `NotFound` when nothing is registered under the name.
    fn delete(&self, group: &str, name: &str) -> Result<(), TriggerServiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAction {
    Created,
    Updated,
    Deleted,
    AlreadyAbsent,
    Failed,
}

/// Structured result of a gateway call. Expected conditions never surface
/// as errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub success: bool,
    pub action: GatewayAction,
    pub provider_id: Option<String>,
    pub error: Option<String>,
    /// The `at(...)` expression registered, when one was.
    pub schedule_expression: Option<String>,
}

impl GatewayOutcome {
    fn ok(action: GatewayAction, provider_id: Option<String>) -> Self {
        Self {
            success: true,
            action,
            provider_id,
            error: None,
            schedule_expression: None,
        }
    }

    fn failed(err: impl ToString) -> Self {
        Self {
            success: false,
            action: GatewayAction::Failed,
            provider_id: None,
            error: Some(err.to_string()),
            schedule_expression: None,
        }
    }
}

pub fn format_at_expression(fields: &NaiveDateTime) -> String {
    format!("at({})", fields.format(AT_EXPRESSION_FORMAT))
}

pub fn parse_at_expression(expression: &str) -> Option<NaiveDateTime> {
    let inner = expression.trim().strip_prefix("at(")?.strip_suffix(')')?;
    NaiveDateTime::parse_from_str(inner, AT_EXPRESSION_FORMAT).ok()
}

/// Create-or-update / delete reconciliation over a [`TriggerService`],
/// scoped to one trigger group.
#[derive(Debug, Clone)]
pub struct TriggerGateway<S: TriggerService> {
    service: S,
    group_name: String,
    retry_policy: RetryPolicy,
    dead_letter_target: Option<String>,
    past_due_grace: Duration,
}

impl<S: TriggerService> TriggerGateway<S> {
    pub fn new(service: S, group_name: impl Into<String>) -> Self {
        Self {
            service,
            group_name: group_name.into(),
            retry_policy: RetryPolicy::default(),
            dead_letter_target: None,
            past_due_grace: Duration::seconds(60),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_dead_letter_target(mut self, target: Option<String>) -> Self {
        self.dead_letter_target = target;
        self
    }

    pub fn with_past_due_grace(mut self, grace: Duration) -> Self {
        self.past_due_grace = grace;
        self
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Registers `payload` to fire at `scheduled` (wall-clock time in
    /// `zone_name`). An occurrence at or before `now` is redirected to fire
    /// shortly after `now` instead of being rejected.
    pub fn create_or_update(
        &self,
        uid: &str,
        scheduled: &LocalTime,
        zone_name: Option<&str>,
        payload: &FireNotification,
        now: DateTime<Utc>,
    ) -> GatewayOutcome {
        let zone = zone_name.and_then(|name| {
            let parsed = parse_zone(name);
            if parsed.is_none() {
                warn!("unknown time zone '{}' for reminder {}; using offset", name, uid);
            }
            parsed
        });
        let (fields, zone_label) = match self.resolve_schedule(scheduled, zone, now) {
            Some(resolved) => resolved,
            None => {
                error!(
                    "cannot resolve schedule for reminder {} at {}",
                    uid,
                    scheduled.encode()
                );
                return GatewayOutcome::failed(format!(
                    "unresolvable local time {}",
                    scheduled.encode()
                ));
            }
        };
        let payload = match payload.to_json() {
            Ok(payload) => payload,
            Err(err) => return GatewayOutcome::failed(err),
        };
        let spec = TriggerSpec {
            group_name: self.group_name.clone(),
            name: uid.to_string(),
            schedule_expression: format_at_expression(&fields),
            time_zone: zone_label,
            payload,
            retry_policy: self.retry_policy,
            dead_letter_target: self.dead_letter_target.clone(),
        };

        let existing = match self.service.get(&self.group_name, uid) {
            Ok(existing) => existing,
            Err(err) => {
                error!("trigger lookup failed for {}/{}: {}", self.group_name, uid, err);
                return GatewayOutcome::failed(err);
            }
        };
        let result = if existing.is_some() {
            self.service
                .update(&spec)
                .map(|id| (GatewayAction::Updated, id))
        } else {
            self.service
                .create(&spec)
                .map(|id| (GatewayAction::Created, id))
        };
        match result {
            Ok((action, provider_id)) => {
                info!(
                    "trigger {:?} {}/{} {} tz={}",
                    action, self.group_name, uid, spec.schedule_expression, spec.time_zone
                );
                let mut outcome = GatewayOutcome::ok(action, Some(provider_id));
                outcome.schedule_expression = Some(spec.schedule_expression);
                outcome
            }
            Err(err) => {
                error!(
                    "trigger create/update failed for {}/{} {}: {}",
                    self.group_name, uid, spec.schedule_expression, err
                );
                GatewayOutcome::failed(err)
            }
        }
    }

    /// Removes the trigger for `uid`; a trigger that does not exist counts as
    /// removed.
    pub fn delete(&self, uid: &str) -> GatewayOutcome {
        match self.service.delete(&self.group_name, uid) {
            Ok(()) => {
                info!("trigger deleted {}/{}", self.group_name, uid);
                GatewayOutcome::ok(GatewayAction::Deleted, None)
            }
            Err(TriggerServiceError::NotFound { .. }) => {
                info!("trigger {}/{} already absent", self.group_name, uid);
                GatewayOutcome::ok(GatewayAction::AlreadyAbsent, None)
            }
            Err(err) => {
                error!("trigger delete failed for {}/{}: {}", self.group_name, uid, err);
                GatewayOutcome::failed(err)
            }
        }
    }

    fn resolve_schedule(
        &self,
        scheduled: &LocalTime,
        zone: Option<Tz>,
        now: DateTime<Utc>,
    ) -> Option<(NaiveDateTime, String)> {
        let instant = scheduled.instant_in(zone.as_ref())?;
        if instant > now {
            return Some(match zone {
                Some(zone) => (scheduled.fields, zone.name().to_string()),
                None => (instant.naive_utc(), "UTC".to_string()),
            });
        }
        let fire_at = now + self.past_due_grace;
        warn!(
            "occurrence {} is past due; firing at {}",
            scheduled.encode(),
            fire_at.to_rfc3339()
        );
        Some(match zone {
            Some(zone) => (
                fire_at.with_timezone(&zone).naive_local(),
                zone.name().to_string(),
            ),
            None => (fire_at.naive_utc(), "UTC".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::local_time::decode;
    use crate::reminder::types::ThreadKey;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapService {
        triggers: RefCell<HashMap<(String, String), TriggerSpec>>,
        fail_writes: bool,
    }

    impl TriggerService for MapService {
        fn get(&self, group: &str, name: &str) -> Result<Option<TriggerRecord>, TriggerServiceError> {
            Ok(self
                .triggers
                .borrow()
                .get(&(group.to_string(), name.to_string()))
                .map(|spec| TriggerRecord {
                    provider_id: format!("{}/{}", group, name),
                    spec: spec.clone(),
                }))
        }

        fn create(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError> {
            if self.fail_writes {
                return Err(TriggerServiceError::Storage("throttled".to_string()));
            }
            self.triggers.borrow_mut().insert(
                (spec.group_name.clone(), spec.name.clone()),
                spec.clone(),
            );
            Ok(format!("{}/{}", spec.group_name, spec.name))
        }

        fn update(&self, spec: &TriggerSpec) -> Result<String, TriggerServiceError> {
            self.create(spec)
        }

        fn delete(&self, group: &str, name: &str) -> Result<(), TriggerServiceError> {
            self.triggers
                .borrow_mut()
                .remove(&(group.to_string(), name.to_string()))
                .map(|_| ())
                .ok_or_else(|| TriggerServiceError::NotFound {
                    group: group.to_string(),
                    name: name.to_string(),
                })
        }
    }

    fn notification(scheduled: &str) -> FireNotification {
        FireNotification::new("rem-1", scheduled, ThreadKey::new("user@example.com", "thread-1"))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 5, 12, 0, 0).unwrap()
    }

    #[test]
    fn create_then_update_keeps_one_trigger() {
        let gateway = TriggerGateway::new(MapService::default(), "reminders");
        let first = decode("2025-09-12T09:00:00-07:00").unwrap();
        let outcome = gateway.create_or_update(
            "rem-1",
            &first,
            Some("America/Los_Angeles"),
            &notification(&first.encode()),
            now(),
        );
        assert!(outcome.success);
        assert_eq!(outcome.action, GatewayAction::Created);
        assert_eq!(
            outcome.schedule_expression.as_deref(),
            Some("at(2025-09-12T09:00:00)")
        );

        let second = decode("2025-09-19T09:00:00-07:00").unwrap();
        let outcome = gateway.create_or_update(
            "rem-1",
            &second,
            Some("America/Los_Angeles"),
            &notification(&second.encode()),
            now(),
        );
        assert_eq!(outcome.action, GatewayAction::Updated);

        let triggers = gateway.service().triggers.borrow();
        assert_eq!(triggers.len(), 1);
        let spec = triggers
            .get(&("reminders".to_string(), "rem-1".to_string()))
            .unwrap();
        assert_eq!(spec.schedule_expression, "at(2025-09-19T09:00:00)");
        assert_eq!(spec.time_zone, "America/Los_Angeles");
        assert!(spec.payload.contains("2025-09-19T09:00:00-07:00"));
    }

    #[test]
    fn past_due_occurrence_fires_shortly_after_now() {
        let gateway = TriggerGateway::new(MapService::default(), "reminders");
        let past = decode("2025-09-05T04:00:00-07:00").unwrap();
        let outcome = gateway.create_or_update(
            "rem-1",
            &past,
            Some("America/Los_Angeles"),
            &notification(&past.encode()),
            now(),
        );
        assert!(outcome.success);
        // 12:00:00Z + 60s, expressed in Los Angeles wall-clock time.
        assert_eq!(
            outcome.schedule_expression.as_deref(),
            Some("at(2025-09-05T05:01:00)")
        );
    }

    #[test]
    fn unknown_zone_schedules_in_utc() {
        let gateway = TriggerGateway::new(MapService::default(), "reminders");
        let at = decode("2025-09-12T09:00:00+05:45").unwrap();
        let outcome =
            gateway.create_or_update("rem-1", &at, None, &notification(&at.encode()), now());
        assert!(outcome.success);
        assert_eq!(
            outcome.schedule_expression.as_deref(),
            Some("at(2025-09-12T03:15:00)")
        );
        let triggers = gateway.service().triggers.borrow();
        assert_eq!(triggers.values().next().unwrap().time_zone, "UTC");
    }

    #[test]
    fn delete_is_idempotent() {
        let gateway = TriggerGateway::new(MapService::default(), "reminders");
        let first = gateway.delete("never-scheduled");
        assert!(first.success);
        assert_eq!(first.action, GatewayAction::AlreadyAbsent);
        let second = gateway.delete("never-scheduled");
        assert_eq!(first, second);
    }

    #[test]
    fn service_failures_are_reported_not_raised() {
        let service = MapService {
            fail_writes: true,
            ..MapService::default()
        };
        let gateway = TriggerGateway::new(service, "reminders");
        let at = decode("2025-09-12T09:00:00-07:00").unwrap();
        let outcome = gateway.create_or_update(
            "rem-1",
            &at,
            Some("America/Los_Angeles"),
            &notification(&at.encode()),
            now(),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.action, GatewayAction::Failed);
        assert!(outcome.error.unwrap().contains("throttled"));
    }

    #[test]
    fn at_expressions_round_trip() {
        let fields = decode("2025-09-12T09:00:00-07:00").unwrap().fields;
        assert_eq!(
            parse_at_expression(&format_at_expression(&fields)),
            Some(fields)
        );
        assert_eq!(parse_at_expression("cron(0 9 * * ? *)"), None);
    }
}
