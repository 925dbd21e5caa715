use chrono::{DateTime, Utc, Weekday};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::mailer::{MailerError, OutboundReminder, ReminderMailer};
use crate::metrics::{self, ReminderMetrics};
use crate::thread_store::{StoredMessage, ThreadStore, ThreadStoreError};

use super::calendar::{CalendarArtifact, CalendarBuilder, CalendarError, CalendarIdentity};
use super::gateway::{GatewayOutcome, TriggerGateway, TriggerService};
use super::local_time::{decode, parse_zone, LocalTime};
use super::notification::{parse_fire_notification, FireNotification};
use super::recurrence::{next_future_occurrence, RecurrenceError};
use super::resolver::{resolve, ResolvedReminder};
use super::types::{Reminder, ReminderState, ThreadKey};

/// Errors the engine propagates to the invoking framework. Everything else is
/// recovered locally with a log line and a metric.
#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error("recurrence failed for reminder {uid}: {source}")]
    Recurrence {
        uid: String,
        #[source]
        source: RecurrenceError,
    },
    #[error("thread store error: {0}")]
    ThreadStore(#[from] ThreadStoreError),
    #[error("mail error: {0}")]
    Mail(#[from] MailerError),
}

/// What happened to one snapshot of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub uid: String,
    pub state: ReminderState,
    pub gateway: Option<GatewayOutcome>,
    /// REQUEST/CANCEL artifact for the reply composer, when one could be built.
    pub calendar: Option<CalendarArtifact>,
    /// The occurrence the trigger was registered for.
    pub scheduled_time: Option<String>,
    pub error: Option<String>,
}

impl SnapshotOutcome {
    fn invalid(uid: &str, error: impl ToString) -> Self {
        Self {
            uid: uid.to_string(),
            state: ReminderState::Unscheduled,
            gateway: None,
            calendar: None,
            scheduled_time: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAction {
    /// No message in the thread mentions the uid any more.
    NotFound,
    Cancelled,
    /// A `once` reminder was delivered and is finished.
    Sent,
    /// A recurring reminder was delivered and its next occurrence registered.
    SentAndRescheduled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireOutcome {
    pub uid: String,
    pub action: FireAction,
    pub state: ReminderState,
    pub next_occurrence: Option<String>,
    pub gateway: Option<GatewayOutcome>,
    pub calendar: Option<CalendarArtifact>,
}

impl FireOutcome {
    fn dropped(uid: &str, action: FireAction, state: ReminderState) -> Self {
        Self {
            uid: uid.to_string(),
            action,
            state,
            next_occurrence: None,
            gateway: None,
            calendar: None,
        }
    }
}

/// Civil zone used for a reminder: its explicit IANA name when valid,
/// otherwise the zone observing the snapshot's offset when it was authored.
/// Later occurrences carry that same offset verbatim, so guessing from them
/// would pick a different zone once DST has changed.
fn zone_name_for(reminder: &Reminder, time: &LocalTime) -> Option<String> {
    if let Some(explicit) = reminder.explicit_time_zone() {
        if parse_zone(explicit).is_some() {
            return Some(explicit.to_string());
        }
        warn!(
            "reminder {} carries unknown time zone '{}'; using offset {}",
            reminder.uid,
            explicit,
            time.offset.as_str()
        );
    }
    match decode(&reminder.date_time) {
        Ok(authored) => authored.guess_zone_name(),
        Err(_) => time.guess_zone_name(),
    }
}

/// Number of `messages` carrying a snapshot of `uid`.
fn revision_of<'a>(messages: impl Iterator<Item = &'a StoredMessage>, uid: &str) -> u32 {
    let count = messages
        .filter(|message| message.reminders.iter().any(|r| r.has_uid(uid)))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

pub struct ReminderEngine<S: TriggerService, T: ThreadStore, M: ReminderMailer> {
    gateway: TriggerGateway<S>,
    threads: T,
    mailer: M,
    calendar: CalendarBuilder,
    default_allowed_days: Vec<Weekday>,
    metrics: Arc<ReminderMetrics>,
}

impl<S: TriggerService, T: ThreadStore, M: ReminderMailer> ReminderEngine<S, T, M> {
    pub fn new(gateway: TriggerGateway<S>, threads: T, mailer: M, calendar: CalendarBuilder) -> Self {
        Self {
            gateway,
            threads,
            mailer,
            calendar,
            default_allowed_days: Vec::new(),
            metrics: Arc::new(ReminderMetrics::new()),
        }
    }

    /// Weekday constraint for reminders that do not carry their own.
    pub fn with_default_allowed_days(mut self, days: Vec<Weekday>) -> Self {
        self.default_allowed_days = days;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ReminderMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &ReminderMetrics {
        &self.metrics
    }

    pub fn gateway(&self) -> &TriggerGateway<S> {
        &self.gateway
    }

    pub fn threads(&self) -> &T {
        &self.threads
    }

    pub fn mailer(&self) -> &M {
        &self.mailer
    }

    /// Persists an inbound message and reconciles every snapshot it carries.
    pub fn ingest_message(
        &self,
        message: &StoredMessage,
        now: DateTime<Utc>,
    ) -> Result<Vec<SnapshotOutcome>, ReminderError> {
        self.threads.put_message(message)?;
        let history = self.threads.messages_by_thread_key(&message.thread_key)?;
        info!(
            "ingested message {} on {} with {} reminder(s)",
            message.message_id,
            message.thread_key,
            message.reminders.len()
        );

        let outcomes = message
            .reminders
            .iter()
            .map(|reminder| {
                let older = history
                    .iter()
                    .filter(|stored| stored.email_date < message.email_date);
                let revision = revision_of(older, &reminder.uid);
                self.process_snapshot(&message.thread_key, reminder, revision, now)
            })
            .collect();
        Ok(outcomes)
    }

    /// Reconciles a batch of snapshots that are not stored yet. Every stored
    /// message of the thread that mentions a uid counts as an earlier
    /// revision. One bad snapshot never stops its siblings.
    pub fn process_snapshots(
        &self,
        key: &ThreadKey,
        reminders: &[Reminder],
        now: DateTime<Utc>,
    ) -> Vec<SnapshotOutcome> {
        let history = self.threads.messages_by_thread_key(key).unwrap_or_else(|err| {
            warn!("cannot load history of {} for revisions: {}", key, err);
            Vec::new()
        });
        reminders
            .iter()
            .map(|reminder| {
                let revision = revision_of(history.iter(), &reminder.uid);
                self.process_snapshot(key, reminder, revision, now)
            })
            .collect()
    }

    /// Schedules, reschedules or cancels the trigger for one snapshot.
    /// `revision` counts earlier snapshots of the same uid in the thread.
    pub fn process_snapshot(
        &self,
        key: &ThreadKey,
        reminder: &Reminder,
        revision: u32,
        now: DateTime<Utc>,
    ) -> SnapshotOutcome {
        let uid = reminder.uid.trim();
        if uid.is_empty() {
            warn!("skipping reminder without uid on {}", key);
            self.metrics.incr(metrics::SNAPSHOT_INVALID);
            return SnapshotOutcome::invalid("", "missing uid");
        }

        if reminder.is_cancelled() {
            return self.cancel(key, reminder, revision);
        }

        let start = match decode(&reminder.date_time) {
            Ok(start) => start,
            Err(err) => {
                warn!("skipping reminder {} on {}: {}", uid, key, err);
                self.metrics.incr(metrics::SNAPSHOT_INVALID);
                return SnapshotOutcome::invalid(uid, err);
            }
        };
        let zone_name = zone_name_for(reminder, &start);
        let zone = zone_name.as_deref().and_then(parse_zone);
        let pattern = reminder.recurrence_pattern();

        let is_past = start
            .instant_in(zone.as_ref())
            .map(|instant| instant <= now)
            .unwrap_or(false);
        let scheduled = if is_past && pattern.is_recurring() {
            let allowed = self.allowed_days_for(reminder);
            match next_future_occurrence(&start, pattern, &allowed, |candidate| {
                candidate
                    .instant_in(zone.as_ref())
                    .map(|instant| instant > now)
                    .unwrap_or(false)
            }) {
                Ok(next) => {
                    info!(
                        "reminder {} first occurrence {} already passed; skipped {} more, next {}",
                        uid,
                        start.encode(),
                        next.skipped,
                        next.time.encode()
                    );
                    if next.weekday_adjusted {
                        self.metrics.incr(metrics::WEEKDAY_ADJUSTED);
                    }
                    next.time
                }
                Err(err) => {
                    error!("cannot catch up reminder {} on {}: {}", uid, key, err);
                    self.metrics.incr(metrics::SCHEDULE_FAILED);
                    return SnapshotOutcome::invalid(uid, err);
                }
            }
        } else {
            start
        };

        let payload = FireNotification::new(uid, scheduled.encode(), key.clone());
        let outcome =
            self.gateway
                .create_or_update(uid, &scheduled, zone_name.as_deref(), &payload, now);
        let state = if outcome.success {
            self.metrics.incr(metrics::SCHEDULED);
            ReminderState::Scheduled
        } else {
            error!(
                "failed to schedule reminder {} on {} at {}: {}",
                uid,
                key,
                scheduled.encode(),
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            self.metrics.incr(metrics::SCHEDULE_FAILED);
            ReminderState::Unscheduled
        };

        let mut effective = reminder.clone();
        effective.date_time = scheduled.encode();
        let calendar = self.calendar_or_skip(
            uid,
            self.calendar.for_snapshot(
                &effective,
                &CalendarIdentity::new(key.owner.clone()),
                zone_name.as_deref(),
                revision,
            ),
        );

        SnapshotOutcome {
            uid: uid.to_string(),
            state,
            error: outcome.error.clone(),
            gateway: Some(outcome),
            calendar,
            scheduled_time: Some(scheduled.encode()),
        }
    }

    fn cancel(&self, key: &ThreadKey, reminder: &Reminder, revision: u32) -> SnapshotOutcome {
        let uid = reminder.uid.trim();
        let outcome = self.gateway.delete(uid);
        if outcome.success {
            info!(
                "reminder {} on {} cancelled{}",
                uid,
                key,
                reminder
                    .cancellation_reason()
                    .map(|reason| format!(": {}", reason))
                    .unwrap_or_default()
            );
            self.metrics.incr(metrics::CANCELLED);
        } else {
            error!(
                "failed to cancel trigger for reminder {} on {}: {}",
                uid,
                key,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            self.metrics.incr(metrics::CANCEL_FAILED);
        }

        let zone_name = decode(&reminder.date_time)
            .ok()
            .and_then(|start| zone_name_for(reminder, &start));
        let calendar = self.calendar_or_skip(
            uid,
            self.calendar.for_snapshot(
                reminder,
                &CalendarIdentity::new(key.owner.clone()),
                zone_name.as_deref(),
                revision,
            ),
        );

        SnapshotOutcome {
            uid: uid.to_string(),
            state: ReminderState::Cancelled,
            error: outcome.error.clone(),
            gateway: Some(outcome),
            calendar,
            scheduled_time: None,
        }
    }

    /// Parses a queued payload and handles it. Malformed payloads and other
    /// event types are dropped with a metric.
    pub fn handle_fire_payload(
        &self,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FireOutcome>, ReminderError> {
        match parse_fire_notification(payload) {
            Ok(notification) => self.handle_fire(&notification, now).map(Some),
            Err(err) => {
                warn!("dropping fire payload: {}", err);
                self.metrics.incr(metrics::FIRE_INVALID_PAYLOAD);
                Ok(None)
            }
        }
    }

    /// Delivers a due reminder and, for recurring ones, registers the next
    /// occurrence. Safe to repeat for the same notification.
    pub fn handle_fire(
        &self,
        notification: &FireNotification,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, ReminderError> {
        let uid = notification.uid.as_str();
        let key = &notification.thread_key;
        let Some(resolved) = resolve(&self.threads, key, uid)? else {
            info!("reminder {} not found on {}; dropping fire", uid, key);
            self.metrics.incr(metrics::FIRE_NOT_FOUND);
            return Ok(FireOutcome::dropped(uid, FireAction::NotFound, ReminderState::Terminal));
        };
        let reminder = &resolved.reminder;

        if reminder.is_cancelled() {
            info!("reminder {} on {} is cancelled; not sending", uid, key);
            self.metrics.incr(metrics::FIRE_CANCELLED);
            return Ok(FireOutcome::dropped(uid, FireAction::Cancelled, ReminderState::Cancelled));
        }

        let pattern = reminder.recurrence_pattern();
        if !pattern.is_recurring() {
            self.mailer
                .send(&self.compose(key, reminder, &notification.scheduled_time, None, None))?;
            self.metrics.incr(metrics::FIRE_SENT);
            info!("reminder {} on {} delivered (once)", uid, key);
            return Ok(FireOutcome::dropped(uid, FireAction::Sent, ReminderState::Terminal));
        }

        let fired = self.fired_occurrence(notification, &resolved)?;
        let zone_name = zone_name_for(reminder, &fired);
        let zone = zone_name.as_deref().and_then(parse_zone);
        let allowed = self.allowed_days_for(reminder);
        let next = next_future_occurrence(&fired, pattern, &allowed, |candidate| {
            candidate
                .instant_in(zone.as_ref())
                .map(|instant| instant > now)
                .unwrap_or(false)
        })
        .map_err(|source| {
            error!(
                "recurrence chain broken for reminder {} on {} ({} from {}): {}",
                uid,
                key,
                pattern,
                fired.encode(),
                source
            );
            ReminderError::Recurrence {
                uid: uid.to_string(),
                source,
            }
        })?;
        if next.weekday_adjusted {
            info!(
                "reminder {} next occurrence moved to allowed weekday {}",
                uid,
                next.time.encode()
            );
            self.metrics.incr(metrics::WEEKDAY_ADJUSTED);
        }
        if next.skipped > 0 {
            warn!("reminder {} skipped {} missed occurrence(s)", uid, next.skipped);
        }

        let payload = FireNotification::new(uid, next.time.encode(), key.clone());
        let gateway = self
            .gateway
            .create_or_update(uid, &next.time, zone_name.as_deref(), &payload, now);
        if gateway.success {
            self.metrics.incr(metrics::FIRE_RESCHEDULED);
        } else {
            error!(
                "failed to reschedule reminder {} on {} for {}: {}",
                uid,
                key,
                next.time.encode(),
                gateway.error.as_deref().unwrap_or("unknown error")
            );
            self.metrics.incr(metrics::SCHEDULE_FAILED);
        }

        let calendar = self.calendar_or_skip(
            uid,
            self.calendar.for_next_occurrence(
                reminder,
                &next.time,
                &CalendarIdentity::new(key.owner.clone()),
                zone_name.as_deref(),
                resolved.revision,
            ),
        );
        let next_encoded = next.time.encode();
        self.mailer.send(&self.compose(
            key,
            reminder,
            &notification.scheduled_time,
            Some(&next_encoded),
            calendar.as_ref(),
        ))?;
        self.metrics.incr(metrics::FIRE_SENT);
        info!(
            "reminder {} on {} delivered; next occurrence {}",
            uid, key, next_encoded
        );

        Ok(FireOutcome {
            uid: uid.to_string(),
            action: FireAction::SentAndRescheduled,
            state: ReminderState::Scheduled,
            next_occurrence: Some(next_encoded),
            gateway: Some(gateway),
            calendar,
        })
    }

    /// The occurrence that just fired: the notification's scheduled time, or
    /// the snapshot's own time when that cannot be decoded.
    fn fired_occurrence(
        &self,
        notification: &FireNotification,
        resolved: &ResolvedReminder,
    ) -> Result<LocalTime, ReminderError> {
        match decode(&notification.scheduled_time) {
            Ok(fired) => Ok(fired),
            Err(err) => {
                warn!(
                    "fire for {} has unusable scheduledTime '{}': {}; using snapshot time",
                    notification.uid, notification.scheduled_time, err
                );
                decode(&resolved.reminder.date_time).map_err(|err| {
                    error!(
                        "reminder {} has no decodable occurrence time: {}",
                        notification.uid, err
                    );
                    ReminderError::Recurrence {
                        uid: notification.uid.clone(),
                        source: RecurrenceError::from(err),
                    }
                })
            }
        }
    }

    fn allowed_days_for(&self, reminder: &Reminder) -> Vec<Weekday> {
        let own = reminder.allowed_weekdays();
        if own.is_empty() {
            self.default_allowed_days.clone()
        } else {
            own
        }
    }

    fn calendar_or_skip(
        &self,
        uid: &str,
        artifact: Result<CalendarArtifact, CalendarError>,
    ) -> Option<CalendarArtifact> {
        match artifact {
            Ok(artifact) => {
                info!("calendar artifact {}", artifact);
                Some(artifact)
            }
            Err(err) => {
                warn!("skipping calendar artifact for reminder {}: {}", uid, err);
                self.metrics.incr(metrics::CALENDAR_SKIPPED);
                None
            }
        }
    }

    fn compose(
        &self,
        key: &ThreadKey,
        reminder: &Reminder,
        fired: &str,
        next: Option<&str>,
        calendar: Option<&CalendarArtifact>,
    ) -> OutboundReminder {
        let mut body = format!("Reminder: {}\n", reminder.title());
        let description = reminder.contextual_description.trim();
        if !description.is_empty() {
            body.push_str(&format!("\n{}\n", description));
        }
        let text = reminder.text.trim();
        if !text.is_empty() && text != reminder.title() {
            body.push_str(&format!("\nYou asked: \"{}\"\n", text));
        }
        body.push_str(&format!("\nScheduled for {}\n", fired));
        if let Some(next) = next {
            body.push_str(&format!(
                "Repeats {}; next reminder {}\n",
                reminder.recurrence_pattern(),
                next
            ));
        }
        OutboundReminder {
            to: key.owner.clone(),
            from: self.calendar.organizer().mailbox(),
            subject: format!("Reminder: {}", reminder.title()),
            text_body: body,
            html_body: None,
            calendar: calendar.map(|artifact| artifact.to_attachment(Utc::now())),
        }
    }
}
