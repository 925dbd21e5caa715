//! Poll loop that turns due triggers into fire notifications for the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{error, info, warn};

use crate::config::{ConfigError, ReminderConfig};
use crate::mailer::{PostmarkMailer, ReminderMailer};
use crate::metrics::ReminderMetrics;
use crate::reminder::{
    CalendarBuilder, CalendarIdentity, ReminderEngine, TriggerGateway, TriggerService,
    TriggerServiceError,
};
use crate::thread_store::{SqliteThreadStore, ThreadStore, ThreadStoreError};
use crate::trigger_store::{DueTrigger, FailureDisposition, SqliteTriggerService};

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_BATCH_SIZE: usize = 32;

pub type SqliteReminderEngine =
    ReminderEngine<SqliteTriggerService, SqliteThreadStore, PostmarkMailer>;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("trigger store error: {0}")]
    Triggers(#[from] TriggerServiceError),
    #[error("thread store error: {0}")]
    Threads(#[from] ThreadStoreError),
}

/// Opens both SQLite stores and wires the engine the way `config` describes.
pub fn build_engine(
    config: &ReminderConfig,
    metrics: Arc<ReminderMetrics>,
) -> Result<(SqliteReminderEngine, SqliteTriggerService), WorkerError> {
    let organizer = CalendarIdentity::new(config.require_organizer_email()?)
        .with_name(config.organizer_name.clone());
    let triggers = SqliteTriggerService::new(&config.trigger_db_path)?;
    let threads = SqliteThreadStore::new(&config.thread_db_path)?;
    let gateway = TriggerGateway::new(triggers.clone(), config.trigger_group.clone())
        .with_retry_policy(config.retry_policy)
        .with_dead_letter_target(config.dead_letter_target.clone())
        .with_past_due_grace(config.past_due_grace);
    let calendar = CalendarBuilder::new(organizer, config.event_duration, config.sequence_policy);
    let engine = ReminderEngine::new(gateway, threads, PostmarkMailer::new(), calendar)
        .with_default_allowed_days(config.allowed_weekdays.clone())
        .with_metrics(metrics);
    Ok((engine, triggers))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    pub superseded: usize,
}

impl DeliveryReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Failed(FailureDisposition::Retrying { .. }) => self.retrying += 1,
            DeliveryOutcome::Failed(FailureDisposition::DeadLettered) => self.dead_lettered += 1,
            DeliveryOutcome::Failed(FailureDisposition::Superseded) => self.superseded += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Delivered,
    Failed(FailureDisposition),
}

/// Hands one claimed payload to the engine and settles the trigger.
fn deliver<S, T, M>(
    engine: &ReminderEngine<S, T, M>,
    triggers: &SqliteTriggerService,
    trigger: &DueTrigger,
    now: DateTime<Utc>,
) -> DeliveryOutcome
where
    S: TriggerService,
    T: ThreadStore,
    M: ReminderMailer,
{
    match engine.handle_fire_payload(&trigger.payload, now) {
        Ok(_) => {
            if let Err(err) = triggers.complete(trigger) {
                error!(
                    "failed to complete trigger {}/{}: {}",
                    trigger.group_name, trigger.name, err
                );
            }
            DeliveryOutcome::Delivered
        }
        Err(err) => {
            warn!(
                "delivery of trigger {}/{} failed (attempt {}): {}",
                trigger.group_name,
                trigger.name,
                trigger.attempts + 1,
                err
            );
            match triggers.record_failure(trigger, &err.to_string(), now) {
                Ok(disposition) => DeliveryOutcome::Failed(disposition),
                Err(store_err) => {
                    error!(
                        "failed to record delivery failure for {}/{}: {}",
                        trigger.group_name, trigger.name, store_err
                    );
                    DeliveryOutcome::Failed(FailureDisposition::Retrying {
                        attempts: trigger.attempts,
                    })
                }
            }
        }
    }
}

/// Claims and delivers everything due at `now` on the calling thread.
pub fn deliver_due<S, T, M>(
    engine: &ReminderEngine<S, T, M>,
    triggers: &SqliteTriggerService,
    now: DateTime<Utc>,
) -> Result<DeliveryReport, TriggerServiceError>
where
    S: TriggerService,
    T: ThreadStore,
    M: ReminderMailer,
{
    let mut report = DeliveryReport::default();
    for trigger in triggers.claim_due(now, DEFAULT_BATCH_SIZE)? {
        report.record(deliver(engine, triggers, &trigger, now));
    }
    Ok(report)
}

pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let mut remaining = total;
    while !stop.load(Ordering::Relaxed) && !remaining.is_zero() {
        let step = remaining.min(STOP_CHECK_INTERVAL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn poll_loop(
    triggers: SqliteTriggerService,
    sender: Sender<DueTrigger>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
) {
    info!("reminder poller started (interval {:?})", poll_interval);
    while !stop.load(Ordering::Relaxed) {
        match triggers.claim_due(Utc::now(), DEFAULT_BATCH_SIZE) {
            Ok(due) => {
                if !due.is_empty() {
                    info!("claimed {} due reminder trigger(s)", due.len());
                }
                for trigger in due {
                    if sender.send(trigger).is_err() {
                        warn!("reminder handler gone; stopping poller");
                        return;
                    }
                }
            }
            Err(err) => error!("failed to claim due triggers: {}", err),
        }
        sleep_unless_stopped(poll_interval, &stop);
    }
    info!("reminder poller stopped");
}

fn handler_loop<S, T, M>(
    engine: ReminderEngine<S, T, M>,
    triggers: SqliteTriggerService,
    receiver: Receiver<DueTrigger>,
    stop: Arc<AtomicBool>,
) where
    S: TriggerService,
    T: ThreadStore,
    M: ReminderMailer,
{
    info!("reminder handler started");
    let mut report = DeliveryReport::default();
    while !stop.load(Ordering::Relaxed) {
        match receiver.recv_timeout(STOP_CHECK_INTERVAL) {
            Ok(trigger) => report.record(deliver(&engine, &triggers, &trigger, Utc::now())),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(
        "reminder handler stopped: delivered={} retrying={} dead_lettered={} superseded={}",
        report.delivered, report.retrying, report.dead_lettered, report.superseded
    );
}

/// Starts the poller and the handler thread. Claimed triggers travel over a
/// bounded channel so the poller never races ahead of delivery.
pub fn start_worker_threads<S, T, M>(
    engine: ReminderEngine<S, T, M>,
    triggers: SqliteTriggerService,
    poll_interval: Duration,
) -> WorkerControl
where
    S: TriggerService + Send + 'static,
    T: ThreadStore + Send + 'static,
    M: ReminderMailer + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = bounded::<DueTrigger>(DEFAULT_BATCH_SIZE);
    let mut handles = Vec::with_capacity(2);

    {
        let triggers = triggers.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            poll_loop(triggers, sender, poll_interval, stop)
        }));
    }
    {
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            handler_loop(engine, triggers, receiver, stop)
        }));
    }

    WorkerControl { stop, handles }
}
