pub mod config;
pub mod mailer;
pub mod metrics;
pub mod reminder;
pub mod thread_store;
pub mod trigger_store;
pub mod worker;

pub use reminder::{
    FireAction, FireNotification, FireOutcome, Reminder, ReminderEngine, ReminderError,
    ReminderState, ReminderStatus, SnapshotOutcome, ThreadKey,
};
