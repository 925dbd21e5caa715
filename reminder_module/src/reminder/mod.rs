mod calendar;
mod core;
mod gateway;
mod local_time;
mod notification;
mod recurrence;
mod resolver;
mod types;

pub use self::core::{FireAction, FireOutcome, ReminderEngine, ReminderError, SnapshotOutcome};
pub use calendar::{
    CalendarArtifact, CalendarAttachment, CalendarBuilder, CalendarError, CalendarIdentity,
    CalendarMethod, EventStatus, ParticipationStatus, SequencePolicy,
};
pub use gateway::{
    format_at_expression, parse_at_expression, GatewayAction, GatewayOutcome, RetryPolicy,
    TriggerGateway, TriggerRecord, TriggerService, TriggerServiceError, TriggerSpec,
};
pub use local_time::{
    decode, encode, offset_to_zone_name, parse_zone, zone_offset_at, LocalTime, LocalTimeError,
    UtcOffset,
};
pub use notification::{parse_fire_notification, FireNotification, NotificationError, FIRE_EVENT_TYPE};
pub use recurrence::{
    advance, constrain_to_allowed_weekdays, next_future_occurrence, next_occurrence,
    parse_recurrence, NextOccurrence, RecurrenceError, RecurrencePattern,
};
pub use resolver::{resolve, resolve_in, ResolvedReminder};
pub use types::{Reminder, ReminderState, ReminderStatus, ThreadKey};
pub(crate) use types::parse_weekday_names;
