use serde::{Deserialize, Serialize};

use super::types::ThreadKey;

/// Marker every reminder-fire payload carries; other events on the same
/// queue are ignored.
pub const FIRE_EVENT_TYPE: &str = "reminder.fire";

/// Payload the external trigger delivers when a reminder comes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FireNotification {
    pub event_type: String,
    pub uid: String,
    /// The occurrence that fired, as the ISO local time it was scheduled for.
    pub scheduled_time: String,
    pub thread_key: ThreadKey,
}

impl FireNotification {
    pub fn new(uid: impl Into<String>, scheduled_time: impl Into<String>, thread_key: ThreadKey) -> Self {
        Self {
            event_type: FIRE_EVENT_TYPE.to_string(),
            uid: uid.into(),
            scheduled_time: scheduled_time.into(),
            thread_key,
        }
    }

    pub fn to_json(&self) -> Result<String, NotificationError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a reminder fire event (eventType={0:?})")]
    NotAReminderFire(Option<String>),
    #[error("fire notification missing field {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFireNotification {
    event_type: Option<String>,
    uid: Option<String>,
    scheduled_time: Option<String>,
    thread_key: Option<ThreadKey>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, NotificationError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(NotificationError::MissingField(field))
}

/// Validates the marker and the required fields of a queued payload.
pub fn parse_fire_notification(payload: &str) -> Result<FireNotification, NotificationError> {
    let raw: RawFireNotification = serde_json::from_str(payload)?;
    if raw.event_type.as_deref() != Some(FIRE_EVENT_TYPE) {
        return Err(NotificationError::NotAReminderFire(raw.event_type));
    }
    let uid = required(raw.uid, "uid")?;
    let scheduled_time = required(raw.scheduled_time, "scheduledTime")?;
    let thread_key = raw
        .thread_key
        .filter(|key| !key.owner.trim().is_empty() && !key.thread_id.trim().is_empty())
        .ok_or(NotificationError::MissingField("threadKey"))?;
    Ok(FireNotification {
        event_type: FIRE_EVENT_TYPE.to_string(),
        uid,
        scheduled_time,
        thread_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_serializes() {
        let notification = FireNotification::new(
            "rem-1",
            "2025-09-12T09:00:00-07:00",
            ThreadKey::new("user@example.com", "<root@mail>"),
        );
        let json = notification.to_json().expect("json");
        assert!(json.contains("\"eventType\":\"reminder.fire\""));
        assert!(json.contains("\"threadId\":\"<root@mail>\""));
        assert_eq!(parse_fire_notification(&json).expect("parse"), notification);
    }

    #[test]
    fn rejects_payloads_without_marker() {
        let payload = r#"{"uid":"rem-1","scheduledTime":"2025-09-12T09:00:00-07:00","threadKey":{"owner":"a","threadId":"b"}}"#;
        assert!(matches!(
            parse_fire_notification(payload),
            Err(NotificationError::NotAReminderFire(None))
        ));
        let payload = r#"{"eventType":"email.arrived","uid":"rem-1"}"#;
        assert!(matches!(
            parse_fire_notification(payload),
            Err(NotificationError::NotAReminderFire(Some(_)))
        ));
    }

    #[test]
    fn rejects_missing_fields_and_garbage() {
        let payload = r#"{"eventType":"reminder.fire","uid":" ","scheduledTime":"x","threadKey":{"owner":"a","threadId":"b"}}"#;
        assert!(matches!(
            parse_fire_notification(payload),
            Err(NotificationError::MissingField("uid"))
        ));
        let payload = r#"{"eventType":"reminder.fire","uid":"rem-1","scheduledTime":"x"}"#;
        assert!(matches!(
            parse_fire_notification(payload),
            Err(NotificationError::MissingField("threadKey"))
        ));
        assert!(matches!(
            parse_fire_notification("not json"),
            Err(NotificationError::Json(_))
        ));
    }
}
