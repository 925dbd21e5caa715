use chrono::Weekday;
use serde::Deserialize;
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::reminder::{RetryPolicy, SequencePolicy};

const DEFAULT_TRIGGER_GROUP: &str = "reminders";
const DEFAULT_ORGANIZER_NAME: &str = "Reminders";
const DEFAULT_DEAD_LETTER_TARGET: &str = "reminders-dlq";
const DEFAULT_EVENT_DURATION_MINUTES: i64 = 30;
const DEFAULT_PAST_DUE_GRACE_SECS: i64 = 60;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Optional `reminder.toml`; every value can be overridden from the
/// environment.
#[derive(Debug, Deserialize, Default)]
pub struct ReminderConfigFile {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub trigger: TriggerSection,
    #[serde(default)]
    pub calendar: CalendarSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageSection {
    pub state_dir: Option<PathBuf>,
    pub thread_db_path: Option<PathBuf>,
    pub trigger_db_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerSection {
    pub group: Option<String>,
    pub past_due_grace_secs: Option<i64>,
    pub retry_max_attempts: Option<u32>,
    pub retry_max_event_age_secs: Option<u64>,
    pub dead_letter_target: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CalendarSection {
    pub organizer_email: Option<String>,
    pub organizer_name: Option<String>,
    pub event_duration_minutes: Option<i64>,
    pub sequence_policy: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScheduleSection {
    #[serde(default)]
    pub allowed_weekdays: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub thread_db_path: PathBuf,
    pub trigger_db_path: PathBuf,
    pub trigger_group: String,
    pub organizer_email: Option<String>,
    pub organizer_name: String,
    pub event_duration: chrono::Duration,
    pub past_due_grace: chrono::Duration,
    pub sequence_policy: SequencePolicy,
    pub allowed_weekdays: Vec<Weekday>,
    pub retry_policy: RetryPolicy,
    pub dead_letter_target: Option<String>,
    pub poll_interval: Duration,
}

impl ReminderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match resolve_config_path() {
            Some(path) => load_config_file(&path)?,
            None => ReminderConfigFile::default(),
        };
        Self::from_sources(file, |key| env::var(key).ok())
    }

    /// Merges a parsed config file with overrides from `lookup`.
    pub fn from_sources<F>(file: ReminderConfigFile, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let state_dir = match var("REMINDER_STATE_DIR").map(PathBuf::from) {
            Some(path) => path,
            None => match file.storage.state_dir {
                Some(path) => path,
                None => default_state_dir()?,
            },
        };
        let thread_db_path = var("REMINDER_THREAD_DB_PATH")
            .map(PathBuf::from)
            .or(file.storage.thread_db_path)
            .unwrap_or_else(|| state_dir.join("threads.db"));
        let trigger_db_path = var("REMINDER_TRIGGER_DB_PATH")
            .map(PathBuf::from)
            .or(file.storage.trigger_db_path)
            .unwrap_or_else(|| state_dir.join("triggers.db"));

        let trigger_group = var("REMINDER_TRIGGER_GROUP")
            .or(file.trigger.group)
            .unwrap_or_else(|| DEFAULT_TRIGGER_GROUP.to_string());
        let organizer_email = var("REMINDER_ORGANIZER_EMAIL").or(file.calendar.organizer_email);
        let organizer_name = var("REMINDER_ORGANIZER_NAME")
            .or(file.calendar.organizer_name)
            .unwrap_or_else(|| DEFAULT_ORGANIZER_NAME.to_string());

        let event_duration_minutes = parse_number(
            "REMINDER_EVENT_DURATION_MINUTES",
            var("REMINDER_EVENT_DURATION_MINUTES"),
            file.calendar.event_duration_minutes,
            DEFAULT_EVENT_DURATION_MINUTES,
        )
        .max(1);
        let past_due_grace_secs = parse_number(
            "REMINDER_PAST_DUE_GRACE_SECS",
            var("REMINDER_PAST_DUE_GRACE_SECS"),
            file.trigger.past_due_grace_secs,
            DEFAULT_PAST_DUE_GRACE_SECS,
        )
        .max(0);

        let sequence_policy = match var("REMINDER_SEQUENCE_POLICY").or(file.calendar.sequence_policy) {
            Some(raw) => raw.parse::<SequencePolicy>().map_err(ConfigError::Invalid)?,
            None => SequencePolicy::default(),
        };

        let weekday_names = match var("REMINDER_ALLOWED_WEEKDAYS") {
            Some(raw) => raw
                .split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
            None => file.schedule.allowed_weekdays,
        };
        let allowed_weekdays = parse_weekdays_strict(&weekday_names)?;

        let defaults = RetryPolicy::default();
        let retry_policy = RetryPolicy {
            max_attempts: parse_number(
                "REMINDER_RETRY_MAX_ATTEMPTS",
                var("REMINDER_RETRY_MAX_ATTEMPTS"),
                file.trigger.retry_max_attempts,
                defaults.max_attempts,
            )
            .max(1),
            max_event_age_secs: parse_number(
                "REMINDER_RETRY_MAX_EVENT_AGE_SECS",
                var("REMINDER_RETRY_MAX_EVENT_AGE_SECS"),
                file.trigger.retry_max_event_age_secs,
                defaults.max_event_age_secs,
            ),
        };
        let dead_letter_target = Some(
            var("REMINDER_DEAD_LETTER_TARGET")
                .or(file.trigger.dead_letter_target)
                .unwrap_or_else(|| DEFAULT_DEAD_LETTER_TARGET.to_string()),
        );
        let poll_interval_secs = parse_number(
            "REMINDER_POLL_INTERVAL_SECS",
            var("REMINDER_POLL_INTERVAL_SECS"),
            file.trigger.poll_interval_secs,
            DEFAULT_POLL_INTERVAL_SECS,
        )
        .max(1);

        Ok(Self {
            thread_db_path,
            trigger_db_path,
            trigger_group,
            organizer_email,
            organizer_name,
            event_duration: chrono::Duration::minutes(event_duration_minutes),
            past_due_grace: chrono::Duration::seconds(past_due_grace_secs),
            sequence_policy,
            allowed_weekdays,
            retry_policy,
            dead_letter_target,
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }

    /// Organizer address, required before any mail or invite can be built.
    pub fn require_organizer_email(&self) -> Result<&str, ConfigError> {
        self.organizer_email
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("REMINDER_ORGANIZER_EMAIL is not set".to_string()))
    }
}

fn parse_number<T>(key: &str, raw: Option<String>, from_file: Option<T>, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    match raw {
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("invalid {}='{}'; using default", key, value);
                from_file.unwrap_or(default)
            }
        },
        None => from_file.unwrap_or(default),
    }
}

fn parse_weekdays_strict(names: &[String]) -> Result<Vec<Weekday>, ConfigError> {
    let mut days = Vec::new();
    for name in names {
        let day = name
            .trim()
            .parse::<Weekday>()
            .map_err(|_| ConfigError::Invalid(format!("unknown weekday '{}'", name)))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
}

fn default_state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
    Ok(home.join(".reminder_module").join("state"))
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("REMINDER_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let cwd = env::current_dir().ok()?;
    let direct = cwd.join("reminder.toml");
    if direct.exists() {
        return Some(direct);
    }
    None
}

pub fn load_config_file(path: &Path) -> Result<ReminderConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<ReminderConfigFile>(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ReminderConfig::from_sources(
            ReminderConfigFile::default(),
            lookup(&[("REMINDER_STATE_DIR", "/tmp/reminders")]),
        )
        .expect("config");
        assert_eq!(config.thread_db_path, PathBuf::from("/tmp/reminders/threads.db"));
        assert_eq!(config.trigger_db_path, PathBuf::from("/tmp/reminders/triggers.db"));
        assert_eq!(config.trigger_group, "reminders");
        assert_eq!(config.organizer_name, "Reminders");
        assert_eq!(config.event_duration, chrono::Duration::minutes(30));
        assert_eq!(config.past_due_grace, chrono::Duration::seconds(60));
        assert_eq!(config.sequence_policy, SequencePolicy::Fixed);
        assert!(config.allowed_weekdays.is_empty());
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert_eq!(config.dead_letter_target.as_deref(), Some("reminders-dlq"));
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert!(config.require_organizer_email().is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let file: ReminderConfigFile = toml::from_str(
            r#"
            [storage]
            state_dir = "/srv/reminders"

            [trigger]
            group = "from-file"
            retry_max_attempts = 5

            [calendar]
            organizer_email = "file@example.com"
            sequence_policy = "revision"

            [schedule]
            allowed_weekdays = ["sat"]
            "#,
        )
        .expect("toml");
        let config = ReminderConfig::from_sources(
            file,
            lookup(&[
                ("REMINDER_TRIGGER_GROUP", "from-env"),
                ("REMINDER_ALLOWED_WEEKDAYS", "mon, Wednesday"),
                ("REMINDER_EVENT_DURATION_MINUTES", "not-a-number"),
            ]),
        )
        .expect("config");
        assert_eq!(config.trigger_group, "from-env");
        assert_eq!(config.thread_db_path, PathBuf::from("/srv/reminders/threads.db"));
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(config.require_organizer_email().unwrap(), "file@example.com");
        assert_eq!(config.sequence_policy, SequencePolicy::Revision);
        assert_eq!(config.allowed_weekdays, vec![Weekday::Mon, Weekday::Wed]);
        assert_eq!(config.event_duration, chrono::Duration::minutes(30));
    }

    #[test]
    fn rejects_unknown_policy_and_weekday() {
        let err = ReminderConfig::from_sources(
            ReminderConfigFile::default(),
            lookup(&[
                ("REMINDER_STATE_DIR", "/tmp/r"),
                ("REMINDER_SEQUENCE_POLICY", "increment"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ReminderConfig::from_sources(
            ReminderConfigFile::default(),
            lookup(&[("REMINDER_STATE_DIR", "/tmp/r"), ("REMINDER_ALLOWED_WEEKDAYS", "funday")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
