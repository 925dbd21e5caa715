pub(super) const TRIGGER_STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS triggers (
    group_name TEXT NOT NULL,
    name TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    schedule_expression TEXT NOT NULL,
    time_zone TEXT NOT NULL,
    payload TEXT NOT NULL,
    max_attempts INTEGER NOT NULL,
    max_event_age_secs INTEGER NOT NULL,
    dead_letter_target TEXT,
    fire_at TEXT NOT NULL,
    fire_at_epoch INTEGER NOT NULL,
    next_attempt_epoch INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (group_name, name)
);

CREATE INDEX IF NOT EXISTS idx_triggers_next_attempt
    ON triggers (next_attempt_epoch);

CREATE TABLE IF NOT EXISTS dead_letters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    group_name TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);
"#;
