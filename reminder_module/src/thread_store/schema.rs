pub(super) const THREAD_STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS thread_messages (
    owner TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    email_date TEXT NOT NULL,
    email_date_epoch INTEGER NOT NULL,
    reminders_json TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (owner, thread_id, message_id)
);

CREATE INDEX IF NOT EXISTS idx_thread_messages_date
    ON thread_messages (owner, thread_id, email_date_epoch DESC);
"#;
