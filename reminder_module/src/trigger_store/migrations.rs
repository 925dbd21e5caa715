use rusqlite::Connection;
use std::collections::HashSet;

use crate::reminder::TriggerServiceError;

/// Columns added after the first release of the trigger table.
pub(super) fn ensure_trigger_columns(conn: &Connection) -> Result<(), TriggerServiceError> {
    let mut stmt = conn.prepare("PRAGMA table_info(triggers)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }

    if !columns.contains("last_error") {
        conn.execute("ALTER TABLE triggers ADD COLUMN last_error TEXT", [])?;
    }
    if !columns.contains("last_attempt_at") {
        conn.execute("ALTER TABLE triggers ADD COLUMN last_attempt_at TEXT", [])?;
    }
    Ok(())
}
