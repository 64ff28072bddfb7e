use rusqlite::Connection;

use crate::error::Result;

/// Initialise the overrides table and its indexes.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
/// `approved_by` holds whoever decided the override, approver or rejecter.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS overrides (
            override_id  TEXT PRIMARY KEY NOT NULL,
            requested_by TEXT NOT NULL,
            approved_by  TEXT,
            start_date   TEXT NOT NULL,
            end_date     TEXT NOT NULL,
            status       TEXT NOT NULL DEFAULT 'pending',
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_overrides_status
            ON overrides (status, created_at);
        CREATE INDEX IF NOT EXISTS idx_overrides_range
            ON overrides (start_date, end_date);",
    )?;
    Ok(())
}
