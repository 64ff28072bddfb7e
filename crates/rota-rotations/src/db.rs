use rusqlite::Connection;

use crate::error::Result;

/// Initialise the rotations table.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout. The
/// composite primary key is both the create-path uniqueness guard and the
/// ordering used by partition queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rotations (
            team_id            TEXT    NOT NULL,
            rotation_label     TEXT    NOT NULL,
            rotation_order     TEXT    NOT NULL,   -- JSON array of owner ids
            current_owner      TEXT    NOT NULL,
            frequency          TEXT    NOT NULL DEFAULT 'weekly',
            last_rotation_date TEXT    NOT NULL,   -- RFC 3339
            next_rotation_date TEXT    NOT NULL,   -- RFC 3339
            version            INTEGER NOT NULL,
            PRIMARY KEY (team_id, rotation_label)
        ) WITHOUT ROWID;",
    )?;
    Ok(())
}
