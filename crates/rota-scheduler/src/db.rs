use rusqlite::Connection;

use crate::error::Result;

/// Initialise the schedule index schema in `conn`.
///
/// `schedule_events` is partitioned by hour bucket; the composite primary
/// key doubles as the per-hour lookup index, ordered by event id.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedule_events (
            scheduled_hour  TEXT    NOT NULL,   -- YYYY-MM-DDTHH, UTC
            event_id        TEXT    NOT NULL,   -- rotation_id#action#event_time
            rotation_id     TEXT    NOT NULL,
            action          TEXT    NOT NULL,
            target_channel  TEXT    NOT NULL,
            next_owner      TEXT    NOT NULL,
            event_time      TEXT    NOT NULL,
            expires_at      INTEGER NOT NULL,   -- unix seconds
            PRIMARY KEY (scheduled_hour, event_id)
        ) WITHOUT ROWID;

        -- Expiry sweep: DELETE … WHERE expires_at <= ?
        CREATE INDEX IF NOT EXISTS idx_schedule_events_expires ON schedule_events (expires_at);
        ",
    )?;
    Ok(())
}
