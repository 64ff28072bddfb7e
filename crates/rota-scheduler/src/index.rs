use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rota_core::time::format_ts;
use rusqlite::{Connection, ErrorCode};
use tracing::{debug, info, instrument};

use crate::error::{Result, SchedulerError};
use crate::types::{EventAction, ScheduleEvent};

const EVENT_COLUMNS: &str = "scheduled_hour, event_id, rotation_id, action, target_channel, \
                             next_owner, event_time, expires_at";

/// Append-only store of scheduled reminders and handovers, bucketed by hour.
///
/// Events are never updated in place. They leave the index only through
/// [`ScheduleIndex::purge_expired`].
pub struct ScheduleIndex {
    db: Mutex<Connection>,
}

impl ScheduleIndex {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `event`. Fails with `DuplicateEvent` if its
    /// `(scheduled_hour, event_id)` is already present; nothing is overwritten.
    #[instrument(
        skip(self, event),
        fields(bucket = %event.scheduled_hour, event_id = %event.event_id)
    )]
    pub fn add_event(&self, event: &ScheduleEvent) -> Result<()> {
        if event.scheduled_hour.is_empty() || event.event_id.is_empty() {
            return Err(SchedulerError::Validation(
                "scheduled_hour and event_id must be non-empty".to_string(),
            ));
        }
        let db = self.conn();
        let res = db.execute(
            &format!(
                "INSERT INTO schedule_events ({EVENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            ),
            rusqlite::params![
                event.scheduled_hour,
                event.event_id,
                event.rotation_id,
                event.action.to_string(),
                event.target_channel,
                event.next_owner,
                format_ts(event.event_time),
                event.expires_at,
            ],
        );
        match res {
            Ok(_) => {
                debug!(action = %event.action, "event indexed");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(SchedulerError::DuplicateEvent {
                    scheduled_hour: event.scheduled_hour.clone(),
                    event_id: event.event_id.clone(),
                })
            }
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    /// Every event whose bucket equals `hour` exactly, in ascending
    /// `event_id` order. Expired events are included.
    #[instrument(skip(self))]
    pub fn get_events_by_hour(&self, hour: &str) -> Result<Vec<ScheduleEvent>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM schedule_events
             WHERE scheduled_hour = ?1
             ORDER BY event_id"
        ))?;
        let events = stmt
            .query_map([hour], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Delete every event whose `expires_at` has been reached.
    /// Returns how many were removed.
    #[instrument(skip(self))]
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let n = self.conn().execute(
            "DELETE FROM schedule_events WHERE expires_at <= ?1",
            [now.timestamp()],
        )?;
        if n > 0 {
            info!(count = n, "expired schedule events purged");
        }
        Ok(n)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleEvent> {
    let action: EventAction = row.get::<_, String>(3)?.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    let event_time = rota_core::time::parse_ts(&row.get::<_, String>(6)?).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ScheduleEvent {
        scheduled_hour: row.get(0)?,
        event_id: row.get(1)?,
        rotation_id: row.get(2)?,
        action,
        target_channel: row.get(4)?,
        next_owner: row.get(5)?,
        event_time,
        expires_at: row.get(7)?,
    })
}
