use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SubsecRound, Utc};
use rota_core::time::{format_ts, parse_ts};
use rusqlite::{Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{OverrideError, Result};
use crate::types::{Decision, Override, OverrideStatus};

const OVERRIDE_COLUMNS: &str =
    "override_id, requested_by, approved_by, start_date, end_date, status, created_at, updated_at";

/// Thread-safe store for coverage overrides and their approval state machine.
///
/// `pending -> approved` and `pending -> rejected` are the only transitions;
/// each is a single conditional `UPDATE`, so two racing deciders cannot both
/// win and a decided override is never overwritten.
pub struct OverrideManager {
    db: Mutex<Connection>,
}

impl OverrideManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new pending override.
    ///
    /// The date range is stored as given; ordering and overlap checks belong
    /// to the caller (see [`OverrideManager::overlapping`]).
    #[instrument(skip(self, cancel))]
    pub fn create_override(
        &self,
        requested_by: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Override> {
        if requested_by.trim().is_empty() {
            return Err(OverrideError::Validation(
                "requested_by must not be empty".to_string(),
            ));
        }
        let now = Utc::now().trunc_subsecs(6);
        let o = Override {
            override_id: Uuid::now_v7().to_string(),
            requested_by: requested_by.to_string(),
            start_date: start_date.trunc_subsecs(6),
            end_date: end_date.trunc_subsecs(6),
            status: OverrideStatus::Pending,
            decided_by: None,
            created_at: now,
            updated_at: now,
        };

        let db = self.conn();
        check_cancelled(cancel)?;
        db.execute(
            "INSERT INTO overrides
             (override_id, requested_by, approved_by, start_date, end_date, status,
              created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, 'pending', ?5, ?5)",
            rusqlite::params![
                o.override_id,
                o.requested_by,
                format_ts(o.start_date),
                format_ts(o.end_date),
                format_ts(now),
            ],
        )?;
        info!(override_id = %o.override_id, "override created");
        Ok(o)
    }

    /// Fetch an override by id, failing with `NotFound` if absent.
    pub fn get_override(&self, id: &str) -> Result<Override> {
        let db = self.conn();
        fetch(&db, id)?.ok_or_else(|| OverrideError::NotFound { id: id.to_string() })
    }

    /// All overrides, optionally filtered by status, oldest first.
    pub fn list_overrides(&self, status: Option<OverrideStatus>) -> Result<Vec<Override>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM overrides
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at, override_id"
        ))?;
        let filter = status.map(|s| s.to_string());
        let rows = stmt
            .query_map(rusqlite::params![filter], row_to_override)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Pending or approved overrides whose range intersects `[start, end)`.
    ///
    /// Offered to callers that want to refuse conflicting requests; the
    /// manager itself never rejects on overlap.
    pub fn overlapping(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Override>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {OVERRIDE_COLUMNS} FROM overrides
             WHERE status IN ('pending', 'approved')
               AND start_date < ?2 AND end_date > ?1
             ORDER BY start_date, override_id"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![format_ts(start), format_ts(end)],
                row_to_override,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn approve(
        &self,
        id: &str,
        approved_by: &str,
        cancel: &CancellationToken,
    ) -> Result<Override> {
        self.decide(id, Decision::Approve, approved_by, cancel)
    }

    /// Reject a pending override; `rejected_by` is stored as `approved_by`.
    pub fn reject(
        &self,
        id: &str,
        rejected_by: &str,
        cancel: &CancellationToken,
    ) -> Result<Override> {
        self.decide(id, Decision::Reject, rejected_by, cancel)
    }

    /// Move a pending override to its terminal state.
    ///
    /// Fails with `NotFound` for an unknown id and `AlreadyDecided` when the
    /// override is no longer pending, including a repeat of the same decision.
    /// A fired `cancel` aborts before the update is issued.
    #[instrument(skip(self, cancel))]
    pub fn decide(
        &self,
        id: &str,
        decision: Decision,
        actor: &str,
        cancel: &CancellationToken,
    ) -> Result<Override> {
        if actor.trim().is_empty() {
            return Err(OverrideError::Validation(
                "deciding actor must not be empty".to_string(),
            ));
        }
        let now = Utc::now().trunc_subsecs(6);
        let status = decision.status();

        let db = self.conn();
        check_cancelled(cancel)?;
        let rows_changed = db.execute(
            "UPDATE overrides
             SET status = ?1, approved_by = ?2, updated_at = ?3
             WHERE override_id = ?4 AND status = 'pending'",
            rusqlite::params![status.to_string(), actor, format_ts(now), id],
        )?;
        if rows_changed == 0 {
            return match fetch(&db, id)? {
                None => Err(OverrideError::NotFound { id: id.to_string() }),
                Some(existing) => Err(OverrideError::AlreadyDecided {
                    id: id.to_string(),
                    status: existing.status,
                }),
            };
        }
        info!(override_id = %id, %status, %actor, "override decided");
        fetch(&db, id)?.ok_or_else(|| OverrideError::NotFound { id: id.to_string() })
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(OverrideError::Cancelled);
    }
    Ok(())
}

fn fetch(db: &Connection, id: &str) -> Result<Option<Override>> {
    let o = db
        .query_row(
            &format!("SELECT {OVERRIDE_COLUMNS} FROM overrides WHERE override_id = ?1"),
            [id],
            row_to_override,
        )
        .optional()?;
    Ok(o)
}

fn ts_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a SQLite row (column order from `OVERRIDE_COLUMNS`) to an `Override`.
fn row_to_override(row: &rusqlite::Row<'_>) -> rusqlite::Result<Override> {
    let status_raw: String = row.get(5)?;
    let status = status_raw.parse::<OverrideStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;
    Ok(Override {
        override_id: row.get(0)?,
        requested_by: row.get(1)?,
        decided_by: row.get(2)?,
        start_date: ts_col(row, 3)?,
        end_date: ts_col(row, 4)?,
        status,
        created_at: ts_col(row, 6)?,
        updated_at: ts_col(row, 7)?,
    })
}
