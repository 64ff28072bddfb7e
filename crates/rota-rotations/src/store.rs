use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SubsecRound, Utc};
use rota_core::time::format_ts;
use rota_core::Frequency;
use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Result, RotationError};
use crate::types::{Page, Rotation, RotationKey};

/// Persistence contract the rotation engine depends on.
///
/// Any backend offering an atomic conditional write over a composite
/// `(partition, sort)` key can implement it.
pub trait RotationStore: Send + Sync {
    /// Fetch the record stored under `key`, if any.
    fn get(&self, key: &RotationKey) -> Result<Option<Rotation>>;

    /// Atomically write `rotation` if the stored state matches
    /// `expected_version`.
    ///
    /// - `expected_version == 0`: succeeds only if nothing is stored under
    ///   the key; the record is written with version 1.
    /// - `expected_version > 0`: succeeds only if the stored version equals
    ///   `expected_version`; the record is written with `expected_version + 1`.
    ///
    /// The `version` field of `rotation` itself is ignored. If `cancel` has
    /// fired before the write is issued the call fails with `Cancelled`.
    /// On failure nothing is written. Returns the record as stored.
    fn conditional_put(
        &self,
        rotation: &Rotation,
        expected_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Rotation>;

    /// Records of one team in ascending label order.
    fn query_by_partition(
        &self,
        team_id: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Rotation>>;

    /// Records of every team in ascending `(team, label)` order.
    fn scan(&self, page_size: usize, cursor: Option<&str>) -> Result<Page<Rotation>>;
}

/// Last key returned on a page; hex-encoded JSON on the wire.
#[derive(Debug, Serialize, Deserialize)]
struct RotationCursor {
    team_id: String,
    rotation_label: String,
}

fn encode_cursor(key: &RotationKey) -> String {
    let cursor = RotationCursor {
        team_id: key.team_id.clone(),
        rotation_label: key.rotation_label.clone(),
    };
    // Serialising two strings cannot fail.
    hex::encode(serde_json::to_vec(&cursor).unwrap_or_default())
}

fn decode_cursor(token: &str) -> Result<RotationCursor> {
    hex::decode(token)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| RotationError::Validation("invalid cursor".to_string()))
}

const ROTATION_COLUMNS: &str = "team_id, rotation_label, rotation_order, current_owner, frequency,
     last_rotation_date, next_rotation_date, version";

/// SQLite-backed [`RotationStore`].
///
/// Wraps a single connection in a `Mutex`; every operation is one SQL
/// statement, so a write either commits whole or not at all.
pub struct SqliteRotationStore {
    db: Mutex<Connection>,
}

impl SqliteRotationStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied write.
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, rotation: &Rotation, cancel: &CancellationToken) -> Result<Rotation> {
        let order = serde_json::to_string(&rotation.rotation_order)
            .map_err(|e| RotationError::Validation(e.to_string()))?;
        let db = self.conn();
        check_cancelled(cancel)?;
        let res = db.execute(
            "INSERT INTO rotations
             (team_id, rotation_label, rotation_order, current_owner, frequency,
              last_rotation_date, next_rotation_date, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            rusqlite::params![
                rotation.team_id,
                rotation.rotation_label,
                order,
                rotation.current_owner,
                rotation.frequency.as_str(),
                format_ts(rotation.last_rotation_date),
                format_ts(rotation.next_rotation_date),
            ],
        );
        match res {
            Ok(_) => Ok(Rotation {
                version: 1,
                ..rotation.clone()
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(RotationError::AlreadyExists {
                    key: rotation.key(),
                })
            }
            Err(e) => Err(RotationError::Database(e)),
        }
    }

    fn update(
        &self,
        rotation: &Rotation,
        expected_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Rotation> {
        let order = serde_json::to_string(&rotation.rotation_order)
            .map_err(|e| RotationError::Validation(e.to_string()))?;
        let db = self.conn();
        check_cancelled(cancel)?;
        let rows_changed = db.execute(
            "UPDATE rotations
             SET rotation_order     = ?1,
                 current_owner      = ?2,
                 frequency          = ?3,
                 last_rotation_date = ?4,
                 next_rotation_date = ?5,
                 version            = version + 1
             WHERE team_id = ?6 AND rotation_label = ?7 AND version = ?8",
            rusqlite::params![
                order,
                rotation.current_owner,
                rotation.frequency.as_str(),
                format_ts(rotation.last_rotation_date),
                format_ts(rotation.next_rotation_date),
                rotation.team_id,
                rotation.rotation_label,
                expected_version as i64,
            ],
        )?;
        if rows_changed == 0 {
            return Err(RotationError::VersionConflict {
                key: rotation.key(),
                expected: expected_version,
            });
        }
        Ok(Rotation {
            version: expected_version + 1,
            ..rotation.clone()
        })
    }
}

impl RotationStore for SqliteRotationStore {
    #[instrument(skip(self), fields(key = %key))]
    fn get(&self, key: &RotationKey) -> Result<Option<Rotation>> {
        let db = self.conn();
        let rotation = db
            .query_row(
                &format!(
                    "SELECT {ROTATION_COLUMNS} FROM rotations
                     WHERE team_id = ?1 AND rotation_label = ?2"
                ),
                rusqlite::params![key.team_id, key.rotation_label],
                row_to_rotation,
            )
            .optional()?;
        Ok(rotation)
    }

    #[instrument(skip(self, rotation), fields(key = %rotation.key()))]
    fn conditional_put(
        &self,
        rotation: &Rotation,
        expected_version: u64,
        cancel: &CancellationToken,
    ) -> Result<Rotation> {
        // Stored timestamps carry microseconds; hand back exactly what `get` will return.
        let rotation = Rotation {
            last_rotation_date: rotation.last_rotation_date.trunc_subsecs(6),
            next_rotation_date: rotation.next_rotation_date.trunc_subsecs(6),
            ..rotation.clone()
        };
        let stored = if expected_version == 0 {
            self.insert(&rotation, cancel)?
        } else {
            self.update(&rotation, expected_version, cancel)?
        };
        debug!(version = stored.version, "rotation written");
        Ok(stored)
    }

    #[instrument(skip(self, cursor))]
    fn query_by_partition(
        &self,
        team_id: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Rotation>> {
        let limit = fetch_limit(page_size)?;
        let after = match cursor {
            Some(token) => {
                let c = decode_cursor(token)?;
                if c.team_id != team_id {
                    return Err(RotationError::Validation(
                        "cursor belongs to a different team".to_string(),
                    ));
                }
                Some(c.rotation_label)
            }
            None => None,
        };

        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {ROTATION_COLUMNS} FROM rotations
             WHERE team_id = ?1 AND (?2 IS NULL OR rotation_label > ?2)
             ORDER BY rotation_label
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![team_id, after, limit],
                row_to_rotation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paginate(rows, page_size))
    }

    #[instrument(skip(self, cursor))]
    fn scan(&self, page_size: usize, cursor: Option<&str>) -> Result<Page<Rotation>> {
        let limit = fetch_limit(page_size)?;
        let after = cursor.map(decode_cursor).transpose()?;
        let (after_team, after_label) = match after {
            Some(c) => (Some(c.team_id), Some(c.rotation_label)),
            None => (None, None),
        };

        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {ROTATION_COLUMNS} FROM rotations
             WHERE ?1 IS NULL OR (team_id, rotation_label) > (?1, ?2)
             ORDER BY team_id, rotation_label
             LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![after_team, after_label, limit],
                row_to_rotation,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paginate(rows, page_size))
    }
}

/// SQL `LIMIT` for a page: one look-ahead row beyond `page_size`.
fn fetch_limit(page_size: usize) -> Result<i64> {
    if page_size == 0 {
        return Err(RotationError::Validation(
            "page size must be at least 1".to_string(),
        ));
    }
    i64::try_from(page_size)
        .ok()
        .and_then(|n| n.checked_add(1))
        .ok_or_else(|| RotationError::Validation(format!("page size {page_size} is too large")))
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(RotationError::Cancelled);
    }
    Ok(())
}

/// Trim the look-ahead row and derive the cursor from the last kept row.
fn paginate(mut rows: Vec<Rotation>, page_size: usize) -> Page<Rotation> {
    let next_cursor = if rows.len() > page_size {
        rows.truncate(page_size);
        rows.last().map(|r| encode_cursor(&r.key()))
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
    }
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    rota_core::time::parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a SQLite row (column order from `ROTATION_COLUMNS`) to a `Rotation`.
fn row_to_rotation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Rotation> {
    let order_json: String = row.get(2)?;
    let rotation_order: Vec<String> = serde_json::from_str(&order_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Rotation {
        team_id: row.get(0)?,
        rotation_label: row.get(1)?,
        rotation_order,
        current_owner: row.get(3)?,
        frequency: Frequency::from_label(&row.get::<_, String>(4)?),
        last_rotation_date: parse_ts(5, row.get(5)?)?,
        next_rotation_date: parse_ts(6, row.get(6)?)?,
        version: row.get::<_, i64>(7)? as u64,
    })
}
