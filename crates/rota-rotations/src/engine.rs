use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{Result, RotationError};
use crate::store::RotationStore;
use crate::types::{Page, Rotation, RotationKey};

/// Rotation business rules over a [`RotationStore`].
///
/// Stateless between calls apart from the drift counter. There is no retry
/// loop inside: a lost version race surfaces as
/// [`RotationError::VersionConflict`] and the caller decides whether to
/// re-read and retry.
pub struct RotationEngine {
    store: Arc<dyn RotationStore>,
    /// Number of advances that found the current owner missing from the roster.
    drift: AtomicU64,
}

impl RotationEngine {
    pub fn new(store: Arc<dyn RotationStore>) -> Self {
        Self {
            store,
            drift: AtomicU64::new(0),
        }
    }

    /// How many times owner drift has been recovered since construction.
    pub fn drift_count(&self) -> u64 {
        self.drift.load(Ordering::Relaxed)
    }

    /// Fetch a rotation, failing with `NotFound` if it is absent.
    pub fn get_rotation(&self, key: &RotationKey) -> Result<Rotation> {
        self.store
            .get(key)?
            .ok_or_else(|| RotationError::NotFound { key: key.clone() })
    }

    /// Hand the rotation over to the next owner, as of now.
    pub fn advance_rotation(
        &self,
        key: &RotationKey,
        cancel: &CancellationToken,
    ) -> Result<Rotation> {
        self.advance_rotation_at(key, Utc::now(), cancel)
    }

    /// Hand the rotation over to the next owner, as of `now`.
    ///
    /// The owner after the current one in `rotation_order` takes over,
    /// wrapping at the end. If the current owner is no longer in the roster
    /// the anomaly is logged and counted and the first owner takes over.
    /// `last_rotation_date` becomes `now` and `next_rotation_date` is
    /// derived from the frequency. The write is conditioned on the version
    /// that was read; a fired `cancel` aborts before anything is written.
    #[instrument(skip(self, cancel), fields(key = %key))]
    pub fn advance_rotation_at(
        &self,
        key: &RotationKey,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Rotation> {
        if cancel.is_cancelled() {
            return Err(RotationError::Cancelled);
        }
        // Stored timestamps carry microseconds; keep the returned record identical.
        let now = now.trunc_subsecs(6);
        let mut rotation = self.get_rotation(key)?;
        let len = rotation.rotation_order.len();
        if len == 0 {
            return Err(RotationError::Validation(format!(
                "rotation {key} has an empty rotation order"
            )));
        }

        let next_index = match rotation.current_index() {
            Some(i) => (i + 1) % len,
            None => {
                let total = self.drift.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    current_owner = %rotation.current_owner,
                    drift_total = total,
                    "current owner not found in rotation order, resetting to first owner"
                );
                0
            }
        };

        let previous_owner = std::mem::replace(
            &mut rotation.current_owner,
            rotation.rotation_order[next_index].clone(),
        );
        rotation.last_rotation_date = now;
        rotation.next_rotation_date = rotation.frequency.next_after(now);

        let stored = self.store.conditional_put(&rotation, rotation.version, cancel)?;
        info!(
            from = %previous_owner,
            to = %stored.current_owner,
            next_rotation = %stored.next_rotation_date,
            version = stored.version,
            "rotation advanced"
        );
        Ok(stored)
    }

    /// Create (`version == 0`) or update (`version > 0`) a rotation.
    ///
    /// Creation fails with `AlreadyExists` if the key is taken; an update
    /// fails with `VersionConflict` unless the stored version equals
    /// `rotation.version`. Returns the record as stored.
    #[instrument(
        skip(self, rotation, cancel),
        fields(key = %rotation.key(), version = rotation.version)
    )]
    pub fn upsert_rotation(
        &self,
        rotation: Rotation,
        cancel: &CancellationToken,
    ) -> Result<Rotation> {
        validate(&rotation)?;
        let stored = self.store.conditional_put(&rotation, rotation.version, cancel)?;
        info!(version = stored.version, "rotation saved");
        Ok(stored)
    }

    /// One page of a team's rotations in ascending label order.
    pub fn list_rotations(
        &self,
        team_id: &str,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Rotation>> {
        self.store.query_by_partition(team_id, page_size, cursor)
    }

    /// One page of every team's rotations in ascending key order.
    pub fn scan_rotations(
        &self,
        page_size: usize,
        cursor: Option<&str>,
    ) -> Result<Page<Rotation>> {
        self.store.scan(page_size, cursor)
    }
}

fn validate(rotation: &Rotation) -> Result<()> {
    rotation.key().validate()?;
    if rotation.rotation_order.is_empty() {
        return Err(RotationError::Validation(
            "rotation order must contain at least one owner".to_string(),
        ));
    }
    if rotation.rotation_order.iter().any(|owner| owner.is_empty()) {
        return Err(RotationError::Validation(
            "rotation order contains an empty owner id".to_string(),
        ));
    }
    // Existing records may legitimately drift when the roster is edited;
    // only a brand-new rotation must start on someone in the roster.
    if rotation.version == 0 && rotation.current_index().is_none() {
        return Err(RotationError::Validation(format!(
            "current owner {} is not in the rotation order",
            rotation.current_owner
        )));
    }
    Ok(())
}
