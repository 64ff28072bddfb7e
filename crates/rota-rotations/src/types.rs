use chrono::{DateTime, Utc};
use rota_core::Frequency;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RotationError};

/// Partition used by deployments that only ever run one rotation.
///
/// Such a rotation is addressed as `RotationKey::global(label)` rather than
/// through a separate "first row wins" lookup.
pub const GLOBAL_TEAM: &str = "_global";

/// Composite natural key of a rotation: `(team_id, rotation_label)`.
///
/// Wire format: `{team_id}:{rotation_label}`. The team id may not contain a
/// colon; the label may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RotationKey {
    pub team_id: String,
    pub rotation_label: String,
}

impl RotationKey {
    pub fn new(team_id: impl Into<String>, rotation_label: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            rotation_label: rotation_label.into(),
        }
    }

    pub fn global(rotation_label: impl Into<String>) -> Self {
        Self::new(GLOBAL_TEAM, rotation_label)
    }

    /// Canonical string form, used as `rotation_id` on schedule events.
    pub fn format(&self) -> String {
        format!("{}:{}", self.team_id, self.rotation_label)
    }

    /// Parse the canonical form back into a key.
    pub fn parse(s: &str) -> Result<Self> {
        let (team_id, label) = s
            .split_once(':')
            .ok_or_else(|| RotationError::Validation(format!("missing ':' in rotation id: {s}")))?;
        let key = Self::new(team_id, label);
        key.validate()?;
        Ok(key)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.team_id.is_empty() || self.rotation_label.is_empty() {
            return Err(RotationError::Validation(format!(
                "team id and rotation label must not be empty: {self}"
            )));
        }
        if self.team_id.contains(':') {
            return Err(RotationError::Validation(format!(
                "team id must not contain ':': {}",
                self.team_id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for RotationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format())
    }
}

/// A persisted on-call rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    /// Owning team; partition key.
    #[serde(rename = "creator_team_id")]
    pub team_id: String,
    /// Rotation name within the team; sort key.
    pub rotation_label: String,
    /// Owners in hand-over order. Never empty for a valid rotation.
    pub rotation_order: Vec<String>,
    /// The owner currently on call; normally an element of `rotation_order`.
    pub current_owner: String,
    pub frequency: Frequency,
    pub last_rotation_date: DateTime<Utc>,
    pub next_rotation_date: DateTime<Utc>,
    /// Optimistic-concurrency counter. `0` on a record that has never been
    /// written; the store sets it to `1` on create and bumps it on update.
    #[serde(default)]
    pub version: u64,
}

impl Rotation {
    /// Build a not-yet-persisted rotation starting with the first owner.
    ///
    /// `next_rotation_date` is computed from `starts_at` and the frequency.
    pub fn new(
        key: RotationKey,
        rotation_order: Vec<String>,
        frequency: Frequency,
        starts_at: DateTime<Utc>,
    ) -> Self {
        let current_owner = rotation_order.first().cloned().unwrap_or_default();
        Self {
            team_id: key.team_id,
            rotation_label: key.rotation_label,
            rotation_order,
            current_owner,
            frequency,
            last_rotation_date: starts_at,
            next_rotation_date: frequency.next_after(starts_at),
            version: 0,
        }
    }

    pub fn key(&self) -> RotationKey {
        RotationKey::new(&self.team_id, &self.rotation_label)
    }

    /// Index of the current owner in the roster, first match.
    pub fn current_index(&self) -> Option<usize> {
        self.rotation_order
            .iter()
            .position(|owner| *owner == self.current_owner)
    }

    /// The owner that an advance from the current state would hand over to.
    ///
    /// A drifted rotation (current owner not in the roster) restarts at the
    /// first owner. `None` only for an empty roster.
    pub fn upcoming_owner(&self) -> Option<&str> {
        let len = self.rotation_order.len();
        if len == 0 {
            return None;
        }
        let next = match self.current_index() {
            Some(i) => (i + 1) % len,
            None => 0,
        };
        Some(self.rotation_order[next].as_str())
    }
}

/// One page of a paginated listing.
///
/// `next_cursor` is an opaque token to pass back for the following page;
/// `None` means there are no more records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}
