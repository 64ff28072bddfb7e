//! `rota-rotations`: on-call rotations and their optimistic-concurrency store.
//!
//! # Overview
//!
//! A [`Rotation`] is keyed by `(team_id, rotation_label)` and carries a
//! `version` counter. Every write goes through
//! [`RotationStore::conditional_put`], which commits only when the stored
//! version still matches the one the writer read; the loser of a race sees
//! [`RotationError::VersionConflict`] and must re-read.
//!
//! [`RotationEngine`] layers the business rules on top: cyclic advancement,
//! next-date computation and recovery from owner drift.

pub mod db;
pub mod engine;
pub mod error;
pub mod store;
pub mod types;

pub use engine::RotationEngine;
pub use error::{Result, RotationError};
pub use store::{RotationStore, SqliteRotationStore};
pub use types::{Page, Rotation, RotationKey, GLOBAL_TEAM};
