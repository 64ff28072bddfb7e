//! `rota-scheduler`: hour-bucketed schedule index and the tick that drains it.
//!
//! # Overview
//!
//! Reminders and handovers are appended to a [`ScheduleIndex`] partitioned by
//! UTC hour (`YYYY-MM-DDTHH`). Once per interval the [`TickLoop`] asks a
//! [`TickProcessor`] to process the current bucket:
//!
//! | Action     | Effect                                                     |
//! |------------|------------------------------------------------------------|
//! | `reminder` | Emit a [`Notification`] for the upcoming owner             |
//! | `handover` | Advance the rotation, notify, plan the next cycle's events |
//!
//! Events past `expires_at` are skipped and later swept away.

pub mod db;
pub mod engine;
pub mod error;
pub mod index;
pub mod tick;
pub mod types;

pub use engine::TickLoop;
pub use error::{Result, SchedulerError};
pub use index::ScheduleIndex;
pub use tick::{RotationTickProcessor, TickProcessor};
pub use types::{hour_bucket, plan_events, EventAction, Notification, ScheduleEvent, TickReport};
