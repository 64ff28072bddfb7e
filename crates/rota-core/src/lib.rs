//! `rota-core`: configuration, shared errors and the rotation duration policy.

pub mod config;
pub mod duration;
pub mod error;
pub mod time;

pub use config::RotaConfig;
pub use duration::{next_rotation_date, Frequency};
pub use error::{Result, RotaError};
