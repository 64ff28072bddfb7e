pub mod db;
pub mod error;
pub mod manager;
pub mod types;

pub use error::{OverrideError, Result};
pub use manager::OverrideManager;
pub use types::{Decision, Override, OverrideStatus};
