use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rota_core::Frequency;
use rota_overrides::OverrideStatus;

#[derive(Parser)]
#[command(
    name = "rotad",
    about = "On-call rotation daemon: rotations, overrides and the hourly handover tick",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Config file (default: ~/.rota/rota.toml)
    #[arg(long, global = true, env = "ROTA_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the tick loop until interrupted
    Run,

    /// Process the current hour bucket once and print the report
    Tick {
        /// Restrict to one team (default: every team)
        #[arg(long, default_value = "")]
        team: String,
    },

    /// Manage rotations
    Rotation {
        #[command(subcommand)]
        subcommand: RotationSubcommand,
    },

    /// Manage coverage overrides
    Override {
        #[command(subcommand)]
        subcommand: OverrideSubcommand,
    },

    /// List the scheduled events of one hour bucket (YYYY-MM-DDTHH)
    Events {
        /// Hour bucket (default: current hour)
        hour: Option<String>,
    },

    /// Delete expired schedule events
    Purge,
}

#[derive(Subcommand)]
pub enum RotationSubcommand {
    /// Show one rotation
    Get { team: String, label: String },

    /// List a team's rotations in label order
    List {
        team: String,
        #[arg(long, default_value_t = 25)]
        page_size: usize,
        /// Cursor returned by a previous page
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Create a rotation; the first owner is on call
    Create {
        team: String,
        label: String,
        /// Comma-separated owner ids, in rotation order
        #[arg(long, value_delimiter = ',', required = true)]
        owners: Vec<String>,
        #[arg(long, default_value = "weekly")]
        frequency: Frequency,
        /// RFC 3339 start instant (default: now)
        #[arg(long)]
        starts_at: Option<DateTime<Utc>>,
        /// Plan the first reminder and handover into this channel
        #[arg(long)]
        channel: Option<String>,
    },

    /// Hand the rotation over to the next owner now
    Advance { team: String, label: String },
}

#[derive(Subcommand)]
pub enum OverrideSubcommand {
    /// Request an override
    Create {
        #[arg(long)]
        requested_by: String,
        /// RFC 3339
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339
        #[arg(long)]
        end: DateTime<Utc>,
    },

    /// Show one override
    Get { id: String },

    /// List overrides, oldest first
    List {
        #[arg(long)]
        status: Option<OverrideStatus>,
    },

    /// Approve a pending override
    Approve {
        id: String,
        #[arg(long)]
        by: String,
    },

    /// Reject a pending override
    Reject {
        id: String,
        #[arg(long)]
        by: String,
    },
}
