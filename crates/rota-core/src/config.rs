use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 3600; // one tick per hour bucket
pub const DEFAULT_TICK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000; // per-call store deadline
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;
pub const DEFAULT_REMINDER_LEAD_HOURS: i64 = 24;
pub const DEFAULT_EVENT_TTL_HOURS: i64 = 48;
pub const DEFAULT_LOG_FILTER: &str = "rota=info";

/// Top-level config (rota.toml + ROTA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RotaConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a write waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Tick loop and follow-up event planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on a single tick; the tick is cancelled past this.
    #[serde(default = "default_tick_timeout_secs")]
    pub tick_timeout_secs: u64,
    /// Re-read-and-retry attempts when a handover loses a version race.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// How far ahead of a handover its reminder fires.
    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: i64,
    /// Lifetime of a scheduled event past its event time.
    #[serde(default = "default_event_ttl_hours")]
    pub event_ttl_hours: i64,
    /// Channel used for follow-up events when the firing event has none.
    #[serde(default)]
    pub default_channel: Option<String>,
    /// Append the next cycle's reminder/handover after every handover.
    #[serde(default = "bool_true")]
    pub plan_follow_up: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            tick_timeout_secs: DEFAULT_TICK_TIMEOUT_SECS,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            reminder_lead_hours: DEFAULT_REMINDER_LEAD_HOURS,
            event_ttl_hours: DEFAULT_EVENT_TTL_HOURS,
            default_channel: None,
            plan_follow_up: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_tick_timeout_secs() -> u64 {
    DEFAULT_TICK_TIMEOUT_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_max_conflict_retries() -> u32 {
    DEFAULT_MAX_CONFLICT_RETRIES
}
fn default_reminder_lead_hours() -> i64 {
    DEFAULT_REMINDER_LEAD_HOURS
}
fn default_event_ttl_hours() -> i64 {
    DEFAULT_EVENT_TTL_HOURS
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rota/rota.db", home)
}

impl RotaConfig {
    /// Load config from a TOML file with ROTA_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.rota/rota.toml
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `ROTA_SCHEDULER__TICK_INTERVAL_SECS=60`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("ROTA_").split("__")),
        )
    }

    /// Extract from an already-assembled figment (used by `load` and tests).
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::RotaError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.rota/rota.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_yields_defaults() {
        let cfg = RotaConfig::from_figment(Figment::new()).unwrap();
        assert_eq!(cfg.scheduler.tick_interval_secs, DEFAULT_TICK_INTERVAL_SECS);
        assert_eq!(cfg.database.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert!(cfg.scheduler.plan_follow_up);
        assert_eq!(cfg.log.filter, "rota=info");
    }

    #[test]
    fn toml_overrides_selected_keys() {
        let toml = r#"
            [database]
            path = "/tmp/rota-test.db"

            [scheduler]
            tick_interval_secs = 60
            default_channel = "C0ONCALL"
        "#;
        let cfg = RotaConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap();
        assert_eq!(cfg.database.path, "/tmp/rota-test.db");
        assert_eq!(cfg.scheduler.tick_interval_secs, 60);
        assert_eq!(cfg.scheduler.default_channel.as_deref(), Some("C0ONCALL"));
        // untouched keys keep their defaults
        assert_eq!(cfg.scheduler.max_conflict_retries, DEFAULT_MAX_CONFLICT_RETRIES);
    }

    #[test]
    fn wrong_type_is_config_error() {
        let toml = "[scheduler]\ntick_interval_secs = \"hourly\"\n";
        let err = RotaConfig::from_figment(Figment::new().merge(Toml::string(toml))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
