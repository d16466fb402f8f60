//! Centralized daemon configuration.
//!
//! Loaded via the `config` crate from an optional `cadence.toml` in the
//! working directory, overridden by `CADENCE__*` environment variables
//! (`CADENCE__AGENT__BASE_URL`, `CADENCE__SCHEDULER__WAIT_RETRY_SECONDS`, ...).

use cadence_agent::AgentConfig;
use cadence_scheduler::SchedulerOptions;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    /// Path of the schedules file.
    #[serde(default = "default_schedules_path")]
    pub schedules_path: PathBuf,

    /// Agent connection configuration.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Scheduler tunables.
    #[serde(default)]
    pub scheduler: SchedulerOptions,

    /// Schedules-file watching.
    #[serde(default)]
    pub watch: WatchConfig,
}

/// How the daemon notices edits to the schedules file.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Interval between modification-time checks, in seconds.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

fn default_schedules_path() -> PathBuf {
    PathBuf::from(".cadence/schedules.json")
}

fn default_poll_interval_seconds() -> u64 {
    2
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from `cadence.toml` and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source is malformed or a value has the wrong type.
    pub fn from_sources() -> Result<Self, config::ConfigError> {
        Self::build(
            config::Config::builder()
                .add_source(File::with_name("cadence").required(false))
                .add_source(
                    Environment::with_prefix("CADENCE")
                        .prefix_separator("__")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, config::ConfigError> {
        builder.build()?.try_deserialize()
    }
}
