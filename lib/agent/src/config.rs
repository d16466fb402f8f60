//! Agent connection configuration.

use serde::Deserialize;

/// Where the agent listens and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    /// Base URL of the agent's HTTP API.
    /// Default: "http://127.0.0.1:4780"
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:4780".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl AgentConfig {
    /// Creates a config for the agent at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_request_timeout_seconds(mut self, seconds: u64) -> Self {
        self.request_timeout_seconds = seconds;
        self
    }
}
