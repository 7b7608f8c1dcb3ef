//! Process configuration
//!
//! Static settings come from `RESCALER_*` environment variables. Everything
//! a service may change at runtime lives in its service document instead.

use anyhow::{Context, Result};
use rescaler_lib::store::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RescalerConfig {
    /// Base URL of the CouchDB state store
    #[serde(default = "default_couchdb_url")]
    pub couchdb_url: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Timeout for every host agent and state store call, in seconds
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: u32,

    #[serde(default = "default_persist_backoff")]
    pub persist_backoff_ms: u64,

    /// Control loop restarts before the process gives up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Run the structures snapshotter in this process
    #[serde(default = "default_snapshotter_enabled")]
    pub snapshotter_enabled: bool,
}

fn default_couchdb_url() -> String {
    "http://couchdb:5984".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_agent_timeout() -> u64 {
    10
}

fn default_persist_max_attempts() -> u32 {
    10
}

fn default_persist_backoff() -> u64 {
    500
}

fn default_max_restarts() -> u32 {
    2
}

fn default_snapshotter_enabled() -> bool {
    true
}

impl RescalerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("RESCALER"))
            .build()?;

        config
            .try_deserialize()
            .context("invalid RESCALER_* configuration")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn persist_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.persist_max_attempts,
            Duration::from_millis(self.persist_backoff_ms),
        )
    }
}
