//! Hot-reloadable service configuration
//!
//! Each service keeps its tunables in the `config` map of its service
//! document. The map is re-read every cycle and resolved into a
//! `ServiceConfig` value that is passed down explicitly.

use crate::models::{lenient, Service};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

/// Service document of the rescaling engine
pub const SCALER_SERVICE: &str = "scaler";

/// Service document of the structures snapshotter
pub const SNAPSHOTTER_SERVICE: &str = "structures_snapshoter";

/// Per-cycle configuration of a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Sleep between cycles (POLLING_FREQUENCY, seconds)
    pub polling_frequency: Duration,
    /// Maximum age of a pending request (REQUEST_TIMEOUT, seconds)
    pub request_timeout: Duration,
    /// Log routine cycle messages at info level (DEBUG)
    pub debug: bool,
    /// Snapshot application totals as well as containers (PERSIST_APPS)
    pub persist_apps: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            polling_frequency: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            debug: true,
            persist_apps: true,
        }
    }
}

impl ServiceConfig {
    /// Resolve the configuration of `service`, falling back to defaults for
    /// missing or malformed keys
    pub fn from_service(service: &Service) -> Self {
        let defaults = Self::default();
        let config = &service.config;

        let seconds = |key: &str, default: Duration| match config.get(key) {
            None => default,
            Some(value) => match lenient::to_i64(value) {
                Some(secs) if secs >= 0 => Duration::from_secs(secs as u64),
                _ => {
                    warn!(service = %service.name, key, value = %value, "Invalid config value, using default");
                    default
                }
            },
        };

        let flag = |key: &str, default: bool| match config.get(key) {
            None => default,
            Some(value) => parse_flag(value).unwrap_or_else(|| {
                warn!(service = %service.name, key, value = %value, "Invalid config value, using default");
                default
            }),
        };

        Self {
            polling_frequency: seconds("POLLING_FREQUENCY", defaults.polling_frequency),
            request_timeout: seconds("REQUEST_TIMEOUT", defaults.request_timeout),
            debug: flag("DEBUG", defaults.debug),
            persist_apps: flag("PERSIST_APPS", defaults.persist_apps),
        }
    }
}

fn parse_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(config: Value) -> Service {
        let mut service = Service::new(SCALER_SERVICE);
        service.config = config.as_object().cloned().unwrap_or_default();
        service
    }

    #[test]
    fn test_defaults_for_empty_config() {
        let config = ServiceConfig::from_service(&service(json!({})));
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.polling_frequency, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_reads_values() {
        let config = ServiceConfig::from_service(&service(json!({
            "POLLING_FREQUENCY": 5,
            "REQUEST_TIMEOUT": "30",
            "DEBUG": false,
            "PERSIST_APPS": "no"
        })));

        assert_eq!(config.polling_frequency, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.debug);
        assert!(!config.persist_apps);
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = ServiceConfig::from_service(&service(json!({
            "POLLING_FREQUENCY": -3,
            "REQUEST_TIMEOUT": "soon",
            "DEBUG": "maybe"
        })));

        assert_eq!(config, ServiceConfig::default());
    }
}
