//! Resource rescaling engine for serverless containers
//!
//! This crate provides the core functionality for:
//! - Typed access to the state store (structures, requests, services, rules, limits)
//! - Host agent communication (live limits, limit updates)
//! - Per-resource allocation, including CPU core bin-packing
//! - Container and application rescaling driven by pending requests
//! - Structure snapshots of live limits
//! - Health checks and observability

/// Log at `info` when the service's DEBUG flag is set, at `debug` otherwise.
macro_rules! verbose {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

pub mod agent;
pub mod config;
pub mod health;
pub mod models;
pub mod observability;
pub mod rescaler;
pub mod snapshot;
pub mod store;

pub use config::ServiceConfig;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{RequestOutcome, ScalerMetrics, StructuredLogger};
