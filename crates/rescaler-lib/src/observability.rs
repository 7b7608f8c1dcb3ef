//! Observability infrastructure for the rescaler
//!
//! Provides:
//! - Prometheus metrics (cycle latency, request outcomes, host persistence, snapshots)
//! - Structured event logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for cycle and snapshot latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

static GLOBAL_METRICS: OnceLock<ScalerMetricsInner> = OnceLock::new();

struct ScalerMetricsInner {
    cycle_latency_seconds: Histogram,
    requests: IntCounterVec,
    pending_requests: IntGauge,
    hosts_persisted: IntCounter,
    host_persist_failures: IntCounter,
    partial_rescales: IntCounter,
    loop_restarts: IntCounter,
    snapshot_latency_seconds: Histogram,
    snapshot_errors: IntCounter,
}

impl ScalerMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram!(
                "rescaler_cycle_latency_seconds",
                "Time spent dispatching the requests of one cycle",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            requests: register_int_counter_vec!(
                "rescaler_requests_total",
                "Requests handled, by outcome",
                &["outcome"]
            )
            .expect("Failed to register requests_total"),

            pending_requests: register_int_gauge!(
                "rescaler_pending_requests",
                "Requests left for dispatch after deduplication in the last cycle"
            )
            .expect("Failed to register pending_requests"),

            hosts_persisted: register_int_counter!(
                "rescaler_hosts_persisted_total",
                "Host documents written back to the state store"
            )
            .expect("Failed to register hosts_persisted"),

            host_persist_failures: register_int_counter!(
                "rescaler_host_persist_failures_total",
                "Host persistence passes abandoned after exhausting retries"
            )
            .expect("Failed to register host_persist_failures"),

            partial_rescales: register_int_counter!(
                "rescaler_partial_application_rescales_total",
                "Application requests that could only be partly planned"
            )
            .expect("Failed to register partial_rescales"),

            loop_restarts: register_int_counter!(
                "rescaler_loop_restarts_total",
                "Control loop restarts after a failed cycle"
            )
            .expect("Failed to register loop_restarts"),

            snapshot_latency_seconds: register_histogram!(
                "rescaler_snapshot_latency_seconds",
                "Time spent on one structures snapshot pass",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register snapshot_latency_seconds"),

            snapshot_errors: register_int_counter!(
                "rescaler_snapshot_errors_total",
                "Structures that could not be snapshotted"
            )
            .expect("Failed to register snapshot_errors"),
        }
    }
}

/// Outcome label of a handled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Applied,
    Failed,
    Planned,
    Expired,
    Superseded,
}

impl RequestOutcome {
    fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Applied => "applied",
            RequestOutcome::Failed => "failed",
            RequestOutcome::Planned => "planned",
            RequestOutcome::Expired => "expired",
            RequestOutcome::Superseded => "superseded",
        }
    }
}

/// Handle to the process-wide rescaler metrics
#[derive(Clone)]
pub struct ScalerMetrics {
    _private: (),
}

impl Default for ScalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScalerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScalerMetricsInner {
        GLOBAL_METRICS.get_or_init(ScalerMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, duration_secs: f64) {
        self.inner().cycle_latency_seconds.observe(duration_secs);
    }

    pub fn add_requests(&self, outcome: RequestOutcome, count: usize) {
        self.inner()
            .requests
            .with_label_values(&[outcome.label()])
            .inc_by(count as u64);
    }

    pub fn set_pending_requests(&self, count: usize) {
        self.inner().pending_requests.set(count as i64);
    }

    pub fn add_hosts_persisted(&self, count: usize) {
        self.inner().hosts_persisted.inc_by(count as u64);
    }

    pub fn inc_host_persist_failures(&self) {
        self.inner().host_persist_failures.inc();
    }

    pub fn inc_partial_rescales(&self) {
        self.inner().partial_rescales.inc();
    }

    pub fn inc_loop_restarts(&self) {
        self.inner().loop_restarts.inc();
    }

    pub fn observe_snapshot_latency(&self, duration_secs: f64) {
        self.inner().snapshot_latency_seconds.observe(duration_secs);
    }

    pub fn add_snapshot_errors(&self, count: usize) {
        self.inner().snapshot_errors.inc_by(count as u64);
    }
}

/// Structured logger for rescaler events
#[derive(Clone)]
pub struct StructuredLogger {
    service: String,
}

impl StructuredLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn log_startup(&self, version: &str, state_store: &str) {
        info!(
            event = "rescaler_started",
            service = %self.service,
            version = %version,
            state_store = %state_store,
            "Rescaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "rescaler_shutdown",
            service = %self.service,
            reason = %reason,
            "Rescaler shutting down"
        );
    }

    pub fn log_request_applied(&self, structure: &str, action: &str, amount: i64, new_limit: i64) {
        info!(
            event = "request_applied",
            service = %self.service,
            structure = %structure,
            action = %action,
            amount = amount,
            new_limit = new_limit,
            "Request applied"
        );
    }

    pub fn log_request_failed(
        &self,
        structure: &str,
        resource: &str,
        action: &str,
        amount: i64,
        error: &dyn std::error::Error,
    ) {
        error!(
            event = "request_failed",
            service = %self.service,
            structure = %structure,
            resource = %resource,
            action = %action,
            amount = amount,
            error = %error,
            "Request could not be applied"
        );
    }

    pub fn log_partial_rescale(&self, application: &str, resource: &str, requested: i64, rescaled: i64) {
        warn!(
            event = "partial_rescale",
            service = %self.service,
            application = %application,
            resource = %resource,
            requested = requested,
            rescaled = rescaled,
            "Application only partly rescaled"
        );
    }

    pub fn log_restart(&self, attempt: u32, max_restarts: u32, error: &str) {
        error!(
            event = "loop_restart",
            service = %self.service,
            attempt = attempt,
            max_restarts = max_restarts,
            error = %error,
            "Restarting control loop"
        );
    }
}
