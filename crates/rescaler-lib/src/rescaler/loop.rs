//! Control loop
//!
//! Every cycle writes the heartbeat, reloads the service configuration,
//! collects the pending requests and applies them: all scale-downs first so
//! the capacity they release is visible to the scale-ups that follow. Host
//! changes are persisted once at the end of the cycle.

use super::{
    split_by_direction, AppliedRescale, ApplicationPlanner, ContainerRescaler, HostCache, Plan,
    RequestQueue, RescaleError, SPLIT_SHARES,
};
use crate::agent::HostAgent;
use crate::config::{ServiceConfig, SCALER_SERVICE};
use crate::health::{components, HealthRegistry};
use crate::models::{Request, Subtype, ValidationError};
use crate::observability::{RequestOutcome, ScalerMetrics, StructuredLogger};
use crate::store::{beat, RetryPolicy, StateStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::info;

/// Static configuration of the control loop
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Service document holding the heartbeat and dynamic config
    pub service_name: String,
    /// Retries for writing host documents back
    pub persist_policy: RetryPolicy,
    /// Retries for the heartbeat write
    pub heartbeat_policy: RetryPolicy,
    /// Restarts allowed after a failed cycle before giving up
    pub max_restarts: u32,
    /// Step size for application requests
    pub split_shares: i64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            service_name: SCALER_SERVICE.to_string(),
            persist_policy: RetryPolicy::default(),
            heartbeat_policy: RetryPolicy::new(3, Duration::from_millis(500)),
            max_restarts: 2,
            split_shares: SPLIT_SHARES,
        }
    }
}

/// What happened during one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub applied: usize,
    pub failed: usize,
    /// Container requests generated from application requests
    pub planned: usize,
    pub expired: usize,
    pub superseded: usize,
    pub hosts_persisted: usize,
}

enum Dispatched {
    Container(AppliedRescale),
    Application(Plan),
}

/// The rescaling control loop
pub struct Scaler {
    store: Arc<dyn StateStore>,
    agent: Arc<dyn HostAgent>,
    config: ScalerConfig,
    health: HealthRegistry,
    metrics: ScalerMetrics,
    logger: StructuredLogger,
}

impl Scaler {
    pub fn new(
        store: Arc<dyn StateStore>,
        agent: Arc<dyn HostAgent>,
        config: ScalerConfig,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(config.service_name.clone());
        Self {
            store,
            agent,
            config,
            health,
            metrics: ScalerMetrics::new(),
            logger,
        }
    }

    /// Run the loop, restarting it after failures up to the restart budget
    ///
    /// Returns `Ok` on shutdown and the last error once the budget is spent.
    pub async fn run_with_restarts(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut restarts = 0;
        loop {
            let err = match self.run(&mut shutdown).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if restarts >= self.config.max_restarts {
                self.health
                    .set_unhealthy(components::SCALER, format!("{err:#}"))
                    .await;
                return Err(err.context(format!(
                    "control loop failed after {restarts} restarts"
                )));
            }

            restarts += 1;
            self.metrics.inc_loop_restarts();
            self.health
                .set_degraded(components::SCALER, format!("restarting: {err:#}"))
                .await;
            self.logger
                .log_restart(restarts, self.config.max_restarts, &format!("{err:#}"));
        }
    }

    /// Purge stale requests, then run cycles until shutdown or failure
    pub async fn run(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        info!(service = %self.config.service_name, "Purging previous requests");
        let purged = RequestQueue::new(self.store.as_ref())
            .purge()
            .await
            .context("failed to purge previous requests")?;
        self.metrics.add_requests(RequestOutcome::Expired, purged);

        loop {
            let service = beat(
                self.store.as_ref(),
                &self.config.service_name,
                &self.config.heartbeat_policy,
            )
            .await
            .context("failed to write heartbeat")?;
            let config = ServiceConfig::from_service(&service);

            let outcome = self.cycle(&config).await;
            self.health.record(components::SCALER, &outcome).await;
            let report = outcome?;

            verbose!(
                config.debug,
                applied = report.applied,
                failed = report.failed,
                planned = report.planned,
                expired = report.expired,
                superseded = report.superseded,
                hosts_persisted = report.hosts_persisted,
                "Cycle complete"
            );

            tokio::select! {
                _ = tokio::time::sleep(config.polling_frequency) => {}
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    return Ok(());
                }
            }
        }
    }

    /// Run one cycle: collect, dispatch down then up, persist
    pub async fn cycle(&self, config: &ServiceConfig) -> Result<CycleReport> {
        let now = chrono::Utc::now().timestamp();
        let queue = RequestQueue::new(self.store.as_ref())
            .collect_pending(config.request_timeout, now)
            .await
            .context("failed to collect pending requests")?;

        let mut report = CycleReport {
            expired: queue.expired,
            superseded: queue.superseded,
            ..Default::default()
        };
        self.metrics.add_requests(RequestOutcome::Expired, queue.expired);
        self.metrics
            .add_requests(RequestOutcome::Superseded, queue.superseded);
        self.metrics.set_pending_requests(queue.requests.len());

        if queue.requests.is_empty() {
            verbose!(config.debug, "No requests");
            return Ok(report);
        }
        verbose!(config.debug, requests = queue.requests.len(), "Processing requests");

        let start = Instant::now();
        let mut cache = HostCache::new();
        let (down, up) = split_by_direction(queue.requests);

        for request in down.iter().chain(up.iter()) {
            self.dispatch(request, &mut cache, config, &mut report)
                .await?;
            self.store
                .delete_request(request)
                .await
                .with_context(|| format!("failed to delete request for {}", request.structure))?;
        }

        match cache
            .persist(self.store.as_ref(), &self.config.persist_policy)
            .await
        {
            Ok(written) => {
                report.hosts_persisted = written;
                self.metrics.add_hosts_persisted(written);
            }
            Err(e) => {
                self.metrics.inc_host_persist_failures();
                return Err(e).context("failed to persist host resources");
            }
        }

        self.metrics
            .observe_cycle_latency(start.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Apply one request, recording its outcome
    ///
    /// Only failures that make the store untrustworthy are returned.
    async fn dispatch(
        &self,
        request: &Request,
        cache: &mut HostCache,
        config: &ServiceConfig,
        report: &mut CycleReport,
    ) -> Result<()> {
        match self.apply(request, cache, config).await {
            Ok(Dispatched::Container(applied)) => {
                report.applied += 1;
                self.metrics.add_requests(RequestOutcome::Applied, 1);
                self.logger.log_request_applied(
                    &applied.structure,
                    &request.action,
                    applied.amount,
                    applied.update.new_limit(),
                );
            }
            Ok(Dispatched::Application(plan)) => {
                report.planned += plan.requests.len();
                self.metrics.add_requests(RequestOutcome::Planned, 1);
                if !plan.is_complete() {
                    self.metrics.inc_partial_rescales();
                    self.logger.log_partial_rescale(
                        &request.structure,
                        request.resource.as_str(),
                        plan.requested,
                        plan.rescaled,
                    );
                }
            }
            Err(e) if e.is_fatal() => {
                return Err(e).with_context(|| {
                    format!("{} of {} by {}", request.action, request.structure, request.amount)
                });
            }
            Err(e) => {
                report.failed += 1;
                self.metrics.add_requests(RequestOutcome::Failed, 1);
                self.logger.log_request_failed(
                    &request.structure,
                    request.resource.as_str(),
                    &request.action,
                    request.amount,
                    &e,
                );
            }
        }
        Ok(())
    }

    async fn apply(
        &self,
        request: &Request,
        cache: &mut HostCache,
        config: &ServiceConfig,
    ) -> Result<Dispatched, RescaleError> {
        let structure = self.store.get_structure(&request.structure).await?;

        match structure.subtype {
            Subtype::Container => {
                ContainerRescaler::new(self.store.as_ref(), self.agent.as_ref(), config.debug)
                    .rescale(request, &structure, cache)
                    .await
                    .map(Dispatched::Container)
            }
            Subtype::Application => {
                ApplicationPlanner::new(self.store.as_ref(), self.config.split_shares, config.debug)
                    .rescale(request, &structure, cache)
                    .await
                    .map(Dispatched::Application)
            }
            Subtype::Host => Err(ValidationError::UnsupportedSubtype {
                structure: structure.name.clone(),
                subtype: structure.subtype,
            }
            .into()),
        }
    }
}

/// Builder for the control loop
pub struct ScalerBuilder {
    store: Option<Arc<dyn StateStore>>,
    agent: Option<Arc<dyn HostAgent>>,
    config: ScalerConfig,
    health: HealthRegistry,
}

impl ScalerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            agent: None,
            config: ScalerConfig::default(),
            health: HealthRegistry::new(),
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn agent(mut self, agent: Arc<dyn HostAgent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn persist_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.persist_policy = policy;
        self
    }

    pub fn heartbeat_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.heartbeat_policy = policy;
        self
    }

    pub fn max_restarts(mut self, max_restarts: u32) -> Self {
        self.config.max_restarts = max_restarts;
        self
    }

    pub fn split_shares(mut self, shares: i64) -> Self {
        self.config.split_shares = shares;
        self
    }

    /// Registry the loop reports its health to
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> Result<Scaler> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("State store is required"))?;
        let agent = self
            .agent
            .ok_or_else(|| anyhow::anyhow!("Host agent client is required"))?;
        if self.config.split_shares <= 0 {
            anyhow::bail!("Split size must be positive, got {}", self.config.split_shares);
        }

        Ok(Scaler::new(store, agent, self.config, self.health))
    }
}

impl Default for ScalerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Service;
    use crate::rescaler::tests::MockAgent;
    use crate::store::MemoryStore;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(2, Duration::ZERO)
    }

    #[test]
    fn test_scaler_config_default() {
        let config = ScalerConfig::default();
        assert_eq!(config.service_name, "scaler");
        assert_eq!(config.max_restarts, 2);
        assert_eq!(config.split_shares, 15);
        assert_eq!(config.persist_policy.max_attempts, 10);
    }

    #[test]
    fn test_builder_requires_store_and_agent() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        assert!(ScalerBuilder::new().store(store.clone()).build().is_err());
        assert!(ScalerBuilder::new()
            .agent(Arc::new(MockAgent::default()))
            .build()
            .is_err());
        assert!(ScalerBuilder::new()
            .store(store.clone())
            .agent(Arc::new(MockAgent::default()))
            .split_shares(0)
            .build()
            .is_err());
        assert!(ScalerBuilder::new()
            .store(store)
            .agent(Arc::new(MockAgent::default()))
            .build()
            .is_ok());
    }

    #[tokio::test]
    async fn test_restart_budget_is_enforced() {
        // No service document: every run fails on its heartbeat
        let health = HealthRegistry::new();
        let scaler = ScalerBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .agent(Arc::new(MockAgent::default()))
            .heartbeat_policy(quick())
            .max_restarts(2)
            .health(health.clone())
            .build()
            .unwrap();

        let (_tx, rx) = broadcast::channel(1);
        let err = scaler.run_with_restarts(rx).await.unwrap_err();

        assert!(format!("{err:#}").contains("after 2 restarts"));
        assert!(!health.health().await.status.is_operational());
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let mut service = Service::new("scaler");
        service
            .config
            .insert("POLLING_FREQUENCY".to_string(), serde_json::json!(3600));
        store.insert(&service).await.unwrap();

        let health = HealthRegistry::new();
        let scaler = ScalerBuilder::new()
            .store(store.clone())
            .agent(Arc::new(MockAgent::default()))
            .heartbeat_policy(quick())
            .health(health.clone())
            .build()
            .unwrap();

        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        tokio_test::assert_ok!(scaler.run_with_restarts(rx).await);

        assert!(store.get_service("scaler").await.unwrap().heartbeat.is_some());
        assert_eq!(
            health.health().await.components[components::SCALER].status,
            crate::health::ComponentStatus::Healthy
        );
    }
}
