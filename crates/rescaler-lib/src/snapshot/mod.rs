//! Structures snapshotter
//!
//! Samples the limits enforced by the host agents and records them as the
//! `current` value of every container, and optionally of every application
//! as the sum of its members. Runs as its own service next to the control
//! loop, with its own heartbeat and configuration document.

use crate::agent::{HostAgent, LiveResources};
use crate::config::{ServiceConfig, SNAPSHOTTER_SERVICE};
use crate::health::{components, HealthRegistry};
use crate::models::{AgentEndpoint, ResourceKind, Structure, Subtype};
use crate::observability::ScalerMetrics;
use crate::store::{beat, update_verified, RetryPolicy, StateStore, StoreResult};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{info, warn};

/// Resources whose live limits are snapshotted
pub const SNAPSHOT_RESOURCES: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Mem];

/// Outcome of one snapshot pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    pub containers: usize,
    pub failed: usize,
    pub applications: usize,
}

/// Periodic writer of live limits into structure documents
pub struct Snapshotter {
    store: Arc<dyn StateStore>,
    agent: Arc<dyn HostAgent>,
    health: HealthRegistry,
    metrics: ScalerMetrics,
    heartbeat_policy: RetryPolicy,
    write_policy: RetryPolicy,
}

impl Snapshotter {
    pub fn new(store: Arc<dyn StateStore>, agent: Arc<dyn HostAgent>, health: HealthRegistry) -> Self {
        Self {
            store,
            agent,
            health,
            metrics: ScalerMetrics::new(),
            heartbeat_policy: RetryPolicy::new(3, Duration::from_millis(500)),
            write_policy: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }

    pub fn heartbeat_policy(mut self, policy: RetryPolicy) -> Self {
        self.heartbeat_policy = policy;
        self
    }

    /// Retries for each structure write
    pub fn write_policy(mut self, policy: RetryPolicy) -> Self {
        self.write_policy = policy;
        self
    }

    /// Run snapshot passes until shutdown
    ///
    /// A pass runs in the background while the loop sleeps. A pass that
    /// outlives the polling period delays the next one.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let service = beat(self.store.as_ref(), SNAPSHOTTER_SERVICE, &self.heartbeat_policy)
                .await
                .context("failed to write snapshotter heartbeat")?;
            let config = ServiceConfig::from_service(&service);

            let mut pass = tokio::spawn(snapshot_pass(
                self.store.clone(),
                self.agent.clone(),
                self.write_policy.clone(),
                config.persist_apps,
            ));
            verbose!(config.debug, "Structures snapshot started");

            tokio::select! {
                _ = tokio::time::sleep(config.polling_frequency) => {}
                _ = shutdown.recv() => {
                    pass.abort();
                    info!("Shutting down snapshotter");
                    return Ok(());
                }
            }

            let late = if pass.is_finished() {
                None
            } else {
                warn!(
                    polling_frequency_secs = config.polling_frequency.as_secs(),
                    "Snapshot pass still running, waiting for it"
                );
                Some(Instant::now())
            };

            let outcome = tokio::select! {
                joined = &mut pass => joined.context("snapshot pass panicked")?,
                _ = shutdown.recv() => {
                    pass.abort();
                    info!("Shutting down snapshotter");
                    return Ok(());
                }
            };
            if let Some(since) = late {
                warn!(delay_ms = since.elapsed().as_millis() as u64, "Snapshot pass delayed the next poll");
            }

            match &outcome {
                Ok(report) => {
                    self.metrics.add_snapshot_errors(report.failed);
                    verbose!(
                        config.debug,
                        containers = report.containers,
                        failed = report.failed,
                        applications = report.applications,
                        "Structures snapshotted"
                    );
                }
                Err(e) => warn!(error = %e, "Snapshot pass failed"),
            }
            self.health.record(components::SNAPSHOTTER, &outcome).await;
        }
    }
}

/// Snapshot every container, then every application if `persist_apps`
pub async fn snapshot_pass(
    store: Arc<dyn StateStore>,
    agent: Arc<dyn HostAgent>,
    policy: RetryPolicy,
    persist_apps: bool,
) -> StoreResult<SnapshotReport> {
    let start = Instant::now();
    let containers = store.get_structures(Some(Subtype::Container)).await?;
    let mut report = SnapshotReport::default();

    let mut tasks = JoinSet::new();
    for container in containers.iter().cloned() {
        let (store, agent, policy) = (store.clone(), agent.clone(), policy.clone());
        tasks.spawn(async move {
            snapshot_container(store.as_ref(), agent.as_ref(), &policy, &container).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => report.containers += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                warn!(error = %e, "Container snapshot task failed");
                report.failed += 1;
            }
        }
    }

    if persist_apps {
        let live = host_containers(agent.as_ref(), &containers).await;
        report.applications = persist_applications(store.as_ref(), &policy, &live).await?;
    }

    ScalerMetrics::new().observe_snapshot_latency(start.elapsed().as_secs_f64());
    Ok(report)
}

/// Write the live limits of one container, returning whether it succeeded
async fn snapshot_container(
    store: &dyn StateStore,
    agent: &dyn HostAgent,
    policy: &RetryPolicy,
    container: &Structure,
) -> bool {
    let name = container.name.as_str();
    let placement = match container.placement() {
        Ok(placement) => placement,
        Err(e) => {
            warn!(container = %name, error = %e, "Cannot snapshot container");
            return false;
        }
    };

    let live = match agent.container_resources(&placement.endpoint, name).await {
        Ok(live) => live,
        Err(e) => {
            warn!(container = %name, error = %e, "Could not get container resources");
            return false;
        }
    };

    let values = snapshot_values(name, &live);
    if values.is_empty() {
        return false;
    }

    match write_current(store, policy, name, &values).await {
        Ok(()) => true,
        Err(e) => {
            warn!(container = %name, error = %e, "Could not persist container snapshot");
            false
        }
    }
}

fn snapshot_values(name: &str, live: &LiveResources) -> BTreeMap<ResourceKind, i64> {
    let mut values = BTreeMap::new();
    for kind in SNAPSHOT_RESOURCES {
        match live.snapshot_value(kind) {
            Some(value) => {
                values.insert(kind, value);
            }
            None => warn!(container = %name, resource = %kind, "No live value for resource"),
        }
    }
    values
}

/// Store `values` as the current values of structure `name`
async fn write_current(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    name: &str,
    values: &BTreeMap<ResourceKind, i64>,
) -> StoreResult<()> {
    update_verified(
        policy,
        name,
        move || async move { store.get_structure(name).await },
        move |mut structure: Structure| async move {
            for (kind, value) in values {
                structure.resources.entry(*kind).or_default().current = Some(*value);
            }
            store.update_structure(&structure).await
        },
        |stored: &Structure| {
            values
                .iter()
                .all(|(kind, value)| stored.resources.get(kind).and_then(|r| r.current) == Some(*value))
        },
    )
    .await
    .map(|_| ())
}

/// Live limits of every container, asking each distinct host agent once
async fn host_containers(
    agent: &dyn HostAgent,
    containers: &[Structure],
) -> HashMap<String, LiveResources> {
    let mut endpoints: BTreeMap<String, AgentEndpoint> = BTreeMap::new();
    for container in containers {
        if let Ok(placement) = container.placement() {
            endpoints.entry(placement.host).or_insert(placement.endpoint);
        }
    }

    let mut live = HashMap::new();
    for (host, endpoint) in endpoints {
        match agent.host_containers(&endpoint).await {
            Ok(found) => live.extend(found),
            Err(e) => warn!(host = %host, error = %e, "Could not list host containers"),
        }
    }
    live
}

/// Store every application's current values as the sum over its members
async fn persist_applications(
    store: &dyn StateStore,
    policy: &RetryPolicy,
    live: &HashMap<String, LiveResources>,
) -> StoreResult<usize> {
    let applications = store.get_structures(Some(Subtype::Application)).await?;
    let mut written = 0;

    for app in &applications {
        let mut totals: BTreeMap<ResourceKind, i64> =
            SNAPSHOT_RESOURCES.iter().map(|kind| (*kind, 0)).collect();
        for member in &app.containers {
            let Some(resources) = live.get(member) else {
                warn!(application = %app.name, container = %member, "Container info missing, application totals will be inaccurate");
                continue;
            };
            for (kind, total) in totals.iter_mut() {
                match resources.snapshot_value(*kind) {
                    Some(value) => *total += value,
                    None => warn!(application = %app.name, container = %member, resource = %kind, "No live value for resource"),
                }
            }
        }

        match write_current(store, policy, &app.name, &totals).await {
            Ok(()) => written += 1,
            Err(e) => warn!(application = %app.name, error = %e, "Could not persist application snapshot"),
        }
    }
    Ok(written)
}
