//! Control loop tests against the in-memory store and a mock host agent

use super::allocator::test_support::{container, cpu_host, live_cpu, shares};
use super::{CycleReport, Scaler, ScalerBuilder};
use crate::agent::{AgentError, HostAgent, LimitUpdate, LiveResources};
use crate::config::ServiceConfig;
use crate::models::{
    AgentEndpoint, Placement, Request, ResourceKind, ResourceRecord, Structure,
    Subtype,
};
use crate::store::{Document, MemoryStore, RetryPolicy, StateStore};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Host agent double recording every limit update it receives
#[derive(Default)]
pub(crate) struct MockAgent {
    live: Mutex<HashMap<String, LiveResources>>,
    rejected: Mutex<HashSet<String>>,
    updates: Mutex<Vec<(String, LimitUpdate)>>,
}

impl MockAgent {
    pub fn with_live(self, container: &str, live: LiveResources) -> Self {
        self.live.lock().unwrap().insert(container.to_string(), live);
        self
    }

    /// Make limit updates for `container` fail
    pub fn reject(self, container: &str) -> Self {
        self.rejected.lock().unwrap().insert(container.to_string());
        self
    }

    pub fn updates(&self) -> Vec<(String, LimitUpdate)> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostAgent for MockAgent {
    async fn container_resources(
        &self,
        _endpoint: &AgentEndpoint,
        container: &str,
    ) -> Result<LiveResources, AgentError> {
        self.live
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .ok_or_else(|| AgentError::Status {
                status: 404,
                body: format!("{container} not found"),
            })
    }

    async fn host_containers(
        &self,
        _endpoint: &AgentEndpoint,
    ) -> Result<HashMap<String, LiveResources>, AgentError> {
        Ok(self.live.lock().unwrap().clone())
    }

    async fn set_container_resources(
        &self,
        _endpoint: &AgentEndpoint,
        container: &str,
        update: &LimitUpdate,
    ) -> Result<(), AgentError> {
        if self.rejected.lock().unwrap().contains(container) {
            return Err(AgentError::Status {
                status: 500,
                body: "cgroup write failed".to_string(),
            });
        }
        self.updates
            .lock()
            .unwrap()
            .push((container.to_string(), update.clone()));
        Ok(())
    }
}

fn placement() -> Placement {
    Placement {
        host: "host0".to_string(),
        endpoint: AgentEndpoint {
            ip: "10.0.0.1".to_string(),
            port: 8000,
        },
    }
}

fn placed(mut structure: Structure) -> Structure {
    let placement = placement();
    structure.host = Some(placement.host);
    structure.host_rescaler_ip = Some(placement.endpoint.ip);
    structure.host_rescaler_port = Some(placement.endpoint.port);
    structure
}

fn request(structure: &str, resource: ResourceKind, amount: i64) -> Request {
    Request::new(
        structure,
        resource,
        amount,
        &placement(),
        chrono::Utc::now().timestamp(),
    )
}

fn scaler(store: Arc<MemoryStore>, agent: Arc<MockAgent>) -> Scaler {
    ScalerBuilder::new()
        .store(store)
        .agent(agent)
        .persist_policy(RetryPolicy::new(5, Duration::ZERO))
        .build()
        .unwrap()
}

/// Two single-core containers on a full two-core host
async fn full_host_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert(&cpu_host(
            2,
            &[
                ("0", shares(0, &[("node0", 100)])),
                ("1", shares(0, &[("node1", 100)])),
            ],
        ))
        .await
        .unwrap();
    for name in ["node0", "node1"] {
        store
            .insert(&placed(container(name, ResourceKind::Cpu, 50, 200)))
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn test_scale_downs_run_before_scale_ups() {
    let store = full_host_store().await;
    // The scale-up is queued first but needs the shares the scale-down frees
    store
        .insert(&request("node1", ResourceKind::Cpu, 50))
        .await
        .unwrap();
    store
        .insert(&request("node0", ResourceKind::Cpu, -50))
        .await
        .unwrap();

    let agent = Arc::new(
        MockAgent::default()
            .with_live("node0", live_cpu(100, "0"))
            .with_live("node1", live_cpu(100, "1")),
    );
    let report = scaler(store.clone(), agent.clone())
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(
        report,
        CycleReport {
            applied: 2,
            hosts_persisted: 1,
            ..Default::default()
        }
    );

    let updates = agent.updates();
    assert_eq!(updates[0].0, "node0");
    assert_eq!(
        updates[1],
        (
            "node1".to_string(),
            LimitUpdate::Cpu {
                cpu_num: "1,0".to_string(),
                cpu_allowance_limit: 150,
            }
        )
    );

    let host = store.get_structure("host0").await.unwrap();
    let cpu = &host.resources[&ResourceKind::Cpu];
    assert_eq!(cpu.free, Some(0));
    let map = cpu.core_usage_mapping.as_ref().unwrap();
    assert_eq!(map["0"], shares(0, &[("node0", 50), ("node1", 50)]));
    assert_eq!(store.count::<Request>().await, 0);
}

#[tokio::test]
async fn test_rejected_update_leaves_host_untouched() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&cpu_host(2, &[])).await.unwrap();
    store
        .insert(&placed(container("node0", ResourceKind::Cpu, 50, 200)))
        .await
        .unwrap();
    store
        .insert(&request("node0", ResourceKind::Cpu, 50))
        .await
        .unwrap();

    let agent = Arc::new(
        MockAgent::default()
            .with_live("node0", live_cpu(100, "0"))
            .reject("node0"),
    );
    let report = scaler(store.clone(), agent.clone())
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.hosts_persisted, 0);
    assert!(agent.updates().is_empty());

    let host = store.get_structure("host0").await.unwrap();
    assert_eq!(host.resources[&ResourceKind::Cpu].free, Some(200));
    assert_eq!(host.rev.as_deref(), Some("1-mem"));
    // Failed requests are consumed like applied ones
    assert_eq!(store.count::<Request>().await, 0);
}

#[tokio::test]
async fn test_invalid_requests_are_dropped() {
    let store = full_host_store().await;
    store
        .insert(&request("node0", ResourceKind::Cpu, 150))
        .await
        .unwrap();
    store
        .insert(&request("ghost", ResourceKind::Cpu, 10))
        .await
        .unwrap();
    store
        .insert(&request("host0", ResourceKind::Cpu, 10))
        .await
        .unwrap();

    let agent = Arc::new(MockAgent::default().with_live("node0", live_cpu(100, "0")));
    let report = scaler(store.clone(), agent.clone())
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    // Above max, unknown structure and a host target
    assert_eq!(report.failed, 3);
    assert_eq!(report.applied, 0);
    assert_eq!(store.count::<Request>().await, 0);
}

#[tokio::test]
async fn test_application_request_is_planned_into_container_requests() {
    let store = Arc::new(MemoryStore::new());
    let mut host = Structure::new("host0", Subtype::Host);
    host.resources.insert(
        ResourceKind::Mem,
        ResourceRecord {
            max: Some(8192),
            free: Some(4096),
            ..Default::default()
        },
    );
    store.insert(&host).await.unwrap();

    for (name, usage) in [("node0", 1015.0), ("node1", 1010.0)] {
        let mut member = placed(container(name, ResourceKind::Mem, 512, 2048));
        if let Some(mem) = member.resources.get_mut(&ResourceKind::Mem) {
            mem.current = Some(1024);
            mem.usage = Some(usage);
        }
        store.insert(&member).await.unwrap();
    }

    let mut app = Structure::new("app0", Subtype::Application);
    app.containers = vec!["node0".to_string(), "node1".to_string(), "gone".to_string()];
    store.insert(&app).await.unwrap();
    store
        .insert(&request("app0", ResourceKind::Mem, 20))
        .await
        .unwrap();

    let agent = Arc::new(MockAgent::default());
    let report = scaler(store.clone(), agent.clone())
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(report.planned, 2);
    assert_eq!(report.hosts_persisted, 0);
    assert!(agent.updates().is_empty());

    let mut generated: Vec<(String, i64)> = store
        .get_requests()
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.structure, r.amount))
        .collect();
    generated.sort();
    // The tighter container takes the first step, then rotates to the back
    assert_eq!(
        generated,
        vec![("node0".to_string(), 15), ("node1".to_string(), 5)]
    );
}

#[tokio::test]
async fn test_host_persistence_retries_conflicts() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&cpu_host(2, &[])).await.unwrap();
    store
        .insert(&placed(container("node0", ResourceKind::Cpu, 50, 200)))
        .await
        .unwrap();
    store
        .insert(&request("node0", ResourceKind::Cpu, 50))
        .await
        .unwrap();
    store.inject_conflicts(3).await;

    let agent = Arc::new(MockAgent::default().with_live("node0", live_cpu(100, "0")));
    let report = scaler(store.clone(), agent)
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.hosts_persisted, 1);
    let host = store.get_structure("host0").await.unwrap();
    let cpu = &host.resources[&ResourceKind::Cpu];
    assert_eq!(cpu.free, Some(150));
    assert_eq!(
        cpu.core_usage_mapping.as_ref().unwrap()["0"],
        shares(50, &[("node0", 50)])
    );
}

#[tokio::test]
async fn test_exhausted_persistence_fails_the_cycle() {
    let store = Arc::new(MemoryStore::new());
    store.insert(&cpu_host(2, &[])).await.unwrap();
    store
        .insert(&placed(container("node0", ResourceKind::Cpu, 50, 200)))
        .await
        .unwrap();
    store
        .insert(&request("node0", ResourceKind::Cpu, 50))
        .await
        .unwrap();
    store.inject_conflicts(10).await;

    let agent = Arc::new(MockAgent::default().with_live("node0", live_cpu(100, "0")));
    let err = scaler(store.clone(), agent)
        .cycle(&ServiceConfig::default())
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("persist host resources"));
    assert_eq!(
        store.get_structure("host0").await.unwrap().resources[&ResourceKind::Cpu].free,
        Some(200)
    );
}

#[tokio::test]
async fn test_malformed_host_only_fails_its_own_request() {
    let store = Arc::new(MemoryStore::new());
    // Shares written as floats by other services
    store
        .insert_value(
            Structure::DATABASE,
            "host0",
            json!({
                "type": "structure", "subtype": "host", "name": "host0",
                "resources": {"cpu": {
                    "max": 200, "free": 185.0,
                    "core_usage_mapping": {
                        "0": {"free": 85.0, "node0": 15.0},
                        "1": {"free": 100.0}
                    }
                }}
            }),
        )
        .await;
    store
        .insert_value(
            Structure::DATABASE,
            "host1",
            json!({
                "type": "structure", "subtype": "host", "name": "host1",
                "resources": {"cpu": {
                    "max": 100, "free": 50,
                    "core_usage_mapping": {"0": {"free": 50, "node1": "half"}}
                }}
            }),
        )
        .await;

    store
        .insert(&placed(container("node0", ResourceKind::Cpu, 10, 200)))
        .await
        .unwrap();
    let broken = Placement {
        host: "host1".to_string(),
        endpoint: AgentEndpoint {
            ip: "10.0.0.2".to_string(),
            port: 8000,
        },
    };
    let mut node1 = container("node1", ResourceKind::Cpu, 10, 100);
    node1.host = Some(broken.host.clone());
    node1.host_rescaler_ip = Some(broken.endpoint.ip.clone());
    node1.host_rescaler_port = Some(broken.endpoint.port);
    store.insert(&node1).await.unwrap();

    store
        .insert(&request("node0", ResourceKind::Cpu, 50))
        .await
        .unwrap();
    store
        .insert(&Request::new(
            "node1",
            ResourceKind::Cpu,
            10,
            &broken,
            chrono::Utc::now().timestamp(),
        ))
        .await
        .unwrap();

    let agent = Arc::new(
        MockAgent::default()
            .with_live("node0", live_cpu(15, "0"))
            .with_live("node1", live_cpu(50, "0")),
    );
    let report = scaler(store.clone(), agent.clone())
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.hosts_persisted, 1);
    assert_eq!(
        agent.updates(),
        vec![(
            "node0".to_string(),
            LimitUpdate::Cpu {
                cpu_num: "0".to_string(),
                cpu_allowance_limit: 65,
            }
        )]
    );

    let host = store.get_structure("host0").await.unwrap();
    let cpu = &host.resources[&ResourceKind::Cpu];
    assert_eq!(cpu.free, Some(135));
    assert_eq!(
        cpu.core_usage_mapping.as_ref().unwrap()["0"],
        shares(35, &[("node0", 65)])
    );
    assert_eq!(store.count::<Request>().await, 0);
}

#[tokio::test]
async fn test_empty_queue_is_a_no_op() {
    let store = full_host_store().await;
    let agent = Arc::new(MockAgent::default());
    let report = scaler(store.clone(), agent)
        .cycle(&ServiceConfig::default())
        .await
        .unwrap();

    assert_eq!(report, CycleReport::default());
    assert_eq!(
        store.get_structure("host0").await.unwrap().resources[&ResourceKind::Cpu].free,
        Some(0)
    );
}
