//! Host agent communication
//!
//! Every host runs an agent that enforces container limits at the cgroup
//! level. The engine reads live limits from it and pushes new ones; the agent
//! is the source of truth for what is currently enforced.

mod http;

pub use http::HttpHostAgent;

use crate::models::{AgentEndpoint, ResourceKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors talking to a host agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("host agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("host agent returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid host agent url: {0}")]
    Url(String),

    #[error("host agent reported no {resource} data for {container}")]
    MissingResource {
        container: String,
        resource: ResourceKind,
    },
}

/// A limit as enforced by the host, `-1` on the wire meaning unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "i64")]
pub enum Limit {
    Unlimited,
    Value(i64),
}

impl TryFrom<Value> for Limit {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match crate::models::lenient::to_i64(&value) {
            Some(-1) => Ok(Limit::Unlimited),
            Some(v) => Ok(Limit::Value(v)),
            None => Err(format!("bad limit value {value}")),
        }
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        match limit {
            Limit::Unlimited => -1,
            Limit::Value(v) => v,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_allowance_limit: Option<Limit>,
    #[serde(default)]
    pub cpu_num: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_cpu_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<Limit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_read_limit: Option<Limit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_write_limit: Option<Limit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_limit: Option<Limit>,
}

/// Live limits of a container as reported by its host agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<MemLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<NetLimits>,
}

impl LiveResources {
    /// The limit a rescale of `kind` starts from
    pub fn limit(&self, kind: ResourceKind) -> Option<Limit> {
        match kind {
            ResourceKind::Cpu => self.cpu.as_ref()?.cpu_allowance_limit,
            ResourceKind::Mem => self.mem.as_ref()?.mem_limit,
            ResourceKind::Disk => self.disk.as_ref()?.disk_read_limit,
            ResourceKind::Net => self.net.as_ref()?.net_limit,
            ResourceKind::Energy => None,
        }
    }

    /// Value recorded as a structure's `current` by snapshots
    pub fn snapshot_value(&self, kind: ResourceKind) -> Option<i64> {
        match kind {
            ResourceKind::Cpu => self
                .cpu
                .as_ref()?
                .effective_cpu_limit
                .map(|v| v.round() as i64),
            _ => match self.limit(kind)? {
                Limit::Value(v) => Some(v),
                Limit::Unlimited => None,
            },
        }
    }

    /// Cores the container is pinned to, in listed order
    pub fn cpu_cores(&self) -> Vec<String> {
        self.cpu
            .as_ref()
            .map(|cpu| parse_cpu_list(&cpu.cpu_num))
            .unwrap_or_default()
    }
}

/// Expand a cpuset string such as `0-2,7` into `["0", "1", "2", "7"]`
pub fn parse_cpu_list(cpu_num: &str) -> Vec<String> {
    let mut cores = Vec::new();
    for part in cpu_num.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) if start <= end => {
                    cores.extend((start..=end).map(|c| c.to_string()));
                }
                _ => {
                    cores.push(start.trim().to_string());
                    cores.push(end.trim().to_string());
                }
            },
            None => cores.push(part.to_string()),
        }
    }
    cores
}

fn as_string<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// New limits pushed to a host agent for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitUpdate {
    Cpu {
        cpu_num: String,
        cpu_allowance_limit: i64,
    },
    Mem {
        #[serde(serialize_with = "as_string")]
        mem_limit: i64,
    },
    Disk {
        #[serde(serialize_with = "as_string")]
        disk_read_limit: i64,
        #[serde(serialize_with = "as_string")]
        disk_write_limit: i64,
    },
    Net {
        #[serde(serialize_with = "as_string")]
        net_limit: i64,
    },
}

impl LimitUpdate {
    /// The resulting limit value
    pub fn new_limit(&self) -> i64 {
        match self {
            LimitUpdate::Cpu {
                cpu_allowance_limit,
                ..
            } => *cpu_allowance_limit,
            LimitUpdate::Mem { mem_limit } => *mem_limit,
            LimitUpdate::Disk {
                disk_read_limit, ..
            } => *disk_read_limit,
            LimitUpdate::Net { net_limit } => *net_limit,
        }
    }
}

/// Trait for host agent implementations
#[async_trait]
pub trait HostAgent: Send + Sync {
    /// Live limits of a single container
    async fn container_resources(
        &self,
        endpoint: &AgentEndpoint,
        container: &str,
    ) -> Result<LiveResources, AgentError>;

    /// Live limits of every container on the host, keyed by container name
    async fn host_containers(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<HashMap<String, LiveResources>, AgentError>;

    /// Apply new limits to a container
    async fn set_container_resources(
        &self,
        endpoint: &AgentEndpoint,
        container: &str,
        update: &LimitUpdate,
    ) -> Result<(), AgentError>;
}
