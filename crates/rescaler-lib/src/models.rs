//! Core data models stored in the state database
//!
//! Documents are validated when they cross the store boundary: numeric
//! fields accept integers, floats and numeric strings, and unknown fields are
//! kept in `extra` so that writing a document back never drops data owned by
//! other services.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Resource kinds tracked per structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Mem,
    Disk,
    Net,
    Energy,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Mem => "mem",
            ResourceKind::Disk => "disk",
            ResourceKind::Net => "net",
            ResourceKind::Energy => "energy",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "Cpu",
            ResourceKind::Mem => "Mem",
            ResourceKind::Disk => "Disk",
            ResourceKind::Net => "Net",
            ResourceKind::Energy => "Energy",
        }
    }

    /// Whether a host must declare free capacity for this resource.
    ///
    /// Disk and network capacity is only accounted for on hosts that carry a
    /// record for it.
    pub fn requires_host_capacity(&self) -> bool {
        matches!(self, ResourceKind::Cpu | ResourceKind::Mem)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subtype {
    Container,
    Application,
    Host,
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subtype::Container => "container",
            Subtype::Application => "application",
            Subtype::Host => "host",
        })
    }
}

/// Scaling direction of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// Request action name for a signed amount, e.g. `CpuRescaleUp`
pub fn action_name(resource: ResourceKind, amount: i64) -> String {
    let direction = if amount > 0 { "Up" } else { "Down" };
    format!("{}Rescale{}", resource.title(), direction)
}

/// Errors raised when a document lacks data the engine needs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("structure {structure} has no {resource} resource")]
    MissingResource {
        structure: String,
        resource: ResourceKind,
    },

    #[error("structure {structure} has no {field} value for {resource}")]
    MissingField {
        structure: String,
        resource: ResourceKind,
        field: &'static str,
    },

    #[error("container {0} is missing its host placement")]
    MissingPlacement(String),

    #[error("structure {structure} has bounds min {min} > max {max} for {resource}")]
    InvertedBounds {
        structure: String,
        resource: ResourceKind,
        min: i64,
        max: i64,
    },

    #[error("structure {structure} of subtype {subtype} cannot be rescaled")]
    UnsupportedSubtype { structure: String, subtype: Subtype },
}

/// Shares of a single CPU core split between structures and unused capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreShares {
    #[serde(deserialize_with = "lenient::int")]
    pub free: i64,
    #[serde(flatten, deserialize_with = "lenient::shares")]
    pub owners: BTreeMap<String, i64>,
}

impl CoreShares {
    /// Shares available on one core
    pub const TOTAL: i64 = 100;

    pub fn fully_free() -> Self {
        Self {
            free: Self::TOTAL,
            owners: BTreeMap::new(),
        }
    }

    pub fn share_of(&self, structure: &str) -> i64 {
        self.owners.get(structure).copied().unwrap_or(0)
    }

    /// Move `shares` from the free pool to `structure`
    pub fn grant(&mut self, structure: &str, shares: i64) {
        self.free -= shares;
        *self.owners.entry(structure.to_string()).or_insert(0) += shares;
    }

    /// Return `shares` held by `structure` to the free pool
    pub fn release(&mut self, structure: &str, shares: i64) {
        self.free += shares;
        if let Some(held) = self.owners.get_mut(structure) {
            *held -= shares;
            if *held == 0 {
                self.owners.remove(structure);
            }
        }
    }

    /// Sum of every entry, free included
    pub fn total(&self) -> i64 {
        self.free + self.owners.values().sum::<i64>()
    }
}

/// Core id to share split for a host
pub type CoreUsageMap = BTreeMap<String, CoreShares>;

/// Per-resource record of a structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub current: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub min: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub max: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub free: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_usage_mapping: Option<CoreUsageMap>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Hard bounds declared for a structure's resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

impl Bounds {
    pub fn midpoint(&self) -> i64 {
        (self.min + self.max) / 2
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// Address of a host agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentEndpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Where a container runs and how to reach its host agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub host: String,
    pub endpoint: AgentEndpoint,
}

/// A container, application or host document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    pub subtype: Subtype,
    #[serde(default)]
    pub resources: BTreeMap<ResourceKind, ResourceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_rescaler_ip: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_port"
    )]
    pub host_rescaler_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Structure {
    pub fn new(name: impl Into<String>, subtype: Subtype) -> Self {
        let mut extra = Map::new();
        extra.insert("type".to_string(), Value::from("structure"));
        Self {
            id: None,
            rev: None,
            name: name.into(),
            subtype,
            resources: BTreeMap::new(),
            host: None,
            host_rescaler_ip: None,
            host_rescaler_port: None,
            containers: Vec::new(),
            extra,
        }
    }

    pub fn resource(&self, kind: ResourceKind) -> Result<&ResourceRecord, ValidationError> {
        self.resources
            .get(&kind)
            .ok_or_else(|| ValidationError::MissingResource {
                structure: self.name.clone(),
                resource: kind,
            })
    }

    pub fn bounds(&self, kind: ResourceKind) -> Result<Bounds, ValidationError> {
        let record = self.resource(kind)?;
        let missing = |field| ValidationError::MissingField {
            structure: self.name.clone(),
            resource: kind,
            field,
        };
        let min = record.min.ok_or_else(|| missing("min"))?;
        let max = record.max.ok_or_else(|| missing("max"))?;
        if min > max {
            return Err(ValidationError::InvertedBounds {
                structure: self.name.clone(),
                resource: kind,
                min,
                max,
            });
        }
        Ok(Bounds { min, max })
    }

    pub fn current(&self, kind: ResourceKind) -> Result<i64, ValidationError> {
        self.resource(kind)?
            .current
            .ok_or_else(|| ValidationError::MissingField {
                structure: self.name.clone(),
                resource: kind,
                field: "current",
            })
    }

    pub fn placement(&self) -> Result<Placement, ValidationError> {
        match (&self.host, &self.host_rescaler_ip, self.host_rescaler_port) {
            (Some(host), Some(ip), Some(port)) => Ok(Placement {
                host: host.clone(),
                endpoint: AgentEndpoint {
                    ip: ip.clone(),
                    port,
                },
            }),
            _ => Err(ValidationError::MissingPlacement(self.name.clone())),
        }
    }
}

fn request_doc_type() -> String {
    "request".to_string()
}

/// A pending "rescale by N shares" request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "type", default = "request_doc_type")]
    pub doc_type: String,
    pub structure: String,
    pub resource: ResourceKind,
    #[serde(deserialize_with = "lenient::int")]
    pub amount: i64,
    pub action: String,
    pub host: String,
    pub host_rescaler_ip: String,
    #[serde(deserialize_with = "lenient::port")]
    pub host_rescaler_port: u16,
    #[serde(deserialize_with = "lenient::int")]
    pub timestamp: i64,
}

impl Request {
    /// Build a request for `structure` placed at `placement`
    pub fn new(
        structure: impl Into<String>,
        resource: ResourceKind,
        amount: i64,
        placement: &Placement,
        timestamp: i64,
    ) -> Self {
        Self {
            id: None,
            rev: None,
            doc_type: request_doc_type(),
            structure: structure.into(),
            resource,
            amount,
            action: action_name(resource, amount),
            host: placement.host.clone(),
            host_rescaler_ip: placement.endpoint.ip.clone(),
            host_rescaler_port: placement.endpoint.port,
            timestamp,
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        if self.action.ends_with("Down") {
            Some(Direction::Down)
        } else if self.action.ends_with("Up") {
            Some(Direction::Up)
        } else {
            None
        }
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        AgentEndpoint {
            ip: self.host_rescaler_ip.clone(),
            port: self.host_rescaler_port,
        }
    }

    /// Age in seconds at `now` (unix seconds)
    pub fn age(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

/// Per-service bookkeeping document: heartbeat and hot-reloadable config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert("type".to_string(), Value::from("service"));
        Self {
            id: None,
            rev: None,
            name: name.into(),
            config: Map::new(),
            heartbeat: None,
            extra,
        }
    }
}

/// Scaling rule, evaluated by the rule engine and passed through here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
    #[serde(default)]
    pub active: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Upper/lower usage limits for one resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitRecord {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub upper: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub lower: Option<i64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient::opt_int"
    )]
    pub boundary: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Limits document of a structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub name: String,
    #[serde(default)]
    pub resources: BTreeMap<ResourceKind, LimitRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Deserializers accepting integers, floats and numeric strings
pub(crate) mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub(crate) fn to_i64(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        to_i64(&value).ok_or_else(|| D::Error::custom(format!("expected a number, found {value}")))
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => to_i64(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected a number, found {value}"))),
        }
    }

    /// Owner to share map of a core, shares written as floats included
    pub fn shares<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, i64>, D::Error> {
        BTreeMap::<String, Value>::deserialize(deserializer)?
            .into_iter()
            .map(|(owner, value)| match to_i64(&value) {
                Some(shares) => Ok((owner, shares)),
                None => Err(D::Error::custom(format!(
                    "expected shares for {owner}, found {value}"
                ))),
            })
            .collect()
    }

    pub fn port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let value = int(deserializer)?;
        u16::try_from(value).map_err(|_| D::Error::custom(format!("invalid port {value}")))
    }

    pub fn opt_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
        match opt_int(deserializer)? {
            None => Ok(None),
            Some(value) => u16::try_from(value)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("invalid port {value}"))),
        }
    }
}
