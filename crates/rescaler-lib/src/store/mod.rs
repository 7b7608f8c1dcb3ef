//! State store access
//!
//! This module provides:
//! - The `StateStore` trait with optimistic update semantics
//! - A CouchDB implementation over HTTP
//! - An in-memory implementation with the same revision rules
//! - A bounded read-verify-write retry helper

mod couchdb;
mod memory;
pub mod retry;

pub use couchdb::CouchDbStore;
pub use memory::MemoryStore;
pub use retry::{update_verified, RetryPolicy};

use crate::models::{Limits, Request, Rule, Service, Structure, Subtype};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Result type alias for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("write conflict on {0}")]
    Conflict(String),

    #[error("state store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("state store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed document: {0}")]
    Decode(String),

    #[error("invalid state store url: {0}")]
    Url(String),

    #[error("gave up updating {what} after {attempts} attempts")]
    RetriesExhausted { what: String, attempts: u32 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, StoreError::Decode(_))
    }
}

/// A document persisted in one of the store's databases
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Database holding documents of this type
    const DATABASE: &'static str;
    /// Human readable kind used in errors
    const KIND: &'static str;

    fn id(&self) -> Option<&str>;
    fn rev(&self) -> Option<&str>;
    /// Name the document is looked up by
    fn key(&self) -> &str;
    /// Whether the document id is its name, or generated by the store
    fn named() -> bool {
        true
    }
}

macro_rules! named_document {
    ($ty:ty, $db:literal, $kind:literal) => {
        impl Document for $ty {
            const DATABASE: &'static str = $db;
            const KIND: &'static str = $kind;

            fn id(&self) -> Option<&str> {
                self.id.as_deref()
            }

            fn rev(&self) -> Option<&str> {
                self.rev.as_deref()
            }

            fn key(&self) -> &str {
                &self.name
            }
        }
    };
}

named_document!(Structure, "structures", "structure");
named_document!(Service, "services", "service");
named_document!(Rule, "rules", "rule");
named_document!(Limits, "limits", "limits");

impl Document for Request {
    const DATABASE: &'static str = "requests";
    const KIND: &'static str = "request";

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    fn key(&self) -> &str {
        &self.structure
    }

    fn named() -> bool {
        false
    }
}

/// Typed access to the state store
///
/// Updates are optimistic: a write carrying a stale revision fails with
/// `StoreError::Conflict`, and callers must re-read to confirm a write landed.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_structure(&self, name: &str) -> StoreResult<Structure>;

    /// All structures, optionally restricted to one subtype
    async fn get_structures(&self, subtype: Option<Subtype>) -> StoreResult<Vec<Structure>>;

    async fn update_structure(&self, structure: &Structure) -> StoreResult<()>;

    async fn get_requests(&self) -> StoreResult<Vec<Request>>;

    async fn add_request(&self, request: &Request) -> StoreResult<()>;

    async fn delete_request(&self, request: &Request) -> StoreResult<()>;

    async fn get_service(&self, name: &str) -> StoreResult<Service>;

    async fn update_service(&self, service: &Service) -> StoreResult<()>;

    async fn get_rules(&self) -> StoreResult<Vec<Rule>>;

    async fn get_rule(&self, name: &str) -> StoreResult<Rule>;

    async fn update_rule(&self, rule: &Rule) -> StoreResult<()>;

    async fn get_limits(&self, structure: &str) -> StoreResult<Limits>;

    async fn update_limits(&self, limits: &Limits) -> StoreResult<()>;
}

/// Write a heartbeat into a service document and return the refreshed document
pub async fn beat(
    store: &dyn StateStore,
    service_name: &str,
    policy: &RetryPolicy,
) -> StoreResult<Service> {
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    update_verified(
        policy,
        service_name,
        move || async move { store.get_service(service_name).await },
        move |mut service: Service| async move {
            service.heartbeat = Some(now);
            store.update_service(&service).await
        },
        |service: &Service| service.heartbeat.is_some_and(|beat| beat >= now),
    )
    .await
}
