//! Per-cycle host resource cache
//!
//! Host documents are loaded on first reference within a cycle, mutated in
//! memory as requests are applied, and flushed back once at the end of the
//! cycle. Only hosts that actually changed are written.

use crate::models::{ResourceKind, Structure};
use crate::store::{update_verified, RetryPolicy, StateStore, StoreResult};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Host documents seen during one control loop cycle
#[derive(Debug, Default)]
pub struct HostCache {
    hosts: BTreeMap<String, Structure>,
    dirty: BTreeSet<String>,
}

impl HostCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached host, reading it from the store on first use
    pub async fn load(&mut self, store: &dyn StateStore, host: &str) -> StoreResult<&Structure> {
        match self.hosts.entry(host.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let structure = store.get_structure(host).await?;
                debug!(host = %host, "Cached host resources");
                Ok(entry.insert(structure))
            }
        }
    }

    pub fn get(&self, host: &str) -> Option<&Structure> {
        self.hosts.get(host)
    }

    /// Replace a host entry with a modified copy and mark it for persistence
    pub fn commit(&mut self, host: Structure) {
        self.dirty.insert(host.name.clone());
        self.hosts.insert(host.name.clone(), host);
    }

    /// Free capacity of `kind` on a cached host
    pub fn free(&self, host: &str, kind: ResourceKind) -> Option<i64> {
        self.hosts.get(host)?.resources.get(&kind)?.free
    }

    pub fn is_dirty(&self, host: &str) -> bool {
        self.dirty.contains(host)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Write every modified host back to the store
    ///
    /// Each host is re-read, our resources are copied onto the fresh
    /// document, and the write is verified. Returns the number of hosts
    /// written; the first host that cannot be persisted aborts the pass.
    pub async fn persist(&mut self, store: &dyn StateStore, policy: &RetryPolicy) -> StoreResult<usize> {
        let mut written = 0;
        for name in std::mem::take(&mut self.dirty) {
            let Some(host) = self.hosts.get(&name) else {
                continue;
            };
            let resources = &host.resources;
            let name = name.as_str();

            update_verified(
                policy,
                name,
                move || async move { store.get_structure(name).await },
                move |mut fresh: Structure| async move {
                    fresh.resources = resources.clone();
                    store.update_structure(&fresh).await
                },
                |stored: &Structure| stored.resources == *resources,
            )
            .await?;

            debug!(host = %name, "Persisted host resources");
            written += 1;
        }
        Ok(written)
    }
}
