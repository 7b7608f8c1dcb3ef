//! Container rescale executor
//!
//! Applies one request to one container: reads the limits its host agent
//! currently enforces, runs the allocator on a staged copy of the host entry,
//! and pushes the result. The staged copy only replaces the cached host once
//! the agent has accepted the new limits.

use super::allocator::{self, AllocationContext};
use super::{HostCache, RescaleError};
use crate::agent::{HostAgent, LimitUpdate};
use crate::models::{ResourceKind, Request, Structure};
use crate::store::StateStore;

/// Outcome of a successful container rescale
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRescale {
    pub structure: String,
    pub host: String,
    pub resource: ResourceKind,
    pub amount: i64,
    pub update: LimitUpdate,
}

/// Applies requests targeting single containers
pub struct ContainerRescaler<'a> {
    store: &'a dyn StateStore,
    agent: &'a dyn HostAgent,
    debug: bool,
}

impl<'a> ContainerRescaler<'a> {
    pub fn new(store: &'a dyn StateStore, agent: &'a dyn HostAgent, debug: bool) -> Self {
        Self {
            store,
            agent,
            debug,
        }
    }

    /// Apply `request` to `container`, committing host changes to `cache`
    pub async fn rescale(
        &self,
        request: &Request,
        container: &Structure,
        cache: &mut HostCache,
    ) -> Result<AppliedRescale, RescaleError> {
        let bounds = container.bounds(request.resource)?;
        let mut staged = cache.load(self.store, &request.host).await?.clone();

        let endpoint = request.endpoint();
        let live = self
            .agent
            .container_resources(&endpoint, &container.name)
            .await
            .map_err(|source| RescaleError::Agent {
                structure: container.name.clone(),
                source,
            })?;

        let ctx = AllocationContext {
            structure: container,
            resource: request.resource,
            bounds,
            live: &live,
            amount: request.amount,
        };
        let update = allocator::apply(&ctx, &mut staged)?;

        verbose!(
            self.debug,
            structure = %container.name,
            action = %request.action,
            update = ?update,
            "Pushing new limits"
        );

        self.agent
            .set_container_resources(&endpoint, &container.name, &update)
            .await
            .map_err(|source| RescaleError::Agent {
                structure: container.name.clone(),
                source,
            })?;

        cache.commit(staged);

        Ok(AppliedRescale {
            structure: container.name.clone(),
            host: request.host.clone(),
            resource: request.resource,
            amount: request.amount,
            update,
        })
    }
}
