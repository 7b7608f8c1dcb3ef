//! Resource rescaling engine
//!
//! This module provides:
//! - The per-cycle host resource cache and its persistence
//! - Per-resource allocators, including CPU core bin-packing
//! - The container rescale executor
//! - The application rescale planner
//! - The pending request queue
//! - The control loop tying them together

pub mod allocator;
mod application;
mod cache;
mod container;
mod queue;
mod r#loop;

#[cfg(test)]
pub(crate) mod tests;

pub use allocator::{AllocationContext, AllocationError, Allocator};
pub use application::{ApplicationPlanner, Candidate, Plan, SPLIT_SHARES};
pub use cache::HostCache;
pub use container::{AppliedRescale, ContainerRescaler};
pub use queue::{split_by_direction, QueueReport, RequestQueue};
pub use r#loop::{CycleReport, Scaler, ScalerBuilder, ScalerConfig};

use crate::agent::AgentError;
use crate::models::ValidationError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors raised while applying a single request
#[derive(Debug, Error)]
pub enum RescaleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("host agent call for {structure} failed: {source}")]
    Agent {
        structure: String,
        #[source]
        source: AgentError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RescaleError {
    /// Whether the error must abort the whole cycle rather than one request
    ///
    /// Missing or malformed documents only fail the request that referenced
    /// them. Any other store failure means the store itself is unhealthy.
    pub fn is_fatal(&self) -> bool {
        match self {
            RescaleError::Store(e) => !(e.is_not_found() || e.is_malformed()),
            _ => false,
        }
    }
}
