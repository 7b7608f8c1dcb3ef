//! Resource allocators
//!
//! An allocator turns a signed share delta for one container into the new
//! limits to push to its host agent, updating the host's capacity accounting
//! as it goes. Allocators always work on a staged copy of the host entry so
//! a rejected update never reaches the cache.

mod cpu;
mod linear;

pub use cpu::CpuAllocator;
pub use linear::{DiskAllocator, MemAllocator, NetAllocator};

use crate::agent::{Limit, LimitUpdate, LiveResources};
use crate::models::{Bounds, ResourceKind, Structure};
use thiserror::Error;

/// Reasons a request cannot be honoured
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("{resource} of {structure} would drop to {value}, below zero")]
    Negative {
        structure: String,
        resource: ResourceKind,
        value: i64,
    },

    #[error("{resource} of {structure} would drop to {value}, below min {min}")]
    BelowMin {
        structure: String,
        resource: ResourceKind,
        value: i64,
        min: i64,
    },

    #[error("{resource} of {structure} would rise to {value}, above max {max}")]
    AboveMax {
        structure: String,
        resource: ResourceKind,
        value: i64,
        max: i64,
    },

    #[error("host {host} has {free} free {resource}, {needed} needed")]
    InsufficientHostCapacity {
        host: String,
        resource: ResourceKind,
        free: i64,
        needed: i64,
    },

    #[error("host agent reported no {resource} limit for {structure}")]
    MissingLiveLimit {
        structure: String,
        resource: ResourceKind,
    },

    #[error("host {host} has no {resource} capacity record")]
    MissingHostResource { host: String, resource: ResourceKind },

    #[error("could not find {missing} cpu shares for {structure} on its host cores")]
    CoresExhausted { structure: String, missing: i64 },

    #[error("could not free {remaining} cpu shares from the cores of {structure}")]
    CoresNotFreed { structure: String, remaining: i64 },

    #[error("{0} cannot be rescaled")]
    Unsupported(ResourceKind),
}

/// Everything an allocator needs to know about one request
#[derive(Debug, Clone, Copy)]
pub struct AllocationContext<'a> {
    /// The container being rescaled
    pub structure: &'a Structure,
    pub resource: ResourceKind,
    /// Declared bounds of the container for this resource
    pub bounds: Bounds,
    /// Limits currently enforced on the container
    pub live: &'a LiveResources,
    /// Signed share delta
    pub amount: i64,
}

/// Allocation strategy for one resource kind
pub trait Allocator {
    /// Compute the new limits starting from `current`, updating `host`
    fn allocate(
        &self,
        ctx: &AllocationContext<'_>,
        current: i64,
        host: &mut Structure,
    ) -> Result<LimitUpdate, AllocationError>;
}

impl ResourceKind {
    /// The allocator in charge of this resource, if it is scalable
    pub fn allocator(&self) -> Option<&'static dyn Allocator> {
        match self {
            ResourceKind::Cpu => Some(&CpuAllocator),
            ResourceKind::Mem => Some(&MemAllocator),
            ResourceKind::Disk => Some(&DiskAllocator),
            ResourceKind::Net => Some(&NetAllocator),
            ResourceKind::Energy => None,
        }
    }
}

/// The limit a rescale starts from
///
/// An unlimited container starts from the midpoint of its declared bounds.
pub fn current_limit(ctx: &AllocationContext<'_>) -> Result<i64, AllocationError> {
    match ctx.live.limit(ctx.resource) {
        Some(Limit::Value(value)) => Ok(value),
        Some(Limit::Unlimited) => Ok(ctx.bounds.midpoint()),
        None => Err(AllocationError::MissingLiveLimit {
            structure: ctx.structure.name.clone(),
            resource: ctx.resource,
        }),
    }
}

/// Checks shared by every resource: bounds and host capacity
pub fn precheck(
    ctx: &AllocationContext<'_>,
    current: i64,
    host: &Structure,
) -> Result<(), AllocationError> {
    let structure = || ctx.structure.name.clone();
    let value = current + ctx.amount;

    if value < 0 {
        return Err(AllocationError::Negative {
            structure: structure(),
            resource: ctx.resource,
            value,
        });
    }
    if value < ctx.bounds.min {
        return Err(AllocationError::BelowMin {
            structure: structure(),
            resource: ctx.resource,
            value,
            min: ctx.bounds.min,
        });
    }
    if value > ctx.bounds.max {
        return Err(AllocationError::AboveMax {
            structure: structure(),
            resource: ctx.resource,
            value,
            max: ctx.bounds.max,
        });
    }

    if ctx.amount > 0 {
        let record = host.resources.get(&ctx.resource);
        let free = match record.and_then(|r| r.free) {
            Some(free) => free,
            None if ctx.resource.requires_host_capacity() => {
                return Err(AllocationError::MissingHostResource {
                    host: host.name.clone(),
                    resource: ctx.resource,
                })
            }
            None => return Ok(()),
        };
        if free < ctx.amount {
            return Err(AllocationError::InsufficientHostCapacity {
                host: host.name.clone(),
                resource: ctx.resource,
                free,
                needed: ctx.amount,
            });
        }
    }
    Ok(())
}

/// Run the pre-checks and the resource's allocator against `host`
///
/// `host` must be a staged copy: on error it may be partially modified.
pub fn apply(ctx: &AllocationContext<'_>, host: &mut Structure) -> Result<LimitUpdate, AllocationError> {
    let allocator = ctx
        .resource
        .allocator()
        .ok_or(AllocationError::Unsupported(ctx.resource))?;
    let current = current_limit(ctx)?;
    precheck(ctx, current, host)?;
    allocator.allocate(ctx, current, host)
}

/// Free capacity counter of `host` for `resource`
///
/// `None` means the host does not track that resource.
fn tracked_free<'h>(
    host: &'h mut Structure,
    resource: ResourceKind,
) -> Result<Option<&'h mut i64>, AllocationError> {
    let name = host.name.clone();
    match host.resources.get_mut(&resource).and_then(|r| r.free.as_mut()) {
        Some(free) => Ok(Some(free)),
        None if resource.requires_host_capacity() => Err(AllocationError::MissingHostResource {
            host: name,
            resource,
        }),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::agent::{CpuLimits, MemLimits};
    use crate::models::{CoreShares, ResourceRecord, Subtype};

    pub fn container(name: &str, kind: ResourceKind, min: i64, max: i64) -> Structure {
        let mut container = Structure::new(name, Subtype::Container);
        container.resources.insert(
            kind,
            ResourceRecord {
                min: Some(min),
                max: Some(max),
                ..Default::default()
            },
        );
        container
    }

    /// Host with `cores` cores and the given core map entries
    pub fn cpu_host(cores: i64, mapping: &[(&str, CoreShares)]) -> Structure {
        let mut host = Structure::new("host0", Subtype::Host);
        let map = mapping
            .iter()
            .map(|(core, shares)| (core.to_string(), shares.clone()))
            .collect();
        let used: i64 = mapping
            .iter()
            .map(|(_, shares)| CoreShares::TOTAL - shares.free)
            .sum();
        host.resources.insert(
            ResourceKind::Cpu,
            ResourceRecord {
                max: Some(cores * CoreShares::TOTAL),
                free: Some(cores * CoreShares::TOTAL - used),
                core_usage_mapping: Some(map),
                ..Default::default()
            },
        );
        host
    }

    pub fn shares(free: i64, owners: &[(&str, i64)]) -> CoreShares {
        CoreShares {
            free,
            owners: owners.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
        }
    }

    pub fn live_cpu(limit: i64, cores: &str) -> LiveResources {
        LiveResources {
            cpu: Some(CpuLimits {
                cpu_allowance_limit: Some(if limit < 0 { Limit::Unlimited } else { Limit::Value(limit) }),
                cpu_num: cores.to_string(),
                effective_cpu_limit: None,
            }),
            ..Default::default()
        }
    }

    pub fn live_mem(limit: i64) -> LiveResources {
        LiveResources {
            mem: Some(MemLimits {
                mem_limit: Some(if limit < 0 { Limit::Unlimited } else { Limit::Value(limit) }),
            }),
            ..Default::default()
        }
    }
}
