//! CPU allocation by core bin-packing
//!
//! A host's cpu record carries a core usage map: for every core, how its 100
//! shares are split between containers and the free pool. Scaling up fills
//! the container's own cores first, then prefers one other core that can
//! absorb the whole remainder, and only then spreads over as many cores as
//! needed. Scaling down releases whole lightly-used cores from the end of the
//! container's core list before trimming a single big one.

use super::{AllocationContext, AllocationError, Allocator};
use crate::agent::LimitUpdate;
use crate::models::{CoreShares, CoreUsageMap, ResourceKind, Structure};

pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn allocate(
        &self,
        ctx: &AllocationContext<'_>,
        current: i64,
        host: &mut Structure,
    ) -> Result<LimitUpdate, AllocationError> {
        let container = ctx.structure.name.as_str();
        let Some(record) = host
            .resources
            .get_mut(&ResourceKind::Cpu)
            .filter(|record| record.free.is_some())
        else {
            return Err(AllocationError::MissingHostResource {
                host: host.name.clone(),
                resource: ResourceKind::Cpu,
            });
        };

        let host_cores = record.max.unwrap_or(0) / CoreShares::TOTAL;
        let map = record.core_usage_mapping.get_or_insert_with(CoreUsageMap::new);
        for core in 0..host_cores {
            map.entry(core.to_string())
                .or_insert_with(CoreShares::fully_free);
        }

        let mut cores = ctx.live.cpu_cores();
        for core in &cores {
            map.entry(core.clone()).or_insert_with(CoreShares::fully_free);
        }
        let order = core_order(map);

        if ctx.amount > 0 {
            scale_up(map, &order, container, &mut cores, ctx.amount)?;
        } else if ctx.amount < 0 {
            scale_down(map, container, &mut cores, -ctx.amount)?;
        }

        if let Some(free) = record.free.as_mut() {
            *free -= ctx.amount;
        }

        Ok(LimitUpdate::Cpu {
            cpu_num: cores.join(","),
            cpu_allowance_limit: current + ctx.amount,
        })
    }
}

/// Core ids in numeric order, non-numeric ids last
fn core_order(map: &CoreUsageMap) -> Vec<String> {
    let mut order: Vec<String> = map.keys().cloned().collect();
    order.sort_by_key(|core| (core.parse::<u64>().map_err(|_| ()), core.clone()));
    order
}

fn scale_up(
    map: &mut CoreUsageMap,
    order: &[String],
    container: &str,
    cores: &mut Vec<String>,
    amount: i64,
) -> Result<(), AllocationError> {
    let mut needed = amount;

    for core in cores.iter() {
        if needed == 0 {
            break;
        }
        if let Some(shares) = map.get_mut(core) {
            let take = shares.free.min(needed);
            if take > 0 {
                shares.grant(container, take);
                needed -= take;
            }
        }
    }

    if needed > 0 {
        let single = order
            .iter()
            .filter(|core| !cores.contains(core))
            .find(|core| map.get(*core).is_some_and(|s| s.free >= needed));
        if let Some(core) = single {
            if let Some(shares) = map.get_mut(core) {
                shares.grant(container, needed);
                needed = 0;
                cores.push(core.clone());
            }
        }
    }

    if needed > 0 {
        for core in order {
            if needed == 0 {
                break;
            }
            if cores.contains(core) {
                continue;
            }
            if let Some(shares) = map.get_mut(core) {
                let take = shares.free.min(needed);
                if take > 0 {
                    shares.grant(container, take);
                    needed -= take;
                    cores.push(core.clone());
                }
            }
        }
    }

    if needed > 0 {
        return Err(AllocationError::CoresExhausted {
            structure: container.to_string(),
            missing: needed,
        });
    }
    Ok(())
}

fn scale_down(
    map: &mut CoreUsageMap,
    container: &str,
    cores: &mut Vec<String>,
    amount: i64,
) -> Result<(), AllocationError> {
    let mut to_free = amount;

    // A container always keeps at least one core
    let mut index = cores.len();
    while index > 0 && to_free > 0 && cores.len() > 1 {
        index -= 1;
        let Some(shares) = map.get_mut(&cores[index]) else {
            continue;
        };
        let held = shares.share_of(container);
        if held <= to_free {
            shares.release(container, held);
            to_free -= held;
            cores.remove(index);
        }
    }

    if to_free > 0 {
        for core in cores.iter().rev() {
            if let Some(shares) = map.get_mut(core) {
                if shares.share_of(container) >= to_free {
                    shares.release(container, to_free);
                    to_free = 0;
                    break;
                }
            }
        }
    }

    if to_free > 0 {
        return Err(AllocationError::CoresNotFreed {
            structure: container.to_string(),
            remaining: to_free,
        });
    }
    Ok(())
}
