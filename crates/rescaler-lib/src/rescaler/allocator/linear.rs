//! Linear allocators for memory, disk and network
//!
//! The new limit is the current one plus the delta. Disk bandwidth is set
//! symmetrically on reads and writes.

use super::{tracked_free, AllocationContext, AllocationError, Allocator};
use crate::agent::LimitUpdate;
use crate::models::Structure;

pub struct MemAllocator;
pub struct DiskAllocator;
pub struct NetAllocator;

fn linear(
    ctx: &AllocationContext<'_>,
    current: i64,
    host: &mut Structure,
) -> Result<i64, AllocationError> {
    if let Some(free) = tracked_free(host, ctx.resource)? {
        *free -= ctx.amount;
    }
    Ok(current + ctx.amount)
}

impl Allocator for MemAllocator {
    fn allocate(
        &self,
        ctx: &AllocationContext<'_>,
        current: i64,
        host: &mut Structure,
    ) -> Result<LimitUpdate, AllocationError> {
        let mem_limit = linear(ctx, current, host)?;
        Ok(LimitUpdate::Mem { mem_limit })
    }
}

impl Allocator for DiskAllocator {
    fn allocate(
        &self,
        ctx: &AllocationContext<'_>,
        current: i64,
        host: &mut Structure,
    ) -> Result<LimitUpdate, AllocationError> {
        let limit = linear(ctx, current, host)?;
        Ok(LimitUpdate::Disk {
            disk_read_limit: limit,
            disk_write_limit: limit,
        })
    }
}

impl Allocator for NetAllocator {
    fn allocate(
        &self,
        ctx: &AllocationContext<'_>,
        current: i64,
        host: &mut Structure,
    ) -> Result<LimitUpdate, AllocationError> {
        let net_limit = linear(ctx, current, host)?;
        Ok(LimitUpdate::Net { net_limit })
    }
}
