/*!
 * Memory Syscalls
 * Heap, permissions, queries and shared memory
 */

use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::{Handle, KernelResult, Size, VAddr};
use crate::kernel::{KernelObject, ThreadContext};
use crate::memory::{KSharedMemory, MemoryInfo, MemoryPermission};
use log::debug;
use std::sync::Arc;

fn permission(raw: u32) -> KernelResult<MemoryPermission> {
    MemoryPermission::from_raw(raw).ok_or(KernelError::Result(ResultCode::INVALID_NEW_MEMORY_PERMISSION))
}

/// Grow or shrink the heap; returns the heap base
pub fn set_heap_size(ctx: &ThreadContext, size: Size) -> KernelResult<VAddr> {
    let address = ctx.process().page_table().set_heap_size(size)?;
    debug!("Process {} heap size now 0x{:x}", ctx.process().pid(), size);
    Ok(address)
}

pub fn set_memory_permission(ctx: &ThreadContext, address: VAddr, size: Size, raw_permission: u32) -> KernelResult<()> {
    let permission = permission(raw_permission)?;
    Ok(ctx
        .process()
        .page_table()
        .set_memory_permission(address, size, permission)?)
}

pub fn query_memory(ctx: &ThreadContext, address: VAddr) -> KernelResult<MemoryInfo> {
    Ok(ctx.process().page_table().query(address))
}

/// QueryMemory as the guest calls it: the record is written to `info_address`
pub fn query_memory_into(ctx: &ThreadContext, info_address: VAddr, address: VAddr) -> KernelResult<()> {
    let info = query_memory(ctx, address)?;
    ctx.write_memory(info_address, &info.to_bytes())
        .map_err(|_| KernelError::InvalidPointer(info_address))
}

pub fn create_shared_memory(
    ctx: &ThreadContext,
    size: Size,
    owner_permission: u32,
    remote_permission: u32,
) -> KernelResult<Handle> {
    let owner_permission = permission(owner_permission)?;
    let remote_permission = permission(remote_permission)?;
    for perm in [owner_permission, remote_permission] {
        if perm != MemoryPermission::READ && perm != MemoryPermission::READ_WRITE {
            return Err(KernelError::Result(ResultCode::INVALID_NEW_MEMORY_PERMISSION));
        }
    }
    let process = ctx.process();
    let shared = KSharedMemory::new(
        ctx.kernel().physical_memory(),
        Arc::clone(process.resource_limit()),
        process.pid(),
        size,
        owner_permission,
        remote_permission,
    )?;
    process.add_handle(KernelObject::SharedMemory(Arc::new(shared)))
}

fn shared_memory(ctx: &ThreadContext, handle: Handle) -> KernelResult<Arc<KSharedMemory>> {
    ctx.process()
        .handle_object(handle)?
        .as_shared_memory()
        .cloned()
        .ok_or(KernelError::InvalidHandle(handle))
}

pub fn map_shared_memory(
    ctx: &ThreadContext,
    handle: Handle,
    address: VAddr,
    size: Size,
    raw_permission: u32,
) -> KernelResult<()> {
    let permission = permission(raw_permission)?;
    let shared = shared_memory(ctx, handle)?;
    let process = ctx.process();
    process.map_shared_memory(&shared, address, size, permission)
}

pub fn unmap_shared_memory(ctx: &ThreadContext, handle: Handle, address: VAddr, size: Size) -> KernelResult<()> {
    let shared = shared_memory(ctx, handle)?;
    let process = ctx.process();
    process.unmap_shared_memory(&shared, address, size)
}
