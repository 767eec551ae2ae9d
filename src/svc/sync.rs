/*!
 * Synchronization Syscalls
 * Events, handle waits, mutexes, condition variables and address arbitration
 */

use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::MAX_WAIT_OBJECTS;
use crate::core::types::{Handle, KernelResult, VAddr};
use crate::kernel::address_arbiter::{self, ArbitrationType, SignalType};
use crate::kernel::{condition_variable, synchronization, KEvent, KernelObject, ThreadContext};
use log::debug;
use std::sync::Arc;

/// Returns (writable, readable) handles to a new event
pub fn create_event(ctx: &ThreadContext) -> KernelResult<(Handle, Handle)> {
    let process = ctx.process();
    let event = Arc::new(KEvent::new(process.pid(), Arc::clone(process.resource_limit()))?);
    let writable = process.add_handle(KernelObject::WritableEvent(Arc::clone(&event)))?;
    match process.add_handle(KernelObject::ReadableEvent(event)) {
        Ok(readable) => Ok((writable, readable)),
        Err(err) => {
            process.close_handle(writable)?;
            Err(err)
        }
    }
}

fn event(ctx: &ThreadContext, handle: Handle) -> KernelResult<KernelObject> {
    ctx.process().get_object(handle, ctx.thread())
}

/// Only the writable side may signal
pub fn signal_event(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let object = event(ctx, handle)?;
    let event = object.as_writable_event().ok_or(KernelError::InvalidHandle(handle))?;
    event.signal(ctx.kernel().scheduler());
    Ok(())
}

/// Either side may clear
pub fn clear_event(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let object = event(ctx, handle)?;
    let event = object.as_event().ok_or(KernelError::InvalidHandle(handle))?;
    event.clear(ctx.kernel().scheduler());
    Ok(())
}

/// Clear a signaled event; InvalidState when it was not signaled
pub fn reset_signal(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let object = event(ctx, handle)?;
    let event = object.as_event().ok_or(KernelError::InvalidHandle(handle))?;
    event.reset(ctx.kernel().scheduler())
}

pub fn close_handle(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    ctx.process().close_handle(handle)
}

/// Wait for any of `handles`; returns the index of a signaled one
pub fn wait_synchronization(ctx: &ThreadContext, handles: &[Handle], timeout_ns: i64) -> KernelResult<usize> {
    if handles.len() > MAX_WAIT_OBJECTS {
        return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
    }
    let process = ctx.process();
    let objects = handles
        .iter()
        .map(|&handle| {
            let object = process.get_object(handle, ctx.thread())?;
            if object.sync_object().is_none() {
                return Err(KernelError::InvalidHandle(handle));
            }
            Ok(object)
        })
        .collect::<KernelResult<Vec<_>>>()?;
    synchronization::wait_synchronization(ctx.kernel().scheduler(), ctx.thread(), objects, timeout_ns)
}

/// Read the handle array for WaitSynchronization from guest memory
pub fn read_handles(ctx: &ThreadContext, address: VAddr, count: usize) -> KernelResult<Vec<Handle>> {
    if count > MAX_WAIT_OBJECTS {
        return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
    }
    let bytes = ctx
        .read_memory(address, count * 4)
        .map_err(|_| KernelError::InvalidPointer(address))?;
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub fn cancel_synchronization(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    debug!("Cancelling synchronization of thread {}", thread.tid());
    ctx.kernel()
        .scheduler()
        .cancel_synchronization(thread.tid())
        .map_err(|_| KernelError::InvalidHandle(handle))
}

pub fn arbitrate_lock(ctx: &ThreadContext, owner: Handle, address: VAddr, tag: Handle) -> KernelResult<()> {
    condition_variable::arbitrate_lock(ctx.kernel().scheduler(), ctx.process(), ctx.thread(), owner, address, tag)
}

pub fn arbitrate_unlock(ctx: &ThreadContext, address: VAddr) -> KernelResult<()> {
    condition_variable::arbitrate_unlock(ctx.kernel().scheduler(), ctx.process(), ctx.thread(), address)
}

pub fn wait_process_wide_key_atomic(
    ctx: &ThreadContext,
    address: VAddr,
    key: VAddr,
    tag: Handle,
    timeout_ns: i64,
) -> KernelResult<()> {
    condition_variable::wait_process_wide_key_atomic(
        ctx.kernel().scheduler(),
        ctx.process(),
        ctx.thread(),
        address,
        key,
        tag,
        timeout_ns,
    )
}

pub fn signal_process_wide_key(ctx: &ThreadContext, key: VAddr, count: i32) -> KernelResult<()> {
    condition_variable::signal_process_wide_key(ctx.kernel().scheduler(), ctx.process(), key, count);
    Ok(())
}

pub fn wait_for_address(
    ctx: &ThreadContext,
    address: VAddr,
    arbitration: u32,
    value: i32,
    timeout_ns: i64,
) -> KernelResult<()> {
    let arbitration =
        ArbitrationType::from_raw(arbitration).ok_or(KernelError::InvalidEnumValue(arbitration as u64))?;
    address_arbiter::wait_for_address(
        ctx.kernel().scheduler(),
        ctx.process(),
        ctx.thread(),
        address,
        arbitration,
        value,
        timeout_ns,
    )
}

pub fn signal_to_address(ctx: &ThreadContext, address: VAddr, signal: u32, value: i32, count: i32) -> KernelResult<()> {
    let signal = SignalType::from_raw(signal).ok_or(KernelError::InvalidEnumValue(signal as u64))?;
    address_arbiter::signal_to_address(ctx.kernel().scheduler(), ctx.process(), address, signal, value, count)
}
