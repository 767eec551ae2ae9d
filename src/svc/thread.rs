/*!
 * Thread Syscalls
 * Creation, scheduling parameters and lifetime of guest threads
 */

use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::LOWEST_PRIORITY;
use crate::core::types::{CoreMask, Handle, KernelResult, Priority, VAddr};
use crate::kernel::{KernelObject, ThreadContext, ThreadParams, IDEAL_CORE_USE_PROCESS_VALUE};
use log::{debug, info};
use std::time::Duration;

/// SetThreadCoreMask core id meaning "keep the current ideal core"
pub const IDEAL_CORE_DONT_CARE: i32 = -3;

/// SleepThread: 0, -1 and -2 yield; positive values sleep
pub fn sleep_thread(ctx: &ThreadContext, ns: i64) -> KernelResult<()> {
    let scheduler = ctx.kernel().scheduler();
    if ns <= 0 {
        return scheduler.yield_thread(ctx.thread());
    }
    scheduler.sleep(ctx.thread(), Duration::from_nanos(ns as u64))
}

pub fn create_thread(
    ctx: &ThreadContext,
    entry: VAddr,
    argument: u64,
    stack_top: VAddr,
    priority: u32,
    core_id: i32,
) -> KernelResult<Handle> {
    let kernel = ctx.kernel();
    let process = ctx.process();
    let params = ThreadParams {
        entry,
        argument,
        stack_top,
    };
    let thread = kernel.create_thread(process, params, priority, core_id)?;
    match process.add_handle(KernelObject::Thread(thread.clone())) {
        Ok(handle) => Ok(handle),
        Err(err) => {
            kernel.finish_thread(process, &thread);
            Err(err)
        }
    }
}

pub fn start_thread(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    if thread.pid() != ctx.process().pid() {
        return Err(KernelError::InvalidHandle(handle));
    }
    ctx.kernel().start_thread(&thread)
}

/// ExitThread never returns to the caller: the result is always `TerminationRequested`
pub fn exit_thread(ctx: &ThreadContext) -> KernelResult<()> {
    debug!("Thread {} exiting", ctx.thread().tid());
    ctx.kernel().exit_thread(ctx.thread().tid());
    Err(KernelError::TerminationRequested)
}

/// ExitProcess: terminate every thread of the calling process
pub fn exit_process(ctx: &ThreadContext) -> KernelResult<()> {
    info!("Process {} exiting", ctx.process().pid());
    ctx.kernel().terminate_process(ctx.process().pid())?;
    Err(KernelError::TerminationRequested)
}

pub fn get_thread_priority(ctx: &ThreadContext, handle: Handle) -> KernelResult<u32> {
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    ctx.kernel()
        .scheduler()
        .priority(thread.tid())
        .map(u32::from)
        .ok_or(KernelError::InvalidHandle(handle))
}

pub fn set_thread_priority(ctx: &ThreadContext, handle: Handle, priority: u32) -> KernelResult<()> {
    if priority > LOWEST_PRIORITY as u32 {
        return Err(KernelError::InvalidPriority(priority));
    }
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    ctx.kernel()
        .scheduler()
        .set_priority(thread.tid(), priority as Priority)
        .map_err(|_| KernelError::InvalidHandle(handle))
}

/// Returns (ideal core, affinity mask)
pub fn get_thread_core_mask(ctx: &ThreadContext, handle: Handle) -> KernelResult<(i32, CoreMask)> {
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    let (ideal_core, affinity) = ctx
        .kernel()
        .scheduler()
        .core_mask(thread.tid())
        .ok_or(KernelError::InvalidHandle(handle))?;
    Ok((ideal_core as i32, affinity))
}

pub fn set_thread_core_mask(ctx: &ThreadContext, handle: Handle, core_id: i32, mask: CoreMask) -> KernelResult<()> {
    let process = ctx.process();
    let thread = process.get_thread(handle, ctx.thread())?;
    let scheduler = ctx.kernel().scheduler();

    let (ideal_core, mask) = match core_id {
        IDEAL_CORE_USE_PROCESS_VALUE => (process.ideal_core(), 1 << process.ideal_core()),
        IDEAL_CORE_DONT_CARE => {
            let (current, _) = scheduler
                .core_mask(thread.tid())
                .ok_or(KernelError::InvalidHandle(handle))?;
            (current, mask)
        }
        _ => (
            usize::try_from(core_id).map_err(|_| KernelError::InvalidCoreId(core_id))?,
            mask,
        ),
    };
    if ideal_core >= ctx.kernel().config().core_count {
        return Err(KernelError::InvalidCoreId(core_id));
    }
    if mask == 0 || mask & !process.core_mask() != 0 {
        return Err(KernelError::InvalidCoreId(core_id));
    }
    if mask & (1 << ideal_core) == 0 {
        return Err(KernelError::InvalidCombination(format!(
            "ideal core {} not in mask {:#x}",
            ideal_core, mask
        )));
    }
    scheduler.set_core_mask(thread.tid(), ideal_core, mask)
}

pub fn get_current_processor_number(ctx: &ThreadContext) -> KernelResult<u32> {
    Ok(ctx
        .kernel()
        .scheduler()
        .current_core(ctx.thread().tid())
        .unwrap_or(0) as u32)
}

pub fn get_thread_id(ctx: &ThreadContext, handle: Handle) -> KernelResult<u64> {
    Ok(ctx.process().get_thread(handle, ctx.thread())?.tid())
}

/// Process id of a process handle, or of the process owning a thread handle
pub fn get_process_id(ctx: &ThreadContext, handle: Handle) -> KernelResult<u64> {
    match ctx.process().get_object(handle, ctx.thread())? {
        KernelObject::Process(process) => Ok(process.pid()),
        KernelObject::Thread(thread) => Ok(thread.pid()),
        _ => Err(KernelError::InvalidHandle(handle)),
    }
}

/// SetThreadActivity: 0 runnable, 1 paused
pub fn set_thread_activity(ctx: &ThreadContext, handle: Handle, activity: u32) -> KernelResult<()> {
    let paused = match activity {
        0 => false,
        1 => true,
        other => return Err(KernelError::InvalidEnumValue(other as u64)),
    };
    let thread = ctx.process().get_thread(handle, ctx.thread())?;
    if thread.tid() == ctx.thread().tid() {
        return Err(KernelError::Result(ResultCode::INVALID_STATE));
    }
    ctx.kernel().scheduler().set_activity(thread.tid(), paused)
}
