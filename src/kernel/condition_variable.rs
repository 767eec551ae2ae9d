/*!
 * Guest Mutexes and Condition Variables
 * ArbitrateLock/Unlock and process-wide key waits over guest memory words
 *
 * A mutex word holds the owner's thread handle, with HANDLE_WAIT_MASK set
 * while other threads wait for it. There is no priority inheritance.
 */

use super::process::KProcess;
use super::scheduler::{KScheduler, SchedulerState, WaitKind};
use super::thread::KThread;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::HANDLE_WAIT_MASK;
use crate::core::types::{Handle, KernelResult, Pid, VAddr};
use log::{debug, warn};

use super::synchronization::deadline_from_ns;

fn check_alignment(address: VAddr) -> KernelResult<()> {
    if address % 4 != 0 {
        return Err(KernelError::Result(ResultCode::INVALID_ADDRESS));
    }
    Ok(())
}

fn invalid_memory() -> KernelError {
    KernelError::Result(ResultCode::INVALID_CURRENT_MEMORY)
}

/// Wait for the mutex at `address` if it is still owned by `owner_handle`
pub fn arbitrate_lock(
    scheduler: &KScheduler,
    process: &KProcess,
    thread: &KThread,
    owner_handle: Handle,
    address: VAddr,
    tag: Handle,
) -> KernelResult<()> {
    check_alignment(address)?;
    let state = scheduler.lock();

    let value = process.page_table().read_u32(address).map_err(|_| invalid_memory())?;
    if value != (owner_handle | HANDLE_WAIT_MASK) {
        return Ok(());
    }

    let owner = process
        .handle_object(owner_handle)?
        .as_thread()
        .cloned()
        .ok_or(KernelError::InvalidHandle(owner_handle))?;

    debug!("Thread {} waits for mutex 0x{:x} owned by {}", thread.tid(), address, owner.tid());
    scheduler
        .block(
            state,
            thread,
            WaitKind::Mutex {
                address,
                tag,
                owner: owner.tid(),
            },
            None,
        )
        .map(|_| ())
}

/// Hand the mutex at `address` to its highest-priority waiter, or clear it
pub fn arbitrate_unlock(scheduler: &KScheduler, process: &KProcess, thread: &KThread, address: VAddr) -> KernelResult<()> {
    check_alignment(address)?;
    let mut state = scheduler.lock();
    release_mutex(&mut state, process, thread.pid(), address)
}

fn release_mutex(state: &mut SchedulerState, process: &KProcess, pid: Pid, address: VAddr) -> KernelResult<()> {
    let waiters = state.waiters(pid, |kind| matches!(kind, WaitKind::Mutex { address: a, .. } if *a == address));

    let Some(&next) = waiters.first() else {
        return process.page_table().write_u32(address, 0).map_err(|_| invalid_memory());
    };
    let tag = match state.wait_kind(next) {
        Some(WaitKind::Mutex { tag, .. }) => *tag,
        _ => 0,
    };
    let value = if waiters.len() > 1 { tag | HANDLE_WAIT_MASK } else { tag };
    process
        .page_table()
        .write_u32(address, value)
        .map_err(|_| invalid_memory())?;

    for &other in &waiters[1..] {
        if let Some(WaitKind::Mutex { address, tag, .. }) = state.wait_kind(other).cloned() {
            state.set_wait_kind(other, WaitKind::Mutex { address, tag, owner: next });
        }
    }
    debug!("Mutex 0x{:x} handed to thread {}", address, next);
    state.resolve_wait(next, Ok(0));
    Ok(())
}

/// Release the mutex at `address` and wait on the condition variable `key`
pub fn wait_process_wide_key_atomic(
    scheduler: &KScheduler,
    process: &KProcess,
    thread: &KThread,
    address: VAddr,
    key: VAddr,
    tag: Handle,
    timeout_ns: i64,
) -> KernelResult<()> {
    check_alignment(address)?;
    check_alignment(key)?;
    let mut state = scheduler.lock();
    if let Some(err) = state.record(thread.tid()).and_then(|record| {
        record
            .terminate_requested
            .then_some(KernelError::TerminationRequested)
    }) {
        return Err(err);
    }

    process.page_table().write_u32(key, 1).map_err(|_| invalid_memory())?;
    release_mutex(&mut state, process, thread.pid(), address)?;

    if timeout_ns == 0 {
        return Err(KernelError::TimedOut);
    }

    scheduler
        .block(
            state,
            thread,
            WaitKind::ConditionVariable { key, address, tag },
            deadline_from_ns(timeout_ns),
        )
        .map(|_| ())
}

/// Wake up to `count` waiters on `key` (all when `count <= 0`)
///
/// Each woken thread takes its mutex if free, otherwise it is queued behind
/// the current owner.
pub fn signal_process_wide_key(scheduler: &KScheduler, process: &KProcess, key: VAddr, count: i32) {
    let mut state = scheduler.lock();
    let pid = process.pid();
    let waiters = state.waiters(pid, |kind| matches!(kind, WaitKind::ConditionVariable { key: k, .. } if *k == key));
    let take = if count <= 0 { waiters.len() } else { (count as usize).min(waiters.len()) };

    for &tid in &waiters[..take] {
        let Some(WaitKind::ConditionVariable { address, tag, .. }) = state.wait_kind(tid).cloned() else {
            continue;
        };
        let page_table = process.page_table();
        match page_table.read_u32(address) {
            Err(_) => state.resolve_wait(tid, Err(invalid_memory())),
            Ok(0) => match page_table.write_u32(address, tag) {
                Ok(()) => state.resolve_wait(tid, Ok(0)),
                Err(_) => state.resolve_wait(tid, Err(invalid_memory())),
            },
            Ok(value) => {
                if page_table.write_u32(address, value | HANDLE_WAIT_MASK).is_err() {
                    state.resolve_wait(tid, Err(invalid_memory()));
                    continue;
                }
                let owner_handle = value & !HANDLE_WAIT_MASK;
                let owner = process
                    .handle_object(owner_handle)
                    .ok()
                    .and_then(|object| object.as_thread().map(|owner| owner.tid()));
                match owner {
                    Some(owner) => state.set_wait_kind(tid, WaitKind::Mutex { address, tag, owner }),
                    None => state.resolve_wait(tid, Err(KernelError::Result(ResultCode::INVALID_STATE))),
                }
            }
        }
    }

    if waiters.len() <= take {
        if let Err(err) = process.page_table().write_u32(key, 0) {
            warn!("Process {} could not clear condition variable key 0x{:x}: {}", pid, key, err);
        }
    }
}
