/*!
 * Synchronization
 * WaitSynchronization over processes, threads and readable events
 */

use super::object::KernelObject;
use super::scheduler::{KScheduler, WaitKind};
use super::thread::KThread;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::MAX_WAIT_OBJECTS;
use crate::core::types::KernelResult;
use std::time::{Duration, Instant};

/// Guest timeout in nanoseconds: negative waits forever, zero polls
pub fn deadline_from_ns(timeout_ns: i64) -> Option<Instant> {
    if timeout_ns < 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_nanos(timeout_ns as u64))
    }
}

/// Wait until one of `objects` is signaled
///
/// Returns the index of a signaled object, `TimedOut` when the timeout
/// elapses, `Cancelled` after CancelSynchronization and
/// `TerminationRequested` when the process is being torn down.
pub fn wait_synchronization(
    scheduler: &KScheduler,
    thread: &KThread,
    objects: Vec<KernelObject>,
    timeout_ns: i64,
) -> KernelResult<usize> {
    if objects.len() > MAX_WAIT_OBJECTS {
        return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
    }
    if let Some(object) = objects.iter().find(|object| object.sync_object().is_none()) {
        return Err(KernelError::InvalidState(format!("{:?} is not waitable", object.kind())));
    }

    let mut state = scheduler.lock();
    if let Some(record) = state.record_mut(thread.tid()) {
        if std::mem::take(&mut record.sync_cancelled) {
            return Err(KernelError::Cancelled);
        }
    }

    if let Some(index) = objects
        .iter()
        .position(|object| object.sync_object().map_or(false, |sync| sync.is_signaled()))
    {
        return Ok(index);
    }
    if timeout_ns == 0 {
        return Err(KernelError::TimedOut);
    }

    scheduler.block(state, thread, WaitKind::Synchronization { objects }, deadline_from_ns(timeout_ns))
}
