/*!
 * Events
 * Manually cleared signal with a writable and a readable side
 */

use super::object::SyncObject;
use super::resource_limit::{KResourceLimit, LimitableResource};
use super::scheduler::KScheduler;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::{KernelResult, Pid};
use std::sync::Arc;

/// Event object; stays signaled until cleared
pub struct KEvent {
    owner_pid: Pid,
    sync: SyncObject,
    limit: Arc<KResourceLimit>,
}

impl KEvent {
    /// Create an event charged to the owner's Events limit
    pub fn new(owner_pid: Pid, limit: Arc<KResourceLimit>) -> KernelResult<Self> {
        limit.reserve(LimitableResource::Events, 1)?;
        Ok(Self {
            owner_pid,
            sync: SyncObject::new(),
            limit,
        })
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    pub fn sync_object(&self) -> &SyncObject {
        &self.sync
    }

    pub fn is_signaled(&self) -> bool {
        self.sync.is_signaled()
    }

    /// Signal and wake every waiter
    pub fn signal(&self, scheduler: &KScheduler) {
        scheduler.signal(&self.sync);
    }

    pub fn clear(&self, scheduler: &KScheduler) {
        scheduler.clear(&self.sync);
    }

    /// Clear, failing with InvalidState if the event was not signaled
    pub fn reset(&self, scheduler: &KScheduler) -> KernelResult<()> {
        if scheduler.reset(&self.sync) {
            Ok(())
        } else {
            Err(KernelError::Result(ResultCode::INVALID_STATE))
        }
    }
}

impl Drop for KEvent {
    fn drop(&mut self) {
        self.limit.release(LimitableResource::Events, 1);
    }
}
