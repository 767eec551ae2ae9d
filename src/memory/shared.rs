/*!
 * Shared Memory
 * Physical block mapped into several processes
 */

use super::page_table::KPageTable;
use super::physical::{PhysicalBlock, PhysicalMemory};
use super::types::{validate_range, MemoryError, MemoryPermission, MemoryResult, MemoryState};
use crate::core::types::{Pid, Size, VAddr};
use crate::kernel::resource_limit::KResourceLimit;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared memory object
///
/// The backing block lives as long as the object or any mapping of it.
pub struct KSharedMemory {
    owner_pid: Pid,
    size: Size,
    owner_permission: MemoryPermission,
    remote_permission: MemoryPermission,
    backing: Arc<PhysicalBlock>,
    attached: Mutex<HashMap<Pid, usize>>,
}

impl KSharedMemory {
    pub fn new(
        physical: &Arc<PhysicalMemory>,
        limit: Arc<KResourceLimit>,
        owner_pid: Pid,
        size: Size,
        owner_permission: MemoryPermission,
        remote_permission: MemoryPermission,
    ) -> MemoryResult<Self> {
        validate_range(0, size)?;
        let backing = physical.allocate(size, Some(limit))?;
        info!("Created shared memory of 0x{:x} bytes for PID {}", size, owner_pid);
        Ok(Self {
            owner_pid,
            size,
            owner_permission,
            remote_permission,
            backing,
            attached: Mutex::new(HashMap::new()),
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    /// Permission `pid` is allowed to map with
    pub fn permission_for(&self, pid: Pid) -> MemoryPermission {
        if pid == self.owner_pid {
            self.owner_permission
        } else {
            self.remote_permission
        }
    }

    pub fn map(
        &self,
        page_table: &KPageTable,
        pid: Pid,
        address: VAddr,
        size: Size,
        permission: MemoryPermission,
    ) -> MemoryResult<()> {
        if size != self.size {
            return Err(MemoryError::InvalidSize(size));
        }
        if permission != self.permission_for(pid) {
            return Err(MemoryError::InvalidPermission(permission));
        }
        page_table.map_backing(
            address,
            size,
            permission,
            MemoryState::Shared,
            Arc::clone(&self.backing),
            0,
        )?;
        *self.attached.lock().entry(pid).or_insert(0) += 1;
        debug!("PID {} mapped shared memory at 0x{:x}", pid, address);
        Ok(())
    }

    pub fn unmap(&self, page_table: &KPageTable, pid: Pid, address: VAddr, size: Size) -> MemoryResult<()> {
        if size != self.size {
            return Err(MemoryError::InvalidSize(size));
        }
        match page_table.backing_at(address) {
            Some((backing, 0, MemoryState::Shared)) if Arc::ptr_eq(&backing, &self.backing) => {}
            _ => return Err(MemoryError::InvalidMemoryState { address, size }),
        }
        page_table.unmap(address, size, Some(MemoryState::Shared))?;

        let mut attached = self.attached.lock();
        if let Some(count) = attached.get_mut(&pid) {
            *count -= 1;
            if *count == 0 {
                attached.remove(&pid);
            }
        }
        debug!("PID {} unmapped shared memory at 0x{:x}", pid, address);
        Ok(())
    }

    /// Forget every mapping of `pid` (its page table is being torn down)
    pub fn detach(&self, pid: Pid) {
        if self.attached.lock().remove(&pid).is_some() {
            debug!("PID {} detached from shared memory", pid);
        }
    }

    /// Processes that currently have at least one mapping
    pub fn attached_pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.attached.lock().keys().copied().collect();
        pids.sort_unstable();
        pids
    }
}

impl std::fmt::Debug for KSharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KSharedMemory")
            .field("owner_pid", &self.owner_pid)
            .field("size", &self.size)
            .finish()
    }
}
