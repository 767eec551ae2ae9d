/*!
 * Guest Processes
 * Address space, handle table, resource limit and thread list of one process
 */

use super::handle_table::HandleTable;
use super::object::{KernelObject, SyncObject};
use super::resource_limit::{KResourceLimit, LimitableResource};
use super::scheduler::KScheduler;
use super::thread::KThread;
use crate::core::errors::KernelError;
use crate::core::limits::{
    CURRENT_PROCESS_HANDLE, CURRENT_THREAD_HANDLE, DEFAULT_GUEST_STACK_SIZE, PAGE_SIZE, TLS_SLOT_SIZE,
};
use crate::core::types::{CoreMask, Handle, KernelResult, Pid, Priority, Size, VAddr};
use crate::memory::{KPageTable, KSharedMemory, MemoryPermission, MemoryState};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SLOTS_PER_PAGE: usize = (PAGE_SIZE / TLS_SLOT_SIZE) as usize;

/// Lifecycle of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Created,
    Running,
    /// Termination requested; threads are unwinding
    Exiting,
    Exited,
}

/// Parameters for creating a process from a program image
#[derive(Debug, Clone)]
pub struct ProcessCreateInfo {
    pub name: String,
    pub program_id: u64,
    /// Code loaded at the base of the code region (read/execute)
    pub image: Vec<u8>,
    /// Zeroed read/write data placed after the image
    pub data_size: Size,
    pub main_thread_priority: Priority,
    pub ideal_core: usize,
    pub core_mask: CoreMask,
    pub main_stack_size: Size,
}

impl ProcessCreateInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program_id: 0,
            image: Vec::new(),
            data_size: 0,
            main_thread_priority: 44,
            ideal_core: 0,
            core_mask: 0b1111,
            main_stack_size: DEFAULT_GUEST_STACK_SIZE,
        }
    }

    pub fn with_program_id(mut self, program_id: u64) -> Self {
        self.program_id = program_id;
        self
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = image;
        self
    }

    pub fn with_data_size(mut self, size: Size) -> Self {
        self.data_size = size;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.main_thread_priority = priority;
        self
    }

    pub fn with_ideal_core(mut self, core: usize) -> Self {
        self.ideal_core = core;
        self
    }

    pub fn with_core_mask(mut self, mask: CoreMask) -> Self {
        self.core_mask = mask;
        self
    }

    pub fn with_stack_size(mut self, size: Size) -> Self {
        self.main_stack_size = size;
        self
    }
}

#[derive(Debug, Default)]
struct TlsPages {
    pages: Vec<(VAddr, [bool; SLOTS_PER_PAGE])>,
}

/// Guest process
pub struct KProcess {
    pid: Pid,
    name: String,
    program_id: u64,
    state: Mutex<ProcessState>,
    exited: Condvar,
    handles: Mutex<HandleTable>,
    page_table: KPageTable,
    resource_limit: Arc<KResourceLimit>,
    threads: Mutex<Vec<Arc<KThread>>>,
    sync: SyncObject,
    tls: Mutex<TlsPages>,
    /// One entry per live shared memory mapping
    shared_mappings: Mutex<Vec<Arc<KSharedMemory>>>,
    main_thread_priority: Priority,
    ideal_core: usize,
    core_mask: CoreMask,
    code_address: VAddr,
    created_at: Instant,
}

impl KProcess {
    pub(crate) fn new(
        pid: Pid,
        info: &ProcessCreateInfo,
        page_table: KPageTable,
        resource_limit: Arc<KResourceLimit>,
        handle_capacity: usize,
    ) -> Self {
        let code_address = page_table.layout().code.base;
        Self {
            pid,
            name: info.name.clone(),
            program_id: info.program_id,
            state: Mutex::new(ProcessState::Created),
            exited: Condvar::new(),
            handles: Mutex::new(HandleTable::new(handle_capacity)),
            page_table,
            resource_limit,
            threads: Mutex::new(Vec::new()),
            sync: SyncObject::new(),
            tls: Mutex::new(TlsPages::default()),
            shared_mappings: Mutex::new(Vec::new()),
            main_thread_priority: info.main_thread_priority,
            ideal_core: info.ideal_core,
            core_mask: info.core_mask,
            code_address,
            created_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program_id(&self) -> u64 {
        self.program_id
    }

    pub fn page_table(&self) -> &KPageTable {
        &self.page_table
    }

    pub fn resource_limit(&self) -> &Arc<KResourceLimit> {
        &self.resource_limit
    }

    pub fn sync_object(&self) -> &SyncObject {
        &self.sync
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn main_thread_priority(&self) -> Priority {
        self.main_thread_priority
    }

    pub fn ideal_core(&self) -> usize {
        self.ideal_core
    }

    pub fn core_mask(&self) -> CoreMask {
        self.core_mask
    }

    /// Entry point of the main thread (base of the code region)
    pub fn code_address(&self) -> VAddr {
        self.code_address
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Map the program image and its data segment
    pub(crate) fn load_image(&self, info: &ProcessCreateInfo) -> KernelResult<()> {
        let code_size = crate::memory::page_table::page_align_up(info.image.len().max(1) as u64);
        self.page_table
            .map(self.code_address, code_size, MemoryPermission::READ_EXECUTE, MemoryState::Code)?;
        self.page_table.load(self.code_address, &info.image)?;

        if info.data_size > 0 {
            let data_size = crate::memory::page_table::page_align_up(info.data_size);
            self.page_table.map(
                self.code_address + code_size,
                data_size,
                MemoryPermission::READ_WRITE,
                MemoryState::CodeData,
            )?;
        }
        debug!("Loaded {} byte image for process {} at 0x{:x}", info.image.len(), self.pid, self.code_address);
        Ok(())
    }

    /// Map a stack in the stack region, returning its top
    pub(crate) fn map_stack(&self, size: Size) -> KernelResult<VAddr> {
        let size = crate::memory::page_table::page_align_up(size);
        let base = self.page_table.map_in_region(
            self.page_table.layout().stack,
            size,
            MemoryPermission::READ_WRITE,
            MemoryState::Stack,
        )?;
        Ok(base + size)
    }

    /// Reserve a zeroed TLS slot, mapping a new ThreadLocal page when all are full
    pub(crate) fn allocate_tls(&self) -> KernelResult<VAddr> {
        let mut tls = self.tls.lock();
        for (page, used) in tls.pages.iter_mut() {
            if let Some(slot) = used.iter().position(|in_use| !in_use) {
                used[slot] = true;
                let address = *page + slot as u64 * TLS_SLOT_SIZE;
                self.page_table.load(address, &[0u8; TLS_SLOT_SIZE as usize])?;
                return Ok(address);
            }
        }

        let page = self.page_table.map_in_region(
            self.page_table.layout().tls,
            PAGE_SIZE,
            MemoryPermission::READ_WRITE,
            MemoryState::ThreadLocal,
        )?;
        let mut used = [false; SLOTS_PER_PAGE];
        used[0] = true;
        tls.pages.push((page, used));
        Ok(page)
    }

    pub(crate) fn free_tls(&self, address: VAddr) {
        let mut tls = self.tls.lock();
        for (page, used) in tls.pages.iter_mut() {
            if address >= *page && address < *page + PAGE_SIZE {
                used[((address - *page) / TLS_SLOT_SIZE) as usize] = false;
                return;
            }
        }
    }

    pub fn map_shared_memory(
        &self,
        shared: &Arc<KSharedMemory>,
        address: VAddr,
        size: Size,
        permission: MemoryPermission,
    ) -> KernelResult<()> {
        shared.map(&self.page_table, self.pid, address, size, permission)?;
        self.shared_mappings.lock().push(Arc::clone(shared));
        Ok(())
    }

    pub fn unmap_shared_memory(&self, shared: &Arc<KSharedMemory>, address: VAddr, size: Size) -> KernelResult<()> {
        shared.unmap(&self.page_table, self.pid, address, size)?;
        let mut mappings = self.shared_mappings.lock();
        if let Some(index) = mappings.iter().position(|mapped| Arc::ptr_eq(mapped, shared)) {
            mappings.swap_remove(index);
        }
        Ok(())
    }

    pub fn add_handle(&self, object: KernelObject) -> KernelResult<Handle> {
        self.handles.lock().add(object)
    }

    /// Look up a handle, without pseudo-handles
    pub fn handle_object(&self, handle: Handle) -> KernelResult<KernelObject> {
        self.handles.lock().get(handle)
    }

    /// Look up a handle, resolving the current-process and current-thread pseudo-handles
    pub fn get_object(self: &Arc<Self>, handle: Handle, current: &Arc<KThread>) -> KernelResult<KernelObject> {
        match handle {
            CURRENT_PROCESS_HANDLE => Ok(KernelObject::Process(Arc::clone(self))),
            CURRENT_THREAD_HANDLE => Ok(KernelObject::Thread(Arc::clone(current))),
            _ => self.handle_object(handle),
        }
    }

    /// Thread named by `handle`, failing with InvalidHandle for other object types
    pub fn get_thread(self: &Arc<Self>, handle: Handle, current: &Arc<KThread>) -> KernelResult<Arc<KThread>> {
        self.get_object(handle, current)?
            .as_thread()
            .cloned()
            .ok_or(KernelError::InvalidHandle(handle))
    }

    /// Remove a handle; the object is released after the table lock is dropped
    pub fn close_handle(&self, handle: Handle) -> KernelResult<()> {
        let object = self.handles.lock().remove(handle)?;
        debug!("Process {} closed handle {:#010x} ({:?})", self.pid, handle, object.kind());
        drop(object);
        Ok(())
    }

    /// Remove a handle and hand its object to the caller (IPC move)
    pub fn take_handle(&self, handle: Handle) -> KernelResult<KernelObject> {
        self.handles.lock().remove(handle)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub(crate) fn add_thread(&self, thread: Arc<KThread>) {
        self.threads.lock().push(thread);
    }

    pub fn threads(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == ProcessState::Created {
            *state = ProcessState::Running;
        }
    }

    /// Created/Running -> Exiting; false if termination already began
    pub(crate) fn begin_exit(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            ProcessState::Created | ProcessState::Running => {
                *state = ProcessState::Exiting;
                true
            }
            ProcessState::Exiting | ProcessState::Exited => false,
        }
    }

    /// Forget an exited thread and return its resources
    ///
    /// Returns true when this was the last thread of a started process; the
    /// caller then finalizes it.
    pub(crate) fn on_thread_exit(&self, thread: &KThread) -> bool {
        let remaining = {
            let mut threads = self.threads.lock();
            threads.retain(|other| other.tid() != thread.tid());
            threads.len()
        };
        self.free_tls(thread.tls_address());
        self.resource_limit.release(LimitableResource::Threads, 1);

        remaining == 0 && self.state() != ProcessState::Created
    }

    /// Close every handle, release memory and signal waiters
    pub(crate) fn finalize(&self, scheduler: &KScheduler) {
        {
            let mut state = self.state.lock();
            if *state == ProcessState::Exited {
                return;
            }
            *state = ProcessState::Exited;
        }
        let objects = self.handles.lock().drain();
        let handle_count = objects.len();
        drop(objects);
        let mappings = std::mem::take(&mut *self.shared_mappings.lock());
        for shared in &mappings {
            shared.detach(self.pid);
        }
        self.tls.lock().pages.clear();
        self.page_table.clear();
        scheduler.forget_process(self.pid);
        scheduler.signal(&self.sync);

        let _state = self.state.lock();
        self.exited.notify_all();
        info!("Process {} ({}) exited, closed {} handles", self.pid, self.name, handle_count);
    }

    /// Block the host caller until the process exits; false on timeout
    pub fn wait_for_exit(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        while *state != ProcessState::Exited {
            match deadline {
                Some(deadline) => {
                    if self.exited.wait_until(&mut state, deadline).timed_out() {
                        return *state == ProcessState::Exited;
                    }
                }
                None => self.exited.wait(&mut state),
            }
        }
        true
    }
}

impl std::fmt::Debug for KProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KProcess")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
