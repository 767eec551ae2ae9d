/*!
 * Guest Threads
 * KThread identity, start parameters and host binding
 */

use super::object::SyncObject;
use super::process::KProcess;
use crate::core::types::{Handle, Pid, Tid, VAddr};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// Scheduling state of a guest thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    /// Created but not started
    Created,
    /// Runnable, waiting for its core
    Ready,
    /// Holds a core
    Running,
    /// Suspended by SetThreadActivity
    Paused,
    /// Blocked in a wait
    WaitingSync,
    Terminated,
}

impl ThreadState {
    /// Whether the thread sits in its core's priority queue
    pub fn is_queued(&self) -> bool {
        matches!(self, ThreadState::Ready | ThreadState::Running)
    }
}

/// Entry point and initial registers
#[derive(Debug, Clone, Copy)]
pub struct ThreadParams {
    pub entry: VAddr,
    pub argument: u64,
    pub stack_top: VAddr,
}

/// Guest thread
///
/// Scheduling state lives in the scheduler; this object carries identity,
/// start parameters, the per-thread wake condvar and the host thread handle.
pub struct KThread {
    tid: Tid,
    pid: Pid,
    process: Weak<KProcess>,
    params: ThreadParams,
    tls_address: VAddr,
    /// Value placed in x1 for a process main thread
    main_handle: AtomicU32,
    sync: SyncObject,
    pub(crate) wake: Condvar,
    host: Mutex<Option<JoinHandle<()>>>,
}

impl KThread {
    pub(crate) fn new(tid: Tid, process: &Arc<KProcess>, params: ThreadParams, tls_address: VAddr) -> Self {
        Self {
            tid,
            pid: process.pid(),
            process: Arc::downgrade(process),
            params,
            tls_address,
            main_handle: AtomicU32::new(0),
            sync: SyncObject::new(),
            wake: Condvar::new(),
            host: Mutex::new(None),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn process(&self) -> Option<Arc<KProcess>> {
        self.process.upgrade()
    }

    pub fn params(&self) -> ThreadParams {
        self.params
    }

    /// Base of this thread's TLS slot; the IPC message buffer starts here
    pub fn tls_address(&self) -> VAddr {
        self.tls_address
    }

    pub fn sync_object(&self) -> &SyncObject {
        &self.sync
    }

    /// Signaled once the thread has exited
    pub fn is_terminated(&self) -> bool {
        self.sync.is_signaled()
    }

    pub(crate) fn set_main_handle(&self, handle: Handle) {
        self.main_handle.store(handle, Ordering::SeqCst);
    }

    pub fn main_handle(&self) -> Option<Handle> {
        match self.main_handle.load(Ordering::SeqCst) {
            0 => None,
            handle => Some(handle),
        }
    }

    pub fn host_name(&self) -> String {
        format!("guest-{}-{}", self.pid, self.tid)
    }

    pub(crate) fn set_host(&self, handle: JoinHandle<()>) {
        *self.host.lock() = Some(handle);
    }

    /// Wait for the host thread to finish; no-op when called from it
    pub(crate) fn join_host(&self) {
        let handle = self.host.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for KThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KThread")
            .field("tid", &self.tid)
            .field("pid", &self.pid)
            .field("entry", &format_args!("{:#x}", self.params.entry))
            .finish()
    }
}
