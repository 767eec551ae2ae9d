/*!
 * Kernel Objects
 * Closed set of reference-counted objects a handle can name
 */

use super::event::KEvent;
use super::process::KProcess;
use super::thread::KThread;
use crate::ipc::KSession;
use crate::memory::KSharedMemory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signaled flag of a waitable object
///
/// Only flipped while the scheduler lock is held so that waiters are
/// resolved in the same critical section.
#[derive(Debug, Default)]
pub struct SyncObject {
    signaled: AtomicBool,
}

impl SyncObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_signaled(&self, signaled: bool) {
        self.signaled.store(signaled, Ordering::SeqCst);
    }
}

/// Object type, for handle type checks and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Process,
    Thread,
    ReadableEvent,
    WritableEvent,
    SharedMemory,
    Session,
}

/// Anything a handle can refer to
#[derive(Clone)]
pub enum KernelObject {
    Process(Arc<KProcess>),
    Thread(Arc<KThread>),
    ReadableEvent(Arc<KEvent>),
    WritableEvent(Arc<KEvent>),
    SharedMemory(Arc<KSharedMemory>),
    Session(Arc<KSession>),
}

impl KernelObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            KernelObject::Process(_) => ObjectKind::Process,
            KernelObject::Thread(_) => ObjectKind::Thread,
            KernelObject::ReadableEvent(_) => ObjectKind::ReadableEvent,
            KernelObject::WritableEvent(_) => ObjectKind::WritableEvent,
            KernelObject::SharedMemory(_) => ObjectKind::SharedMemory,
            KernelObject::Session(_) => ObjectKind::Session,
        }
    }

    /// Waitable state, if WaitSynchronization accepts this object
    pub fn sync_object(&self) -> Option<&SyncObject> {
        match self {
            KernelObject::Process(process) => Some(process.sync_object()),
            KernelObject::Thread(thread) => Some(thread.sync_object()),
            KernelObject::ReadableEvent(event) => Some(event.sync_object()),
            _ => None,
        }
    }

    /// Whether this object waits on `sync`
    pub fn waits_on(&self, sync: &SyncObject) -> bool {
        self.sync_object().map_or(false, |own| std::ptr::eq(own, sync))
    }

    pub fn as_thread(&self) -> Option<&Arc<KThread>> {
        match self {
            KernelObject::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&Arc<KProcess>> {
        match self {
            KernelObject::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn as_writable_event(&self) -> Option<&Arc<KEvent>> {
        match self {
            KernelObject::WritableEvent(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_readable_event(&self) -> Option<&Arc<KEvent>> {
        match self {
            KernelObject::ReadableEvent(event) => Some(event),
            _ => None,
        }
    }

    /// Either side of an event
    pub fn as_event(&self) -> Option<&Arc<KEvent>> {
        match self {
            KernelObject::ReadableEvent(event) | KernelObject::WritableEvent(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_shared_memory(&self) -> Option<&Arc<KSharedMemory>> {
        match self {
            KernelObject::SharedMemory(shared) => Some(shared),
            _ => None,
        }
    }

    pub fn as_session(&self) -> Option<&Arc<KSession>> {
        match self {
            KernelObject::Session(session) => Some(session),
            _ => None,
        }
    }
}

impl fmt::Debug for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelObject::Process(process) => write!(f, "Process({})", process.pid()),
            KernelObject::Thread(thread) => write!(f, "Thread({})", thread.tid()),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}
