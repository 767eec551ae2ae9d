/*!
 * HLE Kernel Library
 * Emulated console kernel, IPC substrate and threaded GPU command queue
 */

pub mod core;
pub mod gpu;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod monitoring;
pub mod svc;

// Re-exports
pub use crate::core::{ErrorKind, GpuConfig, KernelConfig, KernelError, ResultCode, ShutdownMode};
pub use crate::core::types::{FirmwareVersion, Handle, KernelResult, Pid, Tid, VAddr, VersionRange};
pub use gpu::{Backend, GpuError, GpuQueue, ResultBox, SoftwareBackend, TableRef};
pub use ipc::{IpcService, KSession, RequestBuilder, RequestContext, ServiceFactory, ServiceManager};
pub use kernel::{ExecutionEngine, HleEntryTable, KProcess, KThread, KernelCore, ProcessCreateInfo, ThreadContext};
pub use memory::{KPageTable, MemoryError, MemoryPermission};
pub use monitoring::init_tracing;
