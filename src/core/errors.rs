/*!
 * Error Types
 * Guest-visible result codes and host-side kernel errors with thiserror and miette
 */

use super::types::{Handle, VAddr};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Re-export MemoryError from memory module
pub use crate::memory::MemoryError;

/// Broad error classes every kernel, IPC and GPU failure falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handle, memory, thread or session quota hit
    ResourceExhausted,
    /// Operation on an object in the wrong state
    InvalidState,
    /// Malformed input: bad address, size, handle or message
    InvalidArgument,
    /// Stubbed syscall or service command
    Unimplemented,
    /// GPU backend operation failed
    BackendFailure,
}

/// Guest-visible result code
///
/// Packed as `module | description << 9`, matching what guest software
/// reads back from syscalls and IPC responses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(u32);

/// Result module ids
pub mod module {
    pub const KERNEL: u32 = 1;
    pub const FS: u32 = 2;
    pub const HIPC: u32 = 11;
    pub const CMIF: u32 = 10;
    pub const SM: u32 = 21;
}

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    // Kernel (module 1)
    pub const NOT_IMPLEMENTED: ResultCode = ResultCode::new(module::KERNEL, 33);
    pub const TERMINATION_REQUESTED: ResultCode = ResultCode::new(module::KERNEL, 59);
    pub const INVALID_SIZE: ResultCode = ResultCode::new(module::KERNEL, 101);
    pub const INVALID_ADDRESS: ResultCode = ResultCode::new(module::KERNEL, 102);
    pub const OUT_OF_RESOURCE: ResultCode = ResultCode::new(module::KERNEL, 103);
    pub const OUT_OF_MEMORY: ResultCode = ResultCode::new(module::KERNEL, 104);
    pub const OUT_OF_HANDLES: ResultCode = ResultCode::new(module::KERNEL, 105);
    pub const INVALID_CURRENT_MEMORY: ResultCode = ResultCode::new(module::KERNEL, 106);
    pub const INVALID_NEW_MEMORY_PERMISSION: ResultCode = ResultCode::new(module::KERNEL, 108);
    pub const INVALID_MEMORY_REGION: ResultCode = ResultCode::new(module::KERNEL, 110);
    pub const INVALID_PRIORITY: ResultCode = ResultCode::new(module::KERNEL, 112);
    pub const INVALID_CORE_ID: ResultCode = ResultCode::new(module::KERNEL, 113);
    pub const INVALID_HANDLE: ResultCode = ResultCode::new(module::KERNEL, 114);
    pub const INVALID_POINTER: ResultCode = ResultCode::new(module::KERNEL, 115);
    pub const INVALID_COMBINATION: ResultCode = ResultCode::new(module::KERNEL, 116);
    pub const TIMED_OUT: ResultCode = ResultCode::new(module::KERNEL, 117);
    pub const CANCELLED: ResultCode = ResultCode::new(module::KERNEL, 118);
    pub const OUT_OF_RANGE: ResultCode = ResultCode::new(module::KERNEL, 119);
    pub const INVALID_ENUM_VALUE: ResultCode = ResultCode::new(module::KERNEL, 120);
    pub const NOT_FOUND: ResultCode = ResultCode::new(module::KERNEL, 121);
    pub const SESSION_CLOSED: ResultCode = ResultCode::new(module::KERNEL, 123);
    pub const INVALID_STATE: ResultCode = ResultCode::new(module::KERNEL, 125);
    pub const LIMIT_REACHED: ResultCode = ResultCode::new(module::KERNEL, 132);

    // CMIF (module 10)
    pub const CMIF_INVALID_HEADER: ResultCode = ResultCode::new(module::CMIF, 202);
    pub const CMIF_INVALID_IN_HEADER: ResultCode = ResultCode::new(module::CMIF, 211);
    pub const CMIF_UNKNOWN_COMMAND_ID: ResultCode = ResultCode::new(module::CMIF, 221);
    pub const CMIF_TARGET_NOT_FOUND: ResultCode = ResultCode::new(module::CMIF, 421);

    // HIPC (module 11)
    pub const HIPC_OUT_OF_DOMAINS: ResultCode = ResultCode::new(module::HIPC, 200);
    pub const HIPC_MESSAGE_TOO_LARGE: ResultCode = ResultCode::new(module::HIPC, 102);

    // Service manager (module 21)
    pub const SM_ALREADY_REGISTERED: ResultCode = ResultCode::new(module::SM, 4);
    pub const SM_INVALID_CLIENT: ResultCode = ResultCode::new(module::SM, 5);
    pub const SM_INVALID_SERVICE_NAME: ResultCode = ResultCode::new(module::SM, 6);
    pub const SM_NOT_REGISTERED: ResultCode = ResultCode::new(module::SM, 7);

    pub const fn new(module: u32, description: u32) -> Self {
        ResultCode((module & 0x1FF) | ((description & 0x1FFF) << 9))
    }

    pub const fn from_raw(raw: u32) -> Self {
        ResultCode(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn module(&self) -> u32 {
        self.0 & 0x1FF
    }

    pub const fn description(&self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_error(&self) -> bool {
        self.0 != 0
    }

    /// Turn the code into a `Result`, keeping errors as codes
    pub fn into_result(self) -> Result<(), ResultCode> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Classify the code into the kernel error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Self::OUT_OF_RESOURCE
            | Self::OUT_OF_MEMORY
            | Self::OUT_OF_HANDLES
            | Self::LIMIT_REACHED
            | Self::HIPC_OUT_OF_DOMAINS => ErrorKind::ResourceExhausted,
            Self::NOT_IMPLEMENTED | Self::CMIF_UNKNOWN_COMMAND_ID => ErrorKind::Unimplemented,
            Self::INVALID_STATE
            | Self::INVALID_CURRENT_MEMORY
            | Self::TERMINATION_REQUESTED
            | Self::SESSION_CLOSED
            | Self::TIMED_OUT
            | Self::CANCELLED
            | Self::SM_ALREADY_REGISTERED => ErrorKind::InvalidState,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

impl Default for ResultCode {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:04}", 2000 + self.module(), self.description())
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultCode({:#x}: {})", self.0, self)
    }
}

/// Kernel object-level errors with miette diagnostics
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum KernelError {
    #[error("Handle {0:#010x} is not valid in this process")]
    #[diagnostic(
        code(kernel::invalid_handle),
        help("The handle was closed, never created, or belongs to another object type.")
    )]
    InvalidHandle(Handle),

    #[error("Handle table is full ({capacity} entries)")]
    #[diagnostic(
        code(kernel::out_of_handles),
        help("Close unused handles before creating new objects.")
    )]
    OutOfHandles { capacity: usize },

    #[error("Resource limit reached for {resource}: requested {requested}, limit {limit}")]
    #[diagnostic(
        code(kernel::limit_reached),
        help("The process resource limit does not allow another object of this kind.")
    )]
    LimitReached {
        resource: &'static str,
        requested: u64,
        limit: u64,
    },

    #[error("Memory error: {0}")]
    #[diagnostic(transparent)]
    Memory(#[from] MemoryError),

    #[error("Invalid priority {0}")]
    #[diagnostic(code(kernel::invalid_priority), help("Priority must be between 0 and 63."))]
    InvalidPriority(u32),

    #[error("Invalid core id {0}")]
    #[diagnostic(code(kernel::invalid_core_id))]
    InvalidCoreId(i32),

    #[error("Invalid combination: {0}")]
    #[diagnostic(code(kernel::invalid_combination))]
    InvalidCombination(String),

    #[error("Invalid enum value {0}")]
    #[diagnostic(code(kernel::invalid_enum_value))]
    InvalidEnumValue(u64),

    #[error("Invalid pointer {0:#x}")]
    #[diagnostic(code(kernel::invalid_pointer))]
    InvalidPointer(VAddr),

    #[error("Value out of range: {0}")]
    #[diagnostic(code(kernel::out_of_range))]
    OutOfRange(String),

    #[error("Invalid state: {0}")]
    #[diagnostic(
        code(kernel::invalid_state),
        help("Operation cannot be performed in the current object state.")
    )]
    InvalidState(String),

    #[error("Not found: {0}")]
    #[diagnostic(code(kernel::not_found))]
    NotFound(String),

    #[error("Wait timed out")]
    #[diagnostic(code(kernel::timed_out))]
    TimedOut,

    #[error("Wait was cancelled")]
    #[diagnostic(code(kernel::cancelled))]
    Cancelled,

    #[error("Thread termination requested")]
    #[diagnostic(code(kernel::termination_requested))]
    TerminationRequested,

    #[error("Session closed")]
    #[diagnostic(code(kernel::session_closed))]
    SessionClosed,

    #[error("Not implemented: {0}")]
    #[diagnostic(
        code(kernel::not_implemented),
        help("The guest called a syscall or command this kernel does not provide.")
    )]
    NotImplemented(String),

    #[error("Result {0}")]
    #[diagnostic(code(kernel::result))]
    Result(ResultCode),
}

impl KernelError {
    /// Guest-visible code for this error
    pub fn result_code(&self) -> ResultCode {
        match self {
            KernelError::InvalidHandle(_) => ResultCode::INVALID_HANDLE,
            KernelError::OutOfHandles { .. } => ResultCode::OUT_OF_HANDLES,
            KernelError::LimitReached { .. } => ResultCode::LIMIT_REACHED,
            KernelError::Memory(err) => err.result_code(),
            KernelError::InvalidPriority(_) => ResultCode::INVALID_PRIORITY,
            KernelError::InvalidCoreId(_) => ResultCode::INVALID_CORE_ID,
            KernelError::InvalidCombination(_) => ResultCode::INVALID_COMBINATION,
            KernelError::InvalidEnumValue(_) => ResultCode::INVALID_ENUM_VALUE,
            KernelError::InvalidPointer(_) => ResultCode::INVALID_POINTER,
            KernelError::OutOfRange(_) => ResultCode::OUT_OF_RANGE,
            KernelError::InvalidState(_) => ResultCode::INVALID_STATE,
            KernelError::NotFound(_) => ResultCode::NOT_FOUND,
            KernelError::TimedOut => ResultCode::TIMED_OUT,
            KernelError::Cancelled => ResultCode::CANCELLED,
            KernelError::TerminationRequested => ResultCode::TERMINATION_REQUESTED,
            KernelError::SessionClosed => ResultCode::SESSION_CLOSED,
            KernelError::NotImplemented(_) => ResultCode::NOT_IMPLEMENTED,
            KernelError::Result(code) => *code,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.result_code().kind()
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        KernelError::InvalidState(msg.into())
    }
}

impl From<ResultCode> for KernelError {
    fn from(code: ResultCode) -> Self {
        match code {
            ResultCode::TIMED_OUT => KernelError::TimedOut,
            ResultCode::CANCELLED => KernelError::Cancelled,
            ResultCode::TERMINATION_REQUESTED => KernelError::TerminationRequested,
            ResultCode::SESSION_CLOSED => KernelError::SessionClosed,
            other => KernelError::Result(other),
        }
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> Self {
        err.result_code()
    }
}
