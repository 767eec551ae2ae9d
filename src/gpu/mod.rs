/*!
 * GPU Command Queue
 * Threaded renderer decoupling guest graphics calls from the host backend
 *
 * Producers record `Command`s into a bounded ring; a single render thread
 * owns the backend and executes them in issue order. Resources that do not
 * exist yet are referenced through generation-tagged `TableRef`s, and
 * readbacks come back through `ResultBox`es.
 */

pub mod backend;
pub mod command;
pub mod operand;
pub mod queue;
pub mod renderer;
pub mod result_box;
pub mod software;
pub mod table;

pub use backend::{Backend, BackendError, BackendResult};
pub use command::{
    BlendFactor, BlendState, BufferId, BufferUsage, ClearTarget, Command, DepthState, DrawCall, IndexFormat, Payload,
    PipelineState, PrimitiveTopology, Rect, TextureFormat, TextureId, TextureInfo, Viewport,
};
pub use operand::{Condition, Operand, OperandKind, ReductionOp};
pub use queue::{GpuQueue, QueueState, QueueStats};
pub use renderer::{Execution, Renderer, ResourceTables};
pub use result_box::{PendingResult, ResultBox};
pub use software::{BackendCall, CallLog, SoftwareBackend};
pub use table::{ResourceTable, TableRef};

use crate::core::errors::ErrorKind;
use miette::Diagnostic;
use thiserror::Error;

pub type GpuResult<T> = Result<T, GpuError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum GpuError {
    #[error("GPU queue is shut down")]
    #[diagnostic(code(gpu::queue_shutdown), help("The command was discarded or never queued."))]
    QueueShutdown,

    #[error("Backend operation {op} failed: {source}")]
    #[diagnostic(code(gpu::backend))]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },

    #[error("Backend panicked during {0}")]
    #[diagnostic(code(gpu::backend_panic))]
    BackendPanic(&'static str),

    #[error("Unresolved resource reference: {0}")]
    #[diagnostic(
        code(gpu::unresolved_resource),
        help("The resource was never created, failed to create or was already deleted.")
    )]
    UnresolvedResource(String),

    #[error("Operand mismatch: {0}")]
    #[diagnostic(code(gpu::operand_mismatch))]
    OperandMismatch(String),

    #[error("Result already taken")]
    #[diagnostic(code(gpu::result_taken))]
    ResultTaken,

    #[error("Failed to start render thread: {0}")]
    #[diagnostic(code(gpu::spawn))]
    Spawn(String),
}

impl GpuError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GpuError::Backend {
                source: BackendError::OutOfMemory { .. },
                ..
            } => ErrorKind::ResourceExhausted,
            GpuError::Backend { .. } | GpuError::BackendPanic(_) | GpuError::Spawn(_) => ErrorKind::BackendFailure,
            GpuError::QueueShutdown | GpuError::ResultTaken => ErrorKind::InvalidState,
            GpuError::UnresolvedResource(_) | GpuError::OperandMismatch(_) => ErrorKind::InvalidArgument,
        }
    }
}
