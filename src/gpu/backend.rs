/*!
 * Backend Interface
 * Capability set the render thread drives
 */

use super::command::{BufferId, BufferUsage, ClearTarget, DrawCall, PipelineState, TextureId, TextureInfo};
use miette::Diagnostic;
use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum BackendError {
    #[error("Out of GPU memory: requested {requested} bytes, {available} available")]
    #[diagnostic(code(gpu::out_of_memory))]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Unknown buffer {0:?}")]
    #[diagnostic(code(gpu::unknown_buffer))]
    UnknownBuffer(BufferId),

    #[error("Unknown texture {0:?}")]
    #[diagnostic(code(gpu::unknown_texture))]
    UnknownTexture(TextureId),

    #[error("Range {offset}+{size} out of bounds (resource size {limit})")]
    #[diagnostic(code(gpu::out_of_bounds))]
    OutOfBounds { offset: u64, size: u64, limit: u64 },

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(gpu::invalid_argument))]
    InvalidArgument(String),

    #[error("Device lost: {0}")]
    #[diagnostic(code(gpu::device_lost), help("The backend can no longer execute commands."))]
    DeviceLost(String),
}

/// A host graphics backend
///
/// Only the render thread calls into it, so implementations need `Send` but
/// not `Sync`.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> BackendResult<BufferId>;
    fn delete_buffer(&mut self, buffer: BufferId) -> BackendResult<()>;
    fn set_buffer_data(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()>;
    fn get_buffer_data(&mut self, buffer: BufferId, offset: u64, size: u64) -> BackendResult<Vec<u8>>;
    fn copy_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()>;

    fn create_texture(&mut self, info: &TextureInfo) -> BackendResult<TextureId>;
    fn delete_texture(&mut self, texture: TextureId) -> BackendResult<()>;
    fn set_texture_data(&mut self, texture: TextureId, layer: u32, level: u32, data: &[u8]) -> BackendResult<()>;

    fn set_state(&mut self, state: &PipelineState) -> BackendResult<()>;
    fn clear(&mut self, target: &ClearTarget) -> BackendResult<()>;
    fn draw(&mut self, call: &DrawCall) -> BackendResult<()>;
    /// Draw `count` records of (vertex count, instance count, first vertex, first instance)
    fn draw_indirect(&mut self, buffer: BufferId, offset: u64, count: u32) -> BackendResult<()>;
    fn barrier(&mut self) -> BackendResult<()>;
    /// Wait for all submitted work
    fn finish(&mut self) -> BackendResult<()>;
}
