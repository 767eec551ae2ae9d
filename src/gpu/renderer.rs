/*!
 * Renderer
 * Consumer-side command execution against the backend
 *
 * Backend failures never escape: fire-and-forget commands log and become
 * no-ops, readbacks and fences carry the error in their result box.
 */

use super::backend::{Backend, BackendResult};
use super::command::{BufferId, Command, Payload, PipelineState, TextureId};
use super::operand::{Condition, Operand, OperandKind};
use super::result_box::PendingResult;
use super::table::{ResourceTable, TableRef};
use super::{GpuError, GpuResult};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Arenas shared by producers (reserve) and the render thread (fill, resolve, reclaim)
#[derive(Debug, Default)]
pub struct ResourceTables {
    pub buffers: Mutex<ResourceTable<BufferId>>,
    pub textures: Mutex<ResourceTable<TextureId>>,
    pub payloads: Mutex<ResourceTable<Payload>>,
    pub results: Mutex<ResourceTable<PendingResult>>,
}

impl ResourceTables {
    /// Reclaim the transient slots a command carries
    pub fn release_transient(&self, command: &Command) -> (Option<Payload>, Option<PendingResult>) {
        let payload = command.payload().and_then(|data| self.payloads.lock().reclaim(data));
        let pending = command
            .pending_result()
            .and_then(|result| self.results.lock().reclaim(result));
        (payload, pending)
    }
}

/// Outcome of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Executed,
    Failed,
    /// Predicated off by conditional rendering
    Skipped,
}

pub struct Renderer {
    backend: Box<dyn Backend>,
    tables: Arc<ResourceTables>,
    render_enabled: bool,
}

impl Renderer {
    pub fn new(backend: Box<dyn Backend>, tables: Arc<ResourceTables>) -> Self {
        Self {
            backend,
            tables,
            render_enabled: true,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn render_enabled(&self) -> bool {
        self.render_enabled
    }

    pub fn execute(&mut self, command: Command) -> Execution {
        let (payload, pending) = self.tables.release_transient(&command);
        if command.is_predicated() && !self.render_enabled {
            debug!("Skipping {} (conditional rendering false)", command.name());
            return Execution::Skipped;
        }
        match self.dispatch(command, payload, pending.as_ref()) {
            Ok(()) => Execution::Executed,
            Err(err) => {
                warn!("GPU command {} failed: {}", command.name(), err);
                Execution::Failed
            }
        }
    }

    /// Drop a command without running it, failing any producer waiting on it
    pub fn discard(&mut self, command: Command) {
        let (_, pending) = self.tables.release_transient(&command);
        if let Some(pending) = pending {
            pending.fail(GpuError::QueueShutdown);
        }
    }

    /// Release every live host resource and fail every outstanding result
    pub fn shutdown(&mut self) {
        let buffers = self.tables.buffers.lock().drain();
        for buffer in buffers {
            let _ = self.guarded("DeleteBuffer", |backend| backend.delete_buffer(buffer));
        }
        let textures = self.tables.textures.lock().drain();
        for texture in textures {
            let _ = self.guarded("DeleteTexture", |backend| backend.delete_texture(texture));
        }
        self.tables.payloads.lock().drain();
        let pending = self.tables.results.lock().drain();
        for result in pending {
            result.fail(GpuError::QueueShutdown);
        }
        debug!("Renderer on {} backend shut down", self.backend.name());
    }

    /// Run one backend call, converting errors and panics
    fn guarded<R>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut dyn Backend) -> BackendResult<R>,
    ) -> GpuResult<R> {
        let backend = self.backend.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| f(backend))) {
            Ok(result) => result.map_err(|source| GpuError::Backend { op, source }),
            Err(_) => {
                error!("Backend {} panicked during {}", self.backend.name(), op);
                Err(GpuError::BackendPanic(op))
            }
        }
    }

    fn buffer(&self, reference: TableRef<BufferId>) -> GpuResult<BufferId> {
        self.tables
            .buffers
            .lock()
            .resolve(reference)
            .copied()
            .ok_or_else(|| GpuError::UnresolvedResource(format!("buffer {}", reference)))
    }

    fn texture(&self, reference: TableRef<TextureId>) -> GpuResult<TextureId> {
        self.tables
            .textures
            .lock()
            .resolve(reference)
            .copied()
            .ok_or_else(|| GpuError::UnresolvedResource(format!("texture {}", reference)))
    }

    fn optional_buffer(&self, reference: Option<TableRef<BufferId>>) -> GpuResult<Option<BufferId>> {
        reference.map(|reference| self.buffer(reference)).transpose()
    }

    fn optional_texture(&self, reference: Option<TableRef<TextureId>>) -> GpuResult<Option<TextureId>> {
        reference.map(|reference| self.texture(reference)).transpose()
    }

    fn read_operand(&mut self, buffer: BufferId, offset: u64, kind: OperandKind) -> GpuResult<Operand> {
        let bytes = self.guarded("ReadOperand", |backend| backend.get_buffer_data(buffer, offset, kind.size() as u64))?;
        Operand::from_le_bytes(kind, &bytes)
            .ok_or_else(|| GpuError::OperandMismatch(format!("short read of {:?} at {:#x}", kind, offset)))
    }

    fn dispatch(&mut self, command: Command, payload: Option<Payload>, pending: Option<&PendingResult>) -> GpuResult<()> {
        let name = command.name();
        match command {
            Command::CreateBuffer { buffer, size, usage } => {
                let id = self.guarded(name, |backend| backend.create_buffer(size, usage))?;
                if self.tables.buffers.lock().fill(buffer, id).is_err() {
                    let _ = self.guarded("DeleteBuffer", |backend| backend.delete_buffer(id));
                    return Err(GpuError::UnresolvedResource(format!("buffer {} released before creation", buffer)));
                }
                Ok(())
            }
            Command::DeleteBuffer { buffer } => {
                let id = self
                    .tables
                    .buffers
                    .lock()
                    .reclaim(buffer)
                    .ok_or_else(|| GpuError::UnresolvedResource(format!("buffer {}", buffer)))?;
                self.guarded(name, |backend| backend.delete_buffer(id))
            }
            Command::SetBufferData { buffer, offset, .. } => {
                let id = self.buffer(buffer)?;
                let data = payload.ok_or_else(|| GpuError::UnresolvedResource("buffer payload".into()))?;
                self.guarded(name, |backend| backend.set_buffer_data(id, offset, &data))
            }
            Command::GetBufferData { buffer, offset, size, .. } => {
                let result = self
                    .buffer(buffer)
                    .and_then(|id| self.guarded(name, |backend| backend.get_buffer_data(id, offset, size)));
                let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
                match pending {
                    Some(pending) => pending.complete_data(result),
                    None => warn!("{} result slot was released before execution", name),
                }
                outcome
            }
            Command::CopyBuffer {
                src,
                dst,
                src_offset,
                dst_offset,
                size,
            } => {
                let src = self.buffer(src)?;
                let dst = self.buffer(dst)?;
                self.guarded(name, |backend| backend.copy_buffer(src, dst, src_offset, dst_offset, size))
            }
            Command::CreateTexture { texture, info } => {
                let id = self.guarded(name, |backend| backend.create_texture(&info))?;
                if self.tables.textures.lock().fill(texture, id).is_err() {
                    let _ = self.guarded("DeleteTexture", |backend| backend.delete_texture(id));
                    return Err(GpuError::UnresolvedResource(format!("texture {} released before creation", texture)));
                }
                Ok(())
            }
            Command::DeleteTexture { texture } => {
                let id = self
                    .tables
                    .textures
                    .lock()
                    .reclaim(texture)
                    .ok_or_else(|| GpuError::UnresolvedResource(format!("texture {}", texture)))?;
                self.guarded(name, |backend| backend.delete_texture(id))
            }
            Command::SetTextureData { texture, layer, level, .. } => {
                let id = self.texture(texture)?;
                let data = payload.ok_or_else(|| GpuError::UnresolvedResource("texture payload".into()))?;
                self.guarded(name, |backend| backend.set_texture_data(id, layer, level, &data))
            }
            Command::SetViewport(viewport) => self.set_state(name, PipelineState::Viewport(viewport)),
            Command::SetScissor(rect) => self.set_state(name, PipelineState::Scissor(rect)),
            Command::SetTopology(topology) => self.set_state(name, PipelineState::Topology(topology)),
            Command::SetBlend(blend) => self.set_state(name, PipelineState::Blend(blend)),
            Command::SetDepth(depth) => self.set_state(name, PipelineState::Depth(depth)),
            Command::SetVertexBuffer {
                slot,
                buffer,
                offset,
                stride,
            } => {
                let buffer = self.optional_buffer(buffer)?;
                self.set_state(
                    name,
                    PipelineState::VertexBuffer {
                        slot,
                        buffer,
                        offset,
                        stride,
                    },
                )
            }
            Command::SetIndexBuffer { buffer, offset, format } => {
                let buffer = self.optional_buffer(buffer)?;
                self.set_state(name, PipelineState::IndexBuffer { buffer, offset, format })
            }
            Command::SetRenderTarget { slot, texture } => {
                let texture = self.optional_texture(texture)?;
                self.set_state(name, PipelineState::RenderTarget { slot, texture })
            }
            Command::SetDepthTarget { texture } => {
                let texture = self.optional_texture(texture)?;
                self.set_state(name, PipelineState::DepthTarget(texture))
            }
            Command::Clear(target) => self.guarded(name, |backend| backend.clear(&target)),
            Command::Draw(call) => self.guarded(name, |backend| backend.draw(&call)),
            Command::DrawIndirect { buffer, offset, count } => {
                let id = self.buffer(buffer)?;
                self.guarded(name, |backend| backend.draw_indirect(id, offset, count))
            }
            Command::Barrier => self.guarded(name, |backend| backend.barrier()),
            Command::SemaphoreRelease {
                buffer,
                offset,
                op,
                operand,
            } => {
                let id = self.buffer(buffer)?;
                let current = self.read_operand(id, offset, operand.kind())?;
                let next = current.reduce(op, operand).ok_or_else(|| {
                    GpuError::OperandMismatch(format!("{:?} with {:?}", current, operand))
                })?;
                self.guarded(name, |backend| backend.set_buffer_data(id, offset, &next.to_le_bytes()))
            }
            Command::BeginConditionalRender {
                buffer,
                offset,
                kind,
                condition,
                reference,
            } => {
                // Render unconditionally if the predicate cannot be evaluated
                self.render_enabled = true;
                self.render_enabled = match condition {
                    Condition::Always => true,
                    Condition::Never => false,
                    _ => {
                        let id = self.buffer(buffer)?;
                        let current = self.read_operand(id, offset, kind)?;
                        current.compare(condition, reference).ok_or_else(|| {
                            GpuError::OperandMismatch(format!("{:?} against {:?}", current, reference))
                        })?
                    }
                };
                debug!("Conditional rendering {}", if self.render_enabled { "passes" } else { "fails" });
                Ok(())
            }
            Command::EndConditionalRender => {
                self.render_enabled = true;
                Ok(())
            }
            Command::Finish { .. } => {
                let result = self.guarded(name, |backend| backend.finish());
                let outcome = result.clone();
                match pending {
                    Some(pending) => pending.complete_fence(result),
                    None => warn!("{} result slot was released before execution", name),
                }
                outcome
            }
        }
    }

    fn set_state(&mut self, name: &'static str, state: PipelineState) -> GpuResult<()> {
        self.guarded(name, |backend| backend.set_state(&state))
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend.name())
            .field("render_enabled", &self.render_enabled)
            .finish()
    }
}
