/*!
 * Software Backend
 * In-memory backend for headless runs and tests
 *
 * Buffers and textures live in host memory, charged against a fixed budget.
 * Every call that reaches the backend is appended to a shared call log, which
 * stays readable after the backend has moved onto the render thread.
 */

use super::backend::{Backend, BackendError, BackendResult};
use super::command::{BufferId, BufferUsage, ClearTarget, DrawCall, PipelineState, TextureId, TextureInfo};
use crate::core::limits::{DEFAULT_SOFTWARE_BACKEND_BUDGET, DRAW_INDIRECT_RECORD_SIZE};
use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// One call observed by the software backend
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreateBuffer { buffer: BufferId, size: u64 },
    DeleteBuffer(BufferId),
    SetBufferData { buffer: BufferId, offset: u64, len: usize },
    GetBufferData { buffer: BufferId, offset: u64, size: u64 },
    CopyBuffer { src: BufferId, dst: BufferId, size: u64 },
    CreateTexture { texture: TextureId, info: TextureInfo },
    DeleteTexture(TextureId),
    SetTextureData { texture: TextureId, layer: u32, level: u32, len: usize },
    SetState(PipelineState),
    Clear(ClearTarget),
    Draw(DrawCall),
    DrawIndirect { buffer: BufferId, offset: u64, count: u32 },
    Barrier,
    Finish,
}

/// Shared handle to a backend's call log
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<BackendCall>>>);

impl CallLog {
    pub fn snapshot(&self) -> Vec<BackendCall> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    fn push(&self, call: BackendCall) {
        self.0.lock().push(call);
    }
}

struct Texture {
    info: TextureInfo,
    levels: AHashMap<(u32, u32), Vec<u8>>,
}

pub struct SoftwareBackend {
    buffers: AHashMap<u64, Vec<u8>>,
    textures: AHashMap<u64, Texture>,
    next_id: u64,
    budget: u64,
    used: u64,
    log: CallLog,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_SOFTWARE_BACKEND_BUDGET)
    }

    pub fn with_budget(budget: u64) -> Self {
        Self {
            buffers: AHashMap::new(),
            textures: AHashMap::new(),
            next_id: 1,
            budget,
            used: 0,
            log: CallLog::default(),
        }
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn memory_used(&self) -> u64 {
        self.used
    }

    fn charge(&mut self, size: u64) -> BackendResult<()> {
        let available = self.budget - self.used;
        if size > available {
            warn!("Software backend out of memory: requested {} bytes, {} available", size, available);
            return Err(BackendError::OutOfMemory {
                requested: size,
                available,
            });
        }
        self.used += size;
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn buffer(&self, buffer: BufferId) -> BackendResult<&Vec<u8>> {
        self.buffers.get(&buffer.0).ok_or(BackendError::UnknownBuffer(buffer))
    }

    fn buffer_mut(&mut self, buffer: BufferId) -> BackendResult<&mut Vec<u8>> {
        self.buffers.get_mut(&buffer.0).ok_or(BackendError::UnknownBuffer(buffer))
    }
}

fn check_range(offset: u64, size: u64, limit: u64) -> BackendResult<std::ops::Range<usize>> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(offset as usize..end as usize),
        _ => Err(BackendError::OutOfBounds { offset, size, limit }),
    }
}

impl Backend for SoftwareBackend {
    fn name(&self) -> &str {
        "software"
    }

    fn create_buffer(&mut self, size: u64, usage: BufferUsage) -> BackendResult<BufferId> {
        if size == 0 {
            return Err(BackendError::InvalidArgument("zero-sized buffer".into()));
        }
        self.charge(size)?;
        let buffer = BufferId(self.allocate_id());
        self.buffers.insert(buffer.0, vec![0; size as usize]);
        debug!("Created buffer {:?} ({} bytes, {:?})", buffer, size, usage);
        self.log.push(BackendCall::CreateBuffer { buffer, size });
        Ok(buffer)
    }

    fn delete_buffer(&mut self, buffer: BufferId) -> BackendResult<()> {
        let data = self.buffers.remove(&buffer.0).ok_or(BackendError::UnknownBuffer(buffer))?;
        self.used -= data.len() as u64;
        self.log.push(BackendCall::DeleteBuffer(buffer));
        Ok(())
    }

    fn set_buffer_data(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let storage = self.buffer_mut(buffer)?;
        let range = check_range(offset, data.len() as u64, storage.len() as u64)?;
        storage[range].copy_from_slice(data);
        self.log.push(BackendCall::SetBufferData {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn get_buffer_data(&mut self, buffer: BufferId, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let storage = self.buffer(buffer)?;
        let range = check_range(offset, size, storage.len() as u64)?;
        let data = storage[range].to_vec();
        self.log.push(BackendCall::GetBufferData { buffer, offset, size });
        Ok(data)
    }

    fn copy_buffer(
        &mut self,
        src: BufferId,
        dst: BufferId,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> BackendResult<()> {
        let source = self.buffer(src)?;
        let range = check_range(src_offset, size, source.len() as u64)?;
        let data = source[range].to_vec();
        let target = self.buffer_mut(dst)?;
        let range = check_range(dst_offset, size, target.len() as u64)?;
        target[range].copy_from_slice(&data);
        self.log.push(BackendCall::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn create_texture(&mut self, info: &TextureInfo) -> BackendResult<TextureId> {
        if info.width == 0 || info.height == 0 || info.layers == 0 || info.levels == 0 {
            return Err(BackendError::InvalidArgument(format!("empty texture {:?}", info)));
        }
        self.charge(info.total_size())?;
        let texture = TextureId(self.allocate_id());
        self.textures.insert(
            texture.0,
            Texture {
                info: *info,
                levels: AHashMap::new(),
            },
        );
        self.log.push(BackendCall::CreateTexture { texture, info: *info });
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) -> BackendResult<()> {
        let removed = self
            .textures
            .remove(&texture.0)
            .ok_or(BackendError::UnknownTexture(texture))?;
        self.used -= removed.info.total_size();
        self.log.push(BackendCall::DeleteTexture(texture));
        Ok(())
    }

    fn set_texture_data(&mut self, texture: TextureId, layer: u32, level: u32, data: &[u8]) -> BackendResult<()> {
        let entry = self
            .textures
            .get_mut(&texture.0)
            .ok_or(BackendError::UnknownTexture(texture))?;
        if layer >= entry.info.layers || level >= entry.info.levels {
            return Err(BackendError::InvalidArgument(format!(
                "layer {} level {} outside {:?}",
                layer, level, entry.info
            )));
        }
        let expected = entry.info.level_size(level);
        if data.len() as u64 != expected {
            return Err(BackendError::OutOfBounds {
                offset: 0,
                size: data.len() as u64,
                limit: expected,
            });
        }
        entry.levels.insert((layer, level), data.to_vec());
        self.log.push(BackendCall::SetTextureData {
            texture,
            layer,
            level,
            len: data.len(),
        });
        Ok(())
    }

    fn set_state(&mut self, state: &PipelineState) -> BackendResult<()> {
        let unknown_buffer = match *state {
            PipelineState::VertexBuffer { buffer: Some(buffer), .. }
            | PipelineState::IndexBuffer { buffer: Some(buffer), .. } => {
                (!self.buffers.contains_key(&buffer.0)).then_some(buffer)
            }
            _ => None,
        };
        if let Some(buffer) = unknown_buffer {
            return Err(BackendError::UnknownBuffer(buffer));
        }
        match *state {
            PipelineState::RenderTarget { texture: Some(texture), .. } | PipelineState::DepthTarget(Some(texture))
                if !self.textures.contains_key(&texture.0) =>
            {
                return Err(BackendError::UnknownTexture(texture));
            }
            _ => {}
        }
        self.log.push(BackendCall::SetState(*state));
        Ok(())
    }

    fn clear(&mut self, target: &ClearTarget) -> BackendResult<()> {
        self.log.push(BackendCall::Clear(*target));
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall) -> BackendResult<()> {
        self.log.push(BackendCall::Draw(*call));
        Ok(())
    }

    fn draw_indirect(&mut self, buffer: BufferId, offset: u64, count: u32) -> BackendResult<()> {
        let storage = self.buffer(buffer)?;
        let range = check_range(offset, count as u64 * DRAW_INDIRECT_RECORD_SIZE, storage.len() as u64)?;
        let draws: Vec<DrawCall> = storage[range]
            .chunks_exact(DRAW_INDIRECT_RECORD_SIZE as usize)
            .map(|record| {
                let word = |i: usize| {
                    u32::from_le_bytes([record[i * 4], record[i * 4 + 1], record[i * 4 + 2], record[i * 4 + 3]])
                };
                DrawCall::Direct {
                    vertex_count: word(0),
                    instance_count: word(1),
                    first_vertex: word(2),
                    first_instance: word(3),
                }
            })
            .collect();
        self.log.push(BackendCall::DrawIndirect { buffer, offset, count });
        for draw in draws {
            self.log.push(BackendCall::Draw(draw));
        }
        Ok(())
    }

    fn barrier(&mut self) -> BackendResult<()> {
        self.log.push(BackendCall::Barrier);
        Ok(())
    }

    fn finish(&mut self) -> BackendResult<()> {
        self.log.push(BackendCall::Finish);
        Ok(())
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("used", &self.used)
            .field("budget", &self.budget)
            .finish()
    }
}
