/*!
 * GPU Commands
 * Fixed-layout command records queued by producers
 *
 * A `Command` is `Copy`: anything that is not plain data (buffer contents,
 * result boxes, host resource ids that do not exist yet) is referenced
 * through a `TableRef` into the queue's resource tables.
 */

use super::operand::{Condition, Operand, OperandKind, ReductionOp};
use super::result_box::PendingResult;
use super::table::TableRef;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Host buffer id returned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

/// Host texture id returned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextureId(pub u64);

/// Transient payload carried alongside a command
pub type Payload = Vec<u8>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    R32Float,
    Rgba16Float,
    Depth24Stencil8,
    Depth32Float,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            TextureFormat::Rgba8
            | TextureFormat::Bgra8
            | TextureFormat::R32Float
            | TextureFormat::Depth24Stencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub levels: u32,
    pub format: TextureFormat,
}

impl TextureInfo {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            layers: 1,
            levels: 1,
            format,
        }
    }

    /// Bytes of one mip level of one layer
    pub fn level_size(&self, level: u32) -> u64 {
        let width = (self.width >> level).max(1) as u64;
        let height = (self.height >> level).max(1) as u64;
        width * height * self.format.bytes_per_pixel()
    }

    /// Bytes of every level of every layer
    pub fn total_size(&self) -> u64 {
        (0..self.levels).map(|level| self.level_size(level)).sum::<u64>() * self.layers as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveTopology {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlendState {
    pub enabled: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexFormat {
    U8,
    U16,
    U32,
}

/// Pipeline state as the backend sees it, with host ids resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PipelineState {
    Viewport(Viewport),
    Scissor(Option<Rect>),
    Topology(PrimitiveTopology),
    Blend(BlendState),
    Depth(DepthState),
    VertexBuffer {
        slot: u32,
        buffer: Option<BufferId>,
        offset: u64,
        stride: u32,
    },
    IndexBuffer {
        buffer: Option<BufferId>,
        offset: u64,
        format: IndexFormat,
    },
    RenderTarget {
        slot: u32,
        texture: Option<TextureId>,
    },
    DepthTarget(Option<TextureId>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearTarget {
    Color { slot: u32, color: [f32; 4] },
    DepthStencil { depth: f32, stencil: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawCall {
    Direct {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Indexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
}

/// One queued GPU command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    CreateBuffer {
        buffer: TableRef<BufferId>,
        size: u64,
        usage: BufferUsage,
    },
    DeleteBuffer {
        buffer: TableRef<BufferId>,
    },
    SetBufferData {
        buffer: TableRef<BufferId>,
        offset: u64,
        data: TableRef<Payload>,
    },
    GetBufferData {
        buffer: TableRef<BufferId>,
        offset: u64,
        size: u64,
        result: TableRef<PendingResult>,
    },
    CopyBuffer {
        src: TableRef<BufferId>,
        dst: TableRef<BufferId>,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CreateTexture {
        texture: TableRef<TextureId>,
        info: TextureInfo,
    },
    DeleteTexture {
        texture: TableRef<TextureId>,
    },
    SetTextureData {
        texture: TableRef<TextureId>,
        layer: u32,
        level: u32,
        data: TableRef<Payload>,
    },
    SetViewport(Viewport),
    SetScissor(Option<Rect>),
    SetTopology(PrimitiveTopology),
    SetBlend(BlendState),
    SetDepth(DepthState),
    SetVertexBuffer {
        slot: u32,
        buffer: Option<TableRef<BufferId>>,
        offset: u64,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: Option<TableRef<BufferId>>,
        offset: u64,
        format: IndexFormat,
    },
    SetRenderTarget {
        slot: u32,
        texture: Option<TableRef<TextureId>>,
    },
    SetDepthTarget {
        texture: Option<TableRef<TextureId>>,
    },
    Clear(ClearTarget),
    Draw(DrawCall),
    DrawIndirect {
        buffer: TableRef<BufferId>,
        offset: u64,
        count: u32,
    },
    Barrier,
    SemaphoreRelease {
        buffer: TableRef<BufferId>,
        offset: u64,
        op: ReductionOp,
        operand: Operand,
    },
    BeginConditionalRender {
        buffer: TableRef<BufferId>,
        offset: u64,
        kind: OperandKind,
        condition: Condition,
        reference: Operand,
    },
    EndConditionalRender,
    /// Fence: completes once everything before it has executed
    Finish {
        result: TableRef<PendingResult>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateBuffer { .. } => "CreateBuffer",
            Command::DeleteBuffer { .. } => "DeleteBuffer",
            Command::SetBufferData { .. } => "SetBufferData",
            Command::GetBufferData { .. } => "GetBufferData",
            Command::CopyBuffer { .. } => "CopyBuffer",
            Command::CreateTexture { .. } => "CreateTexture",
            Command::DeleteTexture { .. } => "DeleteTexture",
            Command::SetTextureData { .. } => "SetTextureData",
            Command::SetViewport(_) => "SetViewport",
            Command::SetScissor(_) => "SetScissor",
            Command::SetTopology(_) => "SetTopology",
            Command::SetBlend(_) => "SetBlend",
            Command::SetDepth(_) => "SetDepth",
            Command::SetVertexBuffer { .. } => "SetVertexBuffer",
            Command::SetIndexBuffer { .. } => "SetIndexBuffer",
            Command::SetRenderTarget { .. } => "SetRenderTarget",
            Command::SetDepthTarget { .. } => "SetDepthTarget",
            Command::Clear(_) => "Clear",
            Command::Draw(_) => "Draw",
            Command::DrawIndirect { .. } => "DrawIndirect",
            Command::Barrier => "Barrier",
            Command::SemaphoreRelease { .. } => "SemaphoreRelease",
            Command::BeginConditionalRender { .. } => "BeginConditionalRender",
            Command::EndConditionalRender => "EndConditionalRender",
            Command::Finish { .. } => "Finish",
        }
    }

    /// Result slot a producer may be blocked on
    pub fn pending_result(&self) -> Option<TableRef<PendingResult>> {
        match *self {
            Command::GetBufferData { result, .. } | Command::Finish { result } => Some(result),
            _ => None,
        }
    }

    /// Payload slot that must be reclaimed with the command
    pub fn payload(&self) -> Option<TableRef<Payload>> {
        match *self {
            Command::SetBufferData { data, .. } | Command::SetTextureData { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Draws and clears are skipped while conditional rendering is false
    pub fn is_predicated(&self) -> bool {
        matches!(
            self,
            Command::Clear(_) | Command::Draw(_) | Command::DrawIndirect { .. }
        )
    }
}
