/*!
 * CMIF Wire Format
 * HIPC framing, buffer descriptors and CMIF data headers
 *
 * Layout of a message (little-endian u32 words):
 *   word 0   type:16 | x:4 | a:4 | b:4 | w:4
 *   word 1   data_words:10 | c_flags:4 | reserved:17 | has_handles:1
 *   [handle descriptor, pid, copy handles, move handles]
 *   X descriptors (2 words), A/B/W descriptors (3 words each)
 *   raw data: padding to 16 bytes, [domain header], CMIF header, payload
 *   C descriptors (2 words each)
 */

use crate::core::errors::ResultCode;
use crate::core::limits::IPC_MESSAGE_SIZE;
use crate::core::types::{Handle, VAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// "SFCI"
pub const CMIF_IN_HEADER_MAGIC: u32 = 0x4943_4653;
/// "SFCO"
pub const CMIF_OUT_HEADER_MAGIC: u32 = 0x4F43_4653;

const CMIF_HEADER_SIZE: usize = 16;
const DOMAIN_HEADER_SIZE: usize = 16;
/// Raw data always reserves 16 bytes for alignment padding
const RAW_PADDING: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid command type {0}")]
    InvalidCommandType(u16),

    #[error("Invalid CMIF magic {0:#010x}")]
    InvalidMagic(u32),

    #[error("Invalid domain command {0}")]
    InvalidDomainCommand(u8),

    #[error("Message of {0} bytes exceeds the IPC buffer")]
    TooLarge(usize),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),
}

impl IpcError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            IpcError::InvalidMagic(_) | IpcError::InvalidDomainCommand(_) => ResultCode::CMIF_INVALID_IN_HEADER,
            IpcError::TooLarge(_) => ResultCode::HIPC_MESSAGE_TOO_LARGE,
            IpcError::Truncated { .. } | IpcError::InvalidCommandType(_) | IpcError::InvalidDescriptor(_) => {
                ResultCode::CMIF_INVALID_HEADER
            }
        }
    }
}

pub type IpcResult<T> = Result<T, IpcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CommandType {
    Invalid = 0,
    LegacyRequest = 1,
    Close = 2,
    LegacyControl = 3,
    Request = 4,
    Control = 5,
    RequestWithContext = 6,
    ControlWithContext = 7,
}

impl CommandType {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => Self::Invalid,
            1 => Self::LegacyRequest,
            2 => Self::Close,
            3 => Self::LegacyControl,
            4 => Self::Request,
            5 => Self::Control,
            6 => Self::RequestWithContext,
            7 => Self::ControlWithContext,
            _ => return None,
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request | Self::RequestWithContext | Self::LegacyRequest)
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Self::Control | Self::ControlWithContext | Self::LegacyControl)
    }
}

/// A, B or W descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub address: VAddr,
    pub size: u64,
    pub mode: u8,
}

/// X (pointer) descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaticDescriptor {
    pub address: VAddr,
    pub size: u16,
    pub index: u16,
}

/// C (receive list) descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveDescriptor {
    pub address: VAddr,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DomainCommand {
    SendMessage = 1,
    CloseVirtualHandle = 2,
}

impl DomainCommand {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::SendMessage),
            2 => Some(Self::CloseVirtualHandle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainHeader {
    pub command: DomainCommand,
    pub input_object_count: u8,
    /// Bytes of CMIF header plus payload
    pub payload_len: u16,
    pub object_id: u32,
    pub token: u32,
}

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command_type: CommandType,
    pub pid: Option<u64>,
    pub copy_handles: Vec<Handle>,
    pub move_handles: Vec<Handle>,
    pub x_buffers: Vec<StaticDescriptor>,
    pub a_buffers: Vec<BufferDescriptor>,
    pub b_buffers: Vec<BufferDescriptor>,
    pub w_buffers: Vec<BufferDescriptor>,
    pub c_buffers: Vec<ReceiveDescriptor>,
    pub domain: Option<DomainHeader>,
    pub domain_objects: Vec<u32>,
    pub command_id: u32,
    pub token: u32,
    pub payload: Vec<u8>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> IpcResult<&'a [u8]> {
        let end = self.offset + len;
        if end > self.bytes.len() {
            return Err(IpcError::Truncated {
                needed: end,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u32(&mut self) -> IpcResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> IpcResult<u64> {
        let low = self.u32()? as u64;
        let high = self.u32()? as u64;
        Ok(low | (high << 32))
    }

    fn seek(&mut self, offset: usize) -> IpcResult<()> {
        if offset > self.bytes.len() {
            return Err(IpcError::Truncated {
                needed: offset,
                available: self.bytes.len(),
            });
        }
        self.offset = offset;
        Ok(())
    }
}

fn align16(offset: usize) -> usize {
    (offset + 15) & !15
}

fn read_u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

fn decode_static(word0: u32, word1: u32) -> StaticDescriptor {
    let address = word1 as u64 | (((word0 >> 12) & 0xF) as u64) << 32 | (((word0 >> 6) & 0x7) as u64) << 36;
    let index = ((word0 & 0x3F) | (word0 & 0xE00)) as u16;
    StaticDescriptor {
        address,
        size: (word0 >> 16) as u16,
        index,
    }
}

fn encode_static(desc: &StaticDescriptor) -> [u32; 2] {
    let index = desc.index as u32;
    let word0 = (index & 0x3F)
        | (((desc.address >> 36) & 0x7) as u32) << 6
        | (index & 0xE00)
        | (((desc.address >> 32) & 0xF) as u32) << 12
        | (desc.size as u32) << 16;
    [word0, desc.address as u32]
}

fn decode_buffer(size_low: u32, address_low: u32, word2: u32) -> BufferDescriptor {
    let address = address_low as u64 | (((word2 >> 28) & 0xF) as u64) << 32 | (((word2 >> 2) & 0x7) as u64) << 36;
    let size = size_low as u64 | (((word2 >> 24) & 0xF) as u64) << 32;
    BufferDescriptor {
        address,
        size,
        mode: (word2 & 0x3) as u8,
    }
}

fn encode_buffer(desc: &BufferDescriptor) -> [u32; 3] {
    let word2 = (desc.mode as u32 & 0x3)
        | (((desc.address >> 36) & 0x7) as u32) << 2
        | (((desc.size >> 32) & 0xF) as u32) << 24
        | (((desc.address >> 32) & 0xF) as u32) << 28;
    [desc.size as u32, desc.address as u32, word2]
}

/// Parse a request; `is_domain` selects domain framing for Request messages
pub fn parse_request(bytes: &[u8], is_domain: bool) -> IpcResult<Request> {
    if bytes.len() > IPC_MESSAGE_SIZE {
        return Err(IpcError::TooLarge(bytes.len()));
    }
    let mut reader = Reader::new(bytes);
    let word0 = reader.u32()?;
    let word1 = reader.u32()?;

    let raw_type = (word0 & 0xFFFF) as u16;
    let command_type = CommandType::from_raw(raw_type).ok_or(IpcError::InvalidCommandType(raw_type))?;
    let num_x = ((word0 >> 16) & 0xF) as usize;
    let num_a = ((word0 >> 20) & 0xF) as usize;
    let num_b = ((word0 >> 24) & 0xF) as usize;
    let num_w = ((word0 >> 28) & 0xF) as usize;
    let data_words = (word1 & 0x3FF) as usize;
    let c_flags = (word1 >> 10) & 0xF;
    let has_handles = word1 >> 31 != 0;

    let mut request = Request {
        command_type,
        pid: None,
        copy_handles: Vec::new(),
        move_handles: Vec::new(),
        x_buffers: Vec::with_capacity(num_x),
        a_buffers: Vec::with_capacity(num_a),
        b_buffers: Vec::with_capacity(num_b),
        w_buffers: Vec::with_capacity(num_w),
        c_buffers: Vec::new(),
        domain: None,
        domain_objects: Vec::new(),
        command_id: 0,
        token: 0,
        payload: Vec::new(),
    };

    if has_handles {
        let descriptor = reader.u32()?;
        if descriptor & 1 != 0 {
            request.pid = Some(reader.u64()?);
        }
        let copies = ((descriptor >> 1) & 0xF) as usize;
        let moves = ((descriptor >> 5) & 0xF) as usize;
        for _ in 0..copies {
            request.copy_handles.push(reader.u32()?);
        }
        for _ in 0..moves {
            request.move_handles.push(reader.u32()?);
        }
    }

    for _ in 0..num_x {
        let word0 = reader.u32()?;
        let word1 = reader.u32()?;
        request.x_buffers.push(decode_static(word0, word1));
    }
    for (count, list) in [
        (num_a, &mut request.a_buffers),
        (num_b, &mut request.b_buffers),
        (num_w, &mut request.w_buffers),
    ] {
        for _ in 0..count {
            let size = reader.u32()?;
            let address = reader.u32()?;
            let word2 = reader.u32()?;
            let desc = decode_buffer(size, address, word2);
            if desc.mode == 2 {
                return Err(IpcError::InvalidDescriptor(format!("buffer mode {}", desc.mode)));
            }
            list.push(desc);
        }
    }

    let raw_start = reader.offset;
    let raw_end = raw_start + data_words * 4;
    if raw_end > bytes.len() {
        return Err(IpcError::Truncated {
            needed: raw_end,
            available: bytes.len(),
        });
    }

    // C descriptors follow the raw data
    if c_flags >= 2 {
        reader.seek(raw_end)?;
        let count = if c_flags == 2 { 1 } else { (c_flags - 2) as usize };
        for _ in 0..count {
            let address_low = reader.u32()?;
            let word1 = reader.u32()?;
            request.c_buffers.push(ReceiveDescriptor {
                address: address_low as u64 | ((word1 & 0xFFFF) as u64) << 32,
                size: (word1 >> 16) as u16,
            });
        }
    }

    if command_type == CommandType::Close || command_type == CommandType::Invalid {
        return Ok(request);
    }

    let mut cursor = align16(raw_start);
    let mut payload_end = raw_end;
    if is_domain && command_type.is_request() {
        if cursor + DOMAIN_HEADER_SIZE > raw_end {
            return Err(IpcError::Truncated {
                needed: cursor + DOMAIN_HEADER_SIZE,
                available: raw_end,
            });
        }
        let raw_command = bytes[cursor];
        let command = DomainCommand::from_raw(raw_command).ok_or(IpcError::InvalidDomainCommand(raw_command))?;
        let input_object_count = bytes[cursor + 1];
        let payload_len = u16::from_le_bytes([bytes[cursor + 2], bytes[cursor + 3]]);
        let header = DomainHeader {
            command,
            input_object_count,
            payload_len,
            object_id: read_u32_at(bytes, cursor + 4),
            token: read_u32_at(bytes, cursor + 12),
        };
        cursor += DOMAIN_HEADER_SIZE;
        request.domain = Some(header);

        if command == DomainCommand::CloseVirtualHandle {
            return Ok(request);
        }
        payload_end = cursor + payload_len as usize;
        let objects_end = payload_end + input_object_count as usize * 4;
        if objects_end > raw_end {
            return Err(IpcError::Truncated {
                needed: objects_end,
                available: raw_end,
            });
        }
        request.domain_objects = (0..input_object_count as usize)
            .map(|i| read_u32_at(bytes, payload_end + i * 4))
            .collect();
    }

    if cursor + CMIF_HEADER_SIZE > payload_end {
        return Err(IpcError::Truncated {
            needed: cursor + CMIF_HEADER_SIZE,
            available: payload_end,
        });
    }
    let magic = read_u32_at(bytes, cursor);
    if magic != CMIF_IN_HEADER_MAGIC {
        return Err(IpcError::InvalidMagic(magic));
    }
    request.command_id = read_u32_at(bytes, cursor + 8);
    request.token = read_u32_at(bytes, cursor + 12);
    request.payload = bytes[cursor + CMIF_HEADER_SIZE..payload_end].to_vec();
    Ok(request)
}

/// Word-granular payload writer shared by requests and responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    fn pad(&mut self) {
        while self.bytes.len() % 4 != 0 {
            self.bytes.push(0);
        }
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push_bytes(&[value]);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.push_bytes(&value.to_le_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push_bytes(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.push_bytes(&value.to_le_bytes());
    }

    /// Append raw bytes, padded to a word boundary
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
        self.pad();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Shared framing for requests and responses
struct Frame<'a> {
    command_type: u16,
    pid: Option<u64>,
    copy_handles: &'a [Handle],
    move_handles: &'a [Handle],
    x_buffers: &'a [StaticDescriptor],
    a_buffers: &'a [BufferDescriptor],
    b_buffers: &'a [BufferDescriptor],
    w_buffers: &'a [BufferDescriptor],
    c_buffers: &'a [ReceiveDescriptor],
    /// Everything after the alignment padding
    body: Vec<u8>,
}

impl Frame<'_> {
    fn encode(&self) -> IpcResult<Vec<u8>> {
        let mut words: Vec<u32> = Vec::with_capacity(IPC_MESSAGE_SIZE / 4);
        let has_handles = self.pid.is_some() || !self.copy_handles.is_empty() || !self.move_handles.is_empty();
        let data_words = (RAW_PADDING + self.body.len()) / 4;
        if self.copy_handles.len() > 0xF
            || self.move_handles.len() > 0xF
            || self.x_buffers.len() > 0xF
            || self.a_buffers.len() > 0xF
            || self.b_buffers.len() > 0xF
            || self.w_buffers.len() > 0xF
            || self.c_buffers.len() > 13
            || data_words > 0x3FF
        {
            return Err(IpcError::InvalidDescriptor("too many descriptors".into()));
        }
        let c_flags = match self.c_buffers.len() {
            0 => 0,
            1 => 2,
            n => n as u32 + 2,
        };

        words.push(
            self.command_type as u32
                | (self.x_buffers.len() as u32) << 16
                | (self.a_buffers.len() as u32) << 20
                | (self.b_buffers.len() as u32) << 24
                | (self.w_buffers.len() as u32) << 28,
        );
        words.push(data_words as u32 | c_flags << 10 | (has_handles as u32) << 31);

        if has_handles {
            words.push(
                self.pid.is_some() as u32
                    | (self.copy_handles.len() as u32) << 1
                    | (self.move_handles.len() as u32) << 5,
            );
            if let Some(pid) = self.pid {
                words.push(pid as u32);
                words.push((pid >> 32) as u32);
            }
            words.extend_from_slice(self.copy_handles);
            words.extend_from_slice(self.move_handles);
        }
        for desc in self.x_buffers {
            words.extend_from_slice(&encode_static(desc));
        }
        for desc in self.a_buffers.iter().chain(self.b_buffers).chain(self.w_buffers) {
            words.extend_from_slice(&encode_buffer(desc));
        }

        let mut bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        let raw_start = bytes.len();
        let padding = align16(raw_start) - raw_start;
        bytes.resize(raw_start + padding, 0);
        bytes.extend_from_slice(&self.body);
        bytes.resize(raw_start + data_words * 4, 0);

        for desc in self.c_buffers {
            bytes.extend_from_slice(&(desc.address as u32).to_le_bytes());
            let word1 = ((desc.address >> 32) & 0xFFFF) as u32 | (desc.size as u32) << 16;
            bytes.extend_from_slice(&word1.to_le_bytes());
        }

        if bytes.len() > IPC_MESSAGE_SIZE {
            return Err(IpcError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }
}

fn cmif_header(magic: u32, version: u32, value: u32, token: u32) -> [u8; CMIF_HEADER_SIZE] {
    let mut header = [0u8; CMIF_HEADER_SIZE];
    header[0..4].copy_from_slice(&magic.to_le_bytes());
    header[4..8].copy_from_slice(&version.to_le_bytes());
    header[8..12].copy_from_slice(&value.to_le_bytes());
    header[12..16].copy_from_slice(&token.to_le_bytes());
    header
}

/// An outgoing response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub result: ResultCode,
    pub payload: Payload,
    pub copy_handles: Vec<Handle>,
    pub move_handles: Vec<Handle>,
    /// Present for responses on domain sessions
    pub domain_objects: Option<Vec<u32>>,
}

impl Response {
    /// Error response carrying only the result code
    pub fn error(result: ResultCode, is_domain: bool) -> Self {
        Self {
            result,
            domain_objects: is_domain.then(Vec::new),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> IpcResult<Vec<u8>> {
        let mut body = Vec::new();
        if let Some(objects) = &self.domain_objects {
            let mut header = [0u8; DOMAIN_HEADER_SIZE];
            header[0..4].copy_from_slice(&(objects.len() as u32).to_le_bytes());
            body.extend_from_slice(&header);
        }
        body.extend_from_slice(&cmif_header(CMIF_OUT_HEADER_MAGIC, 0, self.result.raw(), 0));
        body.extend_from_slice(self.payload.as_bytes());
        if let Some(objects) = &self.domain_objects {
            for object in objects {
                body.extend_from_slice(&object.to_le_bytes());
            }
        }
        Frame {
            command_type: 0,
            pid: None,
            copy_handles: &self.copy_handles,
            move_handles: &self.move_handles,
            x_buffers: &[],
            a_buffers: &[],
            b_buffers: &[],
            w_buffers: &[],
            c_buffers: &[],
            body,
        }
        .encode()
    }
}

/// Client-side request encoder
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    command_type: CommandType,
    command_id: u32,
    pid: Option<u64>,
    copy_handles: Vec<Handle>,
    move_handles: Vec<Handle>,
    x_buffers: Vec<StaticDescriptor>,
    a_buffers: Vec<BufferDescriptor>,
    b_buffers: Vec<BufferDescriptor>,
    c_buffers: Vec<ReceiveDescriptor>,
    domain: Option<(DomainCommand, u32)>,
    domain_objects: Vec<u32>,
    payload: Payload,
}

impl RequestBuilder {
    pub fn new(command_id: u32) -> Self {
        Self {
            command_type: CommandType::Request,
            command_id,
            pid: None,
            copy_handles: Vec::new(),
            move_handles: Vec::new(),
            x_buffers: Vec::new(),
            a_buffers: Vec::new(),
            b_buffers: Vec::new(),
            c_buffers: Vec::new(),
            domain: None,
            domain_objects: Vec::new(),
            payload: Payload::new(),
        }
    }

    pub fn control(command_id: u32) -> Self {
        Self::new(command_id).with_type(CommandType::Control)
    }

    /// A Close message; it carries no CMIF header
    pub fn close() -> Self {
        Self::new(0).with_type(CommandType::Close)
    }

    pub fn with_type(mut self, command_type: CommandType) -> Self {
        self.command_type = command_type;
        self
    }

    pub fn with_pid(mut self, pid: u64) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_copy_handle(mut self, handle: Handle) -> Self {
        self.copy_handles.push(handle);
        self
    }

    pub fn with_move_handle(mut self, handle: Handle) -> Self {
        self.move_handles.push(handle);
        self
    }

    pub fn with_in_buffer(mut self, address: VAddr, size: u64) -> Self {
        self.a_buffers.push(BufferDescriptor { address, size, mode: 0 });
        self
    }

    pub fn with_out_buffer(mut self, address: VAddr, size: u64) -> Self {
        self.b_buffers.push(BufferDescriptor { address, size, mode: 0 });
        self
    }

    pub fn with_in_pointer(mut self, address: VAddr, size: u16) -> Self {
        let index = self.x_buffers.len() as u16;
        self.x_buffers.push(StaticDescriptor { address, size, index });
        self
    }

    pub fn with_out_pointer(mut self, address: VAddr, size: u16) -> Self {
        self.c_buffers.push(ReceiveDescriptor { address, size });
        self
    }

    /// Address a domain object instead of the session object
    pub fn with_domain_object(mut self, object_id: u32) -> Self {
        self.domain = Some((DomainCommand::SendMessage, object_id));
        self
    }

    /// CloseVirtualHandle for a domain object
    pub fn close_domain_object(object_id: u32) -> Self {
        let mut builder = Self::new(0);
        builder.domain = Some((DomainCommand::CloseVirtualHandle, object_id));
        builder
    }

    pub fn with_input_object(mut self, object_id: u32) -> Self {
        self.domain_objects.push(object_id);
        self
    }

    pub fn push_u32(mut self, value: u32) -> Self {
        self.payload.push_u32(value);
        self
    }

    pub fn push_u64(mut self, value: u64) -> Self {
        self.payload.push_u64(value);
        self
    }

    pub fn push_bytes(mut self, bytes: &[u8]) -> Self {
        self.payload.push_bytes(bytes);
        self
    }

    pub fn build(&self) -> IpcResult<Vec<u8>> {
        let mut body = Vec::new();
        if self.command_type != CommandType::Close {
            let mut cmif = Vec::with_capacity(CMIF_HEADER_SIZE + self.payload.len());
            cmif.extend_from_slice(&cmif_header(CMIF_IN_HEADER_MAGIC, 0, self.command_id, 0));
            cmif.extend_from_slice(self.payload.as_bytes());

            match self.domain {
                Some((DomainCommand::CloseVirtualHandle, object_id)) => {
                    body.extend_from_slice(&domain_header(DomainCommand::CloseVirtualHandle, 0, 0, object_id));
                }
                Some((DomainCommand::SendMessage, object_id)) => {
                    body.extend_from_slice(&domain_header(
                        DomainCommand::SendMessage,
                        self.domain_objects.len() as u8,
                        cmif.len() as u16,
                        object_id,
                    ));
                    body.extend_from_slice(&cmif);
                    for object in &self.domain_objects {
                        body.extend_from_slice(&object.to_le_bytes());
                    }
                }
                None => body.extend_from_slice(&cmif),
            }
        }

        Frame {
            command_type: self.command_type as u16,
            pid: self.pid,
            copy_handles: &self.copy_handles,
            move_handles: &self.move_handles,
            x_buffers: &self.x_buffers,
            a_buffers: &self.a_buffers,
            b_buffers: &self.b_buffers,
            w_buffers: &[],
            c_buffers: &self.c_buffers,
            body,
        }
        .encode()
    }
}

fn domain_header(command: DomainCommand, input_objects: u8, payload_len: u16, object_id: u32) -> [u8; DOMAIN_HEADER_SIZE] {
    let mut header = [0u8; DOMAIN_HEADER_SIZE];
    header[0] = command as u8;
    header[1] = input_objects;
    header[2..4].copy_from_slice(&payload_len.to_le_bytes());
    header[4..8].copy_from_slice(&object_id.to_le_bytes());
    header
}

/// A response as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub result: ResultCode,
    pub copy_handles: Vec<Handle>,
    pub move_handles: Vec<Handle>,
    /// Output object count from the domain header
    pub domain_object_count: Option<u32>,
    /// Bytes after the CMIF header up to the end of raw data
    pub data: Vec<u8>,
}

impl ParsedResponse {
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let low = self.read_u32(offset)? as u64;
        let high = self.read_u32(offset + 4)? as u64;
        Some(low | (high << 32))
    }

    /// Output domain object ids, stored after `payload_size` bytes of output data
    pub fn domain_objects(&self, payload_size: usize) -> Vec<u32> {
        let count = self.domain_object_count.unwrap_or(0) as usize;
        (0..count)
            .filter_map(|i| self.read_u32(payload_size + i * 4))
            .collect()
    }
}

/// Decode a response written by the server
pub fn parse_response(bytes: &[u8], is_domain: bool) -> IpcResult<ParsedResponse> {
    let mut reader = Reader::new(bytes);
    let _word0 = reader.u32()?;
    let word1 = reader.u32()?;
    let data_words = (word1 & 0x3FF) as usize;

    let mut copy_handles = Vec::new();
    let mut move_handles = Vec::new();
    if word1 >> 31 != 0 {
        let descriptor = reader.u32()?;
        if descriptor & 1 != 0 {
            reader.u64()?;
        }
        for _ in 0..((descriptor >> 1) & 0xF) {
            copy_handles.push(reader.u32()?);
        }
        for _ in 0..((descriptor >> 5) & 0xF) {
            move_handles.push(reader.u32()?);
        }
    }

    let raw_start = reader.offset;
    let raw_end = raw_start + data_words * 4;
    if raw_end > bytes.len() {
        return Err(IpcError::Truncated {
            needed: raw_end,
            available: bytes.len(),
        });
    }
    let mut cursor = align16(raw_start);
    let mut domain_object_count = None;
    if is_domain {
        if cursor + DOMAIN_HEADER_SIZE > raw_end {
            return Err(IpcError::Truncated {
                needed: cursor + DOMAIN_HEADER_SIZE,
                available: raw_end,
            });
        }
        domain_object_count = Some(read_u32_at(bytes, cursor));
        cursor += DOMAIN_HEADER_SIZE;
    }
    if cursor + CMIF_HEADER_SIZE > raw_end {
        return Err(IpcError::Truncated {
            needed: cursor + CMIF_HEADER_SIZE,
            available: raw_end,
        });
    }
    let magic = read_u32_at(bytes, cursor);
    if magic != CMIF_OUT_HEADER_MAGIC {
        return Err(IpcError::InvalidMagic(magic));
    }
    Ok(ParsedResponse {
        result: ResultCode::from_raw(read_u32_at(bytes, cursor + 8)),
        copy_handles,
        move_handles,
        domain_object_count,
        data: bytes[cursor + CMIF_HEADER_SIZE..raw_end].to_vec(),
    })
}
