/*!
 * Request Context
 * What a service handler sees of one IPC request, and what it sends back
 */

use super::message::{Payload, Request};
use super::service::IpcService;
use crate::core::errors::ResultCode;
use crate::core::types::{FirmwareVersion, Pid};
use crate::kernel::{KProcess, KernelCore, KernelObject};
use std::sync::Arc;

/// Per-request view handed to [`IpcService::handle_request`]
///
/// Input data is popped in order from the raw payload; every value is
/// rounded up to whole words. Output data is pushed the same way.
pub struct RequestContext<'a> {
    kernel: &'a KernelCore,
    process: &'a Arc<KProcess>,
    request: &'a Request,
    cursor: usize,
    copy_objects: Vec<Option<KernelObject>>,
    move_objects: Vec<Option<KernelObject>>,
    input_interfaces: Vec<Arc<dyn IpcService>>,
    pub(crate) output: Payload,
    pub(crate) out_copy: Vec<KernelObject>,
    pub(crate) out_move: Vec<KernelObject>,
    pub(crate) out_interfaces: Vec<Arc<dyn IpcService>>,
}

impl<'a> RequestContext<'a> {
    pub(crate) fn new(
        kernel: &'a KernelCore,
        process: &'a Arc<KProcess>,
        request: &'a Request,
        copy_objects: Vec<KernelObject>,
        move_objects: Vec<KernelObject>,
        input_interfaces: Vec<Arc<dyn IpcService>>,
    ) -> Self {
        Self {
            kernel,
            process,
            request,
            cursor: 0,
            copy_objects: copy_objects.into_iter().map(Some).collect(),
            move_objects: move_objects.into_iter().map(Some).collect(),
            input_interfaces,
            output: Payload::new(),
            out_copy: Vec::new(),
            out_move: Vec::new(),
            out_interfaces: Vec::new(),
        }
    }

    pub fn kernel(&self) -> &KernelCore {
        self.kernel
    }

    pub fn process(&self) -> &Arc<KProcess> {
        self.process
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn command_id(&self) -> u32 {
        self.request.command_id
    }

    /// Pid sent with the request, else the client process id
    pub fn pid(&self) -> Pid {
        self.request.pid.unwrap_or_else(|| self.process.pid())
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.kernel.firmware_version()
    }

    // Input data

    /// Pop `len` raw bytes, advancing by whole words
    pub fn pop_bytes(&mut self, len: usize) -> Result<&'a [u8], ResultCode> {
        let request: &'a Request = self.request;
        let payload = request.payload.as_slice();
        let end = self.cursor + len;
        if end > payload.len() {
            return Err(ResultCode::CMIF_INVALID_HEADER);
        }
        let bytes = &payload[self.cursor..end];
        self.cursor += (len + 3) & !3;
        Ok(bytes)
    }

    pub fn pop_u8(&mut self) -> Result<u8, ResultCode> {
        Ok(self.pop_bytes(1)?[0])
    }

    pub fn pop_bool(&mut self) -> Result<bool, ResultCode> {
        Ok(self.pop_u8()? != 0)
    }

    pub fn pop_u16(&mut self) -> Result<u16, ResultCode> {
        let bytes = self.pop_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn pop_u32(&mut self) -> Result<u32, ResultCode> {
        let bytes = self.pop_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn pop_i32(&mut self) -> Result<i32, ResultCode> {
        Ok(self.pop_u32()? as i32)
    }

    pub fn pop_u64(&mut self) -> Result<u64, ResultCode> {
        let low = self.pop_u32()? as u64;
        let high = self.pop_u32()? as u64;
        Ok(low | (high << 32))
    }

    pub fn pop_i64(&mut self) -> Result<i64, ResultCode> {
        Ok(self.pop_u64()? as i64)
    }

    /// Remaining unread payload bytes
    pub fn remaining(&self) -> usize {
        self.request.payload.len().saturating_sub(self.cursor)
    }

    // Incoming objects

    /// Take the object sent as copy handle `index`
    pub fn take_copy_object(&mut self, index: usize) -> Result<KernelObject, ResultCode> {
        self.copy_objects
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(ResultCode::INVALID_HANDLE)
    }

    /// Take the object sent as move handle `index`
    pub fn take_move_object(&mut self, index: usize) -> Result<KernelObject, ResultCode> {
        self.move_objects
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(ResultCode::INVALID_HANDLE)
    }

    /// Domain input object `index`
    pub fn input_interface(&self, index: usize) -> Result<Arc<dyn IpcService>, ResultCode> {
        self.input_interfaces
            .get(index)
            .cloned()
            .ok_or(ResultCode::CMIF_TARGET_NOT_FOUND)
    }

    // Buffers

    /// Contents of input buffer `index` (A descriptor, else X descriptor)
    pub fn read_buffer(&self, index: usize) -> Result<Vec<u8>, ResultCode> {
        let (address, size) = match self.request.a_buffers.get(index) {
            Some(desc) if desc.size > 0 => (desc.address, desc.size),
            _ => match self.request.x_buffers.get(index) {
                Some(desc) => (desc.address, desc.size as u64),
                None => return Err(ResultCode::INVALID_POINTER),
            },
        };
        self.process
            .page_table()
            .read_bytes(address, size as usize)
            .map_err(|_| ResultCode::INVALID_POINTER)
    }

    /// Capacity of output buffer `index` (B descriptor, else C descriptor)
    pub fn write_buffer_size(&self, index: usize) -> u64 {
        match self.request.b_buffers.get(index) {
            Some(desc) if desc.size > 0 => desc.size,
            _ => self.request.c_buffers.get(index).map_or(0, |desc| desc.size as u64),
        }
    }

    /// Write into output buffer `index`, truncated to its size; returns bytes written
    pub fn write_buffer(&self, index: usize, data: &[u8]) -> Result<usize, ResultCode> {
        let address = match self.request.b_buffers.get(index) {
            Some(desc) if desc.size > 0 => desc.address,
            _ => match self.request.c_buffers.get(index) {
                Some(desc) => desc.address,
                None => return Err(ResultCode::INVALID_POINTER),
            },
        };
        let len = data.len().min(self.write_buffer_size(index) as usize);
        self.process
            .page_table()
            .write(address, &data[..len])
            .map_err(|_| ResultCode::INVALID_POINTER)?;
        Ok(len)
    }

    // Output

    pub fn push_u8(&mut self, value: u8) {
        self.output.push_u8(value);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.output.push_u16(value);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.output.push_u32(value);
    }

    pub fn push_u64(&mut self, value: u64) {
        self.output.push_u64(value);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.output.push_bytes(bytes);
    }

    /// Send an object as a copy handle; the client gets a new handle to it
    pub fn push_copy_object(&mut self, object: KernelObject) {
        self.out_copy.push(object);
    }

    /// Send an object as a move handle
    pub fn push_move_object(&mut self, object: KernelObject) {
        self.out_move.push(object);
    }

    /// Return a service object: a domain id on domain sessions, else a new session
    pub fn push_interface(&mut self, service: Arc<dyn IpcService>) {
        self.out_interfaces.push(service);
    }
}
