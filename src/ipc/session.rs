/*!
 * IPC Sessions
 * Client sessions to service objects and domains of sub-objects
 *
 * A session starts out bound to a single service object. Converting it to a
 * domain turns it into a table of object ids (starting at 1), each naming a
 * service object that is only reachable through this session.
 */

use super::context::RequestContext;
use super::message::{parse_request, CommandType, DomainCommand, Request, Response};
use super::service::IpcService;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::{CURRENT_PROCESS_HANDLE, MAX_DOMAIN_OBJECTS};
use crate::core::types::{Handle, KernelResult, Pid};
use crate::kernel::{KProcess, KResourceLimit, KernelCore, KernelObject, LimitableResource};
use crate::memory::MemoryPermission;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Control command ids
mod control {
    pub const CONVERT_CURRENT_OBJECT_TO_DOMAIN: u32 = 0;
    pub const COPY_FROM_CURRENT_DOMAIN: u32 = 1;
    pub const CLONE_CURRENT_OBJECT: u32 = 2;
    pub const QUERY_POINTER_BUFFER_SIZE: u32 = 3;
    pub const CLONE_CURRENT_OBJECT_EX: u32 = 4;
}

#[derive(Clone)]
enum Target {
    Object(Arc<dyn IpcService>),
    Domain {
        objects: BTreeMap<u32, Arc<dyn IpcService>>,
        next_id: u32,
    },
}

impl Target {
    fn domain_with(service: Arc<dyn IpcService>) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(1, service);
        Target::Domain { objects, next_id: 2 }
    }
}

struct SessionState {
    target: Target,
    closed: bool,
}

/// Client end of a session to an HLE service
pub struct KSession {
    owner_pid: Pid,
    state: Mutex<SessionState>,
    pointer_buffer_size: u16,
    limit: Arc<KResourceLimit>,
}

impl KSession {
    /// Open a session charged to the owner's Sessions limit
    pub fn new(
        owner_pid: Pid,
        service: Arc<dyn IpcService>,
        limit: Arc<KResourceLimit>,
        pointer_buffer_size: u16,
    ) -> KernelResult<Self> {
        Self::with_target(owner_pid, Target::Object(service), limit, pointer_buffer_size)
    }

    fn with_target(
        owner_pid: Pid,
        target: Target,
        limit: Arc<KResourceLimit>,
        pointer_buffer_size: u16,
    ) -> KernelResult<Self> {
        limit.reserve(LimitableResource::Sessions, 1)?;
        Ok(Self {
            owner_pid,
            state: Mutex::new(SessionState { target, closed: false }),
            pointer_buffer_size,
            limit,
        })
    }

    pub fn owner_pid(&self) -> Pid {
        self.owner_pid
    }

    pub fn pointer_buffer_size(&self) -> u16 {
        self.pointer_buffer_size
    }

    pub fn is_domain(&self) -> bool {
        matches!(self.state.lock().target, Target::Domain { .. })
    }

    /// Number of live domain objects, 0 for plain sessions
    pub fn domain_object_count(&self) -> usize {
        match &self.state.lock().target {
            Target::Domain { objects, .. } => objects.len(),
            Target::Object(_) => 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Name of the session object (object 1 for domains)
    pub fn service_name(&self) -> String {
        match &self.state.lock().target {
            Target::Object(service) => service.service_name().to_string(),
            Target::Domain { objects, .. } => objects
                .values()
                .next()
                .map_or_else(|| "<empty domain>".to_string(), |service| service.service_name().to_string()),
        }
    }

    /// Handle one request from the client's message buffer
    ///
    /// Returns the response message, or `None` for Close requests.
    /// Malformed messages and bad buffer descriptors fail the call itself
    /// before any service code runs.
    pub fn handle_request(
        self: &Arc<Self>,
        kernel: &KernelCore,
        process: &Arc<KProcess>,
        bytes: &[u8],
    ) -> KernelResult<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(KernelError::SessionClosed);
        }
        let request = parse_request(bytes, self.is_domain()).map_err(|err| {
            debug!("Rejected IPC message from process {}: {}", process.pid(), err);
            KernelError::Result(err.result_code())
        })?;
        validate_buffers(process, &request)?;

        let response = match request.command_type {
            CommandType::Close => {
                self.close();
                debug!("Session to {} closed by process {}", self.service_name(), process.pid());
                return Ok(None);
            }
            CommandType::Invalid => return Err(KernelError::Result(ResultCode::CMIF_INVALID_HEADER)),
            command_type if command_type.is_control() => self.handle_control(process, &request),
            _ => self.handle_service_request(kernel, process, &request)?,
        };

        let bytes = response
            .encode()
            .map_err(|err| KernelError::Result(err.result_code()))?;
        Ok(Some(bytes))
    }

    fn handle_control(self: &Arc<Self>, process: &Arc<KProcess>, request: &Request) -> Response {
        let mut response = Response::default();
        let outcome = match request.command_id {
            control::CONVERT_CURRENT_OBJECT_TO_DOMAIN => self.convert_to_domain().map(|id| {
                response.payload.push_u32(id);
            }),
            control::COPY_FROM_CURRENT_DOMAIN => self
                .copy_from_domain(process, request)
                .map(|handle| response.move_handles.push(handle)),
            control::CLONE_CURRENT_OBJECT | control::CLONE_CURRENT_OBJECT_EX => self
                .clone_session(process)
                .map(|handle| response.move_handles.push(handle)),
            control::QUERY_POINTER_BUFFER_SIZE => {
                response.payload.push_u16(self.pointer_buffer_size);
                Ok(())
            }
            other => {
                warn!("Unknown control command {}", other);
                Err(ResultCode::CMIF_UNKNOWN_COMMAND_ID)
            }
        };
        match outcome {
            Ok(()) => response,
            Err(code) => Response::error(code, false),
        }
    }

    fn convert_to_domain(&self) -> Result<u32, ResultCode> {
        let mut state = self.state.lock();
        let service = match &state.target {
            Target::Object(service) => Arc::clone(service),
            Target::Domain { .. } => return Err(ResultCode::INVALID_STATE),
        };
        debug!("Session to {} converted to a domain", service.service_name());
        state.target = Target::domain_with(service);
        Ok(1)
    }

    fn copy_from_domain(&self, process: &KProcess, request: &Request) -> Result<Handle, ResultCode> {
        let bytes = request.payload.get(..4).ok_or(ResultCode::CMIF_INVALID_HEADER)?;
        let object_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let service = match &self.state.lock().target {
            Target::Domain { objects, .. } => objects
                .get(&object_id)
                .cloned()
                .ok_or(ResultCode::CMIF_TARGET_NOT_FOUND)?,
            Target::Object(_) => return Err(ResultCode::INVALID_STATE),
        };
        self.open_for(process, Target::Object(service))
    }

    fn clone_session(&self, process: &KProcess) -> Result<Handle, ResultCode> {
        let target = self.state.lock().target.clone();
        self.open_for(process, target)
    }

    /// Open a session on `target` and hand it to the client
    fn open_for(&self, process: &KProcess, target: Target) -> Result<Handle, ResultCode> {
        let session = KSession::with_target(
            process.pid(),
            target,
            Arc::clone(process.resource_limit()),
            self.pointer_buffer_size,
        )?;
        Ok(process.add_handle(KernelObject::Session(Arc::new(session)))?)
    }

    fn handle_service_request(
        self: &Arc<Self>,
        kernel: &KernelCore,
        process: &Arc<KProcess>,
        request: &Request,
    ) -> KernelResult<Response> {
        let is_domain = request.domain.is_some();
        let (service, inputs) = match self.resolve_target(request) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return Ok(Response::error(ResultCode::SUCCESS, is_domain)),
            Err(code) => return Ok(Response::error(code, is_domain)),
        };

        let copy_objects = request
            .copy_handles
            .iter()
            .map(|&handle| match handle {
                CURRENT_PROCESS_HANDLE => Ok(KernelObject::Process(Arc::clone(process))),
                _ => process.handle_object(handle),
            })
            .collect::<KernelResult<Vec<_>>>()?;
        // Moved handles stay in the client until the request succeeds
        let move_objects = request
            .move_handles
            .iter()
            .map(|&handle| process.handle_object(handle))
            .collect::<KernelResult<Vec<_>>>()?;

        let mut ctx = RequestContext::new(kernel, process, request, copy_objects, move_objects, inputs);
        let outcome = service
            .handle_request(&mut ctx)
            .and_then(|()| self.deliver(process, &mut ctx, is_domain));
        drop(ctx);

        if outcome.is_ok() {
            for &handle in &request.move_handles {
                if let Err(err) = process.take_handle(handle) {
                    warn!("Process {} lost moved handle {:#010x}: {}", process.pid(), handle, err);
                }
            }
        }

        debug!(
            "{}: command {} from process {} -> {:?}",
            service.service_name(),
            request.command_id,
            process.pid(),
            outcome.as_ref().err().copied().unwrap_or(ResultCode::SUCCESS)
        );
        Ok(outcome.unwrap_or_else(|code| Response::error(code, is_domain)))
    }

    /// Service object and domain input objects addressed by a request
    ///
    /// `None` means the request was fully handled here (CloseVirtualHandle).
    #[allow(clippy::type_complexity)]
    fn resolve_target(&self, request: &Request) -> Result<Option<(Arc<dyn IpcService>, Vec<Arc<dyn IpcService>>)>, ResultCode> {
        let mut state = self.state.lock();
        match (&mut state.target, &request.domain) {
            (Target::Object(service), None) => Ok(Some((Arc::clone(service), Vec::new()))),
            (Target::Domain { objects, .. }, Some(header)) => match header.command {
                DomainCommand::CloseVirtualHandle => {
                    objects
                        .remove(&header.object_id)
                        .ok_or(ResultCode::CMIF_TARGET_NOT_FOUND)?;
                    debug!("Closed domain object {}", header.object_id);
                    Ok(None)
                }
                DomainCommand::SendMessage => {
                    let service = objects
                        .get(&header.object_id)
                        .cloned()
                        .ok_or(ResultCode::CMIF_TARGET_NOT_FOUND)?;
                    let inputs = request
                        .domain_objects
                        .iter()
                        .map(|id| objects.get(id).cloned().ok_or(ResultCode::CMIF_TARGET_NOT_FOUND))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Some((service, inputs)))
                }
            },
            _ => Err(ResultCode::CMIF_INVALID_HEADER),
        }
    }

    /// Install the handler's output objects in the client
    fn deliver(&self, process: &KProcess, ctx: &mut RequestContext<'_>, is_domain: bool) -> Result<Response, ResultCode> {
        let mut added: Vec<Handle> = Vec::new();
        let result = self.install_objects(process, ctx, is_domain, &mut added);
        if result.is_err() {
            for handle in added {
                // Undo partial delivery
                let _ = process.close_handle(handle);
            }
        }
        result
    }

    fn install_objects(
        &self,
        process: &KProcess,
        ctx: &mut RequestContext<'_>,
        is_domain: bool,
        added: &mut Vec<Handle>,
    ) -> Result<Response, ResultCode> {
        let mut copy_handles = Vec::with_capacity(ctx.out_copy.len());
        for object in ctx.out_copy.drain(..) {
            let handle = process.add_handle(object)?;
            added.push(handle);
            copy_handles.push(handle);
        }
        let mut move_handles = Vec::with_capacity(ctx.out_move.len());
        for object in ctx.out_move.drain(..) {
            let handle = process.add_handle(object)?;
            added.push(handle);
            move_handles.push(handle);
        }

        let interfaces: Vec<Arc<dyn IpcService>> = ctx.out_interfaces.drain(..).collect();
        let domain_objects = if is_domain {
            Some(self.add_domain_objects(interfaces)?)
        } else {
            for service in interfaces {
                let handle = self.open_for(process, Target::Object(service))?;
                added.push(handle);
                move_handles.push(handle);
            }
            None
        };

        Ok(Response {
            result: ResultCode::SUCCESS,
            payload: std::mem::take(&mut ctx.output),
            copy_handles,
            move_handles,
            domain_objects,
        })
    }

    fn add_domain_objects(&self, services: Vec<Arc<dyn IpcService>>) -> Result<Vec<u32>, ResultCode> {
        let mut state = self.state.lock();
        let Target::Domain { objects, next_id } = &mut state.target else {
            return Err(ResultCode::INVALID_STATE);
        };
        if objects.len() + services.len() > MAX_DOMAIN_OBJECTS {
            return Err(ResultCode::HIPC_OUT_OF_DOMAINS);
        }
        let mut ids = Vec::with_capacity(services.len());
        for service in services {
            let id = *next_id;
            *next_id += 1;
            objects.insert(id, service);
            ids.push(id);
        }
        Ok(ids)
    }
}

/// Buffers must lie in mapped memory with the access they are used for
fn validate_buffers(process: &KProcess, request: &Request) -> KernelResult<()> {
    let page_table = process.page_table();
    let check = |address, size, permission| {
        if size == 0 {
            return Ok(());
        }
        page_table
            .check_range(address, size, permission)
            .map_err(|_| KernelError::Result(ResultCode::INVALID_POINTER))
    };
    for desc in &request.x_buffers {
        check(desc.address, desc.size as u64, MemoryPermission::READ)?;
    }
    for desc in &request.a_buffers {
        check(desc.address, desc.size, MemoryPermission::READ)?;
    }
    for desc in request.b_buffers.iter().chain(&request.w_buffers) {
        check(desc.address, desc.size, MemoryPermission::READ | MemoryPermission::WRITE)?;
    }
    for desc in &request.c_buffers {
        check(desc.address, desc.size as u64, MemoryPermission::WRITE)?;
    }
    Ok(())
}

impl Drop for KSession {
    fn drop(&mut self) {
        self.limit.release(LimitableResource::Sessions, 1);
    }
}

impl std::fmt::Debug for KSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KSession")
            .field("owner_pid", &self.owner_pid)
            .field("service", &self.service_name())
            .field("domain", &self.is_domain())
            .field("closed", &self.is_closed())
            .finish()
    }
}
