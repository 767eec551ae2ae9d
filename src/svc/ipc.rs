/*!
 * IPC Syscalls
 * Named ports and synchronous requests
 */

use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::{Handle, KernelResult, VAddr};
use crate::kernel::{KernelObject, ThreadContext, MAX_PORT_NAME_LEN};
use log::debug;

pub fn connect_to_named_port(ctx: &ThreadContext, name: &str) -> KernelResult<Handle> {
    let process = ctx.process();
    let session = ctx.kernel().connect_to_named_port(process, name)?;
    let handle = process.add_handle(KernelObject::Session(session))?;
    debug!("Process {} connected to port {} as {:#010x}", process.pid(), name, handle);
    Ok(handle)
}

/// ConnectToNamedPort with the name read from guest memory
pub fn connect_to_named_port_at(ctx: &ThreadContext, name_address: VAddr) -> KernelResult<Handle> {
    let name = ctx
        .process()
        .page_table()
        .read_c_string(name_address, MAX_PORT_NAME_LEN + 1)
        .map_err(|_| KernelError::InvalidPointer(name_address))?;
    if name.len() > MAX_PORT_NAME_LEN {
        return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
    }
    connect_to_named_port(ctx, &name)
}

/// Send the message in the caller's TLS buffer; the response overwrites it
pub fn send_sync_request(ctx: &ThreadContext, handle: Handle) -> KernelResult<()> {
    let object = ctx.process().get_object(handle, ctx.thread())?;
    let session = object.as_session().ok_or(KernelError::InvalidHandle(handle))?;
    let message = ctx.read_message()?;
    if let Some(response) = session.handle_request(ctx.kernel(), ctx.process(), &message)? {
        ctx.write_message(&response)?;
    }
    Ok(())
}
