/*!
 * Information Syscalls
 * GetInfo, system tick, debug output and Break
 */

use crate::core::errors::KernelError;
use crate::core::types::{Handle, KernelResult, VAddr};
use crate::kernel::{KProcess, KernelObject, LimitableResource, ThreadContext};
use log::{info, warn};
use std::sync::Arc;
use uuid::Uuid;

/// GetInfo ids
pub mod info_id {
    pub const CORE_MASK: u32 = 0;
    pub const PRIORITY_MASK: u32 = 1;
    pub const ALIAS_REGION_ADDRESS: u32 = 2;
    pub const ALIAS_REGION_SIZE: u32 = 3;
    pub const HEAP_REGION_ADDRESS: u32 = 4;
    pub const HEAP_REGION_SIZE: u32 = 5;
    pub const TOTAL_MEMORY_SIZE: u32 = 6;
    pub const USED_MEMORY_SIZE: u32 = 7;
    pub const DEBUGGER_ATTACHED: u32 = 8;
    pub const RANDOM_ENTROPY: u32 = 11;
    pub const ASLR_REGION_ADDRESS: u32 = 12;
    pub const ASLR_REGION_SIZE: u32 = 13;
    pub const STACK_REGION_ADDRESS: u32 = 14;
    pub const STACK_REGION_SIZE: u32 = 15;
    pub const PROGRAM_ID: u32 = 18;
}

/// Break reasons with this bit set are notifications and return to the caller
const BREAK_NOTIFICATION_ONLY: u64 = 0x8000_0000;

/// Longest debug string accepted by OutputDebugString
const MAX_DEBUG_STRING_LEN: u64 = 0x1000;

fn target_process(ctx: &ThreadContext, handle: Handle) -> KernelResult<Arc<KProcess>> {
    match ctx.process().get_object(handle, ctx.thread())? {
        KernelObject::Process(process) => Ok(process),
        _ => Err(KernelError::InvalidHandle(handle)),
    }
}

pub fn get_info(ctx: &ThreadContext, id: u32, handle: Handle, sub_id: u64) -> KernelResult<u64> {
    match id {
        info_id::DEBUGGER_ATTACHED => {
            if handle != 0 {
                return Err(KernelError::InvalidHandle(handle));
            }
            Ok(0)
        }
        info_id::RANDOM_ENTROPY => {
            if handle != 0 {
                return Err(KernelError::InvalidHandle(handle));
            }
            if sub_id > 3 {
                return Err(KernelError::OutOfRange(format!("entropy index {}", sub_id)));
            }
            Ok(Uuid::new_v4().as_u128() as u64)
        }
        _ => {
            if sub_id != 0 {
                return Err(KernelError::OutOfRange(format!("sub id {}", sub_id)));
            }
            let process = target_process(ctx, handle)?;
            process_info(&process, id)
        }
    }
}

fn process_info(process: &KProcess, id: u32) -> KernelResult<u64> {
    let layout = process.page_table().layout();
    Ok(match id {
        info_id::CORE_MASK => process.core_mask(),
        info_id::PRIORITY_MASK => u64::MAX,
        info_id::ALIAS_REGION_ADDRESS => layout.alias.base,
        info_id::ALIAS_REGION_SIZE => layout.alias.size,
        info_id::HEAP_REGION_ADDRESS => layout.heap.base,
        info_id::HEAP_REGION_SIZE => layout.heap.size,
        info_id::TOTAL_MEMORY_SIZE => process.resource_limit().limit(LimitableResource::PhysicalMemory),
        info_id::USED_MEMORY_SIZE => process.page_table().mapped_size(),
        info_id::ASLR_REGION_ADDRESS => layout.code.base,
        info_id::ASLR_REGION_SIZE => layout.end() - layout.code.base,
        info_id::STACK_REGION_ADDRESS => layout.stack.base,
        info_id::STACK_REGION_SIZE => layout.stack.size,
        info_id::PROGRAM_ID => process.program_id(),
        other => {
            warn!("GetInfo: unknown id {}", other);
            return Err(KernelError::InvalidEnumValue(other as u64));
        }
    })
}

pub fn get_system_tick(ctx: &ThreadContext) -> KernelResult<u64> {
    Ok(ctx.kernel().system_tick())
}

pub fn output_debug_string(ctx: &ThreadContext, address: VAddr, len: u64) -> KernelResult<()> {
    let len = len.min(MAX_DEBUG_STRING_LEN) as usize;
    let bytes = ctx
        .read_memory(address, len)
        .map_err(|_| KernelError::InvalidPointer(address))?;
    let text = String::from_utf8_lossy(&bytes);
    info!("[guest {}:{}] {}", ctx.process().pid(), ctx.thread().tid(), text.trim_end());
    Ok(())
}

/// Break: notifications return, anything else terminates the process
pub fn break_execution(ctx: &ThreadContext, reason: u64, arg1: u64, arg2: u64) -> KernelResult<()> {
    warn!(
        "Process {} thread {} called Break (reason {:#x}, {:#x}, {:#x})",
        ctx.process().pid(),
        ctx.thread().tid(),
        reason,
        arg1,
        arg2
    );
    if reason & BREAK_NOTIFICATION_ONLY != 0 {
        return Ok(());
    }
    ctx.kernel().terminate_process(ctx.process().pid())?;
    Err(KernelError::TerminationRequested)
}
