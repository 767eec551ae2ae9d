/*!
 * Syscall ABI
 * Register-level dispatch of aarch64 `svc` instructions
 *
 * Arguments are read from the thread's register file and results written
 * back: x0 always receives the result code, outputs follow in x1.. as the
 * console's ABI defines them. Guest-visible failures only change x0; the
 * returned `Err` is reserved for `TerminationRequested`, which the
 * execution engine must propagate to end the thread.
 */

pub mod info;
pub mod ipc;
pub mod memory;
pub mod sync;
pub mod thread;

use crate::core::errors::{KernelError, ResultCode};
use crate::core::types::KernelResult;
use crate::kernel::ThreadContext;
use log::warn;

/// Syscall numbers
pub mod number {
    pub const SET_HEAP_SIZE: u32 = 0x01;
    pub const SET_MEMORY_PERMISSION: u32 = 0x02;
    pub const QUERY_MEMORY: u32 = 0x06;
    pub const EXIT_PROCESS: u32 = 0x07;
    pub const CREATE_THREAD: u32 = 0x08;
    pub const START_THREAD: u32 = 0x09;
    pub const EXIT_THREAD: u32 = 0x0A;
    pub const SLEEP_THREAD: u32 = 0x0B;
    pub const GET_THREAD_PRIORITY: u32 = 0x0C;
    pub const SET_THREAD_PRIORITY: u32 = 0x0D;
    pub const GET_THREAD_CORE_MASK: u32 = 0x0E;
    pub const SET_THREAD_CORE_MASK: u32 = 0x0F;
    pub const GET_CURRENT_PROCESSOR_NUMBER: u32 = 0x10;
    pub const SIGNAL_EVENT: u32 = 0x11;
    pub const CLEAR_EVENT: u32 = 0x12;
    pub const MAP_SHARED_MEMORY: u32 = 0x13;
    pub const UNMAP_SHARED_MEMORY: u32 = 0x14;
    pub const CLOSE_HANDLE: u32 = 0x16;
    pub const RESET_SIGNAL: u32 = 0x17;
    pub const WAIT_SYNCHRONIZATION: u32 = 0x18;
    pub const CANCEL_SYNCHRONIZATION: u32 = 0x19;
    pub const ARBITRATE_LOCK: u32 = 0x1A;
    pub const ARBITRATE_UNLOCK: u32 = 0x1B;
    pub const WAIT_PROCESS_WIDE_KEY_ATOMIC: u32 = 0x1C;
    pub const SIGNAL_PROCESS_WIDE_KEY: u32 = 0x1D;
    pub const GET_SYSTEM_TICK: u32 = 0x1E;
    pub const CONNECT_TO_NAMED_PORT: u32 = 0x1F;
    pub const SEND_SYNC_REQUEST: u32 = 0x21;
    pub const GET_PROCESS_ID: u32 = 0x24;
    pub const GET_THREAD_ID: u32 = 0x25;
    pub const BREAK: u32 = 0x26;
    pub const OUTPUT_DEBUG_STRING: u32 = 0x27;
    pub const GET_INFO: u32 = 0x29;
    pub const SET_THREAD_ACTIVITY: u32 = 0x32;
    pub const WAIT_FOR_ADDRESS: u32 = 0x34;
    pub const SIGNAL_TO_ADDRESS: u32 = 0x35;
    pub const CREATE_EVENT: u32 = 0x45;
    pub const CREATE_SHARED_MEMORY: u32 = 0x50;
}

/// Write the result code and outputs of a finished syscall
fn complete<T>(ctx: &mut ThreadContext, result: KernelResult<T>, outputs: impl FnOnce(&mut [u64; 31], T)) -> KernelResult<()> {
    match result {
        Ok(value) => {
            ctx.regs[0] = ResultCode::SUCCESS.raw() as u64;
            outputs(&mut ctx.regs, value);
            Ok(())
        }
        Err(KernelError::TerminationRequested) => {
            ctx.regs[0] = ResultCode::TERMINATION_REQUESTED.raw() as u64;
            Err(KernelError::TerminationRequested)
        }
        Err(err) => {
            ctx.regs[0] = err.result_code().raw() as u64;
            Ok(())
        }
    }
}

fn no_outputs(_: &mut [u64; 31], _: ()) {}

/// Dispatch syscall `svc` against the register file of `ctx`
pub fn call(ctx: &mut ThreadContext, svc: u32) -> KernelResult<()> {
    let x = ctx.regs;
    match svc {
        number::SET_HEAP_SIZE => {
            let result = ctx.syscall("SetHeapSize", |ctx| memory::set_heap_size(ctx, x[1]));
            complete(ctx, result, |regs, address| regs[1] = address)
        }
        number::SET_MEMORY_PERMISSION => {
            let result = ctx.syscall("SetMemoryPermission", |ctx| {
                memory::set_memory_permission(ctx, x[0], x[1], x[2] as u32)
            });
            complete(ctx, result, no_outputs)
        }
        number::QUERY_MEMORY => {
            let result = ctx.syscall("QueryMemory", |ctx| memory::query_memory_into(ctx, x[0], x[2]));
            // page info
            complete(ctx, result, |regs, ()| regs[1] = 0)
        }
        number::EXIT_PROCESS => {
            let result = ctx.syscall("ExitProcess", thread::exit_process);
            complete(ctx, result, no_outputs)
        }
        number::CREATE_THREAD => {
            let result = ctx.syscall("CreateThread", |ctx| {
                thread::create_thread(ctx, x[1], x[2], x[3], x[4] as u32, x[5] as i32)
            });
            complete(ctx, result, |regs, handle| regs[1] = handle as u64)
        }
        number::START_THREAD => {
            let result = ctx.syscall("StartThread", |ctx| thread::start_thread(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::EXIT_THREAD => {
            let result = ctx.syscall("ExitThread", thread::exit_thread);
            complete(ctx, result, no_outputs)
        }
        number::SLEEP_THREAD => {
            let result = ctx.syscall("SleepThread", |ctx| thread::sleep_thread(ctx, x[0] as i64));
            complete(ctx, result, no_outputs)
        }
        number::GET_THREAD_PRIORITY => {
            let result = ctx.syscall("GetThreadPriority", |ctx| thread::get_thread_priority(ctx, x[1] as u32));
            complete(ctx, result, |regs, priority| regs[1] = priority as u64)
        }
        number::SET_THREAD_PRIORITY => {
            let result = ctx.syscall("SetThreadPriority", |ctx| {
                thread::set_thread_priority(ctx, x[0] as u32, x[1] as u32)
            });
            complete(ctx, result, no_outputs)
        }
        number::GET_THREAD_CORE_MASK => {
            let result = ctx.syscall("GetThreadCoreMask", |ctx| thread::get_thread_core_mask(ctx, x[2] as u32));
            complete(ctx, result, |regs, (core, mask)| {
                regs[1] = core as u32 as u64;
                regs[2] = mask;
            })
        }
        number::SET_THREAD_CORE_MASK => {
            let result = ctx.syscall("SetThreadCoreMask", |ctx| {
                thread::set_thread_core_mask(ctx, x[0] as u32, x[1] as i32, x[2])
            });
            complete(ctx, result, no_outputs)
        }
        number::GET_CURRENT_PROCESSOR_NUMBER => {
            let result = ctx.syscall("GetCurrentProcessorNumber", thread::get_current_processor_number);
            // The result itself is returned in x0
            match result {
                Ok(core) => {
                    ctx.regs[0] = core as u64;
                    Ok(())
                }
                Err(err) => complete(ctx, Err::<(), _>(err), no_outputs),
            }
        }
        number::SIGNAL_EVENT => {
            let result = ctx.syscall("SignalEvent", |ctx| sync::signal_event(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::CLEAR_EVENT => {
            let result = ctx.syscall("ClearEvent", |ctx| sync::clear_event(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::MAP_SHARED_MEMORY => {
            let result = ctx.syscall("MapSharedMemory", |ctx| {
                memory::map_shared_memory(ctx, x[0] as u32, x[1], x[2], x[3] as u32)
            });
            complete(ctx, result, no_outputs)
        }
        number::UNMAP_SHARED_MEMORY => {
            let result = ctx.syscall("UnmapSharedMemory", |ctx| {
                memory::unmap_shared_memory(ctx, x[0] as u32, x[1], x[2])
            });
            complete(ctx, result, no_outputs)
        }
        number::CLOSE_HANDLE => {
            let result = ctx.syscall("CloseHandle", |ctx| sync::close_handle(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::RESET_SIGNAL => {
            let result = ctx.syscall("ResetSignal", |ctx| sync::reset_signal(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::WAIT_SYNCHRONIZATION => {
            let result = ctx.syscall("WaitSynchronization", |ctx| {
                let handles = sync::read_handles(ctx, x[1], x[2] as usize)?;
                sync::wait_synchronization(ctx, &handles, x[3] as i64)
            });
            complete(ctx, result, |regs, index| regs[1] = index as u64)
        }
        number::CANCEL_SYNCHRONIZATION => {
            let result = ctx.syscall("CancelSynchronization", |ctx| sync::cancel_synchronization(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::ARBITRATE_LOCK => {
            let result = ctx.syscall("ArbitrateLock", |ctx| {
                sync::arbitrate_lock(ctx, x[0] as u32, x[1], x[2] as u32)
            });
            complete(ctx, result, no_outputs)
        }
        number::ARBITRATE_UNLOCK => {
            let result = ctx.syscall("ArbitrateUnlock", |ctx| sync::arbitrate_unlock(ctx, x[0]));
            complete(ctx, result, no_outputs)
        }
        number::WAIT_PROCESS_WIDE_KEY_ATOMIC => {
            let result = ctx.syscall("WaitProcessWideKeyAtomic", |ctx| {
                sync::wait_process_wide_key_atomic(ctx, x[0], x[1], x[2] as u32, x[3] as i64)
            });
            complete(ctx, result, no_outputs)
        }
        number::SIGNAL_PROCESS_WIDE_KEY => {
            let result = ctx.syscall("SignalProcessWideKey", |ctx| {
                sync::signal_process_wide_key(ctx, x[0], x[1] as i32)
            });
            complete(ctx, result, no_outputs)
        }
        number::GET_SYSTEM_TICK => {
            let result = ctx.syscall("GetSystemTick", info::get_system_tick);
            match result {
                Ok(tick) => {
                    ctx.regs[0] = tick;
                    Ok(())
                }
                Err(err) => complete(ctx, Err::<(), _>(err), no_outputs),
            }
        }
        number::CONNECT_TO_NAMED_PORT => {
            let result = ctx.syscall("ConnectToNamedPort", |ctx| ipc::connect_to_named_port_at(ctx, x[1]));
            complete(ctx, result, |regs, handle| regs[1] = handle as u64)
        }
        number::SEND_SYNC_REQUEST => {
            let result = ctx.syscall("SendSyncRequest", |ctx| ipc::send_sync_request(ctx, x[0] as u32));
            complete(ctx, result, no_outputs)
        }
        number::GET_PROCESS_ID => {
            let result = ctx.syscall("GetProcessId", |ctx| thread::get_process_id(ctx, x[1] as u32));
            complete(ctx, result, |regs, pid| regs[1] = pid)
        }
        number::GET_THREAD_ID => {
            let result = ctx.syscall("GetThreadId", |ctx| thread::get_thread_id(ctx, x[1] as u32));
            complete(ctx, result, |regs, tid| regs[1] = tid)
        }
        number::BREAK => {
            let result = ctx.syscall("Break", |ctx| info::break_execution(ctx, x[0], x[1], x[2]));
            complete(ctx, result, no_outputs)
        }
        number::OUTPUT_DEBUG_STRING => {
            let result = ctx.syscall("OutputDebugString", |ctx| info::output_debug_string(ctx, x[0], x[1]));
            complete(ctx, result, no_outputs)
        }
        number::GET_INFO => {
            let result = ctx.syscall("GetInfo", |ctx| info::get_info(ctx, x[1] as u32, x[2] as u32, x[3]));
            complete(ctx, result, |regs, value| regs[1] = value)
        }
        number::SET_THREAD_ACTIVITY => {
            let result = ctx.syscall("SetThreadActivity", |ctx| {
                thread::set_thread_activity(ctx, x[0] as u32, x[1] as u32)
            });
            complete(ctx, result, no_outputs)
        }
        number::WAIT_FOR_ADDRESS => {
            let result = ctx.syscall("WaitForAddress", |ctx| {
                sync::wait_for_address(ctx, x[0], x[1] as u32, x[2] as i32, x[3] as i64)
            });
            complete(ctx, result, no_outputs)
        }
        number::SIGNAL_TO_ADDRESS => {
            let result = ctx.syscall("SignalToAddress", |ctx| {
                sync::signal_to_address(ctx, x[0], x[1] as u32, x[2] as i32, x[3] as i32)
            });
            complete(ctx, result, no_outputs)
        }
        number::CREATE_EVENT => {
            let result = ctx.syscall("CreateEvent", sync::create_event);
            complete(ctx, result, |regs, (writable, readable)| {
                regs[1] = writable as u64;
                regs[2] = readable as u64;
            })
        }
        number::CREATE_SHARED_MEMORY => {
            let result = ctx.syscall("CreateSharedMemory", |ctx| {
                memory::create_shared_memory(ctx, x[1], x[2] as u32, x[3] as u32)
            });
            complete(ctx, result, |regs, handle| regs[1] = handle as u64)
        }
        other => {
            warn!(
                "Unimplemented syscall 0x{:02X} from thread {} (pc 0x{:x})",
                other,
                ctx.thread().tid(),
                ctx.pc
            );
            ctx.regs[0] = ResultCode::NOT_IMPLEMENTED.raw() as u64;
            Ok(())
        }
    }
}
