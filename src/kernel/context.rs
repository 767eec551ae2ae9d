/*!
 * Thread Context
 * Explicit per-thread kernel context handed to execution engines
 *
 * Every kernel entry from guest code goes through a ThreadContext. It carries
 * the kernel, the owning process and the current thread, plus the aarch64
 * register file that the syscall ABI reads and writes.
 */

use super::process::KProcess;
use super::thread::KThread;
use super::KernelCore;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::IPC_MESSAGE_SIZE;
use crate::core::types::{Handle, KernelResult, VAddr};
use crate::memory::MemoryInfo;
use crate::monitoring::SyscallSpan;
use crate::svc;
use std::sync::Arc;
use std::time::Duration;

/// Execution frame of one guest thread
pub struct ThreadContext {
    kernel: Arc<KernelCore>,
    process: Arc<KProcess>,
    thread: Arc<KThread>,
    /// General purpose registers x0-x30
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
}

impl ThreadContext {
    /// Initial frame: pc at the entry point, x0 the argument, x1 the main thread handle
    pub(crate) fn new(kernel: Arc<KernelCore>, process: Arc<KProcess>, thread: Arc<KThread>) -> Self {
        let params = thread.params();
        let mut regs = [0u64; 31];
        regs[0] = params.argument;
        if let Some(handle) = thread.main_handle() {
            regs[1] = handle as u64;
        }
        Self {
            kernel,
            process,
            thread,
            regs,
            sp: params.stack_top,
            pc: params.entry,
        }
    }

    pub fn kernel(&self) -> &Arc<KernelCore> {
        &self.kernel
    }

    pub fn process(&self) -> &Arc<KProcess> {
        &self.process
    }

    pub fn thread(&self) -> &Arc<KThread> {
        &self.thread
    }

    /// Run one kernel operation as a syscall
    ///
    /// The operation is traced, refused once termination was requested, and
    /// followed by a preemption point.
    pub fn syscall<T, F>(&self, name: &'static str, op: F) -> KernelResult<T>
    where
        F: FnOnce(&Self) -> KernelResult<T>,
    {
        let span = SyscallSpan::new(name, self.process.pid(), self.thread.tid());
        let _entered = span.enter();
        let scheduler = self.kernel.scheduler();
        if scheduler.is_termination_requested(self.thread.tid()) {
            span.record_result(ResultCode::TERMINATION_REQUESTED);
            return Err(KernelError::TerminationRequested);
        }

        let result = op(self);
        span.record_result(match &result {
            Ok(_) => ResultCode::SUCCESS,
            Err(err) => err.result_code(),
        });
        scheduler.preemption_point(&self.thread)?;
        result
    }

    /// Dispatch syscall `number` using the register file
    pub fn svc(&mut self, number: u32) -> KernelResult<()> {
        svc::call(self, number)
    }

    /// The thread's IPC message buffer (start of its TLS slot)
    pub fn read_message(&self) -> KernelResult<Vec<u8>> {
        Ok(self
            .process
            .page_table()
            .read_bytes(self.thread.tls_address(), IPC_MESSAGE_SIZE)?)
    }

    pub fn write_message(&self, message: &[u8]) -> KernelResult<()> {
        if message.len() > IPC_MESSAGE_SIZE {
            return Err(KernelError::Result(ResultCode::HIPC_MESSAGE_TOO_LARGE));
        }
        Ok(self.process.page_table().write(self.thread.tls_address(), message)?)
    }

    pub fn read_memory(&self, address: VAddr, len: usize) -> KernelResult<Vec<u8>> {
        Ok(self.process.page_table().read_bytes(address, len)?)
    }

    pub fn write_memory(&self, address: VAddr, data: &[u8]) -> KernelResult<()> {
        Ok(self.process.page_table().write(address, data)?)
    }

    pub fn read_u32(&self, address: VAddr) -> KernelResult<u32> {
        Ok(self.process.page_table().read_u32(address)?)
    }

    pub fn write_u32(&self, address: VAddr, value: u32) -> KernelResult<()> {
        Ok(self.process.page_table().write_u32(address, value)?)
    }

    // Typed syscalls for HLE guest code

    pub fn sleep(&self, duration: Duration) -> KernelResult<()> {
        let ns = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        self.syscall("SleepThread", |ctx| svc::thread::sleep_thread(ctx, ns))
    }

    pub fn yield_now(&self) -> KernelResult<()> {
        self.syscall("SleepThread", |ctx| svc::thread::sleep_thread(ctx, 0))
    }

    pub fn create_thread(
        &self,
        entry: VAddr,
        argument: u64,
        stack_top: VAddr,
        priority: u32,
        core_id: i32,
    ) -> KernelResult<Handle> {
        self.syscall("CreateThread", |ctx| {
            svc::thread::create_thread(ctx, entry, argument, stack_top, priority, core_id)
        })
    }

    pub fn start_thread(&self, handle: Handle) -> KernelResult<()> {
        self.syscall("StartThread", |ctx| svc::thread::start_thread(ctx, handle))
    }

    /// End the calling thread; always returns `TerminationRequested` for `?`
    pub fn exit_thread(&self) -> KernelResult<()> {
        self.syscall("ExitThread", svc::thread::exit_thread)
    }

    pub fn set_thread_priority(&self, handle: Handle, priority: u32) -> KernelResult<()> {
        self.syscall("SetThreadPriority", |ctx| svc::thread::set_thread_priority(ctx, handle, priority))
    }

    pub fn current_processor(&self) -> KernelResult<u32> {
        self.syscall("GetCurrentProcessorNumber", svc::thread::get_current_processor_number)
    }

    /// Returns (writable, readable) handles
    pub fn create_event(&self) -> KernelResult<(Handle, Handle)> {
        self.syscall("CreateEvent", svc::sync::create_event)
    }

    pub fn signal_event(&self, handle: Handle) -> KernelResult<()> {
        self.syscall("SignalEvent", |ctx| svc::sync::signal_event(ctx, handle))
    }

    pub fn clear_event(&self, handle: Handle) -> KernelResult<()> {
        self.syscall("ClearEvent", |ctx| svc::sync::clear_event(ctx, handle))
    }

    pub fn close_handle(&self, handle: Handle) -> KernelResult<()> {
        self.syscall("CloseHandle", |ctx| svc::sync::close_handle(ctx, handle))
    }

    pub fn wait_synchronization(&self, handles: &[Handle], timeout_ns: i64) -> KernelResult<usize> {
        self.syscall("WaitSynchronization", |ctx| {
            svc::sync::wait_synchronization(ctx, handles, timeout_ns)
        })
    }

    pub fn cancel_synchronization(&self, handle: Handle) -> KernelResult<()> {
        self.syscall("CancelSynchronization", |ctx| svc::sync::cancel_synchronization(ctx, handle))
    }

    pub fn arbitrate_lock(&self, owner: Handle, address: VAddr, tag: Handle) -> KernelResult<()> {
        self.syscall("ArbitrateLock", |ctx| svc::sync::arbitrate_lock(ctx, owner, address, tag))
    }

    pub fn arbitrate_unlock(&self, address: VAddr) -> KernelResult<()> {
        self.syscall("ArbitrateUnlock", |ctx| svc::sync::arbitrate_unlock(ctx, address))
    }

    pub fn wait_process_wide_key(&self, address: VAddr, key: VAddr, tag: Handle, timeout_ns: i64) -> KernelResult<()> {
        self.syscall("WaitProcessWideKeyAtomic", |ctx| {
            svc::sync::wait_process_wide_key_atomic(ctx, address, key, tag, timeout_ns)
        })
    }

    pub fn signal_process_wide_key(&self, key: VAddr, count: i32) -> KernelResult<()> {
        self.syscall("SignalProcessWideKey", |ctx| svc::sync::signal_process_wide_key(ctx, key, count))
    }

    pub fn wait_for_address(&self, address: VAddr, arbitration: u32, value: i32, timeout_ns: i64) -> KernelResult<()> {
        self.syscall("WaitForAddress", |ctx| {
            svc::sync::wait_for_address(ctx, address, arbitration, value, timeout_ns)
        })
    }

    pub fn signal_to_address(&self, address: VAddr, signal: u32, value: i32, count: i32) -> KernelResult<()> {
        self.syscall("SignalToAddress", |ctx| {
            svc::sync::signal_to_address(ctx, address, signal, value, count)
        })
    }

    pub fn set_heap_size(&self, size: u64) -> KernelResult<VAddr> {
        self.syscall("SetHeapSize", |ctx| svc::memory::set_heap_size(ctx, size))
    }

    pub fn query_memory(&self, address: VAddr) -> KernelResult<MemoryInfo> {
        self.syscall("QueryMemory", |ctx| svc::memory::query_memory(ctx, address))
    }

    pub fn connect_to_named_port(&self, name: &str) -> KernelResult<Handle> {
        self.syscall("ConnectToNamedPort", |ctx| svc::ipc::connect_to_named_port(ctx, name))
    }

    /// Send the message in the TLS buffer; the response replaces it
    pub fn send_sync_request(&self, session: Handle) -> KernelResult<()> {
        self.syscall("SendSyncRequest", |ctx| svc::ipc::send_sync_request(ctx, session))
    }

    pub fn get_info(&self, id: u32, handle: Handle, sub_id: u64) -> KernelResult<u64> {
        self.syscall("GetInfo", |ctx| svc::info::get_info(ctx, id, handle, sub_id))
    }
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("pid", &self.process.pid())
            .field("tid", &self.thread.tid())
            .field("pc", &format_args!("{:#x}", self.pc))
            .field("sp", &format_args!("{:#x}", self.sp))
            .finish()
    }
}
