/*!
 * HLE Kernel
 * Processes, threads, scheduling, handles and synchronization
 */

pub mod address_arbiter;
pub mod condition_variable;
pub mod context;
pub mod event;
pub mod execution;
pub mod handle_table;
pub mod object;
pub mod process;
pub mod resource_limit;
pub mod scheduler;
pub mod synchronization;
pub mod thread;

pub use context::ThreadContext;
pub use event::KEvent;
pub use execution::{ExecutionEngine, HleEntry, HleEntryTable};
pub use handle_table::HandleTable;
pub use object::{KernelObject, ObjectKind, SyncObject};
pub use process::{KProcess, ProcessCreateInfo, ProcessState};
pub use resource_limit::{KResourceLimit, LimitableResource};
pub use scheduler::{KScheduler, SchedulerStats};
pub use thread::{KThread, ThreadParams, ThreadState};

use crate::core::config::KernelConfig;
use crate::core::errors::{KernelError, ResultCode};
use crate::core::limits::{DEFAULT_TRANSFER_MEMORY_LIMIT, GUEST_HOST_STACK_SIZE, LOWEST_PRIORITY, SYSTEM_TICK_FREQUENCY};
use crate::core::types::{CoreMask, FirmwareVersion, KernelResult, Pid, Priority, Tid};
use crate::ipc::{KSession, ServiceFactory, ServiceManager};
use crate::memory::{AddressSpaceLayout, KPageTable, PhysicalMemory};
use crate::monitoring::OperationSpan;
use ahash::RandomState;
use dashmap::DashMap;
use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Core id argument meaning "the process's ideal core"
pub const IDEAL_CORE_USE_PROCESS_VALUE: i32 = -2;

/// Longest named port name, excluding the terminator
pub const MAX_PORT_NAME_LEN: usize = 11;

/// Builder for [`KernelCore`]
#[derive(Default)]
pub struct KernelCoreBuilder {
    config: Option<KernelConfig>,
    engine: Option<Arc<dyn ExecutionEngine>>,
}

impl KernelCoreBuilder {
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> KernelResult<Arc<KernelCore>> {
        let config = self.config.unwrap_or_default();
        config
            .validate()
            .map_err(|err| KernelError::InvalidCombination(err.to_string()))?;
        let engine = self.engine.unwrap_or_else(|| Arc::new(HleEntryTable::new()));
        Ok(Arc::new(KernelCore::new(config, engine)))
    }
}

/// The emulated kernel instance
///
/// Holds no global state: several instances can live in one host process.
pub struct KernelCore {
    config: KernelConfig,
    scheduler: KScheduler,
    physical: Arc<PhysicalMemory>,
    processes: DashMap<Pid, Arc<KProcess>, RandomState>,
    next_pid: AtomicU64,
    next_tid: AtomicU64,
    service_manager: Arc<ServiceManager>,
    named_ports: DashMap<String, Arc<dyn ServiceFactory>, RandomState>,
    engine: Arc<dyn ExecutionEngine>,
    boot_time: Instant,
}

impl KernelCore {
    pub fn builder() -> KernelCoreBuilder {
        KernelCoreBuilder::default()
    }

    fn new(config: KernelConfig, engine: Arc<dyn ExecutionEngine>) -> Self {
        let scheduler = KScheduler::new(config.core_count, config.time_quantum());
        let physical = PhysicalMemory::new(config.physical_memory_size);
        let service_manager = Arc::new(ServiceManager::new(config.firmware_version));

        let named_ports: DashMap<String, Arc<dyn ServiceFactory>, RandomState> =
            DashMap::with_hasher(RandomState::new());
        named_ports.insert("sm:".to_string(), service_manager.port_factory());

        info!(
            "Kernel initialized: {} cores, firmware {}, {} MiB physical memory",
            config.core_count,
            config.firmware_version,
            config.physical_memory_size / (1024 * 1024)
        );

        Self {
            config,
            scheduler,
            physical,
            processes: DashMap::with_hasher(RandomState::new()),
            next_pid: AtomicU64::new(0x51),
            next_tid: AtomicU64::new(1),
            service_manager,
            named_ports,
            engine,
            boot_time: Instant::now(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.config.firmware_version
    }

    pub fn scheduler(&self) -> &KScheduler {
        &self.scheduler
    }

    pub fn physical_memory(&self) -> &Arc<PhysicalMemory> {
        &self.physical
    }

    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.service_manager
    }

    fn all_cores(&self) -> CoreMask {
        if self.config.core_count >= 64 {
            u64::MAX
        } else {
            (1u64 << self.config.core_count) - 1
        }
    }

    /// Create a process and load its image; it runs once started
    pub fn create_process(&self, info: ProcessCreateInfo) -> KernelResult<Arc<KProcess>> {
        let core_mask = info.core_mask & self.all_cores();
        if info.ideal_core >= self.config.core_count || core_mask & (1 << info.ideal_core) == 0 {
            return Err(KernelError::InvalidCoreId(info.ideal_core as i32));
        }
        if info.main_thread_priority > LOWEST_PRIORITY {
            return Err(KernelError::InvalidPriority(info.main_thread_priority as u32));
        }

        let limit = Arc::new(
            KResourceLimit::new()
                .with_limit(LimitableResource::PhysicalMemory, self.config.memory_limit)
                .with_limit(LimitableResource::Threads, self.config.thread_limit)
                .with_limit(LimitableResource::Events, self.config.event_limit)
                .with_limit(LimitableResource::TransferMemories, DEFAULT_TRANSFER_MEMORY_LIMIT)
                .with_limit(LimitableResource::Sessions, self.config.session_limit),
        );
        let page_table = KPageTable::new(AddressSpaceLayout::default(), Arc::clone(&self.physical), Arc::clone(&limit));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let info = ProcessCreateInfo { core_mask, ..info };
        let process = Arc::new(KProcess::new(
            pid,
            &info,
            page_table,
            limit,
            self.config.handle_table_capacity,
        ));
        process.load_image(&info)?;

        self.processes.insert(pid, Arc::clone(&process));
        info!("Created process {} ({}), program id {:#018x}", pid, info.name, info.program_id);
        Ok(process)
    }

    /// Map the main stack, create the main thread and start it
    ///
    /// The main thread receives x0 = 0 and x1 = a handle to itself.
    pub fn start_process(self: &Arc<Self>, process: &Arc<KProcess>, stack_size: u64) -> KernelResult<Arc<KThread>> {
        if process.state() != ProcessState::Created {
            return Err(KernelError::Result(ResultCode::INVALID_STATE));
        }
        let stack_top = process.map_stack(stack_size)?;
        let params = ThreadParams {
            entry: process.code_address(),
            argument: 0,
            stack_top,
        };
        let thread = self.create_thread(
            process,
            params,
            process.main_thread_priority() as u32,
            IDEAL_CORE_USE_PROCESS_VALUE,
        )?;
        let handle = process.add_handle(KernelObject::Thread(Arc::clone(&thread)))?;
        thread.set_main_handle(handle);
        process.mark_running();
        self.start_thread(&thread)?;
        Ok(thread)
    }

    /// Create a thread in the Created state
    ///
    /// Fails with LimitReached when the process thread limit is exhausted;
    /// no thread is created in that case.
    pub fn create_thread(
        &self,
        process: &Arc<KProcess>,
        params: ThreadParams,
        priority: u32,
        core_id: i32,
    ) -> KernelResult<Arc<KThread>> {
        if priority > LOWEST_PRIORITY as u32 {
            return Err(KernelError::InvalidPriority(priority));
        }
        let core = if core_id == IDEAL_CORE_USE_PROCESS_VALUE {
            process.ideal_core()
        } else {
            usize::try_from(core_id).map_err(|_| KernelError::InvalidCoreId(core_id))?
        };
        if core >= self.config.core_count || process.core_mask() & (1 << core) == 0 {
            return Err(KernelError::InvalidCoreId(core_id));
        }
        if matches!(process.state(), ProcessState::Exiting | ProcessState::Exited) {
            return Err(KernelError::TerminationRequested);
        }

        process.resource_limit().reserve(LimitableResource::Threads, 1)?;
        let tls_address = match process.allocate_tls() {
            Ok(address) => address,
            Err(err) => {
                process.resource_limit().release(LimitableResource::Threads, 1);
                return Err(err);
            }
        };

        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let thread = Arc::new(KThread::new(tid, process, params, tls_address));
        self.scheduler
            .register(&thread, priority as Priority, core, 1 << core);
        process.add_thread(Arc::clone(&thread));
        info!(
            "Created thread {} in process {}: entry 0x{:x}, priority {}, core {}",
            tid,
            process.pid(),
            params.entry,
            priority,
            core
        );
        Ok(thread)
    }

    /// Make a created thread runnable on its own host thread
    pub fn start_thread(self: &Arc<Self>, thread: &Arc<KThread>) -> KernelResult<()> {
        let process = thread
            .process()
            .ok_or(KernelError::TerminationRequested)?;
        self.scheduler.start(thread.tid())?;

        let kernel = Arc::clone(self);
        let guest = Arc::clone(thread);
        let spawned = std::thread::Builder::new()
            .name(thread.host_name())
            .stack_size(GUEST_HOST_STACK_SIZE)
            .spawn(move || kernel.run_thread(process, guest));

        match spawned {
            Ok(handle) => {
                thread.set_host(handle);
                Ok(())
            }
            Err(err) => {
                error!("Failed to spawn host thread for {}: {}", thread.host_name(), err);
                self.scheduler.request_thread_termination(thread.tid());
                if let Some(process) = thread.process() {
                    self.finish_thread(&process, thread);
                }
                Err(KernelError::Result(ResultCode::OUT_OF_RESOURCE))
            }
        }
    }

    /// Host thread body
    fn run_thread(self: Arc<Self>, process: Arc<KProcess>, thread: Arc<KThread>) {
        let result = self.scheduler.enter(&thread).and_then(|()| {
            let mut ctx = ThreadContext::new(Arc::clone(&self), Arc::clone(&process), Arc::clone(&thread));
            let engine = Arc::clone(&self.engine);
            engine.run(&mut ctx)
        });

        match result {
            Ok(()) | Err(KernelError::TerminationRequested) => {}
            Err(err) => {
                warn!("Thread {} of process {} faulted: {}", thread.tid(), process.pid(), err);
                if let Err(err) = self.terminate_process(process.pid()) {
                    warn!("Could not terminate process {}: {}", process.pid(), err);
                }
            }
        }
        self.finish_thread(&process, &thread);
    }

    pub(crate) fn finish_thread(&self, process: &Arc<KProcess>, thread: &KThread) {
        self.scheduler.exit(thread);
        if process.on_thread_exit(thread) {
            self.finalize_process(process);
        }
    }

    /// Unregister the process, then release its resources and wake its waiters
    ///
    /// Anyone woken by the exit no longer finds the pid.
    fn finalize_process(&self, process: &KProcess) {
        self.processes.remove(&process.pid());
        process.finalize(&self.scheduler);
    }

    /// Flag the calling thread for exit (ExitThread)
    pub(crate) fn exit_thread(&self, tid: Tid) {
        self.scheduler.request_thread_termination(tid);
    }

    /// Terminate every thread of a process
    ///
    /// Blocked threads are released with TerminationRequested in one
    /// scheduler pass; the process finalizes when its last thread exits.
    pub fn terminate_process(&self, pid: Pid) -> KernelResult<()> {
        let process = self
            .process(pid)
            .ok_or_else(|| KernelError::NotFound(format!("process {}", pid)))?;
        if !process.begin_exit() {
            return Ok(());
        }
        let _span = OperationSpan::new("terminate_process");

        let unstarted = self.scheduler.request_termination(pid);
        for thread in &unstarted {
            self.finish_thread(&process, thread);
        }
        if process.thread_count() == 0 {
            self.finalize_process(&process);
        }
        Ok(())
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<KProcess>> {
        self.processes.get(&pid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn process_ids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.iter().map(|entry| *entry.key()).collect();
        pids.sort_unstable();
        pids
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Ticks of the console's 19.2 MHz system counter since boot
    pub fn system_tick(&self) -> u64 {
        let nanos = self.boot_time.elapsed().as_nanos();
        (nanos * SYSTEM_TICK_FREQUENCY as u128 / 1_000_000_000) as u64
    }

    /// Expose a service object under a named port
    pub fn register_named_port(&self, name: &str, factory: Arc<dyn ServiceFactory>) -> KernelResult<()> {
        if name.is_empty() || name.len() > MAX_PORT_NAME_LEN {
            return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
        }
        if self.named_ports.contains_key(name) {
            return Err(KernelError::Result(ResultCode::INVALID_STATE));
        }
        self.named_ports.insert(name.to_string(), factory);
        Ok(())
    }

    /// Open a session to a named port on behalf of `process`
    pub fn connect_to_named_port(&self, process: &KProcess, name: &str) -> KernelResult<Arc<KSession>> {
        if name.len() > MAX_PORT_NAME_LEN {
            return Err(KernelError::Result(ResultCode::OUT_OF_RANGE));
        }
        let factory = self
            .named_ports
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KernelError::NotFound(format!("named port {}", name)))?;
        let service = factory.create(self.config.firmware_version);
        let session = KSession::new(
            process.pid(),
            service,
            Arc::clone(process.resource_limit()),
            self.config.pointer_buffer_size,
        )?;
        Ok(Arc::new(session))
    }

    /// Terminate all processes and wait for their host threads
    pub fn shutdown(&self) {
        let span = OperationSpan::new("kernel_shutdown");
        let processes: Vec<Arc<KProcess>> = self.processes.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut threads = Vec::new();
        for process in &processes {
            threads.extend(process.threads());
            if let Err(err) = self.terminate_process(process.pid()) {
                warn!("Shutdown: {}", err);
            }
        }
        for thread in &threads {
            thread.join_host();
        }
        span.record_items_processed(processes.len() as u64);
        info!("Kernel shut down ({} processes, {} threads)", processes.len(), threads.len());
    }
}

impl std::fmt::Debug for KernelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCore")
            .field("cores", &self.config.core_count)
            .field("firmware", &self.config.firmware_version)
            .field("processes", &self.processes.len())
            .finish()
    }
}
