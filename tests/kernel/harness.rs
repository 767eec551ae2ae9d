/*!
 * Guest Harness
 * Boots a kernel whose guest threads are host closures
 */

#![allow(dead_code)]

use hle_kernel::core::limits::{CODE_REGION_BASE, DEFAULT_GUEST_STACK_SIZE, HEAP_SIZE_ALIGNMENT};
use hle_kernel::kernel::IDEAL_CORE_USE_PROCESS_VALUE;
use hle_kernel::{
    Handle, HleEntryTable, KProcess, KernelConfig, KernelCore, KernelResult, ProcessCreateInfo, ThreadContext, VAddr,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared record of what guest threads observed
pub type Journal<T> = Arc<Mutex<Vec<T>>>;

pub fn journal<T>() -> Journal<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Entry address for the `n`th helper thread, inside the code page
pub fn child(n: u64) -> VAddr {
    CODE_REGION_BASE + 0x100 * n
}

pub struct Harness {
    pub kernel: Arc<KernelCore>,
    entries: Arc<HleEntryTable>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    /// One core, and a quantum long enough that only explicit yields rotate
    pub fn single_core() -> Self {
        Self::with_config(
            KernelConfig::default()
                .with_core_count(1)
                .with_time_quantum(Duration::from_secs(60)),
        )
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let entries = Arc::new(HleEntryTable::new());
        let kernel = KernelCore::builder()
            .with_config(config)
            .with_engine(entries.clone())
            .build()
            .expect("kernel boots");
        Self { kernel, entries }
    }

    /// Bind guest code to an entry address
    pub fn entry<F>(&self, address: VAddr, code: F)
    where
        F: Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync + 'static,
    {
        self.entries.register(address, code);
    }

    /// Create a process whose main thread runs `main`, without starting it
    ///
    /// Every process shares the code base address, so only one main may be
    /// bound at a time.
    pub fn create<F>(&self, name: &str, main: F) -> Arc<KProcess>
    where
        F: Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync + 'static,
    {
        let process = self
            .kernel
            .create_process(ProcessCreateInfo::new(name))
            .expect("process created");
        self.entries.register(process.code_address(), main);
        process
    }

    pub fn spawn<F>(&self, name: &str, main: F) -> Arc<KProcess>
    where
        F: Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync + 'static,
    {
        let process = self.create(name, main);
        self.kernel
            .start_process(&process, DEFAULT_GUEST_STACK_SIZE)
            .expect("process started");
        process
    }

    /// Spawn a process and wait for it to exit
    pub fn run<F>(&self, main: F) -> Arc<KProcess>
    where
        F: Fn(&mut ThreadContext) -> KernelResult<()> + Send + Sync + 'static,
    {
        let process = self.spawn("guest", main);
        assert!(process.wait_for_exit(Some(EXIT_TIMEOUT)), "guest process did not exit");
        process
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.kernel.shutdown();
    }
}

/// Create and start a thread of the caller's process on its ideal core
pub fn start_child(ctx: &ThreadContext, entry: VAddr, argument: u64, priority: u32) -> KernelResult<Handle> {
    let handle = ctx.create_thread(entry, argument, ctx.sp, priority, IDEAL_CORE_USE_PROCESS_VALUE)?;
    ctx.start_thread(handle)?;
    Ok(handle)
}

/// Map the minimum heap and return its base
pub fn heap(ctx: &ThreadContext) -> KernelResult<VAddr> {
    ctx.set_heap_size(HEAP_SIZE_ALIGNMENT)
}

/// Poll `condition` on the host until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
