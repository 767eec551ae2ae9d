/*!
 * HLE Kernel - Main Entry Point
 *
 * Boots a kernel instance with HLE guest code:
 * - Loads configuration (JSON file argument, HLE_* overrides)
 * - Starts a demo process that talks to `sm:` over CMIF
 * - Runs a readback through the threaded GPU queue
 */

use anyhow::{Context, Result};
use hle_kernel::core::limits::DEFAULT_GUEST_STACK_SIZE;
use hle_kernel::gpu::{BufferUsage, GpuQueue, SoftwareBackend};
use hle_kernel::ipc::parse_response;
use hle_kernel::{
    init_tracing, HleEntryTable, KernelConfig, KernelCore, KernelError, ProcessCreateInfo, RequestBuilder,
    ThreadContext,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEMO_TIMEOUT: Duration = Duration::from_secs(10);

fn load_config() -> Result<KernelConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => KernelConfig::from_file(&path)
            .with_context(|| format!("loading {}", path))?
            .with_env_overrides()?,
        None => KernelConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Guest main: open `sm:`, initialize, close and exit
fn demo_main(ctx: &mut ThreadContext) -> hle_kernel::KernelResult<()> {
    let sm = ctx.connect_to_named_port("sm:")?;
    let request = RequestBuilder::new(0)
        .with_pid(0)
        .build()
        .map_err(|err| KernelError::Result(err.result_code()))?;
    ctx.write_message(&request)?;
    ctx.send_sync_request(sm)?;
    let response =
        parse_response(&ctx.read_message()?, false).map_err(|err| KernelError::Result(err.result_code()))?;
    info!("sm:Initialize returned {}", response.result);
    ctx.close_handle(sm)?;
    ctx.exit_thread()
}

fn gpu_smoke_test(config: &KernelConfig) -> Result<()> {
    let queue = GpuQueue::new(Box::new(SoftwareBackend::new()), &config.gpu)?;
    let buffer = queue.create_buffer(64, BufferUsage::STORAGE | BufferUsage::TRANSFER)?;
    queue.set_buffer_data(buffer, 0, b"hle".to_vec())?;
    let data = queue.get_buffer_data(buffer, 0, 3)?;
    queue.delete_buffer(buffer)?;
    queue.finish()?;
    info!("GPU readback returned {:?}, stats {:?}", String::from_utf8_lossy(&data), queue.stats());
    queue.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured tracing
    init_tracing();

    info!("HLE kernel starting...");
    let config = load_config()?;

    let entries = Arc::new(HleEntryTable::new());
    let kernel = KernelCore::builder()
        .with_config(config.clone())
        .with_engine(entries.clone())
        .build()?;

    let process = kernel.create_process(ProcessCreateInfo::new("demo").with_program_id(0x0100_0000_0000_1000))?;
    entries.register(process.code_address(), demo_main);
    kernel.start_process(&process, DEFAULT_GUEST_STACK_SIZE)?;

    let gpu_config = config.clone();
    let gpu = tokio::task::spawn_blocking(move || gpu_smoke_test(&gpu_config));

    let waiter = Arc::clone(&process);
    let exited = tokio::task::spawn_blocking(move || waiter.wait_for_exit(Some(DEMO_TIMEOUT)));

    tokio::select! {
        result = exited => {
            match result {
                Ok(true) => info!("Process {} exited", process.pid()),
                Ok(false) => warn!("Process {} still running after {:?}", process.pid(), DEMO_TIMEOUT),
                Err(err) => error!(error = %err, "Exit waiter failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    match gpu.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "GPU smoke test failed"),
        Err(err) => error!(error = %err, "GPU task failed"),
    }

    kernel.shutdown();
    info!("HLE kernel stopped");
    Ok(())
}
