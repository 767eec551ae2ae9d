/*!
 * Command Queue
 * Bounded ring between guest-facing producers and the render thread
 *
 * Producers serialize on a producer lock and block while the ring is full,
 * so commands are never dropped. The render thread pops in FIFO order and
 * is the only owner of the backend.
 */

use super::backend::Backend;
use super::command::{
    BufferId, BufferUsage, Command, DrawCall, Payload, TextureId, TextureInfo,
};
use super::operand::{Operand, ReductionOp};
use super::renderer::{Execution, Renderer, ResourceTables};
use super::result_box::{PendingResult, ResultBox};
use super::table::TableRef;
use super::{GpuError, GpuResult};
use crate::core::config::{GpuConfig, ShutdownMode};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Observable queue state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Ring empty, render thread idle
    Idle,
    /// Commands queued but not yet picked up
    Recording,
    /// Render thread executing
    Draining,
    /// A producer is blocked on a result box
    Waiting,
    Shutdown,
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub executed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub discarded: u64,
    /// Times a producer blocked on a full ring
    pub backpressure_waits: u64,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    discarded: AtomicU64,
    backpressure_waits: AtomicU64,
}

struct Ring {
    commands: HeapRb<Command>,
    busy: bool,
    shutdown: bool,
    consumer_alive: bool,
}

struct Shared {
    producer: Mutex<()>,
    ring: Mutex<Ring>,
    not_full: Condvar,
    not_empty: Condvar,
    idle: Condvar,
    tables: Arc<ResourceTables>,
    waiting: AtomicUsize,
    counters: Counters,
    shutdown_mode: ShutdownMode,
}

enum Next {
    Run(Command),
    Discard(Vec<Command>),
    Exit,
}

impl Shared {
    fn next(&self) -> Next {
        let mut ring = self.ring.lock();
        loop {
            if ring.shutdown && self.shutdown_mode == ShutdownMode::Discard {
                let rest: Vec<Command> = ring.commands.pop_iter().collect();
                ring.busy = !rest.is_empty();
                self.not_full.notify_all();
                return if rest.is_empty() { Next::Exit } else { Next::Discard(rest) };
            }
            if let Some(command) = ring.commands.try_pop() {
                ring.busy = true;
                self.not_full.notify_one();
                return Next::Run(command);
            }
            ring.busy = false;
            self.idle.notify_all();
            if ring.shutdown {
                return Next::Exit;
            }
            self.not_empty.wait(&mut ring);
        }
    }

    fn record(&self, execution: Execution) {
        let counter = match execution {
            Execution::Executed => &self.counters.executed,
            Execution::Failed => &self.counters.failed,
            Execution::Skipped => &self.counters.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks the consumer gone even if the render loop unwinds
struct ConsumerExit<'a>(&'a Shared);

impl Drop for ConsumerExit<'_> {
    fn drop(&mut self) {
        let mut ring = self.0.ring.lock();
        ring.consumer_alive = false;
        ring.busy = false;
        ring.shutdown = true;
        drop(ring);
        self.0.not_full.notify_all();
        self.0.idle.notify_all();
    }
}

fn render_loop(shared: Arc<Shared>, mut renderer: Renderer) {
    let _exit = ConsumerExit(&shared);
    info!("Render thread started on {} backend", renderer.backend_name());
    loop {
        match shared.next() {
            Next::Run(command) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| renderer.execute(command)));
                match outcome {
                    Ok(execution) => shared.record(execution),
                    Err(_) => {
                        error!("Render thread recovered from a panic in {}", command.name());
                        shared.record(Execution::Failed);
                    }
                }
            }
            Next::Discard(commands) => {
                warn!("Discarding {} queued GPU commands", commands.len());
                shared
                    .counters
                    .discarded
                    .fetch_add(commands.len() as u64, Ordering::Relaxed);
                for command in commands {
                    renderer.discard(command);
                }
            }
            Next::Exit => break,
        }
    }
    renderer.shutdown();
    info!("Render thread stopped");
}

/// Producer-facing handle to the threaded renderer
pub struct GpuQueue {
    shared: Arc<Shared>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl GpuQueue {
    /// Start the render thread with `backend`
    pub fn new(backend: Box<dyn Backend>, config: &GpuConfig) -> GpuResult<Self> {
        let capacity = config.ring_capacity.max(1);
        let tables = Arc::new(ResourceTables::default());
        let shared = Arc::new(Shared {
            producer: Mutex::new(()),
            ring: Mutex::new(Ring {
                commands: HeapRb::new(capacity),
                busy: false,
                shutdown: false,
                consumer_alive: true,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            idle: Condvar::new(),
            tables: Arc::clone(&tables),
            waiting: AtomicUsize::new(0),
            counters: Counters::default(),
            shutdown_mode: config.shutdown_mode,
        });
        let renderer = Renderer::new(backend, tables);
        let consumer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("gpu-render".into())
                .spawn(move || render_loop(shared, renderer))
                .map_err(|err| GpuError::Spawn(err.to_string()))?
        };
        debug!("GPU queue created (capacity {}, {:?} on shutdown)", capacity, config.shutdown_mode);
        Ok(Self {
            shared,
            consumer: Mutex::new(Some(consumer)),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shared.shutdown_mode
    }

    /// Append a command, blocking while the ring is full
    ///
    /// On failure the command's transient slots are released.
    pub fn enqueue(&self, command: Command) -> GpuResult<()> {
        let _producer = self.shared.producer.lock();
        let mut ring = self.shared.ring.lock();
        loop {
            if ring.shutdown {
                drop(ring);
                self.shared.tables.release_transient(&command);
                return Err(GpuError::QueueShutdown);
            }
            if ring.commands.try_push(command).is_ok() {
                break;
            }
            self.shared.counters.backpressure_waits.fetch_add(1, Ordering::Relaxed);
            self.shared.not_full.wait(&mut ring);
        }
        drop(ring);
        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Block until every queued command has executed
    pub fn flush(&self) {
        let mut ring = self.shared.ring.lock();
        while ring.consumer_alive && (ring.busy || !ring.commands.is_empty()) {
            self.shared.idle.wait(&mut ring);
        }
    }

    pub fn state(&self) -> QueueState {
        let ring = self.shared.ring.lock();
        if ring.shutdown {
            QueueState::Shutdown
        } else if self.shared.waiting.load(Ordering::Acquire) > 0 {
            QueueState::Waiting
        } else if ring.busy {
            QueueState::Draining
        } else if !ring.commands.is_empty() {
            QueueState::Recording
        } else {
            QueueState::Idle
        }
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.shared.counters;
        QueueStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            executed: counters.executed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            backpressure_waits: counters.backpressure_waits.load(Ordering::Relaxed),
            queued: self.shared.ring.lock().commands.occupied_len(),
        }
    }

    /// Stop accepting commands, then drain or discard per the shutdown mode
    ///
    /// Blocked producers are woken with `QueueShutdown`. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut ring = self.shared.ring.lock();
            if !ring.shutdown {
                info!(
                    "Shutting down GPU queue ({:?}, {} queued)",
                    self.shared.shutdown_mode,
                    ring.commands.occupied_len()
                );
            }
            ring.shutdown = true;
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        if let Some(handle) = self.consumer.lock().take() {
            if handle.join().is_err() {
                error!("Render thread terminated abnormally");
            }
        }
    }

    fn wait_on<T>(&self, result: &ResultBox<T>) -> GpuResult<T> {
        self.shared.waiting.fetch_add(1, Ordering::AcqRel);
        let value = result.wait();
        self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
        value
    }

    // Typed recording helpers

    /// Reserve a buffer slot and queue its creation
    pub fn create_buffer(&self, size: u64, usage: BufferUsage) -> GpuResult<TableRef<BufferId>> {
        let buffer = self.shared.tables.buffers.lock().reserve();
        if let Err(err) = self.enqueue(Command::CreateBuffer { buffer, size, usage }) {
            self.shared.tables.buffers.lock().reclaim(buffer);
            return Err(err);
        }
        Ok(buffer)
    }

    pub fn delete_buffer(&self, buffer: TableRef<BufferId>) -> GpuResult<()> {
        self.enqueue(Command::DeleteBuffer { buffer })
    }

    pub fn set_buffer_data(&self, buffer: TableRef<BufferId>, offset: u64, data: impl Into<Payload>) -> GpuResult<()> {
        let data = self.shared.tables.payloads.lock().insert(data.into());
        self.enqueue(Command::SetBufferData { buffer, offset, data })
    }

    /// Queue a readback; the box completes once the render thread reaches it
    pub fn get_buffer_data_async(
        &self,
        buffer: TableRef<BufferId>,
        offset: u64,
        size: u64,
    ) -> GpuResult<Arc<ResultBox<Vec<u8>>>> {
        let result = Arc::new(ResultBox::new());
        let slot = self
            .shared
            .tables
            .results
            .lock()
            .insert(PendingResult::Data(Arc::clone(&result)));
        self.enqueue(Command::GetBufferData {
            buffer,
            offset,
            size,
            result: slot,
        })?;
        Ok(result)
    }

    /// Readback; blocks until the render thread produced the bytes
    pub fn get_buffer_data(&self, buffer: TableRef<BufferId>, offset: u64, size: u64) -> GpuResult<Vec<u8>> {
        let result = self.get_buffer_data_async(buffer, offset, size)?;
        self.wait_on(&result)
    }

    pub fn copy_buffer(
        &self,
        src: TableRef<BufferId>,
        dst: TableRef<BufferId>,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        self.enqueue(Command::CopyBuffer {
            src,
            dst,
            src_offset,
            dst_offset,
            size,
        })
    }

    pub fn create_texture(&self, info: TextureInfo) -> GpuResult<TableRef<TextureId>> {
        let texture = self.shared.tables.textures.lock().reserve();
        if let Err(err) = self.enqueue(Command::CreateTexture { texture, info }) {
            self.shared.tables.textures.lock().reclaim(texture);
            return Err(err);
        }
        Ok(texture)
    }

    pub fn delete_texture(&self, texture: TableRef<TextureId>) -> GpuResult<()> {
        self.enqueue(Command::DeleteTexture { texture })
    }

    pub fn set_texture_data(
        &self,
        texture: TableRef<TextureId>,
        layer: u32,
        level: u32,
        data: impl Into<Payload>,
    ) -> GpuResult<()> {
        let data = self.shared.tables.payloads.lock().insert(data.into());
        self.enqueue(Command::SetTextureData {
            texture,
            layer,
            level,
            data,
        })
    }

    pub fn draw(&self, call: DrawCall) -> GpuResult<()> {
        self.enqueue(Command::Draw(call))
    }

    pub fn draw_indirect(&self, buffer: TableRef<BufferId>, offset: u64, count: u32) -> GpuResult<()> {
        self.enqueue(Command::DrawIndirect { buffer, offset, count })
    }

    pub fn barrier(&self) -> GpuResult<()> {
        self.enqueue(Command::Barrier)
    }

    pub fn semaphore_release(
        &self,
        buffer: TableRef<BufferId>,
        offset: u64,
        op: ReductionOp,
        operand: Operand,
    ) -> GpuResult<()> {
        self.enqueue(Command::SemaphoreRelease {
            buffer,
            offset,
            op,
            operand,
        })
    }

    /// Queue a fence without waiting
    pub fn fence(&self) -> GpuResult<Arc<ResultBox<()>>> {
        let result = Arc::new(ResultBox::new());
        let slot = self
            .shared
            .tables
            .results
            .lock()
            .insert(PendingResult::Fence(Arc::clone(&result)));
        self.enqueue(Command::Finish { result: slot })?;
        Ok(result)
    }

    /// Wait for the backend to finish everything queued so far
    pub fn finish(&self) -> GpuResult<()> {
        let fence = self.fence()?;
        self.wait_on(&fence)
    }
}

impl Drop for GpuQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for GpuQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuQueue")
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("shutdown_mode", &self.shared.shutdown_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::software::SoftwareBackend;

    #[test]
    fn test_readback_round_trip() {
        let queue = GpuQueue::new(Box::new(SoftwareBackend::new()), &GpuConfig::default()).unwrap();
        let buffer = queue.create_buffer(16, BufferUsage::STORAGE).unwrap();
        queue.set_buffer_data(buffer, 4, vec![9, 8, 7]).unwrap();
        assert_eq!(queue.get_buffer_data(buffer, 4, 3).unwrap(), vec![9, 8, 7]);
        queue.flush();
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let queue = GpuQueue::new(Box::new(SoftwareBackend::new()), &GpuConfig::default()).unwrap();
        queue.shutdown();
        assert_eq!(queue.state(), QueueState::Shutdown);
        assert_eq!(queue.barrier(), Err(GpuError::QueueShutdown));
        assert!(matches!(queue.finish(), Err(GpuError::QueueShutdown)));
        assert!(queue.shared.tables.results.lock().is_empty());
    }
}
