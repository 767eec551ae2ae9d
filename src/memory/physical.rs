/*!
 * Physical Memory Pool
 * Accounting for every block backing guest memory
 */

use super::types::{MemoryError, MemoryPressure, MemoryResult};
use crate::core::limits::{MEMORY_PRESSURE_CRITICAL, MEMORY_PRESSURE_WARNING};
use crate::core::types::Size;
use crate::kernel::resource_limit::{KResourceLimit, LimitableResource};
use log::{debug, error, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Emulated physical memory
///
/// Blocks are host allocations; the pool only enforces the configured
/// capacity and tracks usage.
#[derive(Debug)]
pub struct PhysicalMemory {
    capacity: Size,
    used: AtomicU64,
    peak: AtomicU64,
}

impl PhysicalMemory {
    pub fn new(capacity: Size) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            used: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        })
    }

    /// Allocate a zeroed block, charging the pool and optionally a process limit
    pub fn allocate(
        self: &Arc<Self>,
        size: Size,
        limit: Option<Arc<KResourceLimit>>,
    ) -> MemoryResult<Arc<PhysicalBlock>> {
        if let Some(limit) = &limit {
            limit
                .reserve(LimitableResource::PhysicalMemory, size)
                .map_err(|_| MemoryError::LimitReached {
                    requested: size,
                    limit: limit.limit(LimitableResource::PhysicalMemory),
                })?;
        }

        let used = self.used.fetch_add(size, Ordering::SeqCst);
        if used.saturating_add(size) > self.capacity {
            self.used.fetch_sub(size, Ordering::SeqCst);
            if let Some(limit) = &limit {
                limit.release(LimitableResource::PhysicalMemory, size);
            }
            error!(
                "OOM: requested {} bytes, only {} bytes available ({} used / {} total)",
                size,
                self.capacity.saturating_sub(used),
                used,
                self.capacity
            );
            return Err(MemoryError::OutOfMemory {
                requested: size,
                available: self.capacity.saturating_sub(used),
                used,
                total: self.capacity,
            });
        }

        let now_used = used + size;
        self.peak.fetch_max(now_used, Ordering::Relaxed);

        match self.pressure(now_used) {
            MemoryPressure::Low => debug!("Allocated {} bytes of physical memory", size),
            level => warn!(
                "Memory pressure {}: allocated {} bytes ({:.1}% used: {} / {})",
                level,
                size,
                (now_used as f64 / self.capacity as f64) * 100.0,
                now_used,
                self.capacity
            ),
        }

        Ok(Arc::new(PhysicalBlock {
            data: RwLock::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
            pool: Arc::clone(self),
            limit,
        }))
    }

    fn pressure(&self, used: Size) -> MemoryPressure {
        let ratio = used as f64 / self.capacity.max(1) as f64;
        if ratio >= MEMORY_PRESSURE_CRITICAL {
            MemoryPressure::Critical
        } else if ratio >= MEMORY_PRESSURE_WARNING {
            MemoryPressure::High
        } else {
            MemoryPressure::Low
        }
    }

    fn free(&self, size: Size) {
        self.used.fetch_sub(size, Ordering::SeqCst);
    }

    pub fn capacity(&self) -> Size {
        self.capacity
    }

    pub fn used(&self) -> Size {
        self.used.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> Size {
        self.capacity.saturating_sub(self.used())
    }

    pub fn peak(&self) -> Size {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Backing storage for one or more guest mappings
///
/// Freed, and its bytes returned to the pool and process limit, when the
/// last mapping or owning object drops it.
pub struct PhysicalBlock {
    data: RwLock<Box<[u8]>>,
    size: Size,
    pool: Arc<PhysicalMemory>,
    limit: Option<Arc<KResourceLimit>>,
}

impl PhysicalBlock {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.read();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    pub fn write(&self, offset: usize, input: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + input.len()].copy_from_slice(input);
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        let mut data = self.data.write();
        data[offset..offset + len].fill(value);
    }
}

impl std::fmt::Debug for PhysicalBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalBlock").field("size", &self.size).finish()
    }
}

impl Drop for PhysicalBlock {
    fn drop(&mut self) {
        self.pool.free(self.size);
        if let Some(limit) = &self.limit {
            limit.release(LimitableResource::PhysicalMemory, self.size);
        }
    }
}
