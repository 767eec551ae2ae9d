/*!
 * System Limits and Constants
 *
 * Centralized location for kernel-wide limits, layout constants and defaults.
 * Values that mirror the console's behavior are marked with [HORIZON].
 */

use std::time::Duration;

// =============================================================================
// CPU / SCHEDULER
// =============================================================================

/// Number of emulated CPU cores
/// [HORIZON] The console exposes four application-visible cores
pub const DEFAULT_CORE_COUNT: usize = 4;

/// Upper bound accepted for `core_count`
pub const MAX_CORE_COUNT: usize = 64;

/// Number of priority levels (0 highest, 63 lowest)
/// [HORIZON]
pub const PRIORITY_LEVELS: usize = 64;

/// Lowest (numerically largest) thread priority
pub const LOWEST_PRIORITY: u8 = 63;

/// Round-robin time slice between equal-priority threads (10ms)
pub const DEFAULT_TIME_QUANTUM_US: u64 = 10_000;

/// Guest system counter frequency (19.2 MHz)
/// [HORIZON] Reported by GetSystemTick and CNTFRQ_EL0
pub const SYSTEM_TICK_FREQUENCY: u64 = 19_200_000;

/// Host stack size for guest-bound threads (2MB)
pub const GUEST_HOST_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Default thread limit for a process
pub const DEFAULT_THREAD_LIMIT: u64 = 256;

/// Maximum handles accepted by WaitSynchronization
/// [HORIZON]
pub const MAX_WAIT_OBJECTS: usize = 64;

/// Bit set in a mutex tag when other threads wait on it
/// [HORIZON]
pub const HANDLE_WAIT_MASK: u32 = 0x4000_0000;

// =============================================================================
// HANDLES
// =============================================================================

/// Default handle table capacity per process
/// [HORIZON] Matches the kernel's default of 1024 entries
pub const DEFAULT_HANDLE_TABLE_CAPACITY: usize = 1024;

/// Maximum handle table capacity (bits 0-14 of a handle index the slot)
pub const MAX_HANDLE_TABLE_CAPACITY: usize = 1 << 15;

/// Pseudo-handle for the calling process
/// [HORIZON]
pub const CURRENT_PROCESS_HANDLE: u32 = 0xFFFF_8000;

/// Pseudo-handle for the calling thread
/// [HORIZON]
pub const CURRENT_THREAD_HANDLE: u32 = 0xFFFF_8001;

// =============================================================================
// MEMORY
// =============================================================================

/// Guest page size (4KB)
pub const PAGE_SIZE: u64 = 0x1000;

/// Heap size granularity (2MB)
/// [HORIZON] SetHeapSize rejects sizes not aligned to this
pub const HEAP_SIZE_ALIGNMENT: u64 = 0x20_0000;

/// Total emulated physical memory (4GB)
pub const DEFAULT_PHYSICAL_MEMORY_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default per-process memory limit (3GB)
pub const DEFAULT_PROCESS_MEMORY_LIMIT: u64 = 3 * 1024 * 1024 * 1024;

/// Physical pool usage fraction that triggers a pressure warning
pub const MEMORY_PRESSURE_WARNING: f64 = 0.80;

/// Physical pool usage fraction that triggers a critical warning
pub const MEMORY_PRESSURE_CRITICAL: f64 = 0.95;

/// Width of the emulated address space
/// [HORIZON] 39-bit layout used by 64-bit applications
pub const ADDRESS_SPACE_WIDTH: u32 = 39;

/// Base of the code region
pub const CODE_REGION_BASE: u64 = 0x0800_0000;

/// Size of the code region (2GB)
pub const CODE_REGION_SIZE: u64 = 0x8000_0000;

/// Base of the alias region
pub const ALIAS_REGION_BASE: u64 = 0x10_0000_0000;

/// Size of the alias region (64GB)
pub const ALIAS_REGION_SIZE: u64 = 0x10_0000_0000;

/// Base of the heap region
pub const HEAP_REGION_BASE: u64 = 0x20_0000_0000;

/// Size of the heap region (8GB)
pub const HEAP_REGION_SIZE: u64 = 0x2_0000_0000;

/// Base of the stack region
pub const STACK_REGION_BASE: u64 = 0x30_0000_0000;

/// Size of the stack region (2GB)
pub const STACK_REGION_SIZE: u64 = 0x8000_0000;

/// Base of the TLS/IO region
pub const TLS_REGION_BASE: u64 = 0x40_0000_0000;

/// Size of the TLS/IO region (64GB)
pub const TLS_REGION_SIZE: u64 = 0x10_0000_0000;

/// Per-thread TLS slot size
/// [HORIZON] Eight slots fit in one ThreadLocal page
pub const TLS_SLOT_SIZE: u64 = 0x200;

/// Default guest stack size for threads created by the host (64KB)
pub const DEFAULT_GUEST_STACK_SIZE: u64 = 0x1_0000;

// =============================================================================
// IPC
// =============================================================================

/// Size of the IPC message buffer at the start of each TLS slot
/// [HORIZON]
pub const IPC_MESSAGE_SIZE: usize = 0x100;

/// Default pointer buffer size reported by QueryPointerBufferSize
pub const DEFAULT_POINTER_BUFFER_SIZE: u16 = 0x8000;

/// Default sessions per process
pub const DEFAULT_SESSION_LIMIT: u64 = 900;

/// Default events per process
pub const DEFAULT_EVENT_LIMIT: u64 = 700;

/// Default transfer memories per process
pub const DEFAULT_TRANSFER_MEMORY_LIMIT: u64 = 200;

/// Maximum objects in a single domain
/// [HORIZON]
pub const MAX_DOMAIN_OBJECTS: usize = 0x1000;

/// Maximum length of a service name in bytes
pub const MAX_SERVICE_NAME_LEN: usize = 8;

// =============================================================================
// GPU QUEUE
// =============================================================================

/// Default command ring capacity
/// [PERF] Large enough that a frame's worth of commands rarely blocks the producer
pub const DEFAULT_GPU_RING_CAPACITY: usize = 1024;

/// Size of one draw-indirect argument record (vertex count, instance count, first vertex, first instance)
pub const DRAW_INDIRECT_RECORD_SIZE: u64 = 16;

/// Default memory budget for the software backend (256MB)
pub const DEFAULT_SOFTWARE_BACKEND_BUDGET: u64 = 256 * 1024 * 1024;

// =============================================================================
// TRACING
// =============================================================================

/// Syscalls slower than this are logged as warnings
pub const SLOW_SYSCALL_THRESHOLD: Duration = Duration::from_millis(10);
