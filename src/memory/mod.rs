/*!
 * Memory Module
 * Guest address spaces, physical accounting and shared memory
 */

pub mod page_table;
pub mod physical;
pub mod shared;
pub mod types;

pub use page_table::KPageTable;
pub use physical::{PhysicalBlock, PhysicalMemory};
pub use shared::KSharedMemory;
pub use types::{
    AddressSpaceLayout, MemoryError, MemoryInfo, MemoryPermission, MemoryPressure, MemoryResult, MemoryState,
    Region,
};
