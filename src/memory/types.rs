/*!
 * Memory Types
 * Guest memory states, permissions, query records and errors
 */

use crate::core::errors::ResultCode;
use crate::core::limits::*;
use crate::core::types::{Size, VAddr};
use bitflags::bitflags;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum MemoryError {
    #[error("Out of memory: requested {requested} bytes, available {available} bytes ({used} used / {total} total)")]
    #[diagnostic(code(memory::out_of_memory), help("The emulated physical pool is exhausted."))]
    OutOfMemory {
        requested: Size,
        available: Size,
        used: Size,
        total: Size,
    },

    #[error("Process memory limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    #[diagnostic(code(memory::limit_reached))]
    LimitReached { requested: Size, limit: Size },

    #[error("Invalid address 0x{0:x}")]
    #[diagnostic(code(memory::invalid_address), help("Addresses must be page aligned and inside the address space."))]
    InvalidAddress(VAddr),

    #[error("Invalid size 0x{0:x}")]
    #[diagnostic(code(memory::invalid_size), help("Sizes must be non-zero and page aligned."))]
    InvalidSize(Size),

    #[error("Range 0x{address:x}+0x{size:x} is not in a valid memory state for this operation")]
    #[diagnostic(code(memory::invalid_memory_state))]
    InvalidMemoryState { address: VAddr, size: Size },

    #[error("Range 0x{address:x}+0x{size:x} lies outside the target region")]
    #[diagnostic(code(memory::invalid_memory_region))]
    InvalidMemoryRegion { address: VAddr, size: Size },

    #[error("Permission {0:?} is not allowed here")]
    #[diagnostic(code(memory::invalid_permission))]
    InvalidPermission(MemoryPermission),

    #[error("Access to unmapped memory at 0x{0:x}")]
    #[diagnostic(code(memory::unmapped))]
    Unmapped(VAddr),

    #[error("Access violation at 0x{address:x}: region is {permission:?}")]
    #[diagnostic(code(memory::access_violation))]
    AccessViolation {
        address: VAddr,
        permission: MemoryPermission,
    },
}

impl MemoryError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            MemoryError::OutOfMemory { .. } => ResultCode::OUT_OF_MEMORY,
            MemoryError::LimitReached { .. } => ResultCode::LIMIT_REACHED,
            MemoryError::InvalidAddress(_) => ResultCode::INVALID_ADDRESS,
            MemoryError::InvalidSize(_) => ResultCode::INVALID_SIZE,
            MemoryError::InvalidMemoryState { .. } => ResultCode::INVALID_CURRENT_MEMORY,
            MemoryError::InvalidMemoryRegion { .. } => ResultCode::INVALID_MEMORY_REGION,
            MemoryError::InvalidPermission(_) => ResultCode::INVALID_NEW_MEMORY_PERMISSION,
            MemoryError::Unmapped(_) => ResultCode::INVALID_CURRENT_MEMORY,
            MemoryError::AccessViolation { .. } => ResultCode::INVALID_POINTER,
        }
    }
}

/// Memory state of a region, numbered as the guest sees it in QueryMemory
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryState {
    Free = 0,
    Io = 1,
    Code = 3,
    CodeData = 4,
    /// Heap memory
    Normal = 5,
    Shared = 6,
    Stack = 11,
    ThreadLocal = 12,
    Inaccessible = 16,
}

bitflags! {
    /// Guest page permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryPermission: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    /// Decode a raw guest permission value, rejecting unknown bits
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::from_bits(raw)
    }
}

/// Pressure level of the physical pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPressure {
    Low,
    High,
    Critical,
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MemoryPressure::Low => write!(f, "LOW"),
            MemoryPressure::High => write!(f, "HIGH"),
            MemoryPressure::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result of a QueryMemory call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base_address: VAddr,
    pub size: Size,
    pub state: MemoryState,
    pub attribute: u32,
    pub permission: MemoryPermission,
    pub ipc_ref_count: u32,
    pub device_ref_count: u32,
}

impl MemoryInfo {
    /// Size of the record QueryMemory writes to guest memory
    pub const SIZE: usize = 0x28;

    pub fn end(&self) -> VAddr {
        self.base_address.saturating_add(self.size)
    }

    /// Serialize to the guest layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0x00..0x08].copy_from_slice(&self.base_address.to_le_bytes());
        out[0x08..0x10].copy_from_slice(&self.size.to_le_bytes());
        out[0x10..0x14].copy_from_slice(&(self.state as u32).to_le_bytes());
        out[0x14..0x18].copy_from_slice(&self.attribute.to_le_bytes());
        out[0x18..0x1C].copy_from_slice(&self.permission.bits().to_le_bytes());
        out[0x1C..0x20].copy_from_slice(&self.ipc_ref_count.to_le_bytes());
        out[0x20..0x24].copy_from_slice(&self.device_ref_count.to_le_bytes());
        out
    }
}

/// A contiguous span of the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub base: VAddr,
    pub size: Size,
}

impl Region {
    pub const fn new(base: VAddr, size: Size) -> Self {
        Self { base, size }
    }

    pub const fn end(&self) -> VAddr {
        self.base + self.size
    }

    pub fn contains_range(&self, address: VAddr, size: Size) -> bool {
        match address.checked_add(size) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }
}

/// Layout of a process address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpaceLayout {
    pub width: u32,
    pub code: Region,
    pub alias: Region,
    pub heap: Region,
    pub stack: Region,
    pub tls: Region,
}

impl AddressSpaceLayout {
    pub fn end(&self) -> VAddr {
        1u64 << self.width
    }

    pub fn contains_range(&self, address: VAddr, size: Size) -> bool {
        Region::new(0, self.end()).contains_range(address, size)
    }
}

impl Default for AddressSpaceLayout {
    fn default() -> Self {
        Self {
            width: ADDRESS_SPACE_WIDTH,
            code: Region::new(CODE_REGION_BASE, CODE_REGION_SIZE),
            alias: Region::new(ALIAS_REGION_BASE, ALIAS_REGION_SIZE),
            heap: Region::new(HEAP_REGION_BASE, HEAP_REGION_SIZE),
            stack: Region::new(STACK_REGION_BASE, STACK_REGION_SIZE),
            tls: Region::new(TLS_REGION_BASE, TLS_REGION_SIZE),
        }
    }
}

pub fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Check a guest range for alignment and non-zero size
pub fn validate_range(address: VAddr, size: Size) -> MemoryResult<()> {
    if !is_page_aligned(address) {
        return Err(MemoryError::InvalidAddress(address));
    }
    if size == 0 || !is_page_aligned(size) {
        return Err(MemoryError::InvalidSize(size));
    }
    if address.checked_add(size).is_none() {
        return Err(MemoryError::InvalidMemoryRegion { address, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_info_layout() {
        let info = MemoryInfo {
            base_address: 0x1000,
            size: 0x2000,
            state: MemoryState::Normal,
            attribute: 0,
            permission: MemoryPermission::READ_WRITE,
            ipc_ref_count: 0,
            device_ref_count: 0,
        };
        let bytes = info.to_bytes();
        assert_eq!(&bytes[0..8], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &0x2000u64.to_le_bytes());
        assert_eq!(&bytes[0x10..0x14], &5u32.to_le_bytes());
        assert_eq!(&bytes[0x18..0x1C], &3u32.to_le_bytes());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(0x1000, 0x1000).is_ok());
        assert_eq!(validate_range(0x1001, 0x1000), Err(MemoryError::InvalidAddress(0x1001)));
        assert_eq!(validate_range(0x1000, 0), Err(MemoryError::InvalidSize(0)));
        assert_eq!(validate_range(0x1000, 0x800), Err(MemoryError::InvalidSize(0x800)));
    }

    #[test]
    fn test_permission_decode() {
        assert_eq!(MemoryPermission::from_raw(3), Some(MemoryPermission::READ_WRITE));
        assert_eq!(MemoryPermission::from_raw(8), None);
    }
}
