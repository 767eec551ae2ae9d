/*!
 * Page Table
 * Per-process map of non-overlapping guest regions onto physical blocks
 *
 * Unmapped space is implicitly `Free`. Every mutation validates the whole
 * range before touching the map, so a failed call leaves the address space
 * exactly as it was.
 */

use super::physical::{PhysicalBlock, PhysicalMemory};
use super::types::*;
use crate::core::limits::{HEAP_SIZE_ALIGNMENT, PAGE_SIZE};
use crate::core::types::{Size, VAddr};
use crate::kernel::resource_limit::KResourceLimit;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct MemoryRegion {
    base: VAddr,
    size: Size,
    state: MemoryState,
    permission: MemoryPermission,
    backing: Arc<PhysicalBlock>,
    offset: Size,
}

impl MemoryRegion {
    fn end(&self) -> VAddr {
        self.base + self.size
    }
}

#[derive(Debug, Default)]
struct TableState {
    regions: BTreeMap<VAddr, MemoryRegion>,
    heap_size: Size,
}

impl TableState {
    fn find(&self, address: VAddr) -> Option<&MemoryRegion> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| address < region.end())
    }

    fn overlaps(&self, address: VAddr, end: VAddr) -> bool {
        self.find(address).is_some() || self.regions.range(address..end).next().is_some()
    }

    /// Regions covering `[address, end)` without gaps, or None
    fn covering(&self, address: VAddr, end: VAddr) -> Option<Vec<&MemoryRegion>> {
        let mut cursor = address;
        let mut out = Vec::new();
        while cursor < end {
            let region = self.find(cursor)?;
            out.push(region);
            cursor = region.end();
        }
        Some(out)
    }

    fn split_at(&mut self, address: VAddr) {
        let Some(region) = self.find(address).cloned() else {
            return;
        };
        if region.base == address {
            return;
        }
        let head_size = address - region.base;
        if let Some(head) = self.regions.get_mut(&region.base) {
            head.size = head_size;
        }
        self.regions.insert(
            address,
            MemoryRegion {
                base: address,
                size: region.size - head_size,
                offset: region.offset + head_size,
                ..region
            },
        );
    }

    /// Split at both ends and return the keys of the regions inside the range
    fn isolate(&mut self, address: VAddr, end: VAddr) -> Vec<VAddr> {
        self.split_at(address);
        self.split_at(end);
        self.regions.range(address..end).map(|(base, _)| *base).collect()
    }
}

/// Guest address space of one process
pub struct KPageTable {
    layout: AddressSpaceLayout,
    physical: Arc<PhysicalMemory>,
    limit: Arc<KResourceLimit>,
    state: RwLock<TableState>,
}

impl KPageTable {
    pub fn new(layout: AddressSpaceLayout, physical: Arc<PhysicalMemory>, limit: Arc<KResourceLimit>) -> Self {
        Self {
            layout,
            physical,
            limit,
            state: RwLock::new(TableState::default()),
        }
    }

    pub fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    fn check_space(&self, address: VAddr, size: Size) -> MemoryResult<()> {
        validate_range(address, size)?;
        if !self.layout.contains_range(address, size) {
            return Err(MemoryError::InvalidMemoryRegion { address, size });
        }
        Ok(())
    }

    /// Map fresh zeroed memory charged to the process
    pub fn map(&self, address: VAddr, size: Size, permission: MemoryPermission, state: MemoryState) -> MemoryResult<()> {
        self.check_space(address, size)?;
        let mut table = self.state.write();
        if table.overlaps(address, address + size) {
            return Err(MemoryError::InvalidMemoryState { address, size });
        }
        let backing = self.physical.allocate(size, Some(Arc::clone(&self.limit)))?;
        table.regions.insert(
            address,
            MemoryRegion {
                base: address,
                size,
                state,
                permission,
                backing,
                offset: 0,
            },
        );
        debug!("Mapped 0x{:x}+0x{:x} as {:?} {:?}", address, size, state, permission);
        Ok(())
    }

    /// Map an existing physical block (shared memory)
    pub fn map_backing(
        &self,
        address: VAddr,
        size: Size,
        permission: MemoryPermission,
        state: MemoryState,
        backing: Arc<PhysicalBlock>,
        offset: Size,
    ) -> MemoryResult<()> {
        self.check_space(address, size)?;
        if offset.checked_add(size).map_or(true, |end| end > backing.size()) {
            return Err(MemoryError::InvalidSize(size));
        }
        let mut table = self.state.write();
        if table.overlaps(address, address + size) {
            return Err(MemoryError::InvalidMemoryState { address, size });
        }
        table.regions.insert(
            address,
            MemoryRegion {
                base: address,
                size,
                state,
                permission,
                backing,
                offset,
            },
        );
        Ok(())
    }

    /// Find a free page-aligned area inside `region` and map it
    pub fn map_in_region(
        &self,
        region: Region,
        size: Size,
        permission: MemoryPermission,
        state: MemoryState,
    ) -> MemoryResult<VAddr> {
        validate_range(region.base, size)?;
        let mut table = self.state.write();
        let address = Self::find_free_area(&table, region, size).ok_or(MemoryError::OutOfMemory {
            requested: size,
            available: 0,
            used: self.physical.used(),
            total: self.physical.capacity(),
        })?;
        let backing = self.physical.allocate(size, Some(Arc::clone(&self.limit)))?;
        table.regions.insert(
            address,
            MemoryRegion {
                base: address,
                size,
                state,
                permission,
                backing,
                offset: 0,
            },
        );
        Ok(address)
    }

    fn find_free_area(table: &TableState, region: Region, size: Size) -> Option<VAddr> {
        let mut cursor = region.base;
        if let Some(existing) = table.find(cursor) {
            cursor = existing.end();
        }
        for (base, existing) in table.regions.range(cursor..) {
            if *base >= region.end() {
                break;
            }
            if base - cursor >= size {
                return Some(cursor);
            }
            cursor = cursor.max(existing.end());
        }
        (region.end().saturating_sub(cursor) >= size).then_some(cursor)
    }

    /// Unmap a fully mapped range, optionally requiring a memory state
    pub fn unmap(&self, address: VAddr, size: Size, expected: Option<MemoryState>) -> MemoryResult<()> {
        self.check_space(address, size)?;
        let mut table = self.state.write();
        Self::unmap_locked(&mut table, address, size, expected)
    }

    fn unmap_locked(table: &mut TableState, address: VAddr, size: Size, expected: Option<MemoryState>) -> MemoryResult<()> {
        let end = address + size;
        let covering = table
            .covering(address, end)
            .ok_or(MemoryError::InvalidMemoryState { address, size })?;
        if let Some(expected) = expected {
            if covering.iter().any(|region| region.state != expected) {
                return Err(MemoryError::InvalidMemoryState { address, size });
            }
        }
        for key in table.isolate(address, end) {
            table.regions.remove(&key);
        }
        debug!("Unmapped 0x{:x}+0x{:x}", address, size);
        Ok(())
    }

    /// Change heap page permissions (SetMemoryPermission)
    pub fn set_memory_permission(&self, address: VAddr, size: Size, permission: MemoryPermission) -> MemoryResult<()> {
        self.check_space(address, size)?;
        if !(permission.is_empty()
            || permission == MemoryPermission::READ
            || permission == MemoryPermission::READ_WRITE)
        {
            return Err(MemoryError::InvalidPermission(permission));
        }
        let end = address + size;
        let mut table = self.state.write();
        let covering = table
            .covering(address, end)
            .ok_or(MemoryError::InvalidMemoryState { address, size })?;
        if covering.iter().any(|region| region.state != MemoryState::Normal) {
            return Err(MemoryError::InvalidMemoryState { address, size });
        }
        for key in table.isolate(address, end) {
            if let Some(region) = table.regions.get_mut(&key) {
                region.permission = permission;
            }
        }
        Ok(())
    }

    /// Grow or shrink the heap; returns the heap base
    pub fn set_heap_size(&self, size: Size) -> MemoryResult<VAddr> {
        if size % HEAP_SIZE_ALIGNMENT != 0 || size > self.layout.heap.size {
            return Err(MemoryError::InvalidSize(size));
        }
        let heap_base = self.layout.heap.base;
        let mut table = self.state.write();
        let current = table.heap_size;

        if size > current {
            let address = heap_base + current;
            let grow = size - current;
            if table.overlaps(address, address + grow) {
                return Err(MemoryError::InvalidMemoryState { address, size: grow });
            }
            let backing = self.physical.allocate(grow, Some(Arc::clone(&self.limit)))?;
            table.regions.insert(
                address,
                MemoryRegion {
                    base: address,
                    size: grow,
                    state: MemoryState::Normal,
                    permission: MemoryPermission::READ_WRITE,
                    backing,
                    offset: 0,
                },
            );
        } else if size < current {
            Self::unmap_locked(&mut table, heap_base + size, current - size, Some(MemoryState::Normal))?;
        }

        table.heap_size = size;
        info!("Heap size set to 0x{:x} (was 0x{:x})", size, current);
        Ok(heap_base)
    }

    pub fn heap_size(&self) -> Size {
        self.state.read().heap_size
    }

    /// Describe the region containing `address`
    ///
    /// Adjacent regions with identical state and permission are reported as one.
    pub fn query(&self, address: VAddr) -> MemoryInfo {
        let space_end = self.layout.end();
        if address >= space_end {
            return MemoryInfo {
                base_address: space_end,
                size: 0u64.wrapping_sub(space_end),
                state: MemoryState::Inaccessible,
                attribute: 0,
                permission: MemoryPermission::empty(),
                ipc_ref_count: 0,
                device_ref_count: 0,
            };
        }

        let table = self.state.read();
        match table.find(address) {
            Some(region) => {
                let same = |other: &MemoryRegion| other.state == region.state && other.permission == region.permission;
                let mut base = region.base;
                while base > 0 {
                    match table.find(base - 1) {
                        Some(prev) if same(prev) => base = prev.base,
                        _ => break,
                    }
                }
                let mut end = region.end();
                while let Some(next) = table.regions.get(&end) {
                    if !same(next) {
                        break;
                    }
                    end = next.end();
                }
                MemoryInfo {
                    base_address: base,
                    size: end - base,
                    state: region.state,
                    attribute: 0,
                    permission: region.permission,
                    ipc_ref_count: 0,
                    device_ref_count: 0,
                }
            }
            None => {
                let start = table
                    .regions
                    .range(..address)
                    .next_back()
                    .map(|(_, region)| region.end())
                    .unwrap_or(0);
                let end = table
                    .regions
                    .range(address..)
                    .next()
                    .map(|(base, _)| *base)
                    .unwrap_or(space_end);
                MemoryInfo {
                    base_address: start,
                    size: end - start,
                    state: MemoryState::Free,
                    attribute: 0,
                    permission: MemoryPermission::empty(),
                    ipc_ref_count: 0,
                    device_ref_count: 0,
                }
            }
        }
    }

    /// Physical block and offset mapped at `address`
    pub fn backing_at(&self, address: VAddr) -> Option<(Arc<PhysicalBlock>, Size, MemoryState)> {
        let table = self.state.read();
        table.find(address).map(|region| {
            (
                Arc::clone(&region.backing),
                region.offset + (address - region.base),
                region.state,
            )
        })
    }

    /// Check that `[address, address+size)` is mapped with at least `required`
    pub fn check_range(&self, address: VAddr, size: Size, required: MemoryPermission) -> MemoryResult<()> {
        if size == 0 {
            return Ok(());
        }
        let end = address.checked_add(size).ok_or(MemoryError::Unmapped(address))?;
        let table = self.state.read();
        let mut cursor = address;
        while cursor < end {
            let region = table.find(cursor).ok_or(MemoryError::Unmapped(cursor))?;
            if !region.permission.contains(required) {
                return Err(MemoryError::AccessViolation {
                    address: cursor,
                    permission: region.permission,
                });
            }
            cursor = region.end();
        }
        Ok(())
    }

    pub fn is_range_mapped(&self, address: VAddr, size: Size) -> bool {
        self.check_range(address, size, MemoryPermission::empty()).is_ok()
    }

    fn access<F>(&self, address: VAddr, len: usize, required: MemoryPermission, mut f: F) -> MemoryResult<()>
    where
        F: FnMut(&PhysicalBlock, usize, Range<usize>),
    {
        if len == 0 {
            return Ok(());
        }
        self.check_range(address, len as u64, required)?;
        let end = address + len as u64;
        let table = self.state.read();
        let mut cursor = address;
        while cursor < end {
            let Some(region) = table.find(cursor) else {
                return Err(MemoryError::Unmapped(cursor));
            };
            let chunk_end = region.end().min(end);
            let block_offset = (region.offset + (cursor - region.base)) as usize;
            let range = (cursor - address) as usize..(chunk_end - address) as usize;
            f(region.backing.as_ref(), block_offset, range);
            cursor = chunk_end;
        }
        Ok(())
    }

    /// Guest-permission-checked read
    pub fn read(&self, address: VAddr, out: &mut [u8]) -> MemoryResult<()> {
        let len = out.len();
        self.access(address, len, MemoryPermission::READ, |block, offset, range| {
            block.read(offset, &mut out[range])
        })
    }

    /// Guest-permission-checked write
    pub fn write(&self, address: VAddr, data: &[u8]) -> MemoryResult<()> {
        self.access(address, data.len(), MemoryPermission::WRITE, |block, offset, range| {
            block.write(offset, &data[range])
        })
    }

    /// Write ignoring page permissions (program loading)
    pub fn load(&self, address: VAddr, data: &[u8]) -> MemoryResult<()> {
        self.access(address, data.len(), MemoryPermission::empty(), |block, offset, range| {
            block.write(offset, &data[range])
        })
    }

    pub fn read_bytes(&self, address: VAddr, len: usize) -> MemoryResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(address, &mut out)?;
        Ok(out)
    }

    pub fn read_u32(&self, address: VAddr) -> MemoryResult<u32> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn write_u32(&self, address: VAddr, value: u32) -> MemoryResult<()> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn read_u64(&self, address: VAddr) -> MemoryResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_u64(&self, address: VAddr, value: u64) -> MemoryResult<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    pub fn read_c_string(&self, address: VAddr, max_len: usize) -> MemoryResult<String> {
        let mut bytes = Vec::with_capacity(max_len);
        for i in 0..max_len as u64 {
            let mut byte = [0u8; 1];
            self.read(address + i, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Bytes currently mapped
    pub fn mapped_size(&self) -> Size {
        self.state.read().regions.values().map(|region| region.size).sum()
    }

    pub fn region_count(&self) -> usize {
        self.state.read().regions.len()
    }

    /// Drop every mapping (process teardown)
    pub fn clear(&self) {
        let regions = {
            let mut table = self.state.write();
            table.heap_size = 0;
            std::mem::take(&mut table.regions)
        };
        debug!("Released {} regions", regions.len());
        drop(regions);
    }
}

/// Round `value` up to the guest page size
pub fn page_align_up(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
