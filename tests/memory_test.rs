/*!
 * Guest Memory Tests
 * Page tables, heap permissions, limits and shared memory between address spaces
 */

use hle_kernel::core::limits::HEAP_SIZE_ALIGNMENT;
use hle_kernel::kernel::{KResourceLimit, LimitableResource};
use hle_kernel::memory::{
    AddressSpaceLayout, KPageTable, KSharedMemory, MemoryError, MemoryPermission, MemoryState, PhysicalMemory,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const POOL_SIZE: u64 = 64 * 1024 * 1024;
const SHARED_SIZE: u64 = 0x2000;

fn page_table(physical: &Arc<PhysicalMemory>, limit: &Arc<KResourceLimit>) -> KPageTable {
    KPageTable::new(AddressSpaceLayout::default(), Arc::clone(physical), Arc::clone(limit))
}

#[test]
fn test_shared_memory_is_visible_in_both_address_spaces() {
    let physical = PhysicalMemory::new(POOL_SIZE);
    let owner_limit = Arc::new(KResourceLimit::new());
    let remote_limit = Arc::new(KResourceLimit::new());
    let owner = page_table(&physical, &owner_limit);
    let remote = page_table(&physical, &remote_limit);

    let shared = KSharedMemory::new(
        &physical,
        Arc::clone(&owner_limit),
        1,
        SHARED_SIZE,
        MemoryPermission::READ_WRITE,
        MemoryPermission::READ,
    )
    .unwrap();
    let owner_at = owner.layout().alias.base;
    let remote_at = remote.layout().alias.base + 0x10_000;

    shared
        .map(&owner, 1, owner_at, SHARED_SIZE, MemoryPermission::READ_WRITE)
        .unwrap();
    // Remote processes only get the remote permission
    assert_eq!(
        shared.map(&remote, 2, remote_at, SHARED_SIZE, MemoryPermission::READ_WRITE),
        Err(MemoryError::InvalidPermission(MemoryPermission::READ_WRITE))
    );
    shared.map(&remote, 2, remote_at, SHARED_SIZE, MemoryPermission::READ).unwrap();
    assert_eq!(shared.attached_pids(), vec![1, 2]);

    owner.write(owner_at + 0x1FFC, b"ping").unwrap();
    assert_eq!(remote.read_bytes(remote_at + 0x1FFC, 4).unwrap(), b"ping".to_vec());
    assert!(matches!(
        remote.write(remote_at, b"pong"),
        Err(MemoryError::AccessViolation { .. })
    ));

    let info = remote.query(remote_at + 0x1000);
    assert_eq!(info.base_address, remote_at);
    assert_eq!(info.size, SHARED_SIZE);
    assert_eq!(info.state, MemoryState::Shared);

    // One physical block backs every mapping
    assert_eq!(physical.used(), SHARED_SIZE);
    assert_eq!(owner_limit.current(LimitableResource::PhysicalMemory), SHARED_SIZE);
    assert_eq!(remote_limit.current(LimitableResource::PhysicalMemory), 0);

    assert_eq!(
        shared.unmap(&owner, 1, owner_at, 0x1000),
        Err(MemoryError::InvalidSize(0x1000))
    );
    shared.unmap(&owner, 1, owner_at, SHARED_SIZE).unwrap();
    assert_eq!(shared.attached_pids(), vec![2]);
    assert_eq!(owner.query(owner_at).state, MemoryState::Free);

    // The block lives until the last mapping and the object are gone
    drop(shared);
    assert_eq!(physical.used(), SHARED_SIZE);
    remote.clear();
    assert_eq!(physical.used(), 0);
    assert_eq!(owner_limit.current(LimitableResource::PhysicalMemory), 0);
}

#[test]
fn test_unmapping_foreign_range_as_shared_fails() {
    let physical = PhysicalMemory::new(POOL_SIZE);
    let limit = Arc::new(KResourceLimit::new());
    let table = page_table(&physical, &limit);
    let shared = KSharedMemory::new(
        &physical,
        Arc::clone(&limit),
        1,
        SHARED_SIZE,
        MemoryPermission::READ_WRITE,
        MemoryPermission::READ,
    )
    .unwrap();

    let heap = table.set_heap_size(HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(
        shared.unmap(&table, 1, heap, SHARED_SIZE),
        Err(MemoryError::InvalidMemoryState {
            address: heap,
            size: SHARED_SIZE
        })
    );
    assert_eq!(table.heap_size(), HEAP_SIZE_ALIGNMENT);
}

#[test]
fn test_heap_permissions_split_regions() {
    let physical = PhysicalMemory::new(POOL_SIZE);
    let limit = Arc::new(KResourceLimit::new());
    let table = page_table(&physical, &limit);

    assert_eq!(table.set_heap_size(0x1000), Err(MemoryError::InvalidSize(0x1000)));
    let base = table.set_heap_size(HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(base, table.layout().heap.base);

    table.set_memory_permission(base, 0x1000, MemoryPermission::READ).unwrap();
    assert!(table.write(base, &[1]).is_err());
    table.write(base + 0x1000, &[1]).unwrap();

    let guarded = table.query(base);
    assert_eq!((guarded.size, guarded.permission), (0x1000, MemoryPermission::READ));
    let rest = table.query(base + 0x1000);
    assert_eq!(rest.base_address, base + 0x1000);
    assert_eq!(rest.size, HEAP_SIZE_ALIGNMENT - 0x1000);

    assert_eq!(
        table.set_memory_permission(base, 0x1000, MemoryPermission::READ_EXECUTE),
        Err(MemoryError::InvalidPermission(MemoryPermission::READ_EXECUTE))
    );

    // Restoring the permission merges the regions again in queries
    table.set_memory_permission(base, 0x1000, MemoryPermission::READ_WRITE).unwrap();
    assert_eq!(table.query(base).size, HEAP_SIZE_ALIGNMENT);

    table.set_heap_size(0).unwrap();
    assert_eq!(table.mapped_size(), 0);
    assert_eq!(physical.used(), 0);
}

#[test]
fn test_process_limit_caps_heap() {
    let physical = PhysicalMemory::new(POOL_SIZE);
    let limit = Arc::new(KResourceLimit::new().with_limit(LimitableResource::PhysicalMemory, HEAP_SIZE_ALIGNMENT));
    let table = page_table(&physical, &limit);

    assert!(matches!(
        table.set_heap_size(2 * HEAP_SIZE_ALIGNMENT),
        Err(MemoryError::LimitReached { .. })
    ));
    assert_eq!(table.heap_size(), 0);
    assert_eq!(physical.used(), 0);

    table.set_heap_size(HEAP_SIZE_ALIGNMENT).unwrap();
    assert_eq!(limit.current(LimitableResource::PhysicalMemory), HEAP_SIZE_ALIGNMENT);

    table.clear();
    assert_eq!(limit.current(LimitableResource::PhysicalMemory), 0);
    assert_eq!(physical.used(), 0);
    assert_eq!(physical.peak(), HEAP_SIZE_ALIGNMENT);
}

#[test]
fn test_pool_exhaustion_reports_out_of_memory() {
    let physical = PhysicalMemory::new(HEAP_SIZE_ALIGNMENT);
    let limit = Arc::new(KResourceLimit::new());
    let first = page_table(&physical, &limit);
    let second = page_table(&physical, &limit);

    first.set_heap_size(HEAP_SIZE_ALIGNMENT).unwrap();
    assert!(matches!(
        second.set_heap_size(HEAP_SIZE_ALIGNMENT),
        Err(MemoryError::OutOfMemory { .. })
    ));
    assert_eq!(limit.current(LimitableResource::PhysicalMemory), HEAP_SIZE_ALIGNMENT);
}
