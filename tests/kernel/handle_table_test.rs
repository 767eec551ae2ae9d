/*!
 * Handle Table Tests
 * Property tests for allocation, reuse and stale handle rejection
 */

use hle_kernel::kernel::{HandleTable, KEvent, KResourceLimit, KernelObject, LimitableResource};
use hle_kernel::KernelError;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

const CAPACITY: usize = 16;

#[derive(Debug, Clone)]
enum Op {
    Add,
    Remove(usize),
    Duplicate(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        2 => any::<usize>().prop_map(Op::Remove),
        1 => any::<usize>().prop_map(Op::Duplicate),
    ]
}

fn event(limit: &Arc<KResourceLimit>) -> KernelObject {
    KernelObject::ReadableEvent(Arc::new(KEvent::new(1, Arc::clone(limit)).unwrap()))
}

proptest! {
    #[test]
    fn test_live_handles_resolve_and_closed_ones_never_do(ops in prop::collection::vec(op(), 1..200)) {
        let limit = Arc::new(KResourceLimit::new());
        let mut table = HandleTable::new(CAPACITY);
        let mut live: Vec<u32> = Vec::new();
        let mut closed: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                Op::Add => match table.add(event(&limit)) {
                    Ok(handle) => live.push(handle),
                    Err(err) => {
                        prop_assert_eq!(live.len(), CAPACITY);
                        prop_assert_eq!(err, KernelError::OutOfHandles { capacity: CAPACITY });
                    }
                },
                Op::Remove(i) if !live.is_empty() => {
                    let handle = live.swap_remove(i % live.len());
                    prop_assert!(table.remove(handle).is_ok());
                    closed.push(handle);
                }
                Op::Duplicate(i) if !live.is_empty() && live.len() < CAPACITY => {
                    let original = live[i % live.len()];
                    let dup = table.duplicate(original).unwrap();
                    live.push(dup);
                }
                _ => {}
            }

            prop_assert_eq!(table.len(), live.len());
            prop_assert!(table.peak() >= table.len());
            let unique: HashSet<u32> = live.iter().copied().collect();
            prop_assert_eq!(unique.len(), live.len());
            for &handle in &live {
                prop_assert!(handle != 0);
                prop_assert_eq!(handle & 0xC000_0000, 0);
                prop_assert!(table.contains(handle));
            }
            for &handle in &closed {
                prop_assert!(table.get(handle).is_err());
            }
        }
    }
}

#[test]
fn test_removing_twice_fails() {
    let limit = Arc::new(KResourceLimit::new());
    let mut table = HandleTable::new(CAPACITY);
    let handle = table.add(event(&limit)).unwrap();

    assert!(table.remove(handle).is_ok());
    assert_eq!(table.remove(handle).unwrap_err(), KernelError::InvalidHandle(handle));
    assert!(table.is_empty());
}

#[test]
fn test_drain_releases_event_reservations() {
    let limit = Arc::new(KResourceLimit::new().with_limit(LimitableResource::Events, 4));
    let mut table = HandleTable::new(CAPACITY);
    for _ in 0..4 {
        table.add(event(&limit)).unwrap();
    }
    assert_eq!(limit.current(LimitableResource::Events), 4);
    assert!(KEvent::new(1, Arc::clone(&limit)).is_err());

    let objects = table.drain();
    assert_eq!(objects.len(), 4);
    drop(objects);

    assert_eq!(limit.current(LimitableResource::Events), 0);
    assert_eq!(table.len(), 0);
    assert_eq!(table.peak(), 4);
}
