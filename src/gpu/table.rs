/*!
 * Resource Table
 * Generation-tagged arena behind TableRef indirections
 *
 * The producer reserves a slot when it records a command, the consumer fills
 * and resolves it when the command executes, and the slot is reclaimed once
 * the resource (or transient payload) is no longer needed. Reclaiming bumps
 * the slot generation, so a stale reference can never resolve to whatever
 * reuses the slot later.
 */

use std::fmt;
use std::marker::PhantomData;

/// Typed index into a [`ResourceTable`]
pub struct TableRef<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TableRef<T> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls: T itself need not be Copy
impl<T> Clone for TableRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TableRef<T> {}

impl<T> PartialEq for TableRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for TableRef<T> {}

impl<T> fmt::Debug for TableRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableRef({}#{})", self.index, self.generation)
    }
}

impl<T> fmt::Display for TableRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

enum SlotState<T> {
    Free,
    Reserved,
    Filled(T),
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

/// Generation-tagged arena
pub struct ResourceTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Reserve an empty slot; it resolves to nothing until filled
    pub fn reserve(&mut self) -> TableRef<T> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Free,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.state = SlotState::Reserved;
        self.live += 1;
        TableRef {
            index,
            generation: slot.generation,
            _marker: PhantomData,
        }
    }

    /// Reserve and fill in one step
    pub fn insert(&mut self, value: T) -> TableRef<T> {
        let reference = self.reserve();
        self.slots[reference.index as usize].state = SlotState::Filled(value);
        reference
    }

    fn slot(&self, reference: TableRef<T>) -> Option<&Slot<T>> {
        self.slots
            .get(reference.index as usize)
            .filter(|slot| slot.generation == reference.generation)
    }

    fn slot_mut(&mut self, reference: TableRef<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(reference.index as usize)
            .filter(|slot| slot.generation == reference.generation)
    }

    /// Fill a reserved slot; returns the value back if the reference is stale or already filled
    pub fn fill(&mut self, reference: TableRef<T>, value: T) -> Result<(), T> {
        match self.slot_mut(reference) {
            Some(slot) if matches!(slot.state, SlotState::Reserved) => {
                slot.state = SlotState::Filled(value);
                Ok(())
            }
            _ => Err(value),
        }
    }

    pub fn resolve(&self, reference: TableRef<T>) -> Option<&T> {
        match &self.slot(reference)?.state {
            SlotState::Filled(value) => Some(value),
            _ => None,
        }
    }

    pub fn resolve_mut(&mut self, reference: TableRef<T>) -> Option<&mut T> {
        match &mut self.slot_mut(reference)?.state {
            SlotState::Filled(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the reference still names a reserved or filled slot
    pub fn is_live(&self, reference: TableRef<T>) -> bool {
        self.slot(reference)
            .map(|slot| !matches!(slot.state, SlotState::Free))
            .unwrap_or(false)
    }

    /// Free the slot and return its value, if it had one
    ///
    /// Stale references are ignored and return `None`.
    pub fn reclaim(&mut self, reference: TableRef<T>) -> Option<T> {
        let slot = self.slot_mut(reference)?;
        if matches!(slot.state, SlotState::Free) {
            return None;
        }
        let state = std::mem::replace(&mut slot.state, SlotState::Free);
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(reference.index);
        self.live -= 1;
        match state {
            SlotState::Filled(value) => Some(value),
            _ => None,
        }
    }

    /// Reserved plus filled slots
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Reclaim every slot, returning the filled values
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if matches!(slot.state, SlotState::Free) {
                continue;
            }
            if let SlotState::Filled(value) = std::mem::replace(&mut slot.state, SlotState::Free) {
                values.push(value);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
        self.live = 0;
        values
    }
}

impl<T> fmt::Debug for ResourceTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_fill() {
        let mut table = ResourceTable::<u64>::new();
        let r = table.reserve();
        assert!(table.is_live(r));
        assert_eq!(table.resolve(r), None);
        assert!(table.fill(r, 7).is_ok());
        assert_eq!(table.resolve(r), Some(&7));
        assert_eq!(table.fill(r, 8), Err(8));
    }

    #[test]
    fn test_stale_reference_rejected() {
        let mut table = ResourceTable::<&str>::new();
        let first = table.insert("a");
        assert_eq!(table.reclaim(first), Some("a"));
        let second = table.insert("b");
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(table.resolve(first), None);
        assert_eq!(table.reclaim(first), None);
        assert_eq!(table.resolve(second), Some(&"b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_frees_all() {
        let mut table = ResourceTable::<u32>::new();
        let a = table.insert(1);
        let _reserved = table.reserve();
        table.insert(2);
        let mut values = table.drain();
        values.sort();
        assert_eq!(values, vec![1, 2]);
        assert!(table.is_empty());
        assert!(!table.is_live(a));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Reclaimed references never resolve again, whatever reuses their slot
            #[test]
            fn test_reclaimed_references_stay_dead(ops in prop::collection::vec(any::<(bool, u8)>(), 1..200)) {
                let mut table = ResourceTable::<u32>::new();
                let mut live: Vec<(TableRef<u32>, u32)> = Vec::new();
                let mut dead: Vec<TableRef<u32>> = Vec::new();

                for (step, (insert, pick)) in ops.into_iter().enumerate() {
                    if insert || live.is_empty() {
                        let value = step as u32;
                        live.push((table.insert(value), value));
                    } else {
                        let (reference, value) = live.swap_remove(pick as usize % live.len());
                        prop_assert_eq!(table.reclaim(reference), Some(value));
                        dead.push(reference);
                    }

                    prop_assert_eq!(table.len(), live.len());
                    for (reference, value) in &live {
                        prop_assert_eq!(table.resolve(*reference), Some(value));
                    }
                    for reference in &dead {
                        prop_assert!(!table.is_live(*reference));
                    }
                }
            }
        }
    }
}
