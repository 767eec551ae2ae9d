/*!
 * Handle Table
 * Per-process map from handle values to kernel objects
 *
 * Handle layout: bits 0-14 slot index, bits 15-29 linear id, bits 30-31 zero.
 * Every allocation takes a fresh linear id, so a handle whose slot has been
 * recycled no longer resolves.
 */

use super::object::KernelObject;
use crate::core::errors::KernelError;
use crate::core::limits::MAX_HANDLE_TABLE_CAPACITY;
use crate::core::types::{Handle, KernelResult};
use log::debug;

const INDEX_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const LINEAR_ID_MASK: u16 = (1 << 15) - 1;
const RESERVED_MASK: u32 = 0xC000_0000;

struct Slot {
    linear_id: u16,
    object: KernelObject,
}

pub struct HandleTable {
    slots: Vec<Option<Slot>>,
    free: Vec<u16>,
    next_linear_id: u16,
    capacity: usize,
    count: usize,
    peak: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_HANDLE_TABLE_CAPACITY);
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_linear_id: 1,
            capacity,
            count: 0,
            peak: 0,
        }
    }

    fn encode(index: u16, linear_id: u16) -> Handle {
        (index as u32) | ((linear_id as u32) << INDEX_BITS)
    }

    fn decode(handle: Handle) -> Option<(usize, u16)> {
        if handle == 0 || handle & RESERVED_MASK != 0 {
            return None;
        }
        let index = (handle & INDEX_MASK) as usize;
        let linear_id = ((handle >> INDEX_BITS) as u16) & LINEAR_ID_MASK;
        (linear_id != 0).then_some((index, linear_id))
    }

    fn take_linear_id(&mut self) -> u16 {
        let id = self.next_linear_id;
        self.next_linear_id = if id >= LINEAR_ID_MASK { 1 } else { id + 1 };
        id
    }

    /// Insert an object, failing with OutOfHandles when full
    pub fn add(&mut self, object: KernelObject) -> KernelResult<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                (self.slots.len() - 1) as u16
            }
            None => {
                return Err(KernelError::OutOfHandles {
                    capacity: self.capacity,
                })
            }
        };
        let linear_id = self.take_linear_id();
        self.slots[index as usize] = Some(Slot { linear_id, object });
        self.count += 1;
        self.peak = self.peak.max(self.count);
        let handle = Self::encode(index, linear_id);
        debug!("Handle {:#010x} allocated", handle);
        Ok(handle)
    }

    fn slot(&self, handle: Handle) -> Option<&Slot> {
        let (index, linear_id) = Self::decode(handle)?;
        self.slots
            .get(index)?
            .as_ref()
            .filter(|slot| slot.linear_id == linear_id)
    }

    pub fn get(&self, handle: Handle) -> KernelResult<KernelObject> {
        self.slot(handle)
            .map(|slot| slot.object.clone())
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slot(handle).is_some()
    }

    /// Remove a handle and return its object
    ///
    /// The object is returned rather than dropped so callers can release it
    /// outside their own locks.
    pub fn remove(&mut self, handle: Handle) -> KernelResult<KernelObject> {
        if self.slot(handle).is_none() {
            return Err(KernelError::InvalidHandle(handle));
        }
        let index = (handle & INDEX_MASK) as usize;
        let slot = self.slots[index].take().ok_or(KernelError::InvalidHandle(handle))?;
        self.free.push(index as u16);
        self.count -= 1;
        Ok(slot.object)
    }

    /// Add a second handle to the object behind `handle`
    pub fn duplicate(&mut self, handle: Handle) -> KernelResult<Handle> {
        let object = self.get(handle)?;
        self.add(object)
    }

    /// Empty the table, returning every object
    pub fn drain(&mut self) -> Vec<KernelObject> {
        self.free.clear();
        self.count = 0;
        self.slots
            .drain(..)
            .flatten()
            .map(|slot| slot.object)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn peak(&self) -> usize {
        self.peak
    }
}
