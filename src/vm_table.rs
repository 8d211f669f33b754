//! VM handle table.
//!
//! A fixed-capacity array of slots indexed by `handle - HANDLE_OFFSET`. The
//! table itself is not synchronized; the manager keeps it behind the single
//! VM table lock and every method here runs with that lock held.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{PkvmError, Result};
use crate::vm::Vm;

/// Handles start here rather than at 0, so 0 is never a valid handle and a
/// small integer from a confused host is rejected outright.
pub const HANDLE_OFFSET: u32 = 0x1000;

pub enum Slot {
    Empty,
    /// Handed out by `reserve` and not yet published.
    Reserved,
    Init(Box<Vm>),
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

pub struct VmTable {
    slots: Box<[Slot]>,
}

/// Table slot index for `handle`, `None` below the offset or past the end.
pub fn handle_to_idx(handle: u32, capacity: usize) -> Option<usize> {
    let idx = handle.checked_sub(HANDLE_OFFSET)? as usize;
    (idx < capacity).then_some(idx)
}

pub const fn idx_to_handle(idx: usize) -> u32 {
    idx as u32 + HANDLE_OFFSET
}

impl VmTable {
    pub fn new(max_vms: usize) -> Self {
        let slots: Vec<Slot> = (0..max_vms).map(|_| Slot::Empty).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, handle: u32) -> Option<&Slot> {
        self.slots.get(handle_to_idx(handle, self.capacity())?)
    }

    fn slot_mut(&mut self, handle: u32) -> Option<&mut Slot> {
        let idx = handle_to_idx(handle, self.capacity())?;
        self.slots.get_mut(idx)
    }

    /// Claim the lowest empty slot.
    pub fn reserve(&mut self) -> Result<u32> {
        let idx = self
            .slots
            .iter()
            .position(Slot::is_empty)
            .ok_or(PkvmError::OutOfResources)?;
        self.slots[idx] = Slot::Reserved;
        Ok(idx_to_handle(idx))
    }

    /// Release a reservation that was never published. Anything else is
    /// left alone.
    pub fn unreserve(&mut self, handle: u32) -> bool {
        match self.slot_mut(handle) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Empty;
                true
            }
            _ => false,
        }
    }

    /// Make `vm` visible under `handle`. Fails with `Invalid`, returning the
    /// VM, unless the slot is still reserved.
    pub fn publish(&mut self, handle: u32, vm: Box<Vm>) -> core::result::Result<(), (PkvmError, Box<Vm>)> {
        match self.slot_mut(handle) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Init(vm);
                Ok(())
            }
            _ => Err((PkvmError::Invalid, vm)),
        }
    }

    pub fn get(&self, handle: u32) -> Option<&Vm> {
        match self.slot(handle)? {
            Slot::Init(vm) => Some(vm),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut Vm> {
        match self.slot_mut(handle)? {
            Slot::Init(vm) => Some(vm),
            _ => None,
        }
    }

    /// Take an initialized VM out of the table, leaving the slot empty.
    pub fn remove(&mut self, handle: u32) -> Option<Box<Vm>> {
        let slot = self.slot_mut(handle)?;
        if !matches!(slot, Slot::Init(_)) {
            return None;
        }
        match core::mem::replace(slot, Slot::Empty) {
            Slot::Init(vm) => Some(vm),
            _ => None,
        }
    }

    pub fn is_reserved(&self, handle: u32) -> bool {
        matches!(self.slot(handle), Some(Slot::Reserved))
    }

    pub fn nr_reserved(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Reserved)).count()
    }

    pub fn nr_initialized(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Init(_))).count()
    }

    /// Initialized VMs in handle order.
    pub fn vms(&self) -> impl Iterator<Item = &Vm> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Init(vm) => Some(&**vm),
            _ => None,
        })
    }
}
