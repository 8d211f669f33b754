//! Per-physical-CPU load slots.
//!
//! One slot per physical CPU records the vCPU currently loaded there. A
//! slot is only ever filled by its own CPU; it may be cleared by the put
//! path, which runs under the VM table lock.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::sync::SpinLock;
use crate::vcpu::Vcpu;

pub struct LoadSlots {
    slots: Box<[SpinLock<Option<Arc<Vcpu>>>]>,
}

impl LoadSlots {
    pub fn new(nr_cpus: usize) -> Self {
        let slots: Vec<_> = (0..nr_cpus).map(|_| SpinLock::new(None)).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    /// The vCPU loaded on `cpu`, if any. Out-of-range CPUs have none.
    pub fn get(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        self.slots.get(cpu).and_then(|slot| slot.lock().clone())
    }

    pub fn is_empty(&self, cpu: usize) -> bool {
        self.slots.get(cpu).map_or(true, |slot| slot.lock().is_none())
    }

    pub fn set(&self, cpu: usize, vcpu: Arc<Vcpu>) {
        if let Some(slot) = self.slots.get(cpu) {
            *slot.lock() = Some(vcpu);
        }
    }

    pub fn clear(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        self.slots.get(cpu).and_then(|slot| slot.lock().take())
    }
}
