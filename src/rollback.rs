//! Scope guards for multi-step initialization.
//!
//! Each successful pin or donation is wrapped in a guard whose `Drop` undoes
//! it. Guards are declared in the order the steps happen, so an early return
//! drops them in reverse and the host pin taken first is released last.
//! Once every step has succeeded the caller disarms the guards with
//! [`Pinned::keep`] / [`Donated::into_region`].

use crate::mem_protect::{unmap_donated, MemProtect};
use crate::mm::{HostRegion, HypRegion};

/// Pinned host memory, unpinned on drop unless kept.
#[must_use]
pub struct Pinned<'a, M: MemProtect + ?Sized> {
    mem: &'a M,
    region: Option<HostRegion>,
}

impl<'a, M: MemProtect + ?Sized> Pinned<'a, M> {
    pub fn pin(mem: &'a M, region: HostRegion) -> crate::error::Result<Self> {
        mem.pin(region)?;
        Ok(Self {
            mem,
            region: Some(region),
        })
    }

    /// Disarm: the pin now lives as long as the object that owns `region`.
    pub fn keep(mut self) -> HostRegion {
        match self.region.take() {
            Some(region) => region,
            None => unreachable!("pin guard disarmed twice"),
        }
    }
}

impl<M: MemProtect + ?Sized> Drop for Pinned<'_, M> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            self.mem.unpin(region);
        }
    }
}

/// Donated memory, scrubbed and returned to the host on drop unless kept.
#[must_use]
pub struct Donated<'a, M: MemProtect + ?Sized> {
    mem: &'a M,
    region: Option<HypRegion>,
}

impl<'a, M: MemProtect + ?Sized> Donated<'a, M> {
    pub fn new(mem: &'a M, region: HypRegion) -> Self {
        Self {
            mem,
            region: Some(region),
        }
    }

    pub fn addr(&self) -> u64 {
        self.region.as_ref().map_or(0, HypRegion::addr)
    }

    pub fn size(&self) -> u64 {
        self.region.as_ref().map_or(0, HypRegion::size)
    }

    pub fn into_region(mut self) -> HypRegion {
        match self.region.take() {
            Some(region) => region,
            None => unreachable!("donation guard disarmed twice"),
        }
    }
}

impl<M: MemProtect + ?Sized> Drop for Donated<'_, M> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            unmap_donated(self.mem, region);
        }
    }
}
