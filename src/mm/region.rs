//! Host and hypervisor address ranges.
//!
//! The hypervisor's linear map mirrors the host's, so a donated range keeps
//! its address when it changes owner. Only the type changes: a
//! [`HostRegion`] is a claim the host makes, a [`HypRegion`] is proof that
//! the pages now belong to the hypervisor.

use crate::arch::aarch64::defs::{PAGE_MASK_4KB, PAGE_SHIFT, PAGE_SIZE_4KB};

pub const PAGE_SIZE: u64 = PAGE_SIZE_4KB;

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_MASK_4KB == 0
}

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !PAGE_MASK_4KB
}

/// Round up to the next page boundary, `None` on overflow.
#[inline]
pub const fn page_align_up(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK_4KB) {
        Some(v) => Some(v & !PAGE_MASK_4KB),
        None => None,
    }
}

/// A range of host virtual addresses supplied by the untrusted host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRegion {
    addr: u64,
    size: u64,
}

impl HostRegion {
    pub const fn new(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end, `None` if the host handed us a wrapping range.
    pub const fn checked_end(&self) -> Option<u64> {
        self.addr.checked_add(self.size)
    }

    pub const fn is_page_aligned(&self) -> bool {
        is_page_aligned(self.addr)
    }

    /// Pages covered once the size is rounded up, as donation counts them.
    pub fn nr_pages(&self) -> Option<u64> {
        page_align_up(self.size).map(|s| s >> PAGE_SHIFT)
    }

    /// Smallest page-aligned range containing this one, as pinning counts it.
    pub fn page_span(&self) -> Option<HostRegion> {
        let start = page_align_down(self.addr);
        let end = page_align_up(self.checked_end()?)?;
        Some(HostRegion::new(start, end - start))
    }

    /// Addresses of every page in [`Self::page_span`].
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        let (start, count) = match self.page_span() {
            Some(span) => (span.addr, span.size >> PAGE_SHIFT),
            None => (0, 0),
        };
        (0..count).map(move |i| start + i * PAGE_SIZE)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && self.checked_end().map_or(true, |end| addr < end)
    }
}

/// Page-aligned memory owned by the hypervisor.
///
/// Deliberately neither `Clone` nor `Copy`: the only way to give the pages
/// back is to hand this token to
/// [`MemProtect::donate_to_host`](crate::mem_protect::MemProtect::donate_to_host).
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a HypRegion leaks the pages from the host"]
pub struct HypRegion {
    addr: u64,
    size: u64,
}

impl HypRegion {
    /// # Safety
    ///
    /// The caller must own `[addr, addr + size)` at stage-2: the range must
    /// have been transitioned to the hypervisor by a successful donation and
    /// not be described by any other live `HypRegion`.
    pub const unsafe fn from_raw(addr: u64, size: u64) -> Self {
        Self { addr, size }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn nr_pages(&self) -> u64 {
        self.size >> PAGE_SHIFT
    }

    /// The same pages as the host addresses them.
    pub const fn as_host(&self) -> HostRegion {
        HostRegion::new(self.addr, self.size)
    }

    /// Split into single-page regions, lowest address first.
    pub fn into_pages(self) -> impl Iterator<Item = HypRegion> {
        let HypRegion { addr, size } = self;
        (0..size >> PAGE_SHIFT).map(move |i| HypRegion {
            addr: addr + i * PAGE_SIZE,
            size: PAGE_SIZE,
        })
    }
}
