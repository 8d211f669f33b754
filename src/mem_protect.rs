//! Memory protection: ownership transitions between host and hypervisor.
//!
//! Every byte the hypervisor takes from the host or gives back goes through
//! [`MemProtect`]. The helpers in this module add the scrubbing and cache
//! maintenance the lifecycle code relies on, so callers never issue a bare
//! donation.

use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;

use log::{trace, warn};

use crate::error::{PkvmError, Result};
use crate::mm::region::page_align_down;
use crate::mm::{HostRegion, HypRegion, MemCache, PAGE_SIZE};
use crate::sync::SpinLock;

/// Page-ownership transitions offered to the VM manager.
pub trait MemProtect {
    /// Keep host-shared pages from being revoked while the hypervisor reads
    /// them. `Busy` if any page is already pinned.
    fn pin(&self, region: HostRegion) -> Result<()>;

    fn unpin(&self, region: HostRegion);

    /// Transfer exclusively host-owned, page-aligned memory to the
    /// hypervisor. The host loses stage-2 access on success.
    fn donate_from_host(&self, region: HostRegion) -> Result<HypRegion>;

    /// Give hypervisor memory back to the host. Callers must have flushed
    /// the range to the point of coherency first.
    fn donate_to_host(&self, region: HypRegion) -> Result<()>;

    fn zero(&self, region: &HypRegion);

    fn flush_to_poc(&self, region: &HypRegion);
}

/// Donate `region` and scrub it before anything reads it.
pub fn map_donated<M: MemProtect + ?Sized>(mem: &M, region: HostRegion) -> Result<HypRegion> {
    let hyp = map_donated_noclear(mem, region)?;
    mem.zero(&hyp);
    Ok(hyp)
}

/// Donate `region` without scrubbing. Only for memory that is completely
/// rewritten before its first read.
pub fn map_donated_noclear<M: MemProtect + ?Sized>(
    mem: &M,
    region: HostRegion,
) -> Result<HypRegion> {
    if !region.is_page_aligned() {
        return Err(PkvmError::NoMemory);
    }
    mem.donate_from_host(region).map_err(|_| PkvmError::NoMemory)
}

/// Scrub, flush and return memory to the host.
pub fn unmap_donated<M: MemProtect + ?Sized>(mem: &M, region: HypRegion) {
    mem.zero(&region);
    unmap_donated_noclear(mem, region);
}

/// Flush and return memory to the host.
pub fn unmap_donated_noclear<M: MemProtect + ?Sized>(mem: &M, region: HypRegion) {
    mem.flush_to_poc(&region);
    let (addr, size) = (region.addr(), region.size());
    if let Err(e) = mem.donate_to_host(region) {
        warn!("pkvm: failed to return {:#x}+{:#x} to host: {}", addr, size, e);
    }
}

/// Scrub a state region, record each page in the host's teardown cache and
/// return it to the host.
pub fn teardown_donated<M: MemProtect + ?Sized>(mem: &M, mc: &mut MemCache, region: HypRegion) {
    mem.zero(&region);
    for page in region.as_host().pages() {
        mc.push(page);
    }
    unmap_donated_noclear(mem, region);
}

/// Host view of a page (matches the stage-2 PTE software bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageState {
    /// Exclusively owned by the host.
    Owned = 0b00,
    /// Owned by the host and shared with the hypervisor.
    SharedOwned = 0b01,
    /// Donated to the hypervisor; the host has no access.
    Donated = 0b11,
}

#[derive(Debug, Clone, Copy)]
struct PageEntry {
    state: PageState,
    pinned: bool,
    /// Written by the hypervisor since the last flush.
    dirty: bool,
}

impl PageEntry {
    const HOST: PageEntry = PageEntry {
        state: PageState::Owned,
        pinned: false,
        dirty: false,
    };
}

/// Counters kept by [`PageTracker`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    pub pages_donated_in: u64,
    pub pages_donated_out: u64,
    pub pages_zeroed: u64,
    pub flushes: u64,
    /// Pages handed back to the host while still dirty in the cache.
    pub unflushed_returns: u64,
}

/// Page-granular [`MemProtect`] implementation over one physical range.
///
/// The tracker owns the ownership bookkeeping only. On bare-metal AArch64
/// the hypervisor runs with an identity map, so [`MemProtect::zero`] and
/// [`MemProtect::flush_to_poc`] also touch the pages themselves; hosted
/// builds keep the bookkeeping and counters.
pub struct PageTracker {
    base: u64,
    pages: SpinLock<Vec<PageEntry>>,
    stats: SpinLock<TrackerStats>,
}

impl PageTracker {
    /// Track `size` bytes of host memory starting at `base`; every page
    /// starts out exclusively host-owned.
    pub fn new(base: u64, size: u64) -> Self {
        let base = page_align_down(base);
        let nr_pages = (size / PAGE_SIZE) as usize;
        Self {
            base,
            pages: SpinLock::new(vec![PageEntry::HOST; nr_pages]),
            stats: SpinLock::new(TrackerStats::default()),
        }
    }

    fn index(&self, addr: u64) -> Option<usize> {
        Some((addr.checked_sub(self.base)? / PAGE_SIZE) as usize)
    }

    fn span(&self, pages: &[PageEntry], region: HostRegion) -> Result<Range<usize>> {
        let span = region.page_span().ok_or(PkvmError::Invalid)?;
        self.range(pages, span.addr(), span.size() / PAGE_SIZE)
    }

    fn range(&self, pages: &[PageEntry], addr: u64, nr_pages: u64) -> Result<Range<usize>> {
        let start = self.index(addr).ok_or(PkvmError::Invalid)?;
        let end = start
            .checked_add(nr_pages as usize)
            .filter(|&end| end <= pages.len())
            .ok_or(PkvmError::Invalid)?;
        if start == end {
            return Err(PkvmError::Invalid);
        }
        Ok(start..end)
    }

    /// Host shares its own pages with the hypervisor so they can be pinned.
    pub fn share_hyp(&self, region: HostRegion) -> Result<()> {
        let mut pages = self.pages.lock();
        let range = self.span(&pages, region)?;
        if pages[range.clone()].iter().any(|p| p.state != PageState::Owned) {
            return Err(PkvmError::Invalid);
        }
        for page in &mut pages[range] {
            page.state = PageState::SharedOwned;
        }
        Ok(())
    }

    /// Host revokes a share; refused while any page is pinned.
    pub fn unshare_hyp(&self, region: HostRegion) -> Result<()> {
        let mut pages = self.pages.lock();
        let range = self.span(&pages, region)?;
        let shared = &pages[range.clone()];
        if shared.iter().any(|p| p.state != PageState::SharedOwned) {
            return Err(PkvmError::Invalid);
        }
        if shared.iter().any(|p| p.pinned) {
            return Err(PkvmError::Busy);
        }
        for page in &mut pages[range] {
            page.state = PageState::Owned;
        }
        Ok(())
    }

    /// State of the page containing `addr`, `None` outside the tracked range.
    pub fn state(&self, addr: u64) -> Option<PageState> {
        let pages = self.pages.lock();
        let idx = self.index(addr)?;
        pages.get(idx).map(|p| p.state)
    }

    pub fn is_pinned(&self, addr: u64) -> bool {
        let pages = self.pages.lock();
        self.index(addr)
            .and_then(|idx| pages.get(idx))
            .map_or(false, |p| p.pinned)
    }

    pub fn count(&self, state: PageState) -> usize {
        self.pages.lock().iter().filter(|p| p.state == state).count()
    }

    pub fn pinned_pages(&self) -> usize {
        self.pages.lock().iter().filter(|p| p.pinned).count()
    }

    /// Ownership of every tracked page, lowest address first.
    pub fn snapshot(&self) -> Vec<PageState> {
        self.pages.lock().iter().map(|p| p.state).collect()
    }

    pub fn stats(&self) -> TrackerStats {
        *self.stats.lock()
    }
}

impl MemProtect for PageTracker {
    fn pin(&self, region: HostRegion) -> Result<()> {
        let mut pages = self.pages.lock();
        let range = self.span(&pages, region)?;
        for page in &pages[range.clone()] {
            if page.state != PageState::SharedOwned {
                return Err(PkvmError::Invalid);
            }
            if page.pinned {
                return Err(PkvmError::Busy);
            }
        }
        for page in &mut pages[range] {
            page.pinned = true;
        }
        Ok(())
    }

    fn unpin(&self, region: HostRegion) {
        let mut pages = self.pages.lock();
        let Ok(range) = self.span(&pages, region) else {
            warn!("pkvm: unpin of untracked range {:#x}", region.addr());
            return;
        };
        for page in &mut pages[range] {
            if !page.pinned {
                warn!("pkvm: unpin of unpinned page in {:#x}", region.addr());
            }
            page.pinned = false;
        }
    }

    fn donate_from_host(&self, region: HostRegion) -> Result<HypRegion> {
        if !region.is_page_aligned() {
            return Err(PkvmError::Invalid);
        }
        let nr_pages = region.nr_pages().ok_or(PkvmError::Invalid)?;
        let mut pages = self.pages.lock();
        let range = self.range(&pages, region.addr(), nr_pages)?;
        if pages[range.clone()]
            .iter()
            .any(|p| p.state != PageState::Owned || p.pinned)
        {
            return Err(PkvmError::Invalid);
        }
        for page in &mut pages[range] {
            page.state = PageState::Donated;
            page.dirty = false;
        }
        drop(pages);

        self.stats.lock().pages_donated_in += nr_pages;
        trace!("pkvm: host donated {:#x}, {} pages", region.addr(), nr_pages);
        // SAFETY: the pages were exclusively host-owned and are now marked
        // donated, so no other HypRegion can describe them.
        Ok(unsafe { HypRegion::from_raw(region.addr(), nr_pages * PAGE_SIZE) })
    }

    fn donate_to_host(&self, region: HypRegion) -> Result<()> {
        let mut pages = self.pages.lock();
        let range = self.range(&pages, region.addr(), region.nr_pages())?;
        if pages[range.clone()].iter().any(|p| p.state != PageState::Donated) {
            return Err(PkvmError::Invalid);
        }
        let mut unflushed = 0;
        for page in &mut pages[range] {
            if page.dirty {
                unflushed += 1;
            }
            *page = PageEntry::HOST;
        }
        drop(pages);

        if unflushed != 0 {
            warn!("pkvm: {:#x} returned to host without a flush", region.addr());
        }
        let mut stats = self.stats.lock();
        stats.pages_donated_out += region.nr_pages();
        stats.unflushed_returns += unflushed;
        Ok(())
    }

    fn zero(&self, region: &HypRegion) {
        #[cfg(all(target_arch = "aarch64", target_os = "none"))]
        // SAFETY: the region is hypervisor-owned and identity mapped at EL2.
        unsafe {
            core::ptr::write_bytes(region.addr() as *mut u8, 0, region.size() as usize)
        };

        let mut pages = self.pages.lock();
        if let Ok(range) = self.range(&pages, region.addr(), region.nr_pages()) {
            for page in &mut pages[range] {
                page.dirty = true;
            }
        }
        drop(pages);
        self.stats.lock().pages_zeroed += region.nr_pages();
    }

    fn flush_to_poc(&self, region: &HypRegion) {
        crate::arch::aarch64::dcache_clean_inval_poc(region.addr(), region.size());

        let mut pages = self.pages.lock();
        if let Ok(range) = self.range(&pages, region.addr(), region.nr_pages()) {
            for page in &mut pages[range] {
                page.dirty = false;
            }
        }
        drop(pages);
        self.stats.lock().flushes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x4000_0000;

    fn tracker() -> PageTracker {
        PageTracker::new(BASE, 64 * PAGE_SIZE)
    }

    #[test]
    fn test_donate_round_trip() {
        let t = tracker();
        let hyp = t.donate_from_host(HostRegion::new(BASE, 0x1800)).unwrap();
        assert_eq!(hyp.size(), 2 * PAGE_SIZE);
        assert_eq!(t.state(BASE + PAGE_SIZE), Some(PageState::Donated));
        assert_eq!(t.count(PageState::Donated), 2);

        unmap_donated(&t, hyp);
        assert_eq!(t.count(PageState::Donated), 0);
        let stats = t.stats();
        assert_eq!(stats.pages_donated_in, 2);
        assert_eq!(stats.pages_donated_out, 2);
        assert_eq!(stats.unflushed_returns, 0);
    }

    #[test]
    fn test_donate_rejects_unaligned_and_foreign() {
        let t = tracker();
        assert_eq!(
            t.donate_from_host(HostRegion::new(BASE + 8, PAGE_SIZE)),
            Err(PkvmError::Invalid)
        );
        assert_eq!(
            t.donate_from_host(HostRegion::new(BASE - PAGE_SIZE, PAGE_SIZE)),
            Err(PkvmError::Invalid)
        );
        assert_eq!(
            t.donate_from_host(HostRegion::new(BASE + 63 * PAGE_SIZE, 2 * PAGE_SIZE)),
            Err(PkvmError::Invalid)
        );

        let _hyp = t.donate_from_host(HostRegion::new(BASE, PAGE_SIZE)).unwrap();
        assert_eq!(
            t.donate_from_host(HostRegion::new(BASE, PAGE_SIZE)),
            Err(PkvmError::Invalid)
        );
    }

    #[test]
    fn test_map_donated_maps_failure_to_nomem() {
        let t = tracker();
        assert_eq!(
            map_donated(&t, HostRegion::new(BASE + 1, PAGE_SIZE)),
            Err(PkvmError::NoMemory)
        );
        let hyp = map_donated(&t, HostRegion::new(BASE, PAGE_SIZE)).unwrap();
        assert_eq!(t.stats().pages_zeroed, 1);
        unmap_donated_noclear(&t, hyp);
    }

    #[test]
    fn test_pin_requires_share_and_is_exclusive() {
        let t = tracker();
        let host = HostRegion::new(BASE + 0x100, 0x200);
        assert_eq!(t.pin(host), Err(PkvmError::Invalid));

        t.share_hyp(host).unwrap();
        t.pin(host).unwrap();
        assert!(t.is_pinned(BASE));
        assert_eq!(t.pin(host), Err(PkvmError::Busy));
        assert_eq!(t.unshare_hyp(host), Err(PkvmError::Busy));

        t.unpin(host);
        assert!(!t.is_pinned(BASE));
        t.unshare_hyp(host).unwrap();
        assert_eq!(t.state(BASE), Some(PageState::Owned));
    }

    #[test]
    fn test_shared_pages_cannot_be_donated() {
        let t = tracker();
        let host = HostRegion::new(BASE, PAGE_SIZE);
        t.share_hyp(host).unwrap();
        assert_eq!(t.donate_from_host(host), Err(PkvmError::Invalid));
    }

    #[test]
    fn test_return_without_flush_is_counted() {
        let t = tracker();
        let hyp = map_donated(&t, HostRegion::new(BASE, PAGE_SIZE)).unwrap();
        t.donate_to_host(hyp).unwrap();
        assert_eq!(t.stats().unflushed_returns, 1);
    }

    #[test]
    fn test_teardown_donated_fills_cache() {
        let t = tracker();
        let hyp = map_donated(&t, HostRegion::new(BASE, 2 * PAGE_SIZE)).unwrap();
        let mut mc = MemCache::new();
        teardown_donated(&t, &mut mc, hyp);
        assert_eq!(mc.len(), 2);
        assert!(mc.contains(BASE + PAGE_SIZE));
        assert_eq!(t.count(PageState::Owned), 64);
        assert_eq!(t.stats().unflushed_returns, 0);
    }
}
