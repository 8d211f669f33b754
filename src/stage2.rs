//! Guest stage-2 translation context.
//!
//! The manager owns each VM's stage-2 root table (the PGD) and its VMID but
//! leaves page-table contents to a [`Stage2Ops`] implementation. It only
//! needs three things from that implementation: turn a donated PGD into an
//! empty table, give every page-table page back at teardown, and invalidate
//! TLB entries for a VMID before the VMID is reused.

use log::debug;

use crate::arch::aarch64::defs::*;
use crate::arch::aarch64::{make_vttbr, tlb_flush_vmid};
use crate::error::{PkvmError, Result};
use crate::mem_protect::{teardown_donated, MemProtect};
use crate::mm::{HypRegion, MemCache, PAGE_SIZE};

/// Largest number of concatenated root tables the architecture allows.
const MAX_CONCAT_PGD_PAGES: u64 = 16;

/// VTCR_EL2 value, decoded as far as PGD sizing needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vtcr(pub u64);

impl Vtcr {
    pub const fn ia_bits(self) -> u32 {
        64 - (self.0 & VTCR_T0SZ_MASK) as u32
    }

    /// Level of the root table (4KB granule).
    pub const fn start_level(self) -> Option<u32> {
        match (self.0 & VTCR_SL0_MASK) >> VTCR_SL0_SHIFT {
            0 => Some(2),
            1 => Some(1),
            2 => Some(0),
            _ => None,
        }
    }

    /// Bytes of (possibly concatenated) root table, `None` for a
    /// configuration the hardware would reject.
    pub fn pgd_size(self) -> Option<u64> {
        let level = self.start_level()?;
        let shift = PAGE_SHIFT + PT_BITS_PER_LEVEL * (3 - level);
        let ia = self.ia_bits();
        if ia <= shift || ia > 52 {
            return None;
        }
        let entries = 1u64 << (ia - shift);
        let pages = (entries * PTE_SIZE / PAGE_SIZE).max(1);
        if pages > MAX_CONCAT_PGD_PAGES {
            return None;
        }
        Some(pages * PAGE_SIZE)
    }
}

/// Stage-2 MMU state of one VM.
#[derive(Debug)]
pub struct Stage2Mmu {
    vmid: u16,
    vtcr: Vtcr,
    pgd: Option<HypRegion>,
}

impl Stage2Mmu {
    pub fn new(vmid: u16, vtcr: Vtcr, pgd: HypRegion) -> Self {
        Self {
            vmid,
            vtcr,
            pgd: Some(pgd),
        }
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn vtcr(&self) -> Vtcr {
        self.vtcr
    }

    pub fn pgd(&self) -> Option<&HypRegion> {
        self.pgd.as_ref()
    }

    /// Physical address of the root table, 0 once it has been reclaimed.
    pub fn pgd_phys(&self) -> u64 {
        self.pgd.as_ref().map_or(0, HypRegion::addr)
    }

    pub fn vttbr(&self) -> u64 {
        make_vttbr(self.pgd_phys(), self.vmid)
    }

    pub fn take_pgd(&mut self) -> Option<HypRegion> {
        self.pgd.take()
    }
}

/// Page-table operations the lifecycle manager delegates.
pub trait Stage2Ops {
    /// Initialize an empty stage-2 table in the MMU's donated PGD.
    fn prepare<M: MemProtect + ?Sized>(&self, mem: &M, mmu: &mut Stage2Mmu) -> Result<()>;

    /// Give every page-table page back to the host, recording each page in
    /// `mc`. Leaves the MMU without a PGD.
    fn reclaim<M: MemProtect + ?Sized>(
        &self,
        mem: &M,
        mmu: &mut Stage2Mmu,
        mc: &mut MemCache,
    ) -> Result<()>;

    /// Invalidate all TLB entries tagged with the MMU's VMID.
    fn flush_vmid(&self, mmu: &Stage2Mmu) {
        tlb_flush_vmid(mmu.vttbr());
    }
}

/// Stage-2 backend whose only table is the root: guests map nothing through
/// the manager, so the PGD is the whole page-table pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStage2;

impl Stage2Ops for PoolStage2 {
    fn prepare<M: MemProtect + ?Sized>(&self, mem: &M, mmu: &mut Stage2Mmu) -> Result<()> {
        let expected = mmu.vtcr.pgd_size().ok_or(PkvmError::Invalid)?;
        let pgd = mmu.pgd.as_ref().ok_or(PkvmError::Invalid)?;
        if pgd.size() != expected {
            return Err(PkvmError::Invalid);
        }
        // Every root entry starts out invalid.
        mem.zero(pgd);
        debug!(
            "pkvm: stage-2 vmid {} pgd {:#x} ({} pages)",
            mmu.vmid,
            pgd.addr(),
            pgd.nr_pages()
        );
        Ok(())
    }

    fn reclaim<M: MemProtect + ?Sized>(
        &self,
        mem: &M,
        mmu: &mut Stage2Mmu,
        mc: &mut MemCache,
    ) -> Result<()> {
        let pgd = mmu.take_pgd().ok_or(PkvmError::NotFound)?;
        teardown_donated(mem, mc, pgd);
        Ok(())
    }
}
