//! Cache and TLB maintenance at EL2.

use super::defs::*;

/// Clean and invalidate `[va, va + size)` to the point of coherency.
///
/// Required before memory is handed back to the host so that scrubbed
/// contents are visible to a non-cacheable host mapping.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn dcache_clean_inval_poc(va: u64, size: u64) {
    let end = va + size;
    let mut line = va & !(DCACHE_LINE_SIZE - 1);
    while line < end {
        unsafe {
            core::arch::asm!("dc civac, {addr}", addr = in(reg) line, options(nostack));
        }
        line += DCACHE_LINE_SIZE;
    }
    unsafe { core::arch::asm!("dsb sy", options(nostack, nomem)) };
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn dcache_clean_inval_poc(_va: u64, _size: u64) {}

/// Encode VTTBR_EL2 from a stage-2 root table and VMID.
pub const fn make_vttbr(pgd_phys: u64, vmid: u16) -> u64 {
    ((vmid as u64) << VTTBR_VMID_SHIFT) | (pgd_phys & VTTBR_BADDR_MASK)
}

/// Invalidate all stage-1 and stage-2 TLB entries tagged with `vttbr`'s
/// VMID, inner-shareable.
///
/// The current VTTBR_EL2 is restored afterwards so the caller's own
/// translation regime is unaffected.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn tlb_flush_vmid(vttbr: u64) {
    unsafe {
        let saved: u64;
        core::arch::asm!("mrs {}, vttbr_el2", out(reg) saved, options(nomem, nostack));
        core::arch::asm!(
            "msr vttbr_el2, {vttbr}",
            "isb",
            "tlbi vmalls12e1is",
            "dsb ish",
            "isb",
            "msr vttbr_el2, {saved}",
            "isb",
            vttbr = in(reg) vttbr,
            saved = in(reg) saved,
            options(nostack),
        );
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub fn tlb_flush_vmid(_vttbr: u64) {}

/// Read current physical CPU ID from MPIDR_EL1.Aff0
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[inline(always)]
pub fn current_cpu_id() -> usize {
    let mpidr: u64;
    unsafe { core::arch::asm!("mrs {}, MPIDR_EL1", out(reg) mpidr, options(nomem, nostack)) };
    (mpidr & MPIDR_AFF0_MASK) as usize
}

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
#[inline(always)]
pub fn current_cpu_id() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vttbr_vmid_encoding() {
        let vttbr = make_vttbr(0x4100_0000, 1);
        assert_eq!(vttbr >> VTTBR_VMID_SHIFT, 1);
        assert_eq!(vttbr & VTTBR_BADDR_MASK, 0x4100_0000);

        // CnP (bit 0) never leaks in from a misaligned base.
        let vttbr = make_vttbr(0x6100_0001, 0xFF);
        assert_eq!(vttbr & 1, 0);
        assert_eq!(vttbr >> VTTBR_VMID_SHIFT, 0xFF);
    }
}
