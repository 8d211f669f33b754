//! ARM64 Architecture Constants
//!
//! Named constants for the EL2 system register fields the VM/vCPU manager
//! programs or inspects: trap controls, stage-2 translation control and
//! page geometry.

// ── HCR_EL2 (Hypervisor Configuration Register) ─────────────────────
pub const HCR_VM: u64 = 1 << 0;
pub const HCR_SWIO: u64 = 1 << 1;
pub const HCR_PTW: u64 = 1 << 2;
pub const HCR_FMO: u64 = 1 << 3;
pub const HCR_IMO: u64 = 1 << 4;
pub const HCR_AMO: u64 = 1 << 5;
pub const HCR_FB: u64 = 1 << 9;
pub const HCR_BSU_IS: u64 = 1 << 10;
pub const HCR_TWI: u64 = 1 << 13;
pub const HCR_TWE: u64 = 1 << 14;
pub const HCR_TID1: u64 = 1 << 16;
pub const HCR_TID2: u64 = 1 << 17;
pub const HCR_TID3: u64 = 1 << 18;
pub const HCR_TSC: u64 = 1 << 19;
pub const HCR_TIDCP: u64 = 1 << 20;
pub const HCR_TACR: u64 = 1 << 21;
pub const HCR_TSW: u64 = 1 << 22;
pub const HCR_RW: u64 = 1 << 31;
pub const HCR_E2H: u64 = 1 << 34;
pub const HCR_TLOR: u64 = 1 << 35;
pub const HCR_TERR: u64 = 1 << 36;
pub const HCR_TEA: u64 = 1 << 37;  // Trap External Aborts to EL2
pub const HCR_APK: u64 = 1 << 40;
pub const HCR_API: u64 = 1 << 41;
pub const HCR_FWB: u64 = 1 << 46;
pub const HCR_FIEN: u64 = 1 << 47;
pub const HCR_TID4: u64 = 1 << 49;
pub const HCR_AMVOFFEN: u64 = 1 << 51;
pub const HCR_ATA: u64 = 1 << 56;
pub const HCR_DCT: u64 = 1 << 57;
pub const HCR_TID5: u64 = 1 << 58;

/// Baseline trap set for every guest vCPU.
pub const HCR_GUEST_FLAGS: u64 = HCR_TSC
    | HCR_TSW
    | HCR_TWE
    | HCR_TWI
    | HCR_VM
    | HCR_BSU_IS
    | HCR_FB
    | HCR_TACR
    | HCR_AMO
    | HCR_SWIO
    | HCR_TIDCP
    | HCR_RW
    | HCR_TLOR
    | HCR_FMO
    | HCR_IMO
    | HCR_PTW
    | HCR_TID3
    | HCR_TID1;

// ── MDCR_EL2 (Monitor Debug Configuration Register) ─────────────────
pub const MDCR_HPMN_MASK: u64 = 0x1F;
pub const MDCR_TPMCR: u64 = 1 << 5;
pub const MDCR_TPM: u64 = 1 << 6;
pub const MDCR_HPME: u64 = 1 << 7;
pub const MDCR_TDA: u64 = 1 << 9;
pub const MDCR_TDOSA: u64 = 1 << 10;
pub const MDCR_TDRA: u64 = 1 << 11;
pub const MDCR_E2PB_MASK: u64 = 0b11 << 12;
pub const MDCR_TPMS: u64 = 1 << 14;
pub const MDCR_TTRF: u64 = 1 << 19;
pub const MDCR_E2TB_MASK: u64 = 0b11 << 24;
pub const MDCR_TDCC: u64 = 1 << 27;
pub const MDCR_MTPME: u64 = 1 << 28;

// ── HCRX_EL2 (Extended Hypervisor Configuration Register) ───────────
pub const HCRX_SMPME: u64 = 1 << 5;
pub const HCRX_TCR2EN: u64 = 1 << 14;
pub const HCRX_GUEST_FLAGS: u64 = HCRX_SMPME | HCRX_TCR2EN;

// ── VTCR_EL2 fields ─────────────────────────────────────────────────
pub const VTCR_T0SZ_MASK: u64 = 0x3F;
pub const VTCR_T0SZ_48BIT: u64 = 16;
pub const VTCR_SL0_SHIFT: u32 = 6;
pub const VTCR_SL0_MASK: u64 = 0b11 << VTCR_SL0_SHIFT;
pub const VTCR_SL0_LEVEL0: u64 = 2 << VTCR_SL0_SHIFT;
pub const VTCR_SL0_LEVEL1: u64 = 1 << VTCR_SL0_SHIFT;
pub const VTCR_IRGN0_WB: u64 = 0b01 << 8;
pub const VTCR_ORGN0_WB: u64 = 0b01 << 10;
pub const VTCR_SH0_INNER: u64 = 0b11 << 12;
pub const VTCR_TG0_4KB: u64 = 0b00 << 14;
pub const VTCR_PS_48BIT: u64 = 0b101 << 16;

/// 48-bit IPA, 4KB granule, walk starting at level 0.
pub const VTCR_DEFAULT: u64 = VTCR_T0SZ_48BIT
    | VTCR_SL0_LEVEL0
    | VTCR_IRGN0_WB
    | VTCR_ORGN0_WB
    | VTCR_SH0_INNER
    | VTCR_TG0_4KB
    | VTCR_PS_48BIT;

// ── VTTBR_EL2 ────────────────────────────────────────────────────────
pub const VTTBR_VMID_SHIFT: u32 = 48;
pub const VTTBR_BADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFFE;

// ── MPIDR_EL1 ────────────────────────────────────────────────────────
pub const MPIDR_AFF0_MASK: u64 = 0xFF;

// ── Page table constants ─────────────────────────────────────────────
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE_4KB: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK_4KB: u64 = PAGE_SIZE_4KB - 1;
pub const PTE_SIZE: u64 = 8;
pub const PT_BITS_PER_LEVEL: u32 = 9;
pub const PT_ENTRIES: u64 = 1 << PT_BITS_PER_LEVEL;

/// Data cache line size assumed for maintenance loops.
pub const DCACHE_LINE_SIZE: u64 = 64;
