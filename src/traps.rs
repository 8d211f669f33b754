//! vCPU trap configuration.
//!
//! Computes the HCR_EL2 / MDCR_EL2 / HCRX_EL2 values a vCPU runs with. The
//! values are fixed at vCPU init and never rewritten by the manager.

use crate::arch::aarch64::defs::*;
use crate::features::{CpuCaps, IdFeatures, VmFeatures};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapConfig {
    pub hcr_el2: u64,
    pub mdcr_el2: u64,
    pub hcrx_el2: u64,
}

/// HCR_EL2 every vCPU starts from, protected or not.
pub fn reset_hcr(cpu: CpuCaps, features: &VmFeatures) -> u64 {
    let mut hcr = HCR_GUEST_FLAGS;

    if cpu.contains(CpuCaps::VHE) {
        hcr |= HCR_E2H;
    }
    if cpu.contains(CpuCaps::RAS_EXTN) {
        // Route synchronous external aborts to EL2, trap error records.
        hcr |= HCR_TEA | HCR_TERR;
    }
    if cpu.contains(CpuCaps::STAGE2_FWB) {
        hcr |= HCR_FWB;
    }
    if cpu.contains(CpuCaps::EVT) {
        hcr |= HCR_TID4;
    } else {
        hcr |= HCR_TID2;
    }
    if features.has_ptrauth() {
        hcr |= HCR_API | HCR_APK;
    }
    if features.has_mte() {
        hcr |= HCR_ATA;
    }
    hcr
}

fn pvm_hcr(mut hcr: u64, id: IdFeatures) -> u64 {
    // No AArch32, and always trap ID and implementation-defined registers.
    hcr |= HCR_RW | HCR_TACR | HCR_TIDCP | HCR_TID3 | HCR_TID1;

    if !id.contains(IdFeatures::RAS) {
        hcr |= HCR_TERR | HCR_TEA;
        hcr &= !HCR_FIEN;
    }
    if !id.contains(IdFeatures::AMU) {
        hcr &= !HCR_AMVOFFEN;
    }
    if !id.contains(IdFeatures::MTE) {
        hcr |= HCR_TID5;
        hcr &= !(HCR_DCT | HCR_ATA);
    }
    if !id.contains(IdFeatures::LO) {
        hcr |= HCR_TLOR;
    }
    hcr
}

fn pvm_mdcr(mut mdcr: u64, id: IdFeatures) -> u64 {
    if !id.contains(IdFeatures::PMUV3) {
        mdcr |= MDCR_TPM | MDCR_TPMCR;
        mdcr &= !(MDCR_HPME | MDCR_MTPME | MDCR_HPMN_MASK);
    }
    if !id.contains(IdFeatures::DEBUG) {
        mdcr |= MDCR_TDRA | MDCR_TDA;
    }
    if !id.contains(IdFeatures::DOUBLE_LOCK) {
        mdcr |= MDCR_TDOSA;
    }
    if !id.contains(IdFeatures::PMS) {
        mdcr |= MDCR_TPMS;
        mdcr &= !MDCR_E2PB_MASK;
    }
    if !id.contains(IdFeatures::TRACE_FILT) {
        mdcr |= MDCR_TTRF;
    }
    if !id.contains(IdFeatures::EXT_TRC_BUFF) {
        mdcr |= MDCR_E2TB_MASK;
    }
    // Debug communications channel.
    if !id.contains(IdFeatures::FGT) {
        mdcr |= MDCR_TDCC;
    }
    mdcr
}

/// Trap configuration for a new vCPU.
///
/// Non-protected vCPUs trust the host's HCRX_EL2. Protected vCPUs trap
/// everything their (already filtered) ID registers do not advertise.
pub fn init_traps(protected: bool, features: &VmFeatures, cpu: CpuCaps, host_hcrx: u64) -> TrapConfig {
    let hcr = reset_hcr(cpu, features);

    if !protected {
        return TrapConfig {
            hcr_el2: hcr,
            mdcr_el2: 0,
            hcrx_el2: host_hcrx,
        };
    }

    TrapConfig {
        hcr_el2: pvm_hcr(hcr, features.id),
        mdcr_el2: pvm_mdcr(0, features.id),
        hcrx_el2: HCRX_GUEST_FLAGS,
    }
}
