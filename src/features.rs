//! Guest feature negotiation.
//!
//! The host proposes a feature set for every VM. Non-protected VMs get what
//! the host asks for. Protected VMs must not depend on anything the
//! hypervisor neither traps nor supports, so their request is validated and
//! cut down to an allow-list before the VM is published.

use bitflags::bitflags;

use crate::error::{PkvmError, Result};

bitflags! {
    /// Per-vCPU features requested through KVM_ARM_VCPU_INIT.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VcpuFeatures: u64 {
        const POWER_OFF         = 1 << 0;
        const EL1_32BIT         = 1 << 1;
        const PSCI_0_2          = 1 << 2;
        const PMU_V3            = 1 << 3;
        const SVE               = 1 << 4;
        const PTRAUTH_ADDRESS   = 1 << 5;
        const PTRAUTH_GENERIC   = 1 << 6;
        const HAS_EL2           = 1 << 7;
    }
}

bitflags! {
    /// CPU features advertised to the guest through the ID registers,
    /// reduced to "implemented or not".
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IdFeatures: u64 {
        /// ID_AA64PFR0_EL1.EL0 == AArch32
        const EL0_AARCH32   = 1 << 0;
        /// ID_AA64PFR0_EL1.EL1 == AArch32
        const EL1_AARCH32   = 1 << 1;
        const FP            = 1 << 2;
        const ADVSIMD       = 1 << 3;
        const SME           = 1 << 4;
        const RAS           = 1 << 5;
        const AMU           = 1 << 6;
        const MTE           = 1 << 7;
        /// Limited ordering regions.
        const LO            = 1 << 8;
        const PMUV3         = 1 << 9;
        const DEBUG         = 1 << 10;
        const DOUBLE_LOCK   = 1 << 11;
        /// Statistical profiling.
        const PMS           = 1 << 12;
        const TRACE_FILT    = 1 << 13;
        /// Trace buffer extension.
        const EXT_TRC_BUFF  = 1 << 14;
        /// Fine-grained traps.
        const FGT           = 1 << 15;
        const SVE           = 1 << 16;
    }
}

bitflags! {
    /// VM-wide architecture flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArchFlags: u64 {
        const MTE_ENABLED           = 1 << 0;
        const GUEST_HAS_SVE         = 1 << 1;
        const WRITABLE_IMP_ID_REGS  = 1 << 2;
    }
}

bitflags! {
    /// Capabilities the hypervisor is willing to extend to protected VMs.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PvmCaps: u32 {
        const PMU_V3            = 1 << 0;
        const PTRAUTH_ADDRESS   = 1 << 1;
        const PTRAUTH_GENERIC   = 1 << 2;
        const SVE               = 1 << 3;
    }
}

bitflags! {
    /// System-wide CPU capabilities that shape the vCPU trap configuration.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuCaps: u32 {
        /// hVHE: the hypervisor runs with HCR_EL2.E2H set.
        const VHE           = 1 << 0;
        const RAS_EXTN      = 1 << 1;
        const STAGE2_FWB    = 1 << 2;
        /// Enhanced virtualization traps (TID4).
        const EVT           = 1 << 3;
    }
}

/// ID-register features a protected VM may see regardless of capabilities.
const PVM_ID_ALLOWED: IdFeatures = IdFeatures::FP
    .union(IdFeatures::ADVSIMD)
    .union(IdFeatures::RAS)
    .union(IdFeatures::LO)
    .union(IdFeatures::DEBUG)
    .union(IdFeatures::DOUBLE_LOCK)
    .union(IdFeatures::FGT);

/// Everything the hypervisor keeps about a VM's negotiated features.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmFeatures {
    pub flags: ArchFlags,
    pub vcpu: VcpuFeatures,
    pub id: IdFeatures,
    pub ctr_el0: u64,
    pub midr_el1: u64,
}

impl VmFeatures {
    pub fn has_ptrauth(&self) -> bool {
        self.vcpu
            .contains(VcpuFeatures::PTRAUTH_ADDRESS | VcpuFeatures::PTRAUTH_GENERIC)
    }

    pub fn has_mte(&self) -> bool {
        self.flags.contains(ArchFlags::MTE_ENABLED)
    }
}

/// Reject protected-VM CPU features that are neither trapped nor supported.
pub fn check_pvm_cpu_features(id: IdFeatures) -> Result<()> {
    if id.intersects(IdFeatures::EL0_AARCH32 | IdFeatures::EL1_AARCH32) {
        return Err(PkvmError::Invalid);
    }
    if !id.contains(IdFeatures::FP | IdFeatures::ADVSIMD) {
        return Err(PkvmError::Invalid);
    }
    if id.contains(IdFeatures::SME) {
        return Err(PkvmError::Invalid);
    }
    Ok(())
}

/// Derive the hypervisor's copy of a VM's features from the host's request.
///
/// Applying the filter to its own output yields the same output.
pub fn filter(protected: bool, host: &VmFeatures, caps: PvmCaps) -> Result<VmFeatures> {
    if !protected {
        let midr_el1 = if host.flags.contains(ArchFlags::WRITABLE_IMP_ID_REGS) {
            host.midr_el1
        } else {
            0
        };
        return Ok(VmFeatures { midr_el1, ..*host });
    }

    check_pvm_cpu_features(host.id)?;

    // CTR_EL0 stays under host control even for protected VMs.
    let mut out = VmFeatures {
        ctr_el0: host.ctr_el0,
        flags: host.flags & ArchFlags::MTE_ENABLED,
        ..VmFeatures::default()
    };

    let mut allowed = VcpuFeatures::PSCI_0_2;
    let mut id_allowed = PVM_ID_ALLOWED;
    if caps.contains(PvmCaps::PMU_V3) {
        allowed |= VcpuFeatures::PMU_V3;
        id_allowed |= IdFeatures::PMUV3;
    }
    if caps.contains(PvmCaps::PTRAUTH_ADDRESS) {
        allowed |= VcpuFeatures::PTRAUTH_ADDRESS;
    }
    if caps.contains(PvmCaps::PTRAUTH_GENERIC) {
        allowed |= VcpuFeatures::PTRAUTH_GENERIC;
    }
    if caps.contains(PvmCaps::SVE) {
        allowed |= VcpuFeatures::SVE;
        id_allowed |= IdFeatures::SVE;
        out.flags |= host.flags & ArchFlags::GUEST_HAS_SVE;
    }

    out.vcpu = host.vcpu & allowed;
    out.id = host.id & id_allowed;
    Ok(out)
}
