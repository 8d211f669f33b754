//! Hypervisor configuration.
//!
//! Everything the VM manager needs to know about the machine and the policy
//! it enforces, fixed before the first VM is reserved. Defaults describe a
//! 4-CPU QEMU virt board; [`crate::dtb`] overrides them from the boot
//! device tree.

use crate::arch::aarch64::defs::VTCR_DEFAULT;
use crate::features::{CpuCaps, PvmCaps};
use crate::stage2::Vtcr;

pub const DEFAULT_MAX_VMS: usize = 255;
pub const DEFAULT_NR_CPUS: usize = 4;
/// Largest SVE vector length the hypervisor saves, in bytes (2048 bits).
pub const DEFAULT_SVE_MAX_VL: u32 = 256;
/// Architectural upper bound on the SVE vector length, in bytes.
pub const SVE_VL_ARCH_MAX: u32 = 256;
/// Most vCPUs a single VM may be created with.
pub const KVM_MAX_VCPUS: u32 = 512;
/// Upper bound on handles: VMIDs are 16 bits and VMID 0 belongs to the host.
pub const MAX_VMS_LIMIT: usize = u16::MAX as usize;

/// Errors from [`HypConfig::validate`].
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// max_vms must be between 1 and 65535, got {0}
    MaxVms(usize),
    /// At least one physical CPU is required
    NoCpus,
    /// SVE vector length {0} is not a non-zero multiple of 16 up to 256
    SveVl(u32),
    /// VTCR_EL2 value {0:#x} does not describe a usable stage-2 root
    Vtcr(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypConfig {
    pub max_vms: usize,
    pub nr_cpus: usize,
    pub sve_max_vl: u32,
    /// Stage-2 translation control mirrored from the host MMU.
    pub vtcr: u64,
    pub pvm_caps: PvmCaps,
    pub cpu_caps: CpuCaps,
}

impl Default for HypConfig {
    fn default() -> Self {
        Self {
            max_vms: DEFAULT_MAX_VMS,
            nr_cpus: DEFAULT_NR_CPUS,
            sve_max_vl: DEFAULT_SVE_MAX_VL,
            vtcr: VTCR_DEFAULT,
            pvm_caps: PvmCaps::all(),
            cpu_caps: CpuCaps::empty(),
        }
    }
}

impl HypConfig {
    pub fn with_max_vms(mut self, max_vms: usize) -> Self {
        self.max_vms = max_vms;
        self
    }

    pub fn with_nr_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn with_sve_max_vl(mut self, vl: u32) -> Self {
        self.sve_max_vl = vl;
        self
    }

    pub fn with_vtcr(mut self, vtcr: u64) -> Self {
        self.vtcr = vtcr;
        self
    }

    pub fn with_pvm_caps(mut self, caps: PvmCaps) -> Self {
        self.pvm_caps = caps;
        self
    }

    pub fn with_cpu_caps(mut self, caps: CpuCaps) -> Self {
        self.cpu_caps = caps;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_vms == 0 || self.max_vms > MAX_VMS_LIMIT {
            return Err(ConfigError::MaxVms(self.max_vms));
        }
        if self.nr_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.sve_max_vl == 0 || self.sve_max_vl % 16 != 0 || self.sve_max_vl > SVE_VL_ARCH_MAX {
            return Err(ConfigError::SveVl(self.sve_max_vl));
        }
        if Vtcr(self.vtcr).pgd_size().is_none() {
            return Err(ConfigError::Vtcr(self.vtcr));
        }
        Ok(())
    }
}
