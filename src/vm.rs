//! Virtual Machine Management
//!
//! The hypervisor's copy of a VM. A `Vm` is only ever reachable through the
//! VM table, and every field the table lock does not protect is immutable
//! once the VM is published.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use crate::features::{VcpuFeatures, VmFeatures};
use crate::host::HostVm;
use crate::mm::HypRegion;
use crate::stage2::Stage2Mmu;
use crate::vcpu::Vcpu;

/// A published vCPU together with the donated memory that backs it.
pub struct VcpuEntry {
    pub vcpu: Arc<Vcpu>,
    pub backing: HypRegion,
}

/// Bytes the host must donate for a VM with `nr_vcpus` vCPUs.
pub fn hyp_vm_size(nr_vcpus: u32) -> Option<u64> {
    (size_of::<Option<VcpuEntry>>() as u64)
        .checked_mul(nr_vcpus as u64)?
        .checked_add(size_of::<Vm>() as u64)
}

/// Bytes the host must donate for each vCPU.
pub const HYP_VCPU_SIZE: u64 = size_of::<Vcpu>() as u64;

/// Virtual Machine
pub struct Vm {
    handle: u32,
    host: Arc<HostVm>,
    created_vcpus: u32,
    protected: bool,
    features: VmFeatures,
    mmu: Stage2Mmu,
    backing: HypRegion,
    vcpus: Box<[Option<VcpuEntry>]>,
    /// Loaded vCPUs plus outstanding `VmRef`s. Only touched under the
    /// table lock.
    refcount: u32,
}

/// Point-in-time view of a published VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmInfo {
    pub handle: u32,
    pub vmid: u16,
    pub created_vcpus: u32,
    pub protected: bool,
    pub nr_vcpus: u32,
    pub refcount: u32,
    pub features: VmFeatures,
}

/// What teardown needs once a VM has left the table.
pub(crate) struct VmRemains {
    pub host: Arc<HostVm>,
    pub mmu: Stage2Mmu,
    pub backing: HypRegion,
    pub vcpus: Vec<VcpuEntry>,
}

impl Vm {
    pub fn new(
        handle: u32,
        host: Arc<HostVm>,
        created_vcpus: u32,
        protected: bool,
        features: VmFeatures,
        mmu: Stage2Mmu,
        backing: HypRegion,
    ) -> Self {
        let vcpus: Vec<Option<VcpuEntry>> = (0..created_vcpus).map(|_| None).collect();
        Self {
            handle,
            host,
            created_vcpus,
            protected,
            features,
            mmu,
            backing,
            vcpus: vcpus.into_boxed_slice(),
            refcount: 0,
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn host(&self) -> &Arc<HostVm> {
        &self.host
    }

    pub fn created_vcpus(&self) -> u32 {
        self.created_vcpus
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn features(&self) -> &VmFeatures {
        &self.features
    }

    pub(crate) fn clear_vcpu_feature(&mut self, feature: VcpuFeatures) {
        self.features.vcpu.remove(feature);
    }

    /// VMID 0 belongs to the host, so a VM's VMID is its table index + 1.
    pub fn vmid(&self) -> u16 {
        self.mmu.vmid()
    }

    pub fn mmu(&self) -> &Stage2Mmu {
        &self.mmu
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub(crate) fn get(&mut self) {
        self.refcount += 1;
    }

    pub(crate) fn put(&mut self) {
        debug_assert!(self.refcount > 0, "VM {:#x} refcount underflow", self.handle);
        self.refcount = self.refcount.saturating_sub(1);
    }

    pub fn vcpu(&self, idx: u32) -> Option<&Arc<Vcpu>> {
        self.vcpus.get(idx as usize)?.as_ref().map(|e| &e.vcpu)
    }

    /// Whether `idx` names an empty vCPU slot of this VM.
    pub fn vcpu_slot_free(&self, idx: u32) -> bool {
        matches!(self.vcpus.get(idx as usize), Some(None))
    }

    /// Fill an empty vCPU slot. The entry is handed back if the slot is out
    /// of range or already taken.
    pub(crate) fn set_vcpu(&mut self, idx: u32, entry: VcpuEntry) -> Result<(), VcpuEntry> {
        match self.vcpus.get_mut(idx as usize) {
            Some(slot @ None) => {
                *slot = Some(entry);
                Ok(())
            }
            _ => Err(entry),
        }
    }

    pub fn vcpus(&self) -> impl Iterator<Item = &Arc<Vcpu>> {
        self.vcpus.iter().flatten().map(|e| &e.vcpu)
    }

    pub fn nr_vcpus(&self) -> u32 {
        self.vcpus.iter().flatten().count() as u32
    }

    pub fn info(&self) -> VmInfo {
        VmInfo {
            handle: self.handle,
            vmid: self.vmid(),
            created_vcpus: self.created_vcpus,
            protected: self.protected,
            nr_vcpus: self.nr_vcpus(),
            refcount: self.refcount,
            features: self.features,
        }
    }

    /// Disassemble a VM that failed to publish or has left the table.
    pub(crate) fn into_remains(self) -> VmRemains {
        let Vm {
            host,
            mmu,
            backing,
            vcpus,
            ..
        } = self;
        VmRemains {
            host,
            mmu,
            backing,
            vcpus: vcpus.into_vec().into_iter().flatten().collect(),
        }
    }
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("vmid", &self.vmid())
            .field("created_vcpus", &self.created_vcpus)
            .field("protected", &self.protected)
            .field("refcount", &self.refcount)
            .finish_non_exhaustive()
    }
}
