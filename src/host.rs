//! Host-side views of VMs and vCPUs.
//!
//! These structures live in host memory: the host can rewrite any field at
//! any time, so the hypervisor reads each one exactly once (single atomic
//! load) and validates the copy. The hypervisor pins the underlying pages
//! while it depends on them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::features::{ArchFlags, IdFeatures, VcpuFeatures, VmFeatures};
use crate::mm::{HostRegion, MemCache, PAGE_SIZE};
use crate::sync::SpinLock;

/// Bytes of host memory the hypervisor pins for a host VM.
pub const HOST_VM_SIZE: u64 = PAGE_SIZE;
/// Bytes of host memory the hypervisor pins for a host vCPU.
pub const HOST_VCPU_SIZE: u64 = PAGE_SIZE;

/// The host's description of a VM (its `struct kvm`).
#[derive(Debug)]
pub struct HostVm {
    hva: u64,
    handle: AtomicU32,
    created_vcpus: AtomicU32,
    is_protected: AtomicBool,
    arch_flags: AtomicU64,
    vcpu_features: AtomicU64,
    id_features: AtomicU64,
    ctr_el0: AtomicU64,
    midr_el1: AtomicU64,
    /// Pages returned by teardown that held hypervisor metadata.
    pub teardown_mc: SpinLock<MemCache>,
    /// Pages returned by teardown that held stage-2 page tables.
    pub stage2_teardown_mc: SpinLock<MemCache>,
}

impl HostVm {
    pub fn new(hva: u64) -> Self {
        Self {
            hva,
            handle: AtomicU32::new(0),
            created_vcpus: AtomicU32::new(0),
            is_protected: AtomicBool::new(false),
            arch_flags: AtomicU64::new(0),
            vcpu_features: AtomicU64::new(0),
            id_features: AtomicU64::new(0),
            ctr_el0: AtomicU64::new(0),
            midr_el1: AtomicU64::new(0),
            teardown_mc: SpinLock::new(MemCache::new()),
            stage2_teardown_mc: SpinLock::new(MemCache::new()),
        }
    }

    pub fn hva(&self) -> u64 {
        self.hva
    }

    pub fn region(&self) -> HostRegion {
        HostRegion::new(self.hva, HOST_VM_SIZE)
    }

    pub fn handle(&self) -> u32 {
        self.handle.load(Ordering::Acquire)
    }

    pub fn set_handle(&self, handle: u32) {
        self.handle.store(handle, Ordering::Release);
    }

    pub fn created_vcpus(&self) -> u32 {
        self.created_vcpus.load(Ordering::Acquire)
    }

    pub fn set_created_vcpus(&self, n: u32) {
        self.created_vcpus.store(n, Ordering::Release);
    }

    pub fn is_protected(&self) -> bool {
        self.is_protected.load(Ordering::Acquire)
    }

    pub fn set_protected(&self, protected: bool) {
        self.is_protected.store(protected, Ordering::Release);
    }

    /// Snapshot of the requested feature set.
    pub fn features(&self) -> VmFeatures {
        VmFeatures {
            flags: ArchFlags::from_bits_truncate(self.arch_flags.load(Ordering::Acquire)),
            vcpu: VcpuFeatures::from_bits_truncate(self.vcpu_features.load(Ordering::Acquire)),
            id: IdFeatures::from_bits_truncate(self.id_features.load(Ordering::Acquire)),
            ctr_el0: self.ctr_el0.load(Ordering::Acquire),
            midr_el1: self.midr_el1.load(Ordering::Acquire),
        }
    }

    pub fn set_features(&self, f: &VmFeatures) {
        self.arch_flags.store(f.flags.bits(), Ordering::Release);
        self.vcpu_features.store(f.vcpu.bits(), Ordering::Release);
        self.id_features.store(f.id.bits(), Ordering::Release);
        self.ctr_el0.store(f.ctr_el0, Ordering::Release);
        self.midr_el1.store(f.midr_el1, Ordering::Release);
    }
}

/// The host's description of a vCPU.
#[derive(Debug)]
pub struct HostVcpu {
    hva: u64,
    vcpu_id: AtomicU32,
    vcpu_idx: AtomicU32,
    hcrx_el2: AtomicU64,
    sve_max_vl: AtomicU32,
    sve_state: AtomicU64,
}

impl HostVcpu {
    pub fn new(hva: u64, vcpu_id: u32, vcpu_idx: u32) -> Self {
        Self {
            hva,
            vcpu_id: AtomicU32::new(vcpu_id),
            vcpu_idx: AtomicU32::new(vcpu_idx),
            hcrx_el2: AtomicU64::new(0),
            sve_max_vl: AtomicU32::new(0),
            sve_state: AtomicU64::new(0),
        }
    }

    pub fn hva(&self) -> u64 {
        self.hva
    }

    pub fn region(&self) -> HostRegion {
        HostRegion::new(self.hva, HOST_VCPU_SIZE)
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id.load(Ordering::Acquire)
    }

    pub fn vcpu_idx(&self) -> u32 {
        self.vcpu_idx.load(Ordering::Acquire)
    }

    pub fn set_vcpu_idx(&self, idx: u32) {
        self.vcpu_idx.store(idx, Ordering::Release);
    }

    pub fn hcrx_el2(&self) -> u64 {
        self.hcrx_el2.load(Ordering::Acquire)
    }

    pub fn set_hcrx_el2(&self, hcrx: u64) {
        self.hcrx_el2.store(hcrx, Ordering::Release);
    }

    /// Requested SVE vector length in bytes.
    pub fn sve_max_vl(&self) -> u32 {
        self.sve_max_vl.load(Ordering::Acquire)
    }

    /// Host address of the SVE register save area, 0 if none.
    pub fn sve_state(&self) -> u64 {
        self.sve_state.load(Ordering::Acquire)
    }

    pub fn set_sve(&self, state_hva: u64, max_vl: u32) {
        self.sve_state.store(state_hva, Ordering::Release);
        self.sve_max_vl.store(max_vl, Ordering::Release);
    }
}

/// Maps host addresses passed in hypercall arguments to host structures.
pub trait HostResolver {
    fn vm(&self, hva: u64) -> Option<Arc<HostVm>>;
    fn vcpu(&self, hva: u64) -> Option<Arc<HostVcpu>>;
}

/// Host structures known to the hypervisor, keyed by host address.
#[derive(Default)]
pub struct HostRegistry {
    vms: SpinLock<Vec<Arc<HostVm>>>,
    vcpus: SpinLock<Vec<Arc<HostVcpu>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_vm(&self, vm: Arc<HostVm>) {
        let mut vms = self.vms.lock();
        vms.retain(|v| v.hva() != vm.hva());
        vms.push(vm);
    }

    pub fn register_vcpu(&self, vcpu: Arc<HostVcpu>) {
        let mut vcpus = self.vcpus.lock();
        vcpus.retain(|v| v.hva() != vcpu.hva());
        vcpus.push(vcpu);
    }
}

impl HostResolver for HostRegistry {
    fn vm(&self, hva: u64) -> Option<Arc<HostVm>> {
        self.vms.lock().iter().find(|v| v.hva() == hva).cloned()
    }

    fn vcpu(&self, hva: u64) -> Option<Arc<HostVcpu>> {
        self.vcpus.lock().iter().find(|v| v.hva() == hva).cloned()
    }
}
