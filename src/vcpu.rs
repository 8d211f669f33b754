//! Virtual CPU (vCPU) Management
//!
//! The hypervisor's copy of a vCPU, built from host-donated memory by
//! `init_vcpu`. Everything except the load marker and the private page
//! cache is written once at init and never changes afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::features::{VcpuFeatures, VmFeatures};
use crate::host::HostVcpu;
use crate::mm::{HostRegion, HypRegion};
use crate::sync::SpinLock;
use crate::traps::TrapConfig;

/// Load marker value meaning "not loaded on any CPU".
const NOT_LOADED: usize = usize::MAX;

/// Bytes in one SVE vector-quadword (128 bits).
pub const SVE_VQ_BYTES: u32 = 16;

/// Size of the SVE register save area for a vector length in bytes:
/// 32 Z registers, 16 P registers and FFR, each P/FFR being VL/8.
pub const fn sve_state_size(vl: u32) -> u64 {
    let vq = (vl / SVE_VQ_BYTES) as u64;
    vq * (32 * 16 + 17 * 2)
}

/// Multiprocessing state reported to the guest's PSCI calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpState {
    Runnable,
    /// Powered off until a PSCI CPU_ON targets it.
    Stopped,
}

/// Host SVE save area pinned for the vCPU's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SveState {
    pub region: HostRegion,
    /// Effective vector length in bytes.
    pub max_vl: u32,
}

/// Virtual CPU
pub struct Vcpu {
    /// Handle of the owning VM
    handle: u32,
    vcpu_id: u32,
    vcpu_idx: u32,
    vmid: u16,
    protected: bool,
    host: Arc<HostVcpu>,
    features: VcpuFeatures,
    mp_state: MpState,
    traps: TrapConfig,
    sve: Option<SveState>,
    /// CPU this vCPU is loaded on, or `NOT_LOADED`.
    loaded_on: AtomicUsize,
    /// Pages donated by the host for this vCPU's stage-2 allocations.
    memcache: SpinLock<Vec<HypRegion>>,
}

/// Everything `init_vcpu` has decided about a new vCPU.
pub struct VcpuInit {
    pub handle: u32,
    pub vmid: u16,
    pub protected: bool,
    pub host: Arc<HostVcpu>,
    pub vcpu_id: u32,
    pub vcpu_idx: u32,
    pub features: VmFeatures,
    pub traps: TrapConfig,
    pub sve: Option<SveState>,
}

impl Vcpu {
    pub fn new(init: VcpuInit) -> Self {
        Self {
            handle: init.handle,
            vcpu_id: init.vcpu_id,
            vcpu_idx: init.vcpu_idx,
            vmid: init.vmid,
            protected: init.protected,
            host: init.host,
            features: init.features.vcpu,
            mp_state: MpState::Stopped,
            traps: init.traps,
            sve: init.sve,
            loaded_on: AtomicUsize::new(NOT_LOADED),
            memcache: SpinLock::new(Vec::new()),
        }
    }

    /// Handle of the VM this vCPU belongs to
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn vcpu_idx(&self) -> u32 {
        self.vcpu_idx
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn host(&self) -> &Arc<HostVcpu> {
        &self.host
    }

    pub fn has_feature(&self, feature: VcpuFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn mp_state(&self) -> MpState {
        self.mp_state
    }

    pub fn traps(&self) -> &TrapConfig {
        &self.traps
    }

    pub fn sve(&self) -> Option<&SveState> {
        self.sve.as_ref()
    }

    /// CPU the vCPU is loaded on.
    pub fn loaded_on(&self) -> Option<usize> {
        match self.loaded_on.load(Ordering::Acquire) {
            NOT_LOADED => None,
            cpu => Some(cpu),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded_on().is_some()
    }

    /// Mark as loaded on `cpu`. Callers hold the VM table lock.
    pub(crate) fn mark_loaded(&self, cpu: usize) {
        self.loaded_on.store(cpu, Ordering::Release);
    }

    /// Clear the load marker, returning the CPU it named. Callers hold the
    /// VM table lock.
    pub(crate) fn mark_put(&self) -> Option<usize> {
        match self.loaded_on.swap(NOT_LOADED, Ordering::AcqRel) {
            NOT_LOADED => None,
            cpu => Some(cpu),
        }
    }

    /// Pages currently held in the private page cache.
    pub fn memcache_pages(&self) -> usize {
        self.memcache.lock().iter().map(|r| r.nr_pages() as usize).sum()
    }

    pub(crate) fn push_memcache(&self, pages: HypRegion) {
        self.memcache.lock().push(pages);
    }

    /// Empty the private page cache, most recently added page first.
    pub(crate) fn drain_memcache(&self) -> Vec<HypRegion> {
        let mut pages = core::mem::take(&mut *self.memcache.lock());
        pages.reverse();
        pages
    }
}

impl core::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vcpu")
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("vcpu_idx", &self.vcpu_idx)
            .field("vmid", &self.vmid)
            .field("loaded_on", &self.loaded_on())
            .finish_non_exhaustive()
    }
}
