//! Shared fixtures for the integration tests.
//!
//! `TestPlatform` tracks page ownership over a private window of "host RAM"
//! and treats each test thread as a physical CPU, so several threads can
//! drive one manager the way several CPUs drive it at EL2.

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pkvm_hyp::arch::traits::CpuLocal;
use pkvm_hyp::features::{IdFeatures, VmFeatures};
use pkvm_hyp::host::{HostVcpu, HostVm};
use pkvm_hyp::mem_protect::{MemProtect, PageTracker};
use pkvm_hyp::mm::{HostRegion, MemCache, PAGE_SIZE};
use pkvm_hyp::stage2::{PoolStage2, Stage2Mmu, Stage2Ops};
use pkvm_hyp::{HypConfig, Pkvm, PkvmError, Platform};

pub const RAM_BASE: u64 = 0xA000_0000;
pub const RAM_SIZE: u64 = 0x1000_0000;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Make the calling thread act as physical CPU `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// Stage-2 backend that can be told to fail the next `prepare` or
/// `reclaim`.
#[derive(Default)]
pub struct FlakyStage2 {
    fail_prepare: AtomicBool,
    fail_reclaim: AtomicBool,
}

impl FlakyStage2 {
    pub fn fail_next_prepare(&self) {
        self.fail_prepare.store(true, Ordering::SeqCst);
    }

    /// The next `reclaim` gives up without returning any page.
    pub fn fail_next_reclaim(&self) {
        self.fail_reclaim.store(true, Ordering::SeqCst);
    }
}

impl Stage2Ops for FlakyStage2 {
    fn prepare<M: MemProtect + ?Sized>(&self, mem: &M, mmu: &mut Stage2Mmu) -> pkvm_hyp::Result<()> {
        if self.fail_prepare.swap(false, Ordering::SeqCst) {
            return Err(PkvmError::NoMemory);
        }
        PoolStage2.prepare(mem, mmu)
    }

    fn reclaim<M: MemProtect + ?Sized>(
        &self,
        mem: &M,
        mmu: &mut Stage2Mmu,
        mc: &mut MemCache,
    ) -> pkvm_hyp::Result<()> {
        if self.fail_reclaim.swap(false, Ordering::SeqCst) {
            return Err(PkvmError::Busy);
        }
        PoolStage2.reclaim(mem, mmu, mc)
    }
}

pub struct TestPlatform {
    pub mem: PageTracker,
    pub stage2: FlakyStage2,
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self {
            mem: PageTracker::new(RAM_BASE, RAM_SIZE),
            stage2: FlakyStage2::default(),
        }
    }
}

impl CpuLocal for TestPlatform {
    fn cpu_id(&self) -> usize {
        CPU.with(Cell::get)
    }
}

impl Platform for TestPlatform {
    type Mem = PageTracker;
    type Stage2 = FlakyStage2;

    fn mem(&self) -> &PageTracker {
        &self.mem
    }

    fn stage2(&self) -> &FlakyStage2 {
        &self.stage2
    }
}

pub type TestPkvm = Pkvm<TestPlatform>;

pub fn config() -> HypConfig {
    HypConfig::default().with_max_vms(8).with_nr_cpus(4)
}

/// A manager with its VM table already created.
pub fn pkvm_with(config: HypConfig) -> TestPkvm {
    let pkvm = Pkvm::new(TestPlatform::default(), config);
    pkvm.init_table(config.max_vms).unwrap();
    pkvm
}

pub fn pkvm() -> TestPkvm {
    pkvm_with(config())
}

pub fn tracker(pkvm: &TestPkvm) -> &PageTracker {
    &pkvm.platform().mem
}

/// Minimal feature set a protected VM is allowed to run with.
pub fn pvm_features() -> VmFeatures {
    VmFeatures {
        id: IdFeatures::FP | IdFeatures::ADVSIMD,
        ..VmFeatures::default()
    }
}

/// A host VM structure at `hva`, shared with the hypervisor.
pub fn host_vm(pkvm: &TestPkvm, hva: u64, nr_vcpus: u32, protected: bool) -> Arc<HostVm> {
    let vm = HostVm::new(hva);
    vm.set_created_vcpus(nr_vcpus);
    vm.set_protected(protected);
    if protected {
        vm.set_features(&pvm_features());
    }
    tracker(pkvm).share_hyp(vm.region()).unwrap();
    Arc::new(vm)
}

/// A host vCPU structure at `hva`, shared with the hypervisor.
pub fn host_vcpu(pkvm: &TestPkvm, hva: u64, idx: u32) -> Arc<HostVcpu> {
    let vcpu = HostVcpu::new(hva, idx, idx);
    tracker(pkvm).share_hyp(vcpu.region()).unwrap();
    Arc::new(vcpu)
}

/// Where the host keeps one VM's structures and donations. Every VM built
/// with [`VmLayout::at`] owns a disjoint 1MB window.
#[derive(Debug, Clone, Copy)]
pub struct VmLayout {
    pub host_vm: u64,
    pub vm: u64,
    pub pgd: u64,
    pub host_vcpus: u64,
    pub vcpus: u64,
    pub memcache: u64,
}

impl VmLayout {
    pub fn at(slot: u64) -> Self {
        let base = RAM_BASE + slot * 0x10_0000;
        Self {
            host_vm: base,
            vm: base + 0x1_0000,
            pgd: base + 0x2_0000,
            host_vcpus: base + 0x3_0000,
            vcpus: base + 0x4_0000,
            memcache: base + 0x8_0000,
        }
    }

    pub fn host_vcpu(&self, idx: u32) -> u64 {
        self.host_vcpus + u64::from(idx) * PAGE_SIZE
    }

    pub fn vcpu(&self, idx: u32) -> u64 {
        self.vcpus + u64::from(idx) * PAGE_SIZE
    }

    pub fn memcache_page(&self, n: u64) -> u64 {
        self.memcache + n * PAGE_SIZE
    }
}

/// A fully initialized VM and its host-side structures.
pub struct TestVm {
    pub handle: u32,
    pub layout: VmLayout,
    pub host: Arc<HostVm>,
    pub vcpus: Vec<Arc<HostVcpu>>,
}

/// Reserve, initialize and populate a VM with `nr_vcpus` vCPUs.
pub fn create_vm(pkvm: &TestPkvm, slot: u64, nr_vcpus: u32, protected: bool) -> TestVm {
    let layout = VmLayout::at(slot);
    let host = host_vm(pkvm, layout.host_vm, nr_vcpus, protected);
    let handle = pkvm.reserve_vm().unwrap();
    host.set_handle(handle);
    pkvm.init_vm(&host, layout.vm, layout.pgd, handle).unwrap();

    let vcpus = (0..nr_vcpus)
        .map(|idx| {
            let vcpu = host_vcpu(pkvm, layout.host_vcpu(idx), idx);
            pkvm.init_vcpu(handle, &vcpu, layout.vcpu(idx)).unwrap();
            vcpu
        })
        .collect();

    TestVm {
        handle,
        layout,
        host,
        vcpus,
    }
}

pub fn region_is_host_owned(pkvm: &TestPkvm, region: HostRegion) -> bool {
    region
        .pages()
        .all(|page| tracker(pkvm).state(page) == Some(pkvm_hyp::mem_protect::PageState::Owned))
}
