//! Property tests over random host call sequences.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use pkvm_hyp::features::{filter, ArchFlags, IdFeatures, PvmCaps, VcpuFeatures, VmFeatures};
use pkvm_hyp::host::{HostVcpu, HostVm};
use pkvm_hyp::mem_protect::PageState;
use pkvm_hyp::mm::PAGE_SIZE;
use pkvm_hyp::vm::{hyp_vm_size, HYP_VCPU_SIZE};
use pkvm_hyp::{PkvmError, VmRef, HANDLE_OFFSET};
use proptest::prelude::*;

const MAX_VMS: u32 = 4;
const NR_CPUS: usize = 4;
const VCPUS_PER_VM: u32 = 2;

#[derive(Debug, Clone)]
enum Op {
    Create,
    Reserve,
    Unreserve(u32),
    Teardown(u32),
    Load { cpu: usize, vm: u32, vcpu: u32 },
    Put { cpu: usize },
    Topup { cpu: usize, nr_pages: u64 },
    GetRef(u32),
    DropRef,
}

fn arbitrary_op() -> impl Strategy<Value = Op> {
    // Slots and vCPU indices go one past the valid range on purpose.
    prop_oneof![
        3 => Just(Op::Create),
        1 => Just(Op::Reserve),
        1 => (0..=MAX_VMS).prop_map(Op::Unreserve),
        2 => (0..=MAX_VMS).prop_map(Op::Teardown),
        4 => (0..NR_CPUS, 0..=MAX_VMS, 0..=VCPUS_PER_VM)
            .prop_map(|(cpu, vm, vcpu)| Op::Load { cpu, vm, vcpu }),
        3 => (0..NR_CPUS).prop_map(|cpu| Op::Put { cpu }),
        1 => (0..NR_CPUS, 0..3u64).prop_map(|(cpu, nr_pages)| Op::Topup { cpu, nr_pages }),
        1 => (0..=MAX_VMS).prop_map(Op::GetRef),
        1 => Just(Op::DropRef),
    ]
}

fn pages(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE) as usize
}

/// Host memory kept by the hypervisor for one initialized VM.
fn pages_per_vm() -> usize {
    pages(hyp_vm_size(VCPUS_PER_VM).unwrap()) + VCPUS_PER_VM as usize * pages(HYP_VCPU_SIZE) + 1
}

/// Host-side structures, created once per table slot and reused when the
/// slot is reused.
struct HostSide {
    vm: Arc<HostVm>,
    vcpus: Vec<Arc<HostVcpu>>,
    layout: VmLayout,
    next_memcache_page: u64,
}

struct Harness<'a> {
    pkvm: &'a TestPkvm,
    hosts: HashMap<u32, HostSide>,
    refs: Vec<VmRef<'a, TestPlatform>>,
    /// Pages topped up into each live VM's vCPU caches.
    topped_up: HashMap<u32, usize>,
}

impl<'a> Harness<'a> {
    fn new(pkvm: &'a TestPkvm) -> Self {
        Self {
            pkvm,
            hosts: HashMap::new(),
            refs: Vec::new(),
            topped_up: HashMap::new(),
        }
    }

    fn handle(slot: u32) -> u32 {
        HANDLE_OFFSET + slot
    }

    fn host_side(&mut self, handle: u32) -> &mut HostSide {
        let pkvm = self.pkvm;
        self.hosts.entry(handle).or_insert_with(|| {
            let layout = VmLayout::at(u64::from(handle - HANDLE_OFFSET));
            HostSide {
                vm: host_vm(pkvm, layout.host_vm, VCPUS_PER_VM, false),
                vcpus: (0..VCPUS_PER_VM)
                    .map(|idx| host_vcpu(pkvm, layout.host_vcpu(idx), idx))
                    .collect(),
                layout,
                next_memcache_page: 0,
            }
        })
    }

    fn table_full(&self) -> bool {
        self.pkvm.nr_reserved() + self.pkvm.nr_initialized() == MAX_VMS as usize
    }

    fn vcpu_loaded(&self, handle: u32, idx: u32) -> bool {
        (0..NR_CPUS).any(|cpu| {
            self.pkvm
                .loaded_vcpu_on(cpu)
                .is_some_and(|v| v.handle() == handle && v.vcpu_idx() == idx)
        })
    }

    fn apply(&mut self, op: &Op) -> Result<(), TestCaseError> {
        let pkvm = self.pkvm;
        match *op {
            Op::Reserve => {
                let full = self.table_full();
                let res = pkvm.reserve_vm();
                prop_assert_eq!(res.is_err(), full);
                if let Err(e) = res {
                    prop_assert_eq!(e, PkvmError::OutOfResources);
                }
            }
            Op::Create => {
                let full = self.table_full();
                let Ok(h) = pkvm.reserve_vm() else {
                    prop_assert!(full);
                    return Ok(());
                };
                let host = self.host_side(h);
                let (vm, vcpus, layout) = (Arc::clone(&host.vm), host.vcpus.clone(), host.layout);
                vm.set_handle(h);
                prop_assert_eq!(pkvm.init_vm(&vm, layout.vm, layout.pgd, h), Ok(()));
                for (idx, vcpu) in vcpus.iter().enumerate() {
                    prop_assert_eq!(pkvm.init_vcpu(h, vcpu, layout.vcpu(idx as u32)), Ok(()));
                }
            }
            Op::Unreserve(slot) => pkvm.unreserve_vm(Self::handle(slot)),
            Op::Teardown(slot) => {
                let h = Self::handle(slot);
                let expected = match pkvm.lookup(h) {
                    None => Err(PkvmError::NotFound),
                    Some(info) if info.refcount != 0 => Err(PkvmError::Busy),
                    Some(_) => Ok(()),
                };
                prop_assert_eq!(pkvm.teardown_vm(h), expected);
                if expected.is_ok() {
                    self.topped_up.remove(&h);
                }
            }
            Op::Load { cpu, vm, vcpu } => {
                let h = Self::handle(vm);
                set_cpu(cpu);
                let expected = if pkvm.current_loaded_vcpu().is_some() {
                    Err(PkvmError::Conflict)
                } else if pkvm.lookup(h).is_none() {
                    Err(PkvmError::NotFound)
                } else if vcpu >= VCPUS_PER_VM {
                    Err(PkvmError::Invalid)
                } else if self.vcpu_loaded(h, vcpu) {
                    Err(PkvmError::Busy)
                } else {
                    Ok(())
                };
                let res = pkvm.load_vcpu(h, vcpu);
                prop_assert_eq!(res.as_ref().map(|_| ()).map_err(|e| *e), expected);
                if let Ok(v) = res {
                    prop_assert_eq!(v.loaded_on(), Some(cpu));
                }
            }
            Op::Put { cpu } => {
                set_cpu(cpu);
                if let Some(vcpu) = pkvm.current_loaded_vcpu() {
                    pkvm.put_vcpu(&vcpu);
                    prop_assert!(pkvm.current_loaded_vcpu().is_none());
                    prop_assert!(!vcpu.is_loaded());
                }
            }
            Op::Topup { cpu, nr_pages } => {
                set_cpu(cpu);
                let Some(vcpu) = pkvm.current_loaded_vcpu() else {
                    prop_assert_eq!(pkvm.topup_vcpu_memcache(0, nr_pages), Err(PkvmError::NotFound));
                    return Ok(());
                };
                let h = vcpu.handle();
                let host = self.host_side(h);
                let addr = host.layout.memcache_page(host.next_memcache_page);
                host.next_memcache_page += nr_pages;
                prop_assert_eq!(pkvm.topup_vcpu_memcache(addr, nr_pages), Ok(()));
                *self.topped_up.entry(h).or_default() += nr_pages as usize;
            }
            Op::GetRef(slot) => {
                let h = Self::handle(slot);
                let visible = pkvm.lookup(h).is_some();
                let vm_ref = pkvm.get_vm(h);
                prop_assert_eq!(vm_ref.is_some(), visible);
                self.refs.extend(vm_ref);
            }
            Op::DropRef => {
                self.refs.pop();
            }
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), TestCaseError> {
        let pkvm = self.pkvm;

        // Bounded table.
        prop_assert!(pkvm.nr_reserved() + pkvm.nr_initialized() <= MAX_VMS as usize);

        // Unique, non-zero VMIDs.
        let vms = pkvm.vms();
        let mut vmids: Vec<u16> = vms.iter().map(|vm| vm.vmid).collect();
        prop_assert!(vmids.iter().all(|&vmid| vmid != 0));
        vmids.sort_unstable();
        vmids.dedup();
        prop_assert_eq!(vmids.len(), vms.len());

        // Each vCPU sits in at most one load slot, and the slot agrees with
        // the vCPU's own marker.
        let loaded: Vec<_> = (0..NR_CPUS).filter_map(|cpu| pkvm.loaded_vcpu_on(cpu).map(|v| (cpu, v))).collect();
        for (i, (cpu, vcpu)) in loaded.iter().enumerate() {
            prop_assert_eq!(vcpu.loaded_on(), Some(*cpu));
            for (_, other) in &loaded[i + 1..] {
                prop_assert!(!Arc::ptr_eq(vcpu, other));
            }
        }

        // Refcount = loaded vCPUs + live references.
        for vm in &vms {
            let nr_loaded = loaded.iter().filter(|(_, v)| v.handle() == vm.handle).count();
            let nr_refs = self.refs.iter().filter(|r| r.handle() == vm.handle).count();
            prop_assert_eq!(vm.refcount as usize, nr_loaded + nr_refs);
        }

        // Every donated page belongs to a live VM.
        let expected: usize = vms.len() * pages_per_vm() + self.topped_up.values().sum::<usize>();
        prop_assert_eq!(pkvm.platform().mem.count(PageState::Donated), expected);
        Ok(())
    }

    /// Drop every reference, put every vCPU and tear everything down.
    fn drain(&mut self) -> Result<(), TestCaseError> {
        let pkvm = self.pkvm;
        self.refs.clear();
        for cpu in 0..NR_CPUS {
            if let Some(vcpu) = pkvm.loaded_vcpu_on(cpu) {
                pkvm.put_vcpu(&vcpu);
            }
        }
        for vm in pkvm.vms() {
            prop_assert_eq!(pkvm.teardown_vm(vm.handle), Ok(()));
        }
        Ok(())
    }
}

#[test]
fn test_random_host_call_sequences() {
    let cfg = ProptestConfig::with_cases(256);
    proptest!(cfg, |(ops in prop::collection::vec(arbitrary_op(), 1..64))| {
        let pkvm = pkvm_with(
            config()
                .with_max_vms(MAX_VMS as usize)
                .with_nr_cpus(NR_CPUS),
        );
        let mut harness = Harness::new(&pkvm);

        for op in &ops {
            harness.apply(op)?;
            harness.check_invariants()?;
        }
        harness.drain()?;

        // Donation conservation: the host got back exactly what it gave.
        let mem = &pkvm.platform().mem;
        let stats = mem.stats();
        prop_assert_eq!(mem.count(PageState::Donated), 0);
        prop_assert_eq!(mem.pinned_pages(), 0);
        prop_assert_eq!(stats.pages_donated_in, stats.pages_donated_out);
        prop_assert_eq!(stats.unflushed_returns, 0);
        prop_assert_eq!(pkvm.nr_initialized(), 0);
    });
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Unreserved,
    UnalignedVm,
    UnalignedPgd,
    Stage2,
    AArch32,
}

fn arbitrary_failure() -> impl Strategy<Value = Failure> {
    prop_oneof![
        Just(Failure::Unreserved),
        Just(Failure::UnalignedVm),
        Just(Failure::UnalignedPgd),
        Just(Failure::Stage2),
        Just(Failure::AArch32),
    ]
}

#[test]
fn test_failed_init_vm_changes_nothing() {
    let cfg = ProptestConfig::with_cases(64);
    proptest!(cfg, |(failure in arbitrary_failure(), nr_vcpus in 1..8u32, offset in 1..PAGE_SIZE)| {
        let pkvm = pkvm();
        let layout = VmLayout::at(0);
        let host = host_vm(&pkvm, layout.host_vm, nr_vcpus, true);
        let h = pkvm.reserve_vm().unwrap();

        let (mut vm_hva, mut pgd_hva) = (layout.vm, layout.pgd);
        match failure {
            Failure::Unreserved => pkvm.unreserve_vm(h),
            Failure::UnalignedVm => vm_hva += offset,
            Failure::UnalignedPgd => pgd_hva += offset,
            Failure::Stage2 => pkvm.platform().stage2.fail_next_prepare(),
            Failure::AArch32 => host.set_features(&VmFeatures {
                id: IdFeatures::FP | IdFeatures::ADVSIMD | IdFeatures::EL1_AARCH32,
                ..VmFeatures::default()
            }),
        }
        let reserved = pkvm.nr_reserved();
        let before = pkvm.platform().mem.snapshot();

        prop_assert!(pkvm.init_vm(&host, vm_hva, pgd_hva, h).is_err());
        prop_assert!(pkvm.lookup(h).is_none());
        prop_assert_eq!(pkvm.nr_initialized(), 0);
        prop_assert_eq!(pkvm.nr_reserved(), reserved);
        prop_assert_eq!(pkvm.platform().mem.snapshot(), before);
        prop_assert_eq!(pkvm.platform().mem.pinned_pages(), 0);
        prop_assert_eq!(pkvm.platform().mem.stats().unflushed_returns, 0);
    });
}

fn arbitrary_features() -> impl Strategy<Value = VmFeatures> {
    (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>()).prop_map(
        |(flags, vcpu, id, ctr_el0, midr_el1)| VmFeatures {
            flags: ArchFlags::from_bits_truncate(flags),
            vcpu: VcpuFeatures::from_bits_truncate(vcpu),
            id: IdFeatures::from_bits_truncate(id),
            ctr_el0,
            midr_el1,
        },
    )
}

#[test]
fn test_filter_is_idempotent() {
    let cfg = ProptestConfig::with_cases(1000);
    proptest!(cfg, |(protected in any::<bool>(), host in arbitrary_features(), caps in any::<u32>())| {
        let caps = PvmCaps::from_bits_truncate(caps);
        if let Ok(once) = filter(protected, &host, caps) {
            prop_assert_eq!(filter(protected, &once, caps), Ok(once));
            if protected {
                prop_assert!(once.vcpu.bits() & !host.vcpu.bits() == 0);
                prop_assert!(once.id.bits() & !host.id.bits() == 0);
            }
        }
    });
}

#[test]
fn test_publication_is_atomic() {
    let pkvm = pkvm();
    let layout = VmLayout::at(0);
    let host = host_vm(&pkvm, layout.host_vm, 3, true);
    let h = pkvm.reserve_vm().unwrap();
    let published = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            while !published.load(Ordering::Acquire) {
                if let Some(info) = pkvm.lookup(h) {
                    assert_eq!(info.created_vcpus, 3);
                    assert_eq!(info.vmid, 1);
                    assert!(info.protected);
                    assert_eq!(info.features.id, IdFeatures::FP | IdFeatures::ADVSIMD);
                }
            }
        });
        s.spawn(|| {
            set_cpu(1);
            pkvm.init_vm(&host, layout.vm, layout.pgd, h).unwrap();
            published.store(true, Ordering::Release);
        });
    });

    assert!(pkvm.lookup(h).is_some());
}
