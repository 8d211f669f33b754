//! VM and vCPU lifecycle manager.
//!
//! [`Pkvm`] owns the VM table, the per-CPU load slots and the configuration.
//! All table transitions and every load/put/teardown step are linearized by
//! the VM table lock. Memory moves between host and hypervisor only through
//! the platform's [`MemProtect`] implementation.
//!
//! Lock order: VM table lock, then memory-protection locks, then per-CPU
//! load slots. Host teardown caches are filled after the others are
//! released.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::arch::traits::CpuLocal;
use crate::config::{HypConfig, KVM_MAX_VCPUS, MAX_VMS_LIMIT};
use crate::error::{PkvmError, Result};
use crate::features::{self, VcpuFeatures};
use crate::host::{HostVcpu, HostVm};
use crate::mem_protect::{
    map_donated, map_donated_noclear, teardown_donated, unmap_donated, unmap_donated_noclear,
    MemProtect,
};
use crate::mm::{HostRegion, MemCache, PAGE_SIZE};
use crate::percpu::LoadSlots;
use crate::platform::Platform;
use crate::rollback::{Donated, Pinned};
use crate::stage2::{Stage2Mmu, Stage2Ops, Vtcr};
use crate::sync::SpinLock;
use crate::traps::init_traps;
use crate::vcpu::{sve_state_size, SveState, Vcpu, VcpuInit};
use crate::vm::{hyp_vm_size, Vm, VcpuEntry, VmInfo, VmRemains, HYP_VCPU_SIZE};
use crate::vm_table::{VmTable, HANDLE_OFFSET};

pub struct Pkvm<P: Platform> {
    platform: P,
    config: HypConfig,
    table: SpinLock<Option<VmTable>>,
    loaded: LoadSlots,
}

impl<P: Platform> Pkvm<P> {
    /// Create a manager with no VM table yet; see [`Pkvm::init_table`].
    pub fn new(platform: P, config: HypConfig) -> Self {
        Self {
            loaded: LoadSlots::new(config.nr_cpus),
            platform,
            config,
            table: SpinLock::new(None),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &HypConfig {
        &self.config
    }

    /// Create the VM table. May only happen once.
    pub fn init_table(&self, max_vms: usize) -> Result<()> {
        if max_vms == 0 || max_vms > MAX_VMS_LIMIT {
            return Err(PkvmError::Invalid);
        }
        let mut table = self.table.lock();
        if table.is_some() {
            warn!("pkvm: VM table already initialized");
            return Err(PkvmError::Invalid);
        }
        *table = Some(VmTable::new(max_vms));
        info!("pkvm: VM table ready, {} slots, {} CPUs", max_vms, self.loaded.nr_cpus());
        Ok(())
    }

    /// Reserve a table slot for a new VM and return its handle.
    pub fn reserve_vm(&self) -> Result<u32> {
        let mut table = self.table.lock();
        let table = table.as_mut().ok_or(PkvmError::Invalid)?;
        let handle = table.reserve()?;
        debug!("pkvm: reserved handle {:#x}", handle);
        Ok(handle)
    }

    /// Drop a reservation that was never initialized. Anything else about
    /// `handle` is ignored.
    pub fn unreserve_vm(&self, handle: u32) {
        if let Some(table) = self.table.lock().as_mut() {
            if table.unreserve(handle) {
                debug!("pkvm: unreserved handle {:#x}", handle);
            }
        }
    }

    /// Build the hypervisor's copy of `host` from donated memory and publish
    /// it under `handle`.
    ///
    /// `vm_hva` must cover [`hyp_vm_size`] bytes for the host's vCPU count
    /// and `pgd_hva` the stage-2 root size implied by the configured VTCR.
    /// On error nothing has changed: donations are returned, pins released
    /// and the slot is still reserved.
    pub fn init_vm(&self, host: &Arc<HostVm>, vm_hva: u64, pgd_hva: u64, handle: u32) -> Result<()> {
        let mem = self.platform.mem();
        let pin = Pinned::pin(mem, host.region())?;

        let nr_vcpus = host.created_vcpus();
        if !(1..=KVM_MAX_VCPUS).contains(&nr_vcpus) {
            return Err(PkvmError::Invalid);
        }
        if handle < HANDLE_OFFSET {
            return Err(PkvmError::Invalid);
        }
        let vmid = u16::try_from(handle - HANDLE_OFFSET + 1).map_err(|_| PkvmError::Invalid)?;
        let vm_size = hyp_vm_size(nr_vcpus).ok_or(PkvmError::Invalid)?;
        let vtcr = Vtcr(self.config.vtcr);
        let pgd_size = vtcr.pgd_size().ok_or(PkvmError::Invalid)?;

        let backing = Donated::new(mem, map_donated(mem, HostRegion::new(vm_hva, vm_size))?);
        // The PGD is not scrubbed here: stage-2 preparation writes every root
        // entry before the table can be walked, and the table is scrubbed
        // again on its way back to the host.
        let pgd = Donated::new(mem, map_donated_noclear(mem, HostRegion::new(pgd_hva, pgd_size))?);

        let protected = host.is_protected();
        let features = features::filter(protected, &host.features(), self.config.pvm_caps)?;

        let mut mmu = Stage2Mmu::new(vmid, vtcr, pgd.into_region());
        if let Err(e) = self.platform.stage2().prepare(mem, &mut mmu) {
            if let Some(pgd) = mmu.take_pgd() {
                unmap_donated(mem, pgd);
            }
            return Err(e);
        }

        let vm = Vm::new(
            handle,
            Arc::clone(host),
            nr_vcpus,
            protected,
            features,
            mmu,
            backing.into_region(),
        );

        // Publication must come last: it makes the VM visible to every CPU.
        let published = match self.table.lock().as_mut() {
            Some(table) => table.publish(handle, Box::new(vm)),
            None => Err((PkvmError::Invalid, Box::new(vm))),
        };
        if let Err((e, vm)) = published {
            warn!("pkvm: handle {:#x} is no longer reserved, dropping VM", handle);
            self.release_unpublished(vm.into_remains());
            return Err(e);
        }

        pin.keep();
        debug!(
            "pkvm: VM {:#x} vmid {} vcpus {} protected {}",
            handle, vmid, nr_vcpus, protected
        );
        Ok(())
    }

    /// Return the memory of a VM that never became visible.
    fn release_unpublished(&self, remains: VmRemains) {
        let mem = self.platform.mem();
        let VmRemains {
            mut mmu, backing, ..
        } = remains;
        if let Some(pgd) = mmu.take_pgd() {
            unmap_donated(mem, pgd);
        }
        unmap_donated(mem, backing);
    }

    /// Build a vCPU of VM `handle` from donated memory and the host's vCPU
    /// at `host_vcpu`.
    pub fn init_vcpu(&self, handle: u32, host_vcpu: &Arc<HostVcpu>, vcpu_hva: u64) -> Result<()> {
        let mem = self.platform.mem();
        let backing = Donated::new(mem, map_donated(mem, HostRegion::new(vcpu_hva, HYP_VCPU_SIZE))?);

        let mut table = self.table.lock();
        let vm = table
            .as_mut()
            .and_then(|t| t.get_mut(handle))
            .ok_or(PkvmError::NotFound)?;

        let host_pin = Pinned::pin(mem, host_vcpu.region()).map_err(|_| PkvmError::Busy)?;

        let vcpu_id = host_vcpu.vcpu_id();
        let vcpu_idx = host_vcpu.vcpu_idx();
        let traps = init_traps(
            vm.is_protected(),
            vm.features(),
            self.config.cpu_caps,
            host_vcpu.hcrx_el2(),
        );

        let (sve_pin, sve) = match self.pin_sve_state(mem, vm, host_vcpu) {
            Ok(Some((pin, state))) => (Some(pin), Some(state)),
            Ok(None) => (None, None),
            Err(e) => {
                warn!("pkvm: VM {:#x} vcpu {}: SVE state rejected, SVE disabled", handle, vcpu_idx);
                return Err(e);
            }
        };

        let vcpu = Arc::new(Vcpu::new(VcpuInit {
            handle,
            vmid: vm.vmid(),
            protected: vm.is_protected(),
            host: Arc::clone(host_vcpu),
            vcpu_id,
            vcpu_idx,
            features: *vm.features(),
            traps,
            sve,
        }));
        let entry = VcpuEntry {
            vcpu,
            backing: backing.into_region(),
        };
        if let Err(entry) = vm.set_vcpu(vcpu_idx, entry) {
            drop(table);
            drop(Donated::new(mem, entry.backing));
            return Err(PkvmError::Invalid);
        }
        drop(table);

        host_pin.keep();
        if let Some(pin) = sve_pin {
            pin.keep();
        }
        debug!("pkvm: VM {:#x} vcpu {} (id {}) ready", handle, vcpu_idx, vcpu_id);
        Ok(())
    }

    /// Pin the host's SVE save area if the VM uses SVE. Any failure turns
    /// SVE off for the whole VM.
    fn pin_sve_state<'a>(
        &self,
        mem: &'a P::Mem,
        vm: &mut Vm,
        host_vcpu: &HostVcpu,
    ) -> Result<Option<(Pinned<'a, P::Mem>, SveState)>> {
        if !vm.features().vcpu.contains(VcpuFeatures::SVE) {
            return Ok(None);
        }

        let max_vl = host_vcpu.sve_max_vl().min(self.config.sve_max_vl);
        let size = sve_state_size(max_vl);
        let state = host_vcpu.sve_state();
        let pinned = if state == 0 || size == 0 {
            Err(PkvmError::Invalid)
        } else {
            let region = HostRegion::new(state, size);
            Pinned::pin(mem, region).map(|pin| (pin, SveState { region, max_vl }))
        };

        match pinned {
            Ok(pinned) => Ok(Some(pinned)),
            Err(e) => {
                vm.clear_vcpu_feature(VcpuFeatures::SVE);
                Err(e)
            }
        }
    }

    /// Return VM `handle` to the host.
    ///
    /// Refused with `Busy` while any of its vCPUs is loaded or a [`VmRef`]
    /// is alive. Every donated page is scrubbed, flushed and recorded in one
    /// of the host VM's teardown caches before this returns.
    pub fn teardown_vm(&self, handle: u32) -> Result<()> {
        let mem = self.platform.mem();
        let stage2 = self.platform.stage2();

        let vm = {
            let mut table = self.table.lock();
            let table = table.as_mut().ok_or(PkvmError::NotFound)?;
            let vm = table.get(handle).ok_or(PkvmError::NotFound)?;
            if vm.refcount() != 0 {
                warn!("pkvm: teardown of VM {:#x} with {} references", handle, vm.refcount());
                return Err(PkvmError::Busy);
            }
            // The VMID may be handed out again as soon as the slot is free.
            stage2.flush_vmid(vm.mmu());
            table.remove(handle).ok_or(PkvmError::NotFound)?
        };

        let VmRemains {
            host,
            mut mmu,
            backing,
            vcpus,
        } = vm.into_remains();
        let mut mc = MemCache::new();
        let mut stage2_mc = MemCache::new();

        if let Err(e) = stage2.reclaim(mem, &mut mmu, &mut stage2_mc) {
            warn!("pkvm: VM {:#x}: stage-2 reclaim incomplete: {}", handle, e);
            // The root table still goes back even if the walk gave up.
            if let Some(pgd) = mmu.take_pgd() {
                teardown_donated(mem, &mut stage2_mc, pgd);
            }
        }

        for entry in &vcpus {
            mem.unpin(entry.vcpu.host().region());
            if let Some(sve) = entry.vcpu.sve() {
                mem.unpin(sve.region);
            }
        }

        for entry in vcpus {
            for pages in entry.vcpu.drain_memcache() {
                for page in pages.into_pages() {
                    stage2_mc.push(page.addr());
                    unmap_donated_noclear(mem, page);
                }
            }
            teardown_donated(mem, &mut mc, entry.backing);
        }

        teardown_donated(mem, &mut mc, backing);
        mem.unpin(host.region());

        let (nr_meta, nr_s2) = (mc.len(), stage2_mc.len());
        {
            let mut host_mc = host.teardown_mc.lock();
            for page in mc.take_all() {
                host_mc.push(page);
            }
        }
        {
            let mut host_mc = host.stage2_teardown_mc.lock();
            for page in stage2_mc.take_all() {
                host_mc.push(page);
            }
        }
        debug!(
            "pkvm: VM {:#x} torn down, {} metadata and {} stage-2 pages returned",
            handle, nr_meta, nr_s2
        );
        Ok(())
    }

    /// Load vCPU `vcpu_idx` of VM `handle` on the current physical CPU.
    pub fn load_vcpu(&self, handle: u32, vcpu_idx: u32) -> Result<Arc<Vcpu>> {
        if handle < HANDLE_OFFSET {
            return Err(PkvmError::NotFound);
        }
        let cpu = self.platform.cpu_id();
        if cpu >= self.loaded.nr_cpus() {
            return Err(PkvmError::Invalid);
        }
        // A vCPU must be put before another can be loaded here.
        if !self.loaded.is_empty(cpu) {
            return Err(PkvmError::Conflict);
        }

        let vcpu = {
            let mut table = self.table.lock();
            let vm = table
                .as_mut()
                .and_then(|t| t.get_mut(handle))
                .ok_or(PkvmError::NotFound)?;
            if vcpu_idx >= vm.created_vcpus() {
                return Err(PkvmError::Invalid);
            }
            let vcpu = Arc::clone(vm.vcpu(vcpu_idx).ok_or(PkvmError::NotFound)?);
            if vcpu.is_loaded() {
                return Err(PkvmError::Busy);
            }
            vcpu.mark_loaded(cpu);
            vm.get();
            vcpu
        };

        self.loaded.set(cpu, Arc::clone(&vcpu));
        Ok(vcpu)
    }

    /// Undo [`Pkvm::load_vcpu`]. A vCPU that is not loaded is ignored.
    pub fn put_vcpu(&self, vcpu: &Arc<Vcpu>) {
        let mut table = self.table.lock();
        let Some(cpu) = vcpu.mark_put() else {
            warn!("pkvm: put of vcpu {} of VM {:#x} that is not loaded", vcpu.vcpu_idx(), vcpu.handle());
            return;
        };
        if cpu != self.platform.cpu_id() {
            warn!("pkvm: vcpu {} put from CPU {}, loaded on {}", vcpu.vcpu_idx(), self.platform.cpu_id(), cpu);
        }
        self.loaded.clear(cpu);
        match table.as_mut().and_then(|t| t.get_mut(vcpu.handle())) {
            Some(vm) => vm.put(),
            None => warn!("pkvm: loaded vcpu of missing VM {:#x}", vcpu.handle()),
        }
    }

    /// The vCPU loaded on the current physical CPU.
    pub fn current_loaded_vcpu(&self) -> Option<Arc<Vcpu>> {
        self.loaded.get(self.platform.cpu_id())
    }

    /// The vCPU loaded on physical CPU `cpu`.
    pub fn loaded_vcpu_on(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        self.loaded.get(cpu)
    }

    /// Donate `nr_pages` host pages at `hva` to the private page cache of
    /// the vCPU loaded on this CPU.
    pub fn topup_vcpu_memcache(&self, hva: u64, nr_pages: u64) -> Result<()> {
        let vcpu = self.current_loaded_vcpu().ok_or(PkvmError::NotFound)?;
        if nr_pages == 0 {
            return Ok(());
        }
        let size = nr_pages.checked_mul(PAGE_SIZE).ok_or(PkvmError::Invalid)?;
        let pages = map_donated(self.platform.mem(), HostRegion::new(hva, size))?;
        vcpu.push_memcache(pages);
        Ok(())
    }

    /// Snapshot of VM `handle` if it is initialized.
    pub fn lookup(&self, handle: u32) -> Option<VmInfo> {
        self.with_vm(handle, Vm::info)
    }

    /// Run `f` on VM `handle` with the table lock held.
    ///
    /// `f` must not call back into this manager: every operation takes the
    /// same non-recursive lock and would spin forever. Use [`Pkvm::get_vm`]
    /// to keep a VM alive across other calls.
    pub fn with_vm<R>(&self, handle: u32, f: impl FnOnce(&Vm) -> R) -> Option<R> {
        let table = self.table.lock();
        table.as_ref()?.get(handle).map(f)
    }

    /// Take a reference on VM `handle`, keeping it from being torn down
    /// until the returned guard is dropped.
    pub fn get_vm(&self, handle: u32) -> Option<VmRef<'_, P>> {
        let mut table = self.table.lock();
        let vm = table.as_mut()?.get_mut(handle)?;
        vm.get();
        Some(VmRef {
            pkvm: self,
            handle,
            protected: vm.is_protected(),
        })
    }

    /// Like [`Pkvm::get_vm`], but only for non-protected VMs.
    pub fn get_np_vm(&self, handle: u32) -> Option<VmRef<'_, P>> {
        self.get_vm(handle).filter(|vm| !vm.is_protected())
    }

    fn put_vm(&self, handle: u32) {
        let mut table = self.table.lock();
        match table.as_mut().and_then(|t| t.get_mut(handle)) {
            Some(vm) => vm.put(),
            None => warn!("pkvm: reference dropped on missing VM {:#x}", handle),
        }
    }

    /// Slots currently reserved but not initialized.
    pub fn nr_reserved(&self) -> usize {
        self.table.lock().as_ref().map_or(0, VmTable::nr_reserved)
    }

    pub fn nr_initialized(&self) -> usize {
        self.table.lock().as_ref().map_or(0, VmTable::nr_initialized)
    }

    /// Snapshots of every initialized VM in handle order.
    pub fn vms(&self) -> Vec<VmInfo> {
        let table = self.table.lock();
        table
            .as_ref()
            .map(|t| t.vms().map(Vm::info).collect())
            .unwrap_or_default()
    }
}

/// A counted reference to a published VM.
pub struct VmRef<'a, P: Platform> {
    pkvm: &'a Pkvm<P>,
    handle: u32,
    protected: bool,
}

impl<P: Platform> VmRef<'_, P> {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn info(&self) -> Option<VmInfo> {
        self.pkvm.lookup(self.handle)
    }
}

impl<P: Platform> Drop for VmRef<'_, P> {
    fn drop(&mut self) {
        self.pkvm.put_vm(self.handle);
    }
}
