//! Platform/Board Constants (QEMU virt machine) and the collaborator bundle
//! the VM manager runs against.
//!
//! All board-specific addresses live here so they can be changed in one
//! place when targeting a different platform.

use crate::arch::traits::{CpuLocal, Mpidr};
use crate::mem_protect::{MemProtect, PageTracker};
use crate::stage2::{PoolStage2, Stage2Ops};

// ── UART (PL011) ─────────────────────────────────────────────────────
pub const UART_BASE: usize = 0x0900_0000;

// ── Host memory donated through the page tracker ─────────────────────
pub const HOST_RAM_BASE: u64 = 0x4000_0000;
pub const HOST_RAM_SIZE: u64 = 0x4000_0000; // 1GB

/// Everything the VM manager needs from its environment besides memory for
/// its own bookkeeping.
pub trait Platform: CpuLocal {
    type Mem: MemProtect;
    type Stage2: Stage2Ops;

    fn mem(&self) -> &Self::Mem;
    fn stage2(&self) -> &Self::Stage2;
}

/// EL2 on a QEMU virt board: page ownership tracked in software over host
/// RAM, CPU identity from MPIDR_EL1.
pub struct QemuVirt {
    mem: PageTracker,
    stage2: PoolStage2,
}

impl QemuVirt {
    pub fn new(ram_base: u64, ram_size: u64) -> Self {
        Self {
            mem: PageTracker::new(ram_base, ram_size),
            stage2: PoolStage2,
        }
    }
}

impl Default for QemuVirt {
    fn default() -> Self {
        Self::new(HOST_RAM_BASE, HOST_RAM_SIZE)
    }
}

impl CpuLocal for QemuVirt {
    fn cpu_id(&self) -> usize {
        Mpidr.cpu_id()
    }
}

impl Platform for QemuVirt {
    type Mem = PageTracker;
    type Stage2 = PoolStage2;

    fn mem(&self) -> &PageTracker {
        &self.mem
    }

    fn stage2(&self) -> &PoolStage2 {
        &self.stage2
    }
}
