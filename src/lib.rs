//! EL2 VM and vCPU object manager for protected KVM.
//!
//! The host kernel asks the hypervisor to take over the bookkeeping of its
//! VMs: it reserves a handle, donates memory for the hypervisor's copy of the
//! VM and each vCPU, loads vCPUs onto physical CPUs and finally tears the VM
//! down to get its memory back. [`Pkvm`] implements those operations on top
//! of a [`Platform`] supplying page-ownership transitions, stage-2 page-table
//! management and the identity of the current CPU.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod dtb;
pub mod error;
pub mod features;
pub mod host;
pub mod hypercall;
pub mod logger;
pub mod mem_protect;
pub mod mm;
pub mod percpu;
pub mod pkvm;
pub mod platform;
pub mod rollback;
pub mod stage2;
pub mod sync;
pub mod traps;
pub mod vcpu;
pub mod vm;
pub mod vm_table;

pub use config::HypConfig;
pub use error::{PkvmError, Result};
pub use host::{HostVcpu, HostVm};
pub use pkvm::{Pkvm, VmRef};
pub use platform::{Platform, QemuVirt};
pub use vcpu::Vcpu;
pub use vm::{Vm, VmInfo};
pub use vm_table::HANDLE_OFFSET;
