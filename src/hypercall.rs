//! Host hypercall dispatch.
//!
//! The host reaches the VM manager with SMCCC fast calls in the vendor
//! hypervisor service range. Arguments arrive in x1..x3. On return x0 holds
//! the SMCCC status and x1 the operation's result: 0 or a negative errno,
//! or the new handle for `reserve_vm`.

use log::trace;

use crate::error::{PkvmError, Result};
use crate::host::HostResolver;
use crate::pkvm::Pkvm;
use crate::platform::Platform;

/// SMCCC fast call, SMC64, vendor-specific hypervisor service.
pub const PKVM_HCALL_BASE: u64 = 0xC600_0000;

pub const PKVM_RESERVE_VM: u64 = PKVM_HCALL_BASE | 0x10;
pub const PKVM_UNRESERVE_VM: u64 = PKVM_HCALL_BASE | 0x11;
pub const PKVM_INIT_VM: u64 = PKVM_HCALL_BASE | 0x12;
pub const PKVM_INIT_VCPU: u64 = PKVM_HCALL_BASE | 0x13;
pub const PKVM_TEARDOWN_VM: u64 = PKVM_HCALL_BASE | 0x14;
pub const PKVM_VCPU_LOAD: u64 = PKVM_HCALL_BASE | 0x15;
pub const PKVM_VCPU_PUT: u64 = PKVM_HCALL_BASE | 0x16;
pub const PKVM_TOPUP_MEMCACHE: u64 = PKVM_HCALL_BASE | 0x17;

pub const SMCCC_RET_SUCCESS: u64 = 0;
pub const SMCCC_RET_NOT_SUPPORTED: u64 = -1i64 as u64;

/// Argument and result registers of one host call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostCallRegs {
    pub x0: u64,
    pub x1: u64,
    pub x2: u64,
    pub x3: u64,
}

impl HostCallRegs {
    pub fn new(function_id: u64, x1: u64, x2: u64, x3: u64) -> Self {
        Self {
            x0: function_id,
            x1,
            x2,
            x3,
        }
    }

    /// Status left in x1, as a signed value.
    pub fn ret(&self) -> i64 {
        self.x1 as i64
    }
}

/// Handles wider than 32 bits map to 0, which no VM ever has.
fn handle_arg(reg: u64) -> u32 {
    u32::try_from(reg).unwrap_or(0)
}

fn status(result: Result<()>) -> u64 {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_errno() as u64,
    }
}

/// Handle one host call. Returns false if `regs.x0` is not a VM manager call,
/// in which case x0 is set to `SMCCC_RET_NOT_SUPPORTED`.
pub fn handle_host_hcall<P: Platform, R: HostResolver>(
    pkvm: &Pkvm<P>,
    hosts: &R,
    regs: &mut HostCallRegs,
) -> bool {
    let function_id = regs.x0;
    trace!("pkvm: hcall {:#x} ({:#x}, {:#x}, {:#x})", function_id, regs.x1, regs.x2, regs.x3);

    let ret = match function_id {
        PKVM_RESERVE_VM => match pkvm.reserve_vm() {
            Ok(handle) => handle as u64,
            Err(e) => e.to_errno() as u64,
        },
        PKVM_UNRESERVE_VM => {
            pkvm.unreserve_vm(handle_arg(regs.x1));
            0
        }
        PKVM_INIT_VM => status(handle_init_vm(pkvm, hosts, regs)),
        PKVM_INIT_VCPU => status(handle_init_vcpu(pkvm, hosts, regs)),
        PKVM_TEARDOWN_VM => status(pkvm.teardown_vm(handle_arg(regs.x1))),
        PKVM_VCPU_LOAD => status(
            u32::try_from(regs.x2)
                .map_err(|_| PkvmError::Invalid)
                .and_then(|idx| pkvm.load_vcpu(handle_arg(regs.x1), idx))
                .map(|_| ()),
        ),
        PKVM_VCPU_PUT => {
            if let Some(vcpu) = pkvm.current_loaded_vcpu() {
                pkvm.put_vcpu(&vcpu);
            }
            0
        }
        PKVM_TOPUP_MEMCACHE => status(pkvm.topup_vcpu_memcache(regs.x1, regs.x2)),
        _ => {
            regs.x0 = SMCCC_RET_NOT_SUPPORTED;
            return false;
        }
    };

    regs.x0 = SMCCC_RET_SUCCESS;
    regs.x1 = ret;
    true
}

/// x1 = host VM address, x2 = VM state address, x3 = PGD address.
/// The handle is the one the host stored in its VM after `reserve_vm`.
fn handle_init_vm<P: Platform, R: HostResolver>(
    pkvm: &Pkvm<P>,
    hosts: &R,
    regs: &HostCallRegs,
) -> Result<()> {
    let host = hosts.vm(regs.x1).ok_or(PkvmError::Invalid)?;
    pkvm.init_vm(&host, regs.x2, regs.x3, host.handle())
}

/// x1 = handle, x2 = host vCPU address, x3 = vCPU state address.
fn handle_init_vcpu<P: Platform, R: HostResolver>(
    pkvm: &Pkvm<P>,
    hosts: &R,
    regs: &HostCallRegs,
) -> Result<()> {
    let host_vcpu = hosts.vcpu(regs.x2).ok_or(PkvmError::Invalid)?;
    pkvm.init_vcpu(handle_arg(regs.x1), &host_vcpu, regs.x3)
}
