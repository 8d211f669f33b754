//! Error type shared by every hypervisor operation.
//!
//! The host only ever observes the status code, so variants carry no payload
//! that could leak hypervisor layout.

/// Errors returned to the host by VM and vCPU lifecycle operations.
#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum PkvmError {
    /// Invalid argument, alignment, index or feature request
    Invalid,
    /// The handle or vCPU slot does not resolve
    NotFound,
    /// The VM table is full
    OutOfResources,
    /// Host memory could not be donated to the hypervisor
    NoMemory,
    /// The resource is pinned, loaded or still referenced
    Busy,
    /// A vCPU is already loaded on this physical CPU
    Conflict,
}

pub const EINVAL: i64 = 22;
pub const ENOENT: i64 = 2;
pub const ENOSPC: i64 = 28;
pub const ENOMEM: i64 = 12;
pub const EBUSY: i64 = 16;
pub const EEXIST: i64 = 17;

impl PkvmError {
    /// Negative errno handed back to the host in the status register.
    pub const fn to_errno(self) -> i64 {
        match self {
            PkvmError::Invalid => -EINVAL,
            PkvmError::NotFound => -ENOENT,
            PkvmError::OutOfResources => -ENOSPC,
            PkvmError::NoMemory => -ENOMEM,
            PkvmError::Busy => -EBUSY,
            PkvmError::Conflict => -EEXIST,
        }
    }
}

pub type Result<T> = core::result::Result<T, PkvmError>;
