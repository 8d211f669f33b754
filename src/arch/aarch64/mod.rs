//! ARM64/AArch64 architecture support
//!
//! This module contains the pieces of EL2 state the VM manager touches:
//! - System register field definitions
//! - Data cache maintenance to the point of coherency
//! - Stage-2 TLB invalidation by VMID
//! - Physical CPU identification

pub mod defs;
pub mod maintenance;

pub use maintenance::*;
