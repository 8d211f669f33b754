//! Host DTB (Device Tree Blob) parsing
//!
//! Reads the CPU count and the optional VM manager tunables from the boot
//! device tree and folds them into a [`HypConfig`]:
//!
//! ```text
//! / {
//!     cpus { cpu@0 { ... }; cpu@1 { ... }; };
//!     chosen {
//!         pkvm,max-vms = <64>;
//!         pkvm,sve-max-vl = <128>;
//!     };
//! };
//! ```
//!
//! The `fdt` crate does zero-copy parsing, so this works before any
//! allocator is available.

use crate::config::{ConfigError, HypConfig};

/// FDT header magic, big-endian.
pub const FDT_MAGIC: u32 = 0xD00D_FEED;

#[rustfmt::skip]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum DtbError {
    /// Device tree blob is malformed
    Malformed,
    /// Device tree has no /cpus node or no cpu children
    NoCpus,
    /// Property {0} is not a valid cell
    BadProperty(&'static str),
    /// Device tree configuration is invalid: {0}
    Config(#[from] ConfigError),
}

/// Values discovered in the device tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtbInfo {
    pub nr_cpus: usize,
    pub max_vms: Option<usize>,
    pub sve_max_vl: Option<u32>,
}

/// Parse a device tree blob.
pub fn parse(blob: &[u8]) -> Result<DtbInfo, DtbError> {
    let fdt = fdt::Fdt::new(blob).map_err(|_| DtbError::Malformed)?;

    let cpus = fdt.find_node("/cpus").ok_or(DtbError::NoCpus)?;
    let nr_cpus = cpus
        .children()
        .filter(|node| node.name.starts_with("cpu@") || node.name == "cpu")
        .count();
    if nr_cpus == 0 {
        return Err(DtbError::NoCpus);
    }

    let mut info = DtbInfo {
        nr_cpus,
        max_vms: None,
        sve_max_vl: None,
    };

    if let Some(chosen) = fdt.find_node("/chosen") {
        if let Some(prop) = chosen.property("pkvm,max-vms") {
            let v = prop.as_usize().ok_or(DtbError::BadProperty("pkvm,max-vms"))?;
            info.max_vms = Some(v);
        }
        if let Some(prop) = chosen.property("pkvm,sve-max-vl") {
            let v = prop
                .as_usize()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or(DtbError::BadProperty("pkvm,sve-max-vl"))?;
            info.sve_max_vl = Some(v);
        }
    }

    Ok(info)
}

/// Apply a device tree on top of `base` and validate the result.
pub fn apply(blob: &[u8], base: HypConfig) -> Result<HypConfig, DtbError> {
    let info = parse(blob)?;
    let mut config = base.with_nr_cpus(info.nr_cpus);
    if let Some(max_vms) = info.max_vms {
        config = config.with_max_vms(max_vms);
    }
    if let Some(vl) = info.sve_max_vl {
        config = config.with_sve_max_vl(vl);
    }
    config.validate()?;
    Ok(config)
}

/// Parse the blob the bootloader left at `addr`.
///
/// # Safety
///
/// `addr` must point to readable memory holding a complete device tree.
pub unsafe fn apply_from_ptr(addr: usize, base: HypConfig) -> Result<HypConfig, DtbError> {
    if addr == 0 {
        return Err(DtbError::Malformed);
    }
    let magic = u32::from_be(core::ptr::read_unaligned(addr as *const u32));
    if magic != FDT_MAGIC {
        return Err(DtbError::Malformed);
    }
    let total_size = u32::from_be(core::ptr::read_unaligned((addr + 4) as *const u32)) as usize;
    let blob = core::slice::from_raw_parts(addr as *const u8, total_size);
    apply(blob, base)
}
