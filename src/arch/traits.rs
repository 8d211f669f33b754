//! Architecture-Portable Trait Definitions
//!
//! The VM manager never reads CPU identity registers directly; it asks a
//! [`CpuLocal`] implementation, so the same core runs on EL2 hardware and in
//! hosted simulations where "physical CPUs" are threads.

/// Identity of the physical CPU executing the current call.
pub trait CpuLocal {
    /// Index of the current physical CPU, `< nr_cpus` of the configuration.
    fn cpu_id(&self) -> usize;
}

/// Reads MPIDR_EL1.Aff0 on bare metal.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mpidr;

impl CpuLocal for Mpidr {
    #[inline]
    fn cpu_id(&self) -> usize {
        super::aarch64::current_cpu_id()
    }
}
