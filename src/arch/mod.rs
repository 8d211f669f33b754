//! Architecture-specific code
//!
//! Register definitions are always available. The instructions behind
//! [`aarch64::maintenance`] are only emitted for bare-metal AArch64 builds;
//! hosted builds (simulation and tests) get inert fallbacks.

pub mod aarch64;
pub mod traits;
