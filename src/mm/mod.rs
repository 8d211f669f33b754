//! Memory management subsystem
//!
//! Address-range types that record which domain owns a piece of memory, and
//! the page caches used to hand pages between the host and the hypervisor.

pub mod memcache;
pub mod region;

pub use memcache::MemCache;
pub use region::{HostRegion, HypRegion, PAGE_SIZE};
