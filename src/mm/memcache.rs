//! Page caches exchanged with the host.
//!
//! During teardown the hypervisor pushes every page it gives back into one of
//! the host VM's caches, so the host can find and free them without trusting
//! any other hypervisor state. Pages come out in LIFO order.

use alloc::vec::Vec;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemCache {
    pages: Vec<u64>,
}

impl MemCache {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn push(&mut self, page: u64) {
        self.pages.push(page);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.pages.pop()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, page: u64) -> bool {
        self.pages.contains(&page)
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.iter().copied()
    }

    /// Empty the cache, oldest page first.
    pub fn take_all(&mut self) -> Vec<u64> {
        core::mem::take(&mut self.pages)
    }
}
