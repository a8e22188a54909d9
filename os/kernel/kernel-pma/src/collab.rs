//! Interfaces to the systems the allocator cooperates with.
//!
//! None of these are called with the allocator spinlock held, with the
//! exception of [`PageSource::acquire_page`] and
//! [`PageSource::release_page`], which only adjust reference counts.

use crate::consts::DEFAULT_OS_PAGE_SHIFT;
use crate::error::Result;
use crate::flags::OsAllocFlags;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// The kernel's NUMA page allocator.
pub trait PageSource: Send + Sync {
    fn page_shift(&self) -> u32 {
        DEFAULT_OS_PAGE_SHIFT
    }

    /// Allocate `length` contiguous bytes on `node`; returns the system
    /// physical address. May sleep.
    fn alloc_pages_node(&self, node: u32, length: u64, flags: OsAllocFlags) -> Result<u64>;

    /// Take a reference on `page_count` OS pages starting at `addr`.
    fn acquire_page(&self, addr: u64, page_count: u64);

    /// Drop a reference on `page_count` OS pages starting at `addr`.
    fn release_page(&self, addr: u64, page_count: u64);

    /// `(free, total)` bytes on `node`.
    fn numa_memory_usage(&self, node: u32) -> (u64, u64);
}

/// Zero-fills memory before it is handed out.
pub trait Scrubber: Send + Sync {
    /// Queue `pages` (each `page_size` bytes) and return the pages that have
    /// already completed.
    fn submit_pages(&self, page_size: u64, pages: &[u64]) -> Result<Vec<u64>>;

    /// Block until outstanding work is done; returns the pages completed
    /// since the last call.
    fn wait_for_completion(&self) -> Result<Vec<u64>>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryProtection {
    Unprotected,
    Protected,
}

/// The client that owns unpinned memory and can give it back on request.
pub trait EvictionCallbacks: Send + Sync {
    /// Free everything in `[begin, end]`.
    fn evict_range(&self, begin: u64, end: u64, protection: MemoryProtection) -> Result<()>;

    /// Fill `pages` with evicted pages of `page_size` from `[begin, end]`.
    fn evict_pages(
        &self,
        page_size: u64,
        pages: &mut [u64],
        begin: u64,
        end: u64,
        protection: MemoryProtection,
    ) -> Result<()>;
}

/// Receives the free frame count after stat changes. Runs under the
/// allocator lock, so it must not call back into the allocator.
pub type StatsCallback = Box<dyn Fn(u64) + Send + Sync>;
