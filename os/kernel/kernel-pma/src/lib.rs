//! # Physical Memory Allocator
//!
//! A frame allocator for device memory that the kernel has onlined as a
//! NUMA node. Pages are requested from the kernel's page allocator first;
//! when it runs dry, unpinned memory is reclaimed from an eviction client.
//! Newly handed-out memory can be zeroed by a scrubber.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use kernel_pma::*;
//! # fn demo(source: Arc<dyn PageSource>) -> Result<()> {
//! let pma = Pma::new(InitFlags::new().with_numa(true), source);
//! pma.register_region(0, RegionDescriptor::new(0, 0x3fff_ffff))?;
//! pma.numa_onlined(1, 0x40_0000_0000, 0x4000_0000)?;
//!
//! let options = AllocationOptions::new(AllocFlags::new().with_pinned(true));
//! let allocation = pma.allocate_pages(4, consts::PAGE_SIZE_64K, &options)?;
//! pma.free_pages(&allocation.pages, allocation.unit_size)?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod collab;
pub mod consts;
mod error;
mod evict;
mod flags;
mod numa;
mod pma;
mod region;
mod scrub;
mod status;

pub use collab::{EvictionCallbacks, MemoryProtection, PageSource, Scrubber, StatsCallback};
pub use error::{PmaError, Result};
pub use flags::{AllocFlags, Allocation, AllocationOptions, InitFlags, OsAllocFlags, QueryConfig};
pub use pma::Pma;
pub use region::{PmaStats, RegionDescriptor};
pub use status::{FrameState, FreeAction, PageStatus};
