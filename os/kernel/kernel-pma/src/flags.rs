use alloc::vec::Vec;
use bitfield_struct::bitfield;

/// Per-request allocation flags.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AllocFlags {
    /// Return one physically contiguous range.
    pub contiguous: bool,
    /// Frames are not eligible for eviction.
    pub pinned: bool,
    pub persistent: bool,
    /// Fail instead of asking the eviction client for memory.
    pub dont_evict: bool,
    /// Accept fewer pages than requested.
    pub allow_partial: bool,
    /// Skip scrubbing even when scrub-on-free is active.
    pub no_zero: bool,
    /// Allocate from the top of the address space. Not supported on NUMA.
    pub reverse: bool,
    /// Restrict to regions overlapping `phys_begin..=phys_end`.
    pub specify_address_range: bool,
    /// Allocate from protected regions only.
    pub protected_region: bool,
    /// Try low-performance regions first.
    pub prefer_slowest: bool,

    #[bits(22, default = 0)]
    _reserved: u32,
}

/// Allocator-wide policy set at construction.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct InitFlags {
    pub scrub_on_free: bool,
    pub numa: bool,
    /// Treat every allocation as persistent.
    pub force_persistence: bool,

    #[bits(29, default = 0)]
    _reserved: u32,
}

/// Configuration bits reported by `Pma::query_configs`.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct QueryConfig {
    pub scrub_enabled: bool,
    pub scrub_valid: bool,
    pub numa_enabled: bool,
    pub numa_onlined: bool,

    #[bits(28, default = 0)]
    _reserved: u32,
}

/// Flags passed to the OS page source.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct OsAllocFlags {
    /// Do not let the OS run its own reclaim for this request.
    pub skip_reclaim: bool,

    #[bits(31, default = 0)]
    _reserved: u32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AllocationOptions {
    pub flags: AllocFlags,
    /// Inclusive bounds, used with [`AllocFlags::specify_address_range`].
    pub phys_begin: u64,
    pub phys_end: u64,
}

impl AllocationOptions {
    #[must_use]
    pub const fn new(flags: AllocFlags) -> Self {
        Self {
            flags,
            phys_begin: 0,
            phys_end: 0,
        }
    }

    /// Restrict the request to `[begin, end]`.
    #[must_use]
    pub const fn within(self, begin: u64, end: u64) -> Self {
        Self {
            flags: self.flags.with_specify_address_range(true),
            phys_begin: begin,
            phys_end: end,
        }
    }
}

/// A successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// Base address of every returned page.
    pub pages: Vec<u64>,
    /// Bytes covered by each entry in `pages`.
    pub unit_size: u64,
    /// The memory is guaranteed to read as zero.
    pub is_zero: bool,
}

impl Allocation {
    #[must_use]
    pub const fn count(&self) -> usize {
        self.pages.len()
    }
}
