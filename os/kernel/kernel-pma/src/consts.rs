//! # Allocator Configuration

/// log2 of the frame size the allocator tracks.
pub const PMA_PAGE_SHIFT: u32 = 16;

/// Size of one tracked frame (64 KiB).
pub const PMA_PAGE_SIZE: u64 = 1 << PMA_PAGE_SHIFT;

/// Region bases and ends must be aligned to this.
pub const PMA_GRANULARITY: u64 = 0x20_0000; // 2 MiB

pub const PAGE_SIZE_64K: u64 = 64 * 1024;
pub const PAGE_SIZE_128K: u64 = 128 * 1024;
pub const PAGE_SIZE_2M: u64 = 2 * 1024 * 1024;
pub const PAGE_SIZE_512M: u64 = 512 * 1024 * 1024;

/// Page sizes a caller may request.
pub const SUPPORTED_PAGE_SIZES: [u64; 4] =
    [PAGE_SIZE_64K, PAGE_SIZE_128K, PAGE_SIZE_2M, PAGE_SIZE_512M];

/// Upper bound for a single contiguous request on a NUMA node.
pub const MAX_NUMA_CONTIGUOUS: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of regions per allocator.
pub const PMA_REGION_SIZE: usize = 32;

/// Frames per 2 MiB page, used by the reclaim-skip ratio.
pub const FRAMES_PER_2MB: u64 = PAGE_SIZE_2M >> PMA_PAGE_SHIFT;

/// Percentage of free frames under which the OS is asked not to reclaim.
pub const DEFAULT_RECLAIM_SKIP_THRESHOLD: u32 = 4;
pub const MAX_RECLAIM_SKIP_THRESHOLD: u32 = 100;

/// OS page shift assumed when a page source does not say otherwise.
pub const DEFAULT_OS_PAGE_SHIFT: u32 = 12;

const _: () = {
    assert!(PMA_PAGE_SIZE == PAGE_SIZE_64K);
    assert!(PMA_GRANULARITY.is_multiple_of(PMA_PAGE_SIZE));
    assert!(FRAMES_PER_2MB == 32);
    assert!(MAX_NUMA_CONTIGUOUS.is_multiple_of(PAGE_SIZE_512M));
    assert!(DEFAULT_RECLAIM_SKIP_THRESHOLD <= MAX_RECLAIM_SKIP_THRESHOLD);
    assert!(DEFAULT_OS_PAGE_SHIFT <= PMA_PAGE_SHIFT);
};
