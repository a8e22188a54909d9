use crate::collab::{EvictionCallbacks, PageSource, Scrubber, StatsCallback};
use crate::consts::{
    DEFAULT_RECLAIM_SKIP_THRESHOLD, FRAMES_PER_2MB, MAX_RECLAIM_SKIP_THRESHOLD, PMA_GRANULARITY,
    PMA_PAGE_SHIFT, PMA_PAGE_SIZE, PMA_REGION_SIZE, SUPPORTED_PAGE_SIZES,
};
use crate::error::{PmaError, Result};
use crate::flags::{Allocation, AllocationOptions, InitFlags, QueryConfig};
use crate::numa::{FreeOrigin, Translator};
use crate::region::{PmaStats, RegionDescriptor, RegionMap};
use crate::status::{FrameState, PageStatus};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_map::MemoryRange;
use kernel_sync::{RwSpinLock, SpinLock, SpinLockGuard};
use log::{debug, info, warn};

pub(crate) type InnerGuard<'a> = SpinLockGuard<'a, PmaInner>;

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct NumaNode {
    pub(crate) onlined: bool,
    pub(crate) node_id: u32,
    /// System physical base of the CPU-coherent window onto the regions.
    pub(crate) coherent_base: u64,
    pub(crate) coherent_size: u64,
}

/// Everything guarded by the allocator spinlock.
pub(crate) struct PmaInner {
    pub(crate) regions: Vec<RegionMap>,
    pub(crate) stats: PmaStats,
    pub(crate) node: NumaNode,
    pub(crate) reclaim_skip_threshold: u32,
    pub(crate) eviction: Option<Arc<dyn EvictionCallbacks>>,
    pub(crate) evictions_in_flight: usize,
    stats_cb: Option<StatsCallback>,
}

/// A physical memory allocator serving one NUMA node.
///
/// Frames are 64 KiB. Memory comes from the OS through a [`PageSource`];
/// when the OS runs dry, unpinned frames are reclaimed from the registered
/// [`EvictionCallbacks`].
///
/// Lock order is alloc lock, then scrubber lock, then the allocator
/// spinlock. The spinlock is dropped around every call into a
/// collaborator that may block.
pub struct Pma {
    init_flags: InitFlags,
    pub(crate) page_source: Arc<dyn PageSource>,
    pub(crate) inner: SpinLock<PmaInner>,
    /// Serializes scrub-on-free allocations.
    pub(crate) alloc_lock: SpinLock<()>,
    eviction_callbacks_lock: SpinLock<()>,
    pub(crate) scrubber: RwSpinLock<Option<Arc<dyn Scrubber>>>,
}

impl Pma {
    #[must_use]
    pub fn new(init_flags: InitFlags, page_source: Arc<dyn PageSource>) -> Self {
        info!(
            "creating allocator: numa={} scrub_on_free={} force_persistence={}",
            init_flags.numa(),
            init_flags.scrub_on_free(),
            init_flags.force_persistence()
        );
        if page_source.page_shift() > PMA_PAGE_SHIFT {
            warn!(
                "OS page shift {} exceeds the frame shift {PMA_PAGE_SHIFT}",
                page_source.page_shift()
            );
        }

        Self {
            init_flags,
            page_source,
            inner: SpinLock::new(PmaInner {
                regions: Vec::new(),
                stats: PmaStats::default(),
                node: NumaNode::default(),
                reclaim_skip_threshold: DEFAULT_RECLAIM_SKIP_THRESHOLD,
                eviction: None,
                evictions_in_flight: 0,
                stats_cb: None,
            }),
            alloc_lock: SpinLock::new(()),
            eviction_callbacks_lock: SpinLock::new(()),
            scrubber: RwSpinLock::new(None),
        }
    }

    #[must_use]
    pub const fn init_flags(&self) -> InitFlags {
        self.init_flags
    }

    /// Add region `id`. Ids start at zero and must be consecutive.
    ///
    /// # Errors
    /// [`PmaError::InvalidArgument`] if the bounds are not 2 MiB aligned,
    /// the region overlaps another one, or `id` is not the next free slot.
    pub fn register_region(&self, id: usize, desc: RegionDescriptor) -> Result<()> {
        if desc.limit < desc.base {
            return Err(PmaError::InvalidArgument("region limit below base"));
        }
        let end_aligned = desc
            .limit
            .checked_add(1)
            .is_some_and(|end| end.is_multiple_of(PMA_GRANULARITY));
        if !desc.base.is_multiple_of(PMA_GRANULARITY) || !end_aligned {
            return Err(PmaError::InvalidArgument("region bounds not 2 MiB aligned"));
        }
        if self.init_flags.numa() {
            warn!("registering region {id} on a NUMA allocator");
        }

        let mut inner = self.inner.lock();
        if id != inner.regions.len() {
            return Err(PmaError::InvalidArgument("region ids must be consecutive"));
        }
        if inner.regions.len() >= PMA_REGION_SIZE {
            return Err(PmaError::InvalidArgument("too many regions"));
        }
        let span = MemoryRange::new(desc.base, desc.size());
        if inner
            .regions
            .iter()
            .any(|r| MemoryRange::new(r.desc.base, r.desc.size()).overlaps(&span))
        {
            return Err(PmaError::InvalidArgument("region overlaps a registered region"));
        }

        inner.stats.add_region(&desc);
        inner.regions.push(RegionMap::new(desc));
        info!(
            "region {id}: {:#x}..={:#x} perf={} protected={}",
            desc.base, desc.limit, desc.performance, desc.is_protected
        );
        inner.notify_stats();
        Ok(())
    }

    /// Bring the node online once the kernel manages its memory.
    ///
    /// # Errors
    /// [`PmaError::InvalidState`] on an allocator without NUMA support,
    /// [`PmaError::InvalidArgument`] if the coherent window wraps.
    pub fn numa_onlined(&self, node_id: u32, coherent_base: u64, coherent_size: u64) -> Result<()> {
        if !self.init_flags.numa() {
            return Err(PmaError::InvalidState("allocator is not NUMA enabled"));
        }
        if coherent_base.checked_add(coherent_size).is_none() {
            return Err(PmaError::InvalidArgument("coherent window overflows"));
        }

        let mut inner = self.inner.lock();
        inner.node = NumaNode {
            onlined: true,
            node_id,
            coherent_base,
            coherent_size,
        };
        info!(
            "NUMA node {node_id} onlined, coherent window {coherent_base:#x}+{coherent_size:#x}"
        );
        Ok(())
    }

    pub fn numa_offlined(&self) {
        let mut inner = self.inner.lock();
        inner.node.onlined = false;
        info!("NUMA node {} offlined", inner.node.node_id);
    }

    #[must_use]
    pub fn is_numa_onlined(&self) -> bool {
        self.inner.lock().node.onlined
    }

    pub fn register_mem_scrub(&self, scrubber: Arc<dyn Scrubber>) {
        *self.scrubber.write() = Some(scrubber);
        info!("scrubber registered");
    }

    /// Waits for in-flight scrub-on-free allocations to finish.
    pub fn unregister_mem_scrub(&self) {
        *self.scrubber.write() = None;
        info!("scrubber unregistered");
    }

    /// # Errors
    /// [`PmaError::InvalidState`] if callbacks are already registered.
    pub fn register_eviction_cb(&self, callbacks: Arc<dyn EvictionCallbacks>) -> Result<()> {
        let _cb = self.eviction_callbacks_lock.lock();
        let mut inner = self.inner.lock();
        if inner.eviction.is_some() {
            return Err(PmaError::InvalidState("eviction callbacks already registered"));
        }
        inner.eviction = Some(callbacks);
        Ok(())
    }

    /// Clear the eviction callbacks and wait until no eviction is running.
    pub fn unregister_eviction_cb(&self) {
        let _cb = self.eviction_callbacks_lock.lock();
        let mut inner = self.inner.lock();
        inner.eviction = None;
        while inner.evictions_in_flight > 0 {
            SpinLockGuard::unlocked(&mut inner, core::hint::spin_loop);
        }
    }

    /// Install a stats callback; it is invoked once right away.
    pub fn register_update_stats_cb(&self, callback: StatsCallback) {
        let mut inner = self.inner.lock();
        callback(inner.stats.num_free_frames);
        inner.stats_cb = Some(callback);
    }

    pub fn unregister_update_stats_cb(&self) {
        self.inner.lock().stats_cb = None;
    }

    /// Free-frame percentage under which OS reclaim is skipped. Values
    /// above 100 are clamped.
    pub fn set_reclaim_skip_threshold(&self, percent: u32) {
        let clamped = percent.min(MAX_RECLAIM_SKIP_THRESHOLD);
        if clamped != percent {
            warn!("reclaim skip threshold {percent}% clamped to {clamped}%");
        }
        self.inner.lock().reclaim_skip_threshold = clamped;
    }

    #[must_use]
    pub fn reclaim_skip_threshold(&self) -> u32 {
        self.inner.lock().reclaim_skip_threshold
    }

    /// Report the configuration bits selected by `mask`.
    #[must_use]
    pub fn query_configs(&self, mask: QueryConfig) -> QueryConfig {
        let scrub_valid = self.scrubber.read().is_some();
        let onlined = self.is_numa_onlined();
        let all = QueryConfig::new()
            .with_scrub_enabled(self.init_flags.scrub_on_free())
            .with_scrub_valid(scrub_valid)
            .with_numa_enabled(self.init_flags.numa())
            .with_numa_onlined(onlined);
        QueryConfig::from_bits(all.into_bits() & mask.into_bits())
    }

    #[must_use]
    pub fn stats(&self) -> PmaStats {
        self.inner.lock().stats
    }

    /// Free bytes. Asks the OS while the node is online.
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.node.onlined {
            let node = inner.node.node_id;
            drop(inner);
            return self.page_source.numa_memory_usage(node).0;
        }
        inner.stats.num_free_frames << PMA_PAGE_SHIFT
    }

    /// Total bytes. Asks the OS while the node is online.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        let inner = self.inner.lock();
        if inner.node.onlined {
            let node = inner.node.node_id;
            drop(inner);
            return self.page_source.numa_memory_usage(node).1;
        }
        inner.regions.iter().map(|r| r.desc.size()).sum()
    }

    #[must_use]
    pub fn free_protected_memory(&self) -> u64 {
        self.inner.lock().stats.num_free_frames_protected << PMA_PAGE_SHIFT
    }

    #[must_use]
    pub fn free_unprotected_memory(&self) -> u64 {
        let stats = self.inner.lock().stats;
        (stats.num_free_frames - stats.num_free_frames_protected) << PMA_PAGE_SHIFT
    }

    #[must_use]
    pub fn total_protected_memory(&self) -> u64 {
        self.region_bytes(true)
    }

    #[must_use]
    pub fn total_unprotected_memory(&self) -> u64 {
        self.region_bytes(false)
    }

    fn region_bytes(&self, protected: bool) -> u64 {
        self.inner
            .lock()
            .regions
            .iter()
            .filter(|r| r.desc.is_protected == protected)
            .map(|r| r.desc.size())
            .sum()
    }

    #[must_use]
    pub fn region_info(&self) -> Vec<RegionDescriptor> {
        self.inner.lock().regions.iter().map(|r| r.desc).collect()
    }

    #[must_use]
    pub fn is_eviction_pending(&self) -> bool {
        self.inner.lock().evictions_in_flight > 0
    }

    /// Coalesced ranges of allocated frames.
    #[must_use]
    pub fn allocated_blocks(&self) -> Vec<MemoryRange> {
        self.blocks(|s| !s.is_free())
    }

    /// Coalesced ranges of allocated persistent frames.
    #[must_use]
    pub fn persistent_blocks(&self) -> Vec<MemoryRange> {
        self.blocks(|s| !s.is_free() && s.persistent())
    }

    fn blocks(&self, pred: impl Fn(PageStatus) -> bool) -> Vec<MemoryRange> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for region in &inner.regions {
            region.runs(&pred, &mut out);
        }
        out
    }

    /// Largest run of frames the allocator does not track, across all
    /// regions. `None` when every frame is tracked.
    #[must_use]
    pub fn largest_free(&self) -> Option<MemoryRange> {
        let inner = self.inner.lock();
        let largest = inner
            .regions
            .iter()
            .filter_map(RegionMap::largest_free)
            .max_by_key(|r| r.size);
        if let Some(r) = largest {
            debug!("largest free run {:#x}+{:#x}", r.start, r.size);
        }
        largest
    }

    /// Status of the frame holding `addr`, if it lies in a region.
    #[must_use]
    pub fn page_status(&self, addr: u64) -> Option<PageStatus> {
        self.inner.lock().page_status(addr)
    }

    /// Allocate `count` pages of `page_size` bytes.
    ///
    /// With [`AllocFlags::contiguous`](crate::AllocFlags::contiguous) the
    /// result is a single page covering `count * page_size` bytes.
    ///
    /// # Errors
    /// - [`PmaError::InvalidArgument`] for malformed requests.
    /// - [`PmaError::InvalidState`] if the node is offline or scrubbing is
    ///   required without a registered scrubber.
    /// - [`PmaError::NoMemory`] if neither the OS nor eviction could supply
    ///   the pages.
    /// - [`PmaError::InsufficientResources`] if the pages could not be
    ///   scrubbed.
    pub fn allocate_pages(
        &self,
        count: u64,
        page_size: u64,
        options: &AllocationOptions,
    ) -> Result<Allocation> {
        if count == 0 {
            return Err(PmaError::InvalidArgument("page count must be non-zero"));
        }
        if !SUPPORTED_PAGE_SIZES.contains(&page_size) {
            return Err(PmaError::InvalidArgument("unsupported page size"));
        }
        if count.checked_mul(page_size).is_none() {
            return Err(PmaError::InvalidArgument("allocation size overflows"));
        }
        if !self.init_flags.numa() {
            return Err(PmaError::InvalidArgument("allocator is not NUMA enabled"));
        }
        if options.flags.reverse() {
            return Err(PmaError::InvalidArgument("reverse allocation unsupported on NUMA"));
        }
        if options.flags.specify_address_range() && options.phys_begin > options.phys_end {
            return Err(PmaError::InvalidArgument("address range is inverted"));
        }
        let count = usize::try_from(count)
            .map_err(|_| PmaError::InvalidArgument("page count too large"))?;

        self.numa_allocate(count, page_size, options)
    }

    /// Return pages of `size` bytes each to the OS.
    ///
    /// Freeing frames that are already free is a no-op. Frames under
    /// eviction are left to the eviction path.
    ///
    /// # Errors
    /// [`PmaError::InvalidArgument`] if the allocator is not NUMA enabled or
    /// `size` is zero.
    pub fn free_pages(&self, pages: &[u64], size: u64) -> Result<()> {
        if !self.init_flags.numa() {
            return Err(PmaError::InvalidArgument("allocator is not NUMA enabled"));
        }
        if size == 0 {
            return Err(PmaError::InvalidArgument("page size must be non-zero"));
        }
        let mut inner = self.inner.lock();
        self.numa_free_internal(&mut inner, pages, size, FreeOrigin::Client);
        Ok(())
    }

    /// Make allocated pages non-evictable.
    ///
    /// # Errors
    /// - [`PmaError::ObjectNotFound`] for a page outside every region.
    /// - [`PmaError::InvalidArgument`] for a page that is not allocated or
    ///   crosses a region boundary.
    /// - [`PmaError::InvalidState`] for a page under eviction.
    pub fn pin_pages(&self, pages: &[u64], page_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        for &page in pages {
            let (region, first, count) = inner.page_frames(page, page_size)?;
            for frame in first..first + count {
                let s = inner.frame_status(region, frame);
                if s.is_free() {
                    return Err(PmaError::InvalidArgument("pinning a page that is not allocated"));
                }
                if s.evicting() {
                    return Err(PmaError::InvalidState("page is being evicted"));
                }
            }
        }
        inner.set_state(pages, page_size, FrameState::Pin);
        Ok(())
    }

    /// Make allocated pages evictable again.
    ///
    /// # Errors
    /// Same as [`Self::pin_pages`], except that pages under eviction are
    /// accepted.
    pub fn unpin_pages(&self, pages: &[u64], page_size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        for &page in pages {
            let (region, first, count) = inner.page_frames(page, page_size)?;
            if (first..first + count).any(|f| inner.frame_status(region, f).is_free()) {
                return Err(PmaError::InvalidArgument("unpinning a page that is not allocated"));
            }
        }
        inner.set_state(pages, page_size, FrameState::Unpin);
        Ok(())
    }

    /// Drop one OS reference on the frame at `gpa`.
    pub(crate) fn release_frame(&self, inner: &PmaInner, gpa: u64) {
        let os_pages = (PMA_PAGE_SIZE >> self.page_source.page_shift()).max(1);
        self.page_source
            .release_page(inner.node.coherent_base + gpa, os_pages);
    }
}

impl Drop for Pma {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.node.onlined {
            warn!(
                "allocator for NUMA node {} dropped while onlined",
                inner.node.node_id
            );
        }
    }
}

impl PmaInner {
    pub(crate) fn locate(&self, addr: u64) -> Option<usize> {
        self.regions.iter().position(|r| r.desc.contains(addr))
    }

    pub(crate) fn page_status(&self, addr: u64) -> Option<PageStatus> {
        let region = self.locate(addr)?;
        let desc = self.regions[region].desc;
        Some(self.frame_status(region, desc.frame_of(addr)))
    }

    /// Region and frame span covered by the page at `addr`.
    pub(crate) fn page_frames(&self, addr: u64, size: u64) -> Result<(usize, u64, u64)> {
        let region = self
            .locate(addr)
            .ok_or(PmaError::ObjectNotFound)?;
        let desc = self.regions[region].desc;
        if !desc.contains_span(addr, size.max(PMA_PAGE_SIZE)) {
            return Err(PmaError::InvalidArgument("page crosses a region boundary"));
        }
        Ok((region, desc.frame_of(addr), (size >> PMA_PAGE_SHIFT).max(1)))
    }

    pub(crate) fn frame_status(&self, region: usize, frame: u64) -> PageStatus {
        self.regions[region].read(frame)
    }

    pub(crate) fn set_frame_status(&mut self, region: usize, frame: u64, status: PageStatus) {
        let map = &mut self.regions[region];
        let protected = map.desc.is_protected;
        let old = map.write(frame, status);
        if old.is_free() != status.is_free() {
            self.stats.frame_transition(protected, old.is_free());
        }
    }

    pub(crate) fn update_span(
        &mut self,
        region: usize,
        first: u64,
        count: u64,
        f: impl Fn(PageStatus) -> PageStatus,
    ) {
        for frame in first..first + count {
            let s = self.frame_status(region, frame);
            self.set_frame_status(region, frame, f(s));
        }
    }

    /// Apply `f` to every frame of the page at `addr`.
    pub(crate) fn update_page(&mut self, addr: u64, size: u64, f: impl Fn(PageStatus) -> PageStatus) {
        let Some(region) = self.locate(addr) else {
            warn!("no region holds page {addr:#x}");
            return;
        };
        let desc = self.regions[region].desc;
        let first = desc.frame_of(addr);
        let count = (size >> PMA_PAGE_SHIFT)
            .max(1)
            .min(desc.frame_count() - first);
        self.update_span(region, first, count, f);
    }

    fn set_state(&mut self, pages: &[u64], page_size: u64, state: FrameState) {
        for &page in pages {
            self.update_page(page, page_size, |s| s.with_state(state));
        }
    }

    /// Hand freshly obtained pages to their new owner.
    ///
    /// `pages[reserved_from..]` came out of eviction and still carry this
    /// call's EVICTING marks, which are cleared here. Fails with
    /// [`PmaError::NoMemory`] if any other frame is being evicted.
    pub(crate) fn commit(
        &mut self,
        pages: &[u64],
        reserved_from: usize,
        size: u64,
        state: FrameState,
        persistent: bool,
    ) -> Result<()> {
        for (i, &page) in pages.iter().enumerate() {
            let (region, first, count) = self.page_frames(page, size)?;
            if i < reserved_from
                && (first..first + count).any(|f| self.frame_status(region, f).evicting())
            {
                warn!("allocated page {page:#x} is being evicted");
                return Err(PmaError::NoMemory);
            }
        }
        for &page in pages {
            self.update_page(page, size, |s| {
                s.allocated(state, persistent).with_evicting(false)
            });
        }
        debug!("committed {} pages of {size:#x} as {state:?}", pages.len());
        Ok(())
    }

    pub(crate) fn notify_stats(&self) {
        if let Some(cb) = &self.stats_cb {
            cb(self.stats.num_free_frames);
        }
    }

    /// Whether free frames dropped below the reclaim-skip threshold.
    pub(crate) fn should_skip_reclaim(&self) -> bool {
        let free = u128::from(self.stats.num_free_frames);
        let total = u128::from(self.stats.num_2mb_pages) * u128::from(FRAMES_PER_2MB);
        100 * free < total * u128::from(self.reclaim_skip_threshold)
    }

    /// Region ids eligible for `options`, best candidates first.
    pub(crate) fn select_regions(&self, options: &AllocationOptions) -> Result<Vec<usize>> {
        let flags = options.flags;
        let mut ids: Vec<usize> = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                let d = &r.desc;
                d.is_protected == flags.protected_region()
                    && (!flags.specify_address_range()
                        || (d.base <= options.phys_end && d.limit >= options.phys_begin))
            })
            .map(|(i, _)| i)
            .collect();

        if flags.prefer_slowest() {
            ids.sort_by_key(|&i| self.regions[i].desc.performance);
        } else {
            ids.sort_by_key(|&i| core::cmp::Reverse(self.regions[i].desc.performance));
        }

        if ids.is_empty() {
            debug!("no region matches the request");
            return Err(PmaError::NoMemory);
        }
        Ok(ids)
    }

    /// Snapshot used to validate OS pages while the lock is dropped.
    pub(crate) fn translator(&self, regions: &[usize], options: &AllocationOptions) -> Translator {
        let restrict = options.flags.specify_address_range();
        let spans = regions
            .iter()
            .map(|&i| self.regions[i].desc)
            .filter_map(|d| {
                if restrict {
                    let lo = d.base.max(options.phys_begin);
                    let hi = d.limit.min(options.phys_end);
                    (lo <= hi).then_some((lo, hi))
                } else {
                    Some((d.base, d.limit))
                }
            })
            .collect();
        Translator::new(self.node.coherent_base, self.node.coherent_size, spans)
    }

    pub(crate) fn has_evictable_frame(&self, regions: &[usize]) -> bool {
        regions.iter().any(|&i| self.regions[i].has_evictable_frame())
    }

    /// First selected region holding an evictable run of `size` bytes.
    pub(crate) fn find_evictable_range(
        &self,
        regions: &[usize],
        size: u64,
        align: u64,
    ) -> Option<(usize, u64)> {
        regions.iter().find_map(|&i| {
            self.regions[i]
                .find_evictable_range(size, align)
                .map(|start| (i, start))
        })
    }
}
