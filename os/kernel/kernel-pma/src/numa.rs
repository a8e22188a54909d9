//! Allocation engine for a kernel-managed NUMA node.
//!
//! Pages come from the OS first. When the OS cannot deliver, unpinned
//! frames are reclaimed from the eviction client. Every call into the OS,
//! the scrubber or the eviction client happens with the allocator spinlock
//! released; state needed afterwards is either snapshotted before the
//! release or re-read after it.

use crate::collab::Scrubber;
use crate::consts::{MAX_NUMA_CONTIGUOUS, PMA_PAGE_SHIFT};
use crate::error::{PmaError, Result};
use crate::flags::{Allocation, AllocationOptions, OsAllocFlags};
use crate::pma::{InnerGuard, PmaInner};
use crate::scrub::scrub_pages;
use crate::status::{FrameState, FreeAction};
use crate::Pma;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::SpinLockGuard;
use log::{debug, info, warn};

/// Outcome of one engine pass: how many leading slots hold pages, and
/// whether the pass met its target.
///
/// Slots from `reserved_from` up to `allocated` were taken from the eviction
/// client and stay marked EVICTING until they are committed or rolled back.
#[derive(Debug)]
pub(crate) struct Attempt {
    pub(crate) allocated: usize,
    pub(crate) reserved_from: usize,
    pub(crate) status: Result<()>,
}

impl Attempt {
    const fn nothing() -> Self {
        Self::from_os(0, Err(PmaError::NoMemory))
    }

    const fn from_os(allocated: usize, status: Result<()>) -> Self {
        Self {
            allocated,
            reserved_from: allocated,
            status,
        }
    }
}

/// Who is returning pages to [`Pma::numa_free_internal`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FreeOrigin {
    /// An owner freeing its allocation. Free frames are skipped.
    Client,
    /// Unwinding a failed allocation. Pages obtained from the OS were never
    /// marked, so Free frames are released as well.
    Rollback,
}

/// Maps system physical addresses from the OS to region addresses.
#[derive(Debug, Clone)]
pub(crate) struct Translator {
    coherent_base: u64,
    coherent_size: u64,
    /// Inclusive bounds a translated page must fit in.
    spans: Vec<(u64, u64)>,
}

impl Translator {
    pub(crate) const fn new(coherent_base: u64, coherent_size: u64, spans: Vec<(u64, u64)>) -> Self {
        Self {
            coherent_base,
            coherent_size,
            spans,
        }
    }

    pub(crate) fn translate(&self, sys: u64, size: u64) -> Result<u64> {
        let inside_window = match (
            self.coherent_base.checked_add(self.coherent_size),
            sys.checked_add(size),
        ) {
            (Some(window_end), Some(end)) => sys >= self.coherent_base && end <= window_end,
            _ => false,
        };
        if !inside_window || size == 0 {
            return Err(PmaError::InvalidArgument("address outside the coherent window"));
        }

        let gpa = sys - self.coherent_base;
        let last = gpa + (size - 1);
        if self.spans.iter().any(|&(lo, hi)| gpa >= lo && last <= hi) {
            Ok(gpa)
        } else {
            Err(PmaError::InvalidArgument("address outside the selected regions"))
        }
    }
}

/// Parameters shared by the engine passes of one allocation.
struct Request<'a> {
    node: u32,
    page_size: u64,
    allow_evict: bool,
    scrubber: Option<&'a dyn Scrubber>,
    regions: &'a [usize],
    /// Inclusive address restriction from the caller.
    range: Option<(u64, u64)>,
    translator: Translator,
}

impl Request<'_> {
    fn scrub(&self, page_size: u64, pages: &[u64]) -> Result<()> {
        self.scrubber
            .map_or(Ok(()), |s| scrub_pages(s, page_size, pages))
    }

    /// Scrub with the allocator lock released. Without a scrubber the lock
    /// is kept.
    fn scrub_unlocked(
        &self,
        inner: &mut InnerGuard<'_>,
        page_size: u64,
        pages: &[u64],
    ) -> Result<()> {
        if self.scrubber.is_none() {
            return Ok(());
        }
        SpinLockGuard::unlocked(inner, || self.scrub(page_size, pages))
    }
}

impl Pma {
    pub(crate) fn numa_allocate(
        &self,
        count: usize,
        page_size: u64,
        options: &AllocationOptions,
    ) -> Result<Allocation> {
        let flags = options.flags;
        let contiguous = flags.contiguous();
        let unit_size = if contiguous {
            u64::try_from(count)
                .ok()
                .and_then(|c| c.checked_mul(page_size))
                .filter(|&size| size <= MAX_NUMA_CONTIGUOUS)
                .ok_or(PmaError::InvalidArgument("contiguous allocation exceeds 4 GiB"))?
        } else {
            page_size
        };

        let scrub_on_free = self.init_flags().scrub_on_free();
        let scrub_on_alloc = scrub_on_free && !flags.no_zero();

        let _alloc_guard = scrub_on_free.then(|| self.alloc_lock.lock());
        let scrubber_guard = scrub_on_free.then(|| self.scrubber.read());
        let scrubber: Option<Arc<dyn Scrubber>> = match scrubber_guard.as_deref() {
            Some(None) => return Err(PmaError::InvalidState("scrubber is not registered")),
            Some(Some(s)) if scrub_on_alloc => Some(Arc::clone(s)),
            _ => None,
        };

        let mut inner = self.inner.lock();
        if !inner.node.onlined {
            return Err(PmaError::InvalidState("NUMA node is not onlined"));
        }
        let regions = inner.select_regions(options)?;
        if !contiguous {
            let capacity: u64 = regions
                .iter()
                .map(|&i| inner.regions[i].desc.size() / page_size)
                .sum();
            if !u64::try_from(count).is_ok_and(|c| c <= capacity) {
                return Err(PmaError::InvalidArgument(
                    "more pages than the selected regions hold",
                ));
            }
        }
        let req = Request {
            node: inner.node.node_id,
            page_size,
            allow_evict: !flags.dont_evict(),
            scrubber: scrubber.as_deref(),
            regions: &regions,
            range: flags
                .specify_address_range()
                .then_some((options.phys_begin, options.phys_end)),
            translator: inner.translator(&regions, options),
        };

        let mut pages = vec![0u64; if contiguous { 1 } else { count }];
        let attempt = if contiguous {
            self.numa_allocate_range(&mut inner, &req, unit_size, &mut pages)
        } else {
            self.numa_allocate_pages(&mut inner, &req, &mut pages)
        };

        let mut status = attempt.status;
        if status == Err(PmaError::NoMemory) && flags.allow_partial() && attempt.allocated > 0 {
            info!(
                "partial allocation: {} of {} pages of {page_size:#x}",
                attempt.allocated,
                pages.len()
            );
            status = Ok(());
        }

        let obtained = &pages[..attempt.allocated];
        let state = if flags.pinned() {
            FrameState::Pin
        } else {
            FrameState::Unpin
        };
        let persistent = flags.persistent() || self.init_flags().force_persistence();
        let status = status.and_then(|()| {
            inner.commit(obtained, attempt.reserved_from, unit_size, state, persistent)
        });

        if let Err(e) = status {
            warn!(
                "allocating {count} x {page_size:#x} failed ({e}); rolling back {} pages",
                obtained.len()
            );
            for &page in &obtained[attempt.reserved_from..] {
                inner.update_page(page, unit_size, |s| s.with_evicting(false));
            }
            self.numa_free_internal(&mut inner, obtained, unit_size, FreeOrigin::Rollback);
            return Err(e);
        }

        inner.notify_stats();
        drop(inner);

        pages.truncate(attempt.allocated);
        debug!("allocated {} pages of {unit_size:#x}", pages.len());
        Ok(Allocation {
            pages,
            unit_size,
            is_zero: scrub_on_alloc,
        })
    }

    /// Contiguous pass: one OS allocation of `actual_size`, falling back to
    /// evicting an equally sized run. Fills at most `pages[0]`.
    fn numa_allocate_range(
        &self,
        inner: &mut InnerGuard<'_>,
        req: &Request<'_>,
        actual_size: u64,
        pages: &mut [u64],
    ) -> Attempt {
        let source = &*self.page_source;
        let os_shift = source.page_shift();
        let os_pages = (actual_size >> os_shift).max(1);
        let flags = OsAllocFlags::new().with_skip_reclaim(inner.should_skip_reclaim());

        let from_os = SpinLockGuard::unlocked(inner, || {
            let sys = match source.alloc_pages_node(req.node, actual_size, flags) {
                Ok(sys) => sys,
                Err(e) => {
                    debug!("OS could not supply {actual_size:#x} contiguous bytes: {e}");
                    return None;
                }
            };
            if os_pages > 1 {
                source.acquire_page(sys + (1 << os_shift), os_pages - 1);
            }
            match req.translator.translate(sys, actual_size) {
                Ok(gpa) => Some((gpa, req.scrub(actual_size, &[gpa]))),
                Err(e) => {
                    warn!("dropping OS allocation at {sys:#x}: {e}");
                    source.release_page(sys, os_pages);
                    None
                }
            }
        });

        if let Some((gpa, scrubbed)) = from_os {
            pages[0] = gpa;
            return Attempt::from_os(1, scrubbed);
        }

        if !req.allow_evict {
            return Attempt::nothing();
        }
        let Some((region, start)) =
            inner.find_evictable_range(req.regions, actual_size, req.page_size)
        else {
            debug!("no evictable run of {actual_size:#x} bytes");
            return Attempt::nothing();
        };

        if let Err(e) = self.evict_contiguous(inner, region, start, start + actual_size - 1) {
            return Attempt::from_os(0, Err(e));
        }
        pages[0] = start;
        let status = req.scrub_unlocked(inner, actual_size, &pages[..1]);
        Attempt {
            allocated: 1,
            reserved_from: 0,
            status,
        }
    }

    /// Discontiguous pass: pages one at a time from the OS, then the
    /// remainder from eviction.
    fn numa_allocate_pages(
        &self,
        inner: &mut InnerGuard<'_>,
        req: &Request<'_>,
        pages: &mut [u64],
    ) -> Attempt {
        let count = pages.len();
        let page_size = req.page_size;
        let source = &*self.page_source;
        let os_shift = source.page_shift();
        let os_pages = (page_size >> os_shift).max(1);
        let flags = OsAllocFlags::new().with_skip_reclaim(inner.should_skip_reclaim());

        let (obtained, scrubbed) = SpinLockGuard::unlocked(inner, || {
            let mut i = 0;
            while i < count {
                let sys = match source.alloc_pages_node(req.node, page_size, flags) {
                    Ok(sys) => sys,
                    Err(e) => {
                        debug!("OS supplied {i} of {count} pages: {e}");
                        break;
                    }
                };
                if os_pages > 1 {
                    source.acquire_page(sys + (1 << os_shift), os_pages - 1);
                }
                match req.translator.translate(sys, page_size) {
                    Ok(gpa) => {
                        pages[i] = gpa;
                        i += 1;
                    }
                    Err(e) => {
                        warn!("dropping OS page at {sys:#x}: {e}");
                        source.release_page(sys, os_pages);
                        break;
                    }
                }
            }
            let scrubbed = if i > 0 {
                req.scrub(page_size, &pages[..i])
            } else {
                Ok(())
            };
            (i, scrubbed)
        });

        if let Err(e) = scrubbed {
            return Attempt::from_os(obtained, Err(e));
        }
        if obtained == count {
            return Attempt::from_os(count, Ok(()));
        }

        let shortfall = Attempt::from_os(obtained, Err(PmaError::NoMemory));
        if !req.allow_evict || !inner.has_evictable_frame(req.regions) {
            return shortfall;
        }

        let mut status = Err(PmaError::NoMemory);
        for &region in req.regions {
            let desc = inner.regions[region].desc;
            let bounds = match req.range {
                Some((begin, end)) => (desc.base.max(begin), desc.limit.min(end)),
                None => (desc.base, desc.limit),
            };
            if bounds.0 > bounds.1 {
                continue;
            }
            status = self.evict_pages(inner, region, pages, obtained, page_size, bounds);
            if status != Err(PmaError::NoMemory) {
                break;
            }
        }
        if let Err(e) = status {
            return Attempt::from_os(obtained, Err(e));
        }

        let status = req.scrub_unlocked(inner, page_size, &pages[obtained..]);
        Attempt {
            allocated: count,
            reserved_from: obtained,
            status,
        }
    }

    /// Return every frame of `pages` (each `size` bytes) to the OS, except
    /// frames an eviction currently owns.
    pub(crate) fn numa_free_internal(
        &self,
        inner: &mut PmaInner,
        pages: &[u64],
        size: u64,
        origin: FreeOrigin,
    ) {
        let frames_per_page = (size >> PMA_PAGE_SHIFT).max(1);
        for &page in pages {
            let Some(region) = inner.locate(page) else {
                warn!("freeing {page:#x}, which lies outside every region");
                continue;
            };
            let desc = inner.regions[region].desc;
            let first = desc.frame_of(page);
            let last = (first + frames_per_page).min(desc.frame_count());

            for frame in first..last {
                let addr = desc.addr_of(frame);
                let (next, action) = inner.frame_status(region, frame).on_free();
                match action {
                    FreeAction::Release => {
                        self.release_frame(inner, addr);
                        inner.set_frame_status(region, frame, next);
                    }
                    FreeAction::DeferReuse => {
                        debug!("frame {addr:#x} freed during eviction, kept for reuse");
                        inner.set_frame_status(region, frame, next);
                    }
                    FreeAction::Defer => {
                        debug!("frame {addr:#x} freed during eviction, deferred");
                    }
                    FreeAction::AlreadyFree => {
                        if origin == FreeOrigin::Rollback {
                            self.release_frame(inner, addr);
                        }
                    }
                }
            }
        }
        inner.notify_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    fn translator() -> Translator {
        // regions at [0, 1 GiB) and [2 GiB, 3 GiB), window at 64 GiB
        Translator::new(
            64 * GIB,
            4 * GIB,
            vec![(0, GIB - 1), (2 * GIB, 3 * GIB - 1)],
        )
    }

    #[test]
    fn translate_inside_region() {
        let t = translator();
        assert_eq!(t.translate(64 * GIB + 0x20_0000, 0x20_0000), Ok(0x20_0000));
        assert_eq!(t.translate(66 * GIB, 0x1_0000), Ok(2 * GIB));
    }

    #[test]
    fn translate_rejects_gaps_and_window_escapes() {
        let t = translator();
        // gap between the regions
        assert!(t.translate(64 * GIB + GIB, 0x1_0000).is_err());
        // straddles the end of the first region
        assert!(t.translate(64 * GIB + GIB - 0x1_0000, 0x2_0000).is_err());
        // below and past the window
        assert!(t.translate(63 * GIB, 0x1_0000).is_err());
        assert!(t.translate(68 * GIB, 0x1_0000).is_err());
        assert!(t.translate(u64::MAX - 10, 0x1_0000).is_err());
        assert!(t.translate(64 * GIB, 0).is_err());
    }
}
