//! Cooperative eviction through the registered [`EvictionCallbacks`].
//!
//! Both entry points mark frames EVICTING before the allocator spinlock is
//! released. While the marks are set, frees of those frames are deferred by
//! [`PageStatus::on_free`](crate::PageStatus::on_free) and no other eviction
//! picks them. Frames that end up with the new owner keep the mark until
//! [`PmaInner::commit`](crate::pma::PmaInner::commit) clears it.

use crate::collab::EvictionCallbacks;
use crate::error::{PmaError, Result};
use crate::pma::InnerGuard;
use crate::status::{FrameState, PageStatus};
use crate::Pma;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::SpinLockGuard;
use log::{debug, warn};

fn callbacks(inner: &InnerGuard<'_>) -> Result<Arc<dyn EvictionCallbacks>> {
    inner.eviction.clone().ok_or_else(|| {
        debug!("eviction requested without registered callbacks");
        PmaError::NoMemory
    })
}

impl Pma {
    /// Ask the client to vacate `[start, end]` inside `region`.
    ///
    /// The client frees the span through [`Pma::free_pages`]; those frees
    /// only tag the frames NUMA_REUSE. If the client fails, the tagged
    /// frames go back to the OS here. On success the span stays marked
    /// EVICTING for the caller to commit.
    pub(crate) fn evict_contiguous(
        &self,
        inner: &mut InnerGuard<'_>,
        region: usize,
        start: u64,
        end: u64,
    ) -> Result<()> {
        let callbacks = callbacks(inner)?;
        let desc = inner.regions[region].desc;
        let first = desc.frame_of(start);
        let count = desc.frame_of(end) - first + 1;

        inner.update_span(region, first, count, |s| s.with_evicting(true));
        inner.evictions_in_flight += 1;
        debug!("evicting {start:#x}..={end:#x} ({count} frames)");

        let status = SpinLockGuard::unlocked(inner, || {
            callbacks.evict_range(start, end, desc.protection())
        });

        inner.evictions_in_flight -= 1;
        if let Err(e) = status {
            let mut released = 0u64;
            for frame in first..first + count {
                let s = inner.frame_status(region, frame);
                if s.numa_reuse() {
                    self.release_frame(inner, desc.addr_of(frame));
                    inner.set_frame_status(region, frame, PageStatus::FREE);
                    released += 1;
                } else {
                    inner.set_frame_status(region, frame, s.with_evicting(false));
                }
            }
            warn!("eviction of {start:#x}..={end:#x} failed ({e}); released {released} reused frames");
        }
        status
    }

    /// Ask the client for `pages.len() - already` pages of `page_size`
    /// from `[bounds.0, bounds.1]` inside `region`.
    ///
    /// The client writes the base address of every page it gives up into
    /// the unfilled tail of `pages`. Ownership moves with the address: the
    /// client must not free those pages itself. Each page must be aligned,
    /// inside `bounds`, listed once and fully Unpin; accepted pages stay
    /// marked EVICTING for the caller to commit.
    pub(crate) fn evict_pages(
        &self,
        inner: &mut InnerGuard<'_>,
        region: usize,
        pages: &mut [u64],
        already: usize,
        page_size: u64,
        bounds: (u64, u64),
    ) -> Result<()> {
        let callbacks = callbacks(inner)?;
        let protection = inner.regions[region].desc.protection();
        let (held, wanted) = pages.split_at_mut(already);

        for &page in held.iter() {
            inner.update_page(page, page_size, |s| s.with_evicting(true));
        }
        inner.evictions_in_flight += 1;
        debug!(
            "evicting {} pages of {page_size:#x} from {:#x}..={:#x}",
            wanted.len(),
            bounds.0,
            bounds.1
        );

        let status = SpinLockGuard::unlocked(inner, || {
            callbacks.evict_pages(page_size, wanted, bounds.0, bounds.1, protection)
        });

        for &page in held.iter() {
            inner.update_page(page, page_size, |s| s.with_evicting(false));
        }
        inner.evictions_in_flight -= 1;
        status?;

        validate_evicted(inner, wanted, page_size, bounds)?;
        for &page in wanted.iter() {
            inner.update_page(page, page_size, |s| {
                s.with_evicting(true).with_numa_reuse(false)
            });
        }
        Ok(())
    }
}

/// Check the pages a client handed over before taking them.
fn validate_evicted(
    inner: &InnerGuard<'_>,
    pages: &[u64],
    page_size: u64,
    bounds: (u64, u64),
) -> Result<()> {
    for &page in pages {
        let in_bounds = page >= bounds.0
            && page
                .checked_add(page_size - 1)
                .is_some_and(|last| last <= bounds.1);
        if !in_bounds {
            warn!("client evicted {page:#x}, outside {:#x}..={:#x}", bounds.0, bounds.1);
            return Err(PmaError::InvalidState("evicted page outside the requested range"));
        }
        if !page.is_multiple_of(page_size) {
            warn!("client evicted {page:#x}, not aligned to {page_size:#x}");
            return Err(PmaError::InvalidState("evicted page is misaligned"));
        }
        let (region, first, count) = inner.page_frames(page, page_size)?;
        let evictable = (first..first + count).all(|f| {
            let s = inner.frame_status(region, f);
            s.state() == FrameState::Unpin && !s.evicting()
        });
        if !evictable {
            warn!("client evicted {page:#x}, which is not an unpinned allocation");
            return Err(PmaError::InvalidState("evicted page is not evictable"));
        }
    }

    let mut sorted: Vec<u64> = pages.to_vec();
    sorted.sort_unstable();
    if let Some(w) = sorted.windows(2).find(|w| w[0] == w[1]) {
        warn!("client evicted {:#x} more than once", w[0]);
        return Err(PmaError::InvalidState("evicted page listed twice"));
    }
    Ok(())
}
