use crate::consts::{PAGE_SIZE_2M, PMA_PAGE_SHIFT, PMA_PAGE_SIZE};
use crate::status::PageStatus;
use crate::MemoryProtection;
use alloc::vec::Vec;
use kernel_map::{Map, MemoryRange};

/// A span of physical memory handed to the allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    pub base: u64,
    /// Inclusive last address.
    pub limit: u64,
    /// Higher is faster.
    pub performance: u32,
    pub is_protected: bool,
}

impl RegionDescriptor {
    #[must_use]
    pub const fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            performance: 0,
            is_protected: false,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.limit - self.base + 1
    }

    #[must_use]
    pub const fn frame_count(&self) -> u64 {
        self.size() >> PMA_PAGE_SHIFT
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.limit
    }

    /// Whether `[start, start + size)` lies inside the region.
    #[must_use]
    pub const fn contains_span(&self, start: u64, size: u64) -> bool {
        if size == 0 || start < self.base {
            return false;
        }
        match start.checked_add(size - 1) {
            Some(last) => last <= self.limit,
            None => false,
        }
    }

    #[must_use]
    pub const fn frame_of(&self, addr: u64) -> u64 {
        (addr - self.base) >> PMA_PAGE_SHIFT
    }

    #[must_use]
    pub const fn addr_of(&self, frame: u64) -> u64 {
        self.base + (frame << PMA_PAGE_SHIFT)
    }

    #[must_use]
    pub const fn protection(&self) -> MemoryProtection {
        if self.is_protected {
            MemoryProtection::Protected
        } else {
            MemoryProtection::Unprotected
        }
    }
}

/// Frame accounting, updated on every Free/allocated transition.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PmaStats {
    pub num_free_frames: u64,
    pub num_2mb_pages: u64,
    pub num_free_frames_protected: u64,
    pub num_2mb_pages_protected: u64,
}

impl PmaStats {
    pub(crate) const fn add_region(&mut self, desc: &RegionDescriptor) {
        let frames = desc.frame_count();
        let pages_2mb = desc.size() / PAGE_SIZE_2M;
        self.num_free_frames += frames;
        self.num_2mb_pages += pages_2mb;
        if desc.is_protected {
            self.num_free_frames_protected += frames;
            self.num_2mb_pages_protected += pages_2mb;
        }
    }

    /// Account for one frame leaving (`allocated`) or returning to the free
    /// pool.
    pub(crate) const fn frame_transition(&mut self, protected: bool, allocated: bool) {
        if allocated {
            self.num_free_frames -= 1;
            if protected {
                self.num_free_frames_protected -= 1;
            }
        } else {
            self.num_free_frames += 1;
            if protected {
                self.num_free_frames_protected += 1;
            }
        }
    }
}

/// Status of every frame in one region.
///
/// Only frames with a non-default status are stored; absent frames are
/// Free and belong to the OS.
pub(crate) struct RegionMap {
    pub(crate) desc: RegionDescriptor,
    frames: Map<PageStatus>,
}

impl RegionMap {
    pub(crate) const fn new(desc: RegionDescriptor) -> Self {
        Self {
            desc,
            frames: Map::new(),
        }
    }

    pub(crate) fn read(&self, frame: u64) -> PageStatus {
        self.frames.find(frame).copied().unwrap_or(PageStatus::FREE)
    }

    /// Store `status` and return the previous one.
    pub(crate) fn write(&mut self, frame: u64, status: PageStatus) -> PageStatus {
        if status.is_tracked() {
            if let Some(slot) = self.frames.find_mut(frame) {
                return core::mem::replace(slot, status);
            }
            let _ = self.frames.insert(frame, status);
            PageStatus::FREE
        } else {
            self.frames.remove_by_key(frame).unwrap_or(PageStatus::FREE)
        }
    }

    pub(crate) fn has_evictable_frame(&self) -> bool {
        self.frames.iter().any(|(_, s)| s.is_evictable())
    }

    /// Start address of the first run of evictable frames that is `size`
    /// bytes long and aligned to `align`.
    pub(crate) fn find_evictable_range(&self, size: u64, align: u64) -> Option<u64> {
        let needed = size >> PMA_PAGE_SHIFT;
        if needed == 0 || size > self.desc.size() {
            return None;
        }

        let mut run_start: Option<u64> = None;
        let mut prev = 0;
        for (frame, status) in self.frames.iter() {
            if !status.is_evictable() {
                run_start = None;
                continue;
            }
            let start = match run_start {
                Some(s) if frame == prev + 1 => s,
                _ => frame,
            };
            run_start = Some(start);
            prev = frame;

            let aligned = self.desc.addr_of(start).next_multiple_of(align);
            let aligned_frame = self.desc.frame_of(aligned);
            if aligned_frame <= frame && frame - aligned_frame + 1 >= needed {
                return Some(aligned);
            }
        }
        None
    }

    /// Coalesced address ranges of frames matching `pred`.
    pub(crate) fn runs(&self, pred: impl Fn(PageStatus) -> bool, out: &mut Vec<MemoryRange>) {
        let mut current: Option<MemoryRange> = None;
        for (frame, status) in self.frames.iter() {
            if !pred(*status) {
                continue;
            }
            let addr = self.desc.addr_of(frame);
            match current.as_mut() {
                Some(r) if r.end() == Some(addr) => r.size += PMA_PAGE_SIZE,
                _ => {
                    if let Some(done) = current.replace(MemoryRange::new(addr, PMA_PAGE_SIZE)) {
                        out.push(done);
                    }
                }
            }
        }
        out.extend(current);
    }

    /// Longest gap between tracked frames. Ties go to the lower address.
    pub(crate) fn largest_free(&self) -> Option<MemoryRange> {
        let mut best: Option<(u64, u64)> = None;
        let mut consider = |start: u64, end: u64| {
            let len = end - start;
            if len > 0 && best.is_none_or(|(_, l)| len > l) {
                best = Some((start, len));
            }
        };
        let mut next_free = 0;
        for (frame, _) in self.frames.iter() {
            consider(next_free, frame);
            next_free = frame + 1;
        }
        consider(next_free, self.desc.frame_count());
        best.map(|(start, len)| {
            MemoryRange::new(self.desc.addr_of(start), len << PMA_PAGE_SHIFT)
        })
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.frames.len()
    }
}
