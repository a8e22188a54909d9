/// A half-open span of addresses `[start, start + size)`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct MemoryRange {
    pub start: u64,
    pub size: u64,
}

impl MemoryRange {
    #[must_use]
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Build a range from an inclusive last address.
    #[must_use]
    pub const fn from_inclusive(start: u64, limit: u64) -> Option<Self> {
        if limit < start {
            return None;
        }
        match (limit - start).checked_add(1) {
            Some(size) => Some(Self { start, size }),
            None => None,
        }
    }

    /// One past the last address, or `None` if that overflows.
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.start.checked_add(self.size)
    }

    /// The last address inside the range. `None` for empty ranges.
    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        if self.size == 0 {
            return None;
        }
        self.start.checked_add(self.size - 1)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.size
    }

    /// Whether `other` lies entirely inside `self`. Empty ranges are
    /// contained when their start is.
    #[must_use]
    pub const fn contains_range(&self, other: &Self) -> bool {
        if other.start < self.start {
            return false;
        }
        let offset = other.start - self.start;
        offset <= self.size && other.size <= self.size - offset
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        if self.start <= other.start {
            other.start - self.start < self.size
        } else {
            self.start - other.start < other.size
        }
    }
}
