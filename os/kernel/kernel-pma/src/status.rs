use bitfield_struct::bitfield;

/// Ownership state of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameState {
    /// Owned by the OS; not tracked.
    Free = 0,
    /// Allocated and evictable.
    Unpin = 1,
    /// Allocated and never evicted.
    Pin = 2,
}

impl FrameState {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_bits(value: u8) -> Self {
        match value {
            1 => Self::Unpin,
            2 => Self::Pin,
            _ => Self::Free,
        }
    }
}

/// Per-frame state word.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct PageStatus {
    #[bits(2, default = FrameState::Free)]
    pub state: FrameState,
    pub persistent: bool,
    /// Reserved by an eviction that is still running.
    pub evicting: bool,
    /// Freed by its owner while being evicted.
    pub numa_reuse: bool,

    #[bits(3, default = 0)]
    _reserved: u8,
}

/// What the free path must do with a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeAction {
    /// Hand the frame back to the OS.
    Release,
    /// Mid-eviction unpinned frame; remember it for reuse.
    DeferReuse,
    /// Mid-eviction frame; leave it alone.
    Defer,
    /// Nothing allocated here.
    AlreadyFree,
}

impl PageStatus {
    /// Status of a frame the allocator does not track.
    pub const FREE: Self = Self::new();

    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self.state(), FrameState::Free)
    }

    /// Whether the status carries anything worth storing.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        self.into_bits() != Self::FREE.into_bits()
    }

    #[must_use]
    pub const fn is_evictable(self) -> bool {
        matches!(self.state(), FrameState::Unpin) && !self.evicting()
    }

    /// Status after handing the frame to a new owner.
    #[must_use]
    pub const fn allocated(self, state: FrameState, persistent: bool) -> Self {
        self.with_state(state)
            .with_persistent(persistent)
            .with_numa_reuse(false)
    }

    /// Free transition: the new status and what to do with the frame.
    #[must_use]
    pub const fn on_free(self) -> (Self, FreeAction) {
        if self.evicting() {
            if matches!(self.state(), FrameState::Unpin) {
                (self.with_numa_reuse(true), FreeAction::DeferReuse)
            } else {
                (self, FreeAction::Defer)
            }
        } else if self.is_free() {
            (self, FreeAction::AlreadyFree)
        } else {
            (Self::FREE, FreeAction::Release)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let s = PageStatus::new()
            .with_state(FrameState::Pin)
            .with_evicting(true)
            .with_numa_reuse(true);
        assert_eq!(s.into_bits(), 0b1_1010);
        assert_eq!(PageStatus::from_bits(0b0101).state(), FrameState::Unpin);
        assert!(PageStatus::from_bits(0b0101).persistent());
        assert!(!PageStatus::FREE.is_tracked());
        assert!(PageStatus::FREE.with_evicting(true).is_tracked());
    }

    #[test]
    fn allocated_keeps_evicting_and_drops_reuse() {
        let s = PageStatus::new()
            .with_evicting(true)
            .with_numa_reuse(true)
            .allocated(FrameState::Unpin, true);
        assert_eq!(s.state(), FrameState::Unpin);
        assert!(s.persistent());
        assert!(s.evicting());
        assert!(!s.numa_reuse());
    }

    #[test]
    fn free_transitions() {
        let pinned = PageStatus::new().allocated(FrameState::Pin, true);
        assert_eq!(pinned.on_free(), (PageStatus::FREE, FreeAction::Release));

        let evicting_unpin = PageStatus::new()
            .with_state(FrameState::Unpin)
            .with_evicting(true);
        let (next, action) = evicting_unpin.on_free();
        assert_eq!(action, FreeAction::DeferReuse);
        assert!(next.numa_reuse() && next.evicting());
        assert_eq!(next.state(), FrameState::Unpin);

        let evicting_pin = PageStatus::new()
            .with_state(FrameState::Pin)
            .with_evicting(true);
        assert_eq!(evicting_pin.on_free(), (evicting_pin, FreeAction::Defer));

        assert_eq!(
            PageStatus::FREE.on_free(),
            (PageStatus::FREE, FreeAction::AlreadyFree)
        );
    }

    #[test]
    fn evictable_means_unpinned_and_idle() {
        let unpin = PageStatus::new().with_state(FrameState::Unpin);
        assert!(unpin.is_evictable());
        assert!(!unpin.with_evicting(true).is_evictable());
        assert!(!unpin.with_state(FrameState::Pin).is_evictable());
        assert!(!PageStatus::FREE.is_evictable());
    }
}
