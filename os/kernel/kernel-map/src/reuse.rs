//! Reference-counted cache of physical-to-virtual mappings.
//!
//! Entries are created by [`ReuseMappingDb::map_deferred`] and sit on a
//! pending list until [`ReuseMappingDb::commit_pending`] links them into the
//! two lookup trees. An entry is in exactly one of those places at a time.

use crate::{Map, MemoryRange, NodeId};
use alloc::vec::Vec;
use log::{debug, warn};

/// Creates and tears down the mappings the cache hands out.
pub trait MappingBackend {
    type Error;

    /// Map `phys` and return the virtual base address of the new mapping.
    fn map(&mut self, phys: MemoryRange) -> Result<u64, Self::Error>;

    fn unmap(&mut self, virt: MemoryRange);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReuseError<E> {
    #[error("no cached mapping covers the address")]
    NotFound,
    #[error("a referenced mapping already starts at this physical address")]
    Busy,
    #[error("virtual address {0:#x} is already cached")]
    DuplicateVirtual(u64),
    #[error("mapping backend failed: {0}")]
    Backend(E),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct EntryId(usize);

/// Where an entry currently lives.
#[derive(Debug, Copy, Clone)]
enum EntryLink {
    Pending { next: Option<EntryId> },
    Tracked { phys: NodeId, virt: NodeId },
}

#[derive(Debug)]
struct Entry {
    phys: MemoryRange,
    virt: MemoryRange,
    refcount: u32,
    link: EntryLink,
}

impl Entry {
    /// Virtual address of `phys` if this entry covers it.
    fn translate(&self, phys: &MemoryRange) -> Option<u64> {
        self.phys
            .contains_range(phys)
            .then(|| self.virt.start + (phys.start - self.phys.start))
    }
}

pub struct ReuseMappingDb<B: MappingBackend> {
    backend: B,
    entries: Vec<Option<Entry>>,
    free_slots: Vec<usize>,
    by_phys: Map<EntryId>,
    by_virt: Map<EntryId>,
    pending: Option<EntryId>,
}

impl<B: MappingBackend> ReuseMappingDb<B> {
    #[must_use]
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            entries: Vec::new(),
            free_slots: Vec::new(),
            by_phys: Map::new(),
            by_virt: Map::new(),
            pending: None,
        }
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of cached entries, tracked and pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.free_slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending_ids().count()
    }

    /// Get a virtual address for `phys`, reusing a cached mapping when one
    /// covers it. New mappings stay pending until [`Self::commit_pending`].
    ///
    /// # Errors
    ///
    /// [`ReuseError::Busy`] when a referenced, smaller mapping already starts
    /// at `phys.start`, [`ReuseError::Backend`] when mapping fails and
    /// [`ReuseError::DuplicateVirtual`] when the backend returns an address
    /// that is already cached.
    pub fn map_deferred(&mut self, phys: MemoryRange) -> Result<u64, ReuseError<B::Error>> {
        if let Some((id, virt)) = self.lookup_phys(&phys) {
            self.entry_mut(id).refcount += 1;
            debug!("reusing mapping {:#x} for phys {:#x}", virt, phys.start);
            return Ok(virt);
        }

        // Same physical start but too small: replace it if nobody uses it.
        if let Some(id) = self.same_phys_start(phys.start) {
            if self.entry(id).refcount > 0 {
                return Err(ReuseError::Busy);
            }
            self.evict(id);
        }

        let virt_start = self.backend.map(phys).map_err(ReuseError::Backend)?;
        let virt = MemoryRange::new(virt_start, phys.size);
        if self.by_virt.contains_key(virt_start)
            || self
                .pending_ids()
                .any(|id| self.entry(id).virt.start == virt_start)
        {
            self.backend.unmap(virt);
            return Err(ReuseError::DuplicateVirtual(virt_start));
        }

        let id = self.alloc(Entry {
            phys,
            virt,
            refcount: 1,
            link: EntryLink::Pending { next: self.pending },
        });
        self.pending = Some(id);
        Ok(virt_start)
    }

    /// Move every pending entry into the lookup trees.
    pub fn commit_pending(&mut self) -> usize {
        let mut committed = 0;
        let mut cursor = self.pending.take();
        while let Some(id) = cursor {
            let (phys, virt, next) = {
                let e = self.entry(id);
                let next = match e.link {
                    EntryLink::Pending { next } => next,
                    EntryLink::Tracked { .. } => None,
                };
                (e.phys, e.virt, next)
            };
            cursor = next;

            let Ok(phys_node) = self.by_phys.insert(phys.start, id) else {
                warn!(
                    "dropping pending mapping for {:#x}: physical start already cached",
                    phys.start
                );
                self.backend.unmap(virt);
                self.forget(id);
                continue;
            };
            let Ok(virt_node) = self.by_virt.insert(virt.start, id) else {
                warn!(
                    "dropping pending mapping for {:#x}: virtual start already cached",
                    virt.start
                );
                self.by_phys.remove(phys_node);
                self.backend.unmap(virt);
                self.forget(id);
                continue;
            };
            self.entry_mut(id).link = EntryLink::Tracked {
                phys: phys_node,
                virt: virt_node,
            };
            committed += 1;
        }
        committed
    }

    /// [`Self::map_deferred`] followed by [`Self::commit_pending`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::map_deferred`].
    pub fn map(&mut self, phys: MemoryRange) -> Result<u64, ReuseError<B::Error>> {
        let virt = self.map_deferred(phys)?;
        self.commit_pending();
        Ok(virt)
    }

    /// Drop one reference to the mapping covering `virt_addr`.
    ///
    /// The mapping stays cached for reuse; returns the remaining count.
    ///
    /// # Errors
    ///
    /// [`ReuseError::NotFound`] when no cached mapping covers `virt_addr`.
    pub fn unmap(&mut self, virt_addr: u64) -> Result<u32, ReuseError<B::Error>> {
        let id = self.lookup_virt(virt_addr).ok_or(ReuseError::NotFound)?;
        let e = self.entry_mut(id);
        if e.refcount == 0 {
            warn!("unbalanced unmap of {virt_addr:#x}");
            return Ok(0);
        }
        e.refcount -= 1;
        Ok(e.refcount)
    }

    /// Translate a physical address through committed mappings only.
    #[must_use]
    pub fn translate(&self, phys_addr: u64) -> Option<u64> {
        let id = *self.by_phys.get(self.by_phys.find_leq(phys_addr)?)?;
        let e = self.entry(id);
        e.phys
            .contains(phys_addr)
            .then(|| e.virt.start + (phys_addr - e.phys.start))
    }

    /// Tear down every cached mapping without references.
    pub fn trim(&mut self) -> usize {
        let idle: Vec<EntryId> = self
            .live_ids()
            .filter(|&id| self.entry(id).refcount == 0)
            .collect();
        for &id in &idle {
            self.evict(id);
        }
        idle.len()
    }

    /// Unmap everything and give the backend back.
    pub fn destroy(mut self) -> B {
        let all: Vec<EntryId> = self.live_ids().collect();
        for id in all {
            let e = self.entry(id);
            if e.refcount > 0 {
                warn!(
                    "destroying mapping {:#x} with {} references",
                    e.virt.start, e.refcount
                );
            }
            self.evict(id);
        }
        self.backend
    }

    /// Entry covering `phys` and the matching virtual address.
    fn lookup_phys(&self, phys: &MemoryRange) -> Option<(EntryId, u64)> {
        let tracked = self
            .by_phys
            .find_leq(phys.start)
            .and_then(|n| self.by_phys.get(n))
            .and_then(|&id| Some((id, self.entry(id).translate(phys)?)));
        tracked.or_else(|| {
            self.pending_ids()
                .find_map(|id| Some((id, self.entry(id).translate(phys)?)))
        })
    }

    fn lookup_virt(&self, virt_addr: u64) -> Option<EntryId> {
        let tracked = self
            .by_virt
            .find_leq(virt_addr)
            .and_then(|n| self.by_virt.get(n))
            .copied()
            .filter(|&id| self.entry(id).virt.contains(virt_addr));
        tracked.or_else(|| {
            self.pending_ids()
                .find(|&id| self.entry(id).virt.contains(virt_addr))
        })
    }

    fn same_phys_start(&self, start: u64) -> Option<EntryId> {
        self.by_phys.find(start).copied().or_else(|| {
            self.pending_ids()
                .find(|&id| self.entry(id).phys.start == start)
        })
    }

    fn pending_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        core::iter::successors(self.pending, |&id| match self.entry(id).link {
            EntryLink::Pending { next } => next,
            EntryLink::Tracked { .. } => None,
        })
    }

    fn live_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| EntryId(i))
    }

    /// Unlink `id` from wherever it lives, unmap it and free its slot.
    fn evict(&mut self, id: EntryId) {
        match self.entry(id).link {
            EntryLink::Tracked { phys, virt } => {
                self.by_phys.remove(phys);
                self.by_virt.remove(virt);
            }
            EntryLink::Pending { next } => {
                if self.pending == Some(id) {
                    self.pending = next;
                } else {
                    let prev = self.pending_ids().find(|&p| {
                        matches!(self.entry(p).link, EntryLink::Pending { next: Some(n) } if n == id)
                    });
                    if let Some(prev) = prev {
                        self.entry_mut(prev).link = EntryLink::Pending { next };
                    }
                }
            }
        }
        if let Some(e) = self.forget(id) {
            self.backend.unmap(e.virt);
        }
    }

    fn alloc(&mut self, entry: Entry) -> EntryId {
        if let Some(idx) = self.free_slots.pop() {
            self.entries[idx] = Some(entry);
            EntryId(idx)
        } else {
            self.entries.push(Some(entry));
            EntryId(self.entries.len() - 1)
        }
    }

    /// Free the slot without touching links or the backend.
    fn forget(&mut self, id: EntryId) -> Option<Entry> {
        let e = self.entries.get_mut(id.0)?.take()?;
        self.free_slots.push(id.0);
        Some(e)
    }

    fn entry(&self, id: EntryId) -> &Entry {
        match self.entries.get(id.0) {
            Some(Some(e)) => e,
            _ => unreachable!("dangling mapping entry {}", id.0),
        }
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut Entry {
        match self.entries.get_mut(id.0) {
            Some(Some(e)) => e,
            _ => unreachable!("dangling mapping entry {}", id.0),
        }
    }
}
