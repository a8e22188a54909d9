use crate::{Map, NodeId};

/// Borrowing iterator over an inclusive span of nodes.
///
/// Finite and one-shot: once it returns `None` it stays exhausted.
pub struct Range<'a, V> {
    map: &'a Map<V>,
    next: Option<NodeId>,
    last: Option<NodeId>,
}

impl<'a, V> Iterator for Range<'a, V> {
    type Item = (u64, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = if Some(cur) == self.last {
            None
        } else {
            self.map.next(cur)
        };
        self.map.entry(cur)
    }
}

/// Iterator state detached from the map it walks.
///
/// Holding a `Cursor` does not borrow the map, so values can be changed
/// through [`Map::get_mut`] between steps. Inserting or removing nodes while
/// a cursor is live is a bug; debug builds catch it in [`Cursor::advance`].
#[derive(Debug, Clone)]
pub struct Cursor {
    next: Option<NodeId>,
    last: Option<NodeId>,
    version: u64,
}

impl Cursor {
    pub fn advance<V>(&mut self, map: &Map<V>) -> Option<NodeId> {
        debug_assert_eq!(
            self.version,
            map.version(),
            "map structurally modified during iteration"
        );
        let cur = self.next?;
        self.next = if Some(cur) == self.last {
            None
        } else {
            map.next(cur)
        };
        Some(cur)
    }
}

impl<V> Map<V> {
    /// Walk from `first` up to and including `last`.
    ///
    /// Empty when `first` sorts after `last` or either handle is stale.
    #[must_use]
    pub fn range(&self, first: NodeId, last: NodeId) -> Range<'_, V> {
        let next = match (self.key(first), self.key(last)) {
            (Some(a), Some(b)) if a <= b => Some(first),
            _ => None,
        };
        Range {
            map: self,
            next,
            last: Some(last),
        }
    }

    /// Entries with `lo <= key <= hi`.
    #[must_use]
    pub fn range_keys(&self, lo: u64, hi: u64) -> Range<'_, V> {
        match self.span(lo, hi) {
            Some((first, last)) => self.range(first, last),
            None => Range {
                map: self,
                next: None,
                last: None,
            },
        }
    }

    #[must_use]
    pub fn iter(&self) -> Range<'_, V> {
        self.range_keys(0, u64::MAX)
    }

    /// A detached cursor over `lo <= key <= hi`.
    #[must_use]
    pub fn cursor(&self, lo: u64, hi: u64) -> Cursor {
        let (next, last) = match self.span(lo, hi) {
            Some((first, last)) => (Some(first), Some(last)),
            None => (None, None),
        };
        Cursor {
            next,
            last,
            version: self.version(),
        }
    }

    fn span(&self, lo: u64, hi: u64) -> Option<(NodeId, NodeId)> {
        if lo > hi {
            return None;
        }
        let first = self.find_geq(lo)?;
        let last = self.find_leq(hi)?;
        (self.key(first)? <= self.key(last)?).then_some((first, last))
    }
}

impl<'a, V> IntoIterator for &'a Map<V> {
    type Item = (u64, &'a V);
    type IntoIter = Range<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
