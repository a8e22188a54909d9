use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

/// Handle to a node stored in a [`Map`].
///
/// Handles stay valid until the node is removed. After that the slot may be
/// reused by a later insert, so a stale handle can name a different entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

pub(crate) struct Node<V> {
    pub(crate) key: u64,
    pub(crate) value: V,
    pub(crate) color: Color,
    pub(crate) parent: Option<NodeId>,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
}

enum Slot<V> {
    Occupied(Node<V>),
    /// Free list link.
    Vacant(Option<usize>),
}

/// Ordered map from `u64` keys to values, kept as a red-black tree.
///
/// Nodes live in a slot arena and link to each other by index. Removed
/// slots are threaded onto a free list and reused.
pub struct Map<V> {
    slots: Vec<Slot<V>>,
    free_head: Option<usize>,
    root: Option<NodeId>,
    len: usize,
    /// Bumped on every structural change; checked by [`crate::Cursor`].
    version: u64,
}

impl<V> Default for Map<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for Map<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<V> Map<V> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            root: None,
            len: 0,
            version: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drop every entry and release the arena.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = None;
        self.root = None;
        self.len = 0;
        self.bump();
    }

    /// Insert `value` under `key`.
    ///
    /// Duplicate keys are refused: the tree stays untouched and the value is
    /// handed back in `Err`.
    pub fn insert(&mut self, key: u64, value: V) -> Result<NodeId, V> {
        let mut parent = None;
        let mut went_left = false;
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            parent = Some(c);
            match key.cmp(&n.key) {
                Ordering::Less => {
                    went_left = true;
                    cur = n.left;
                }
                Ordering::Greater => {
                    went_left = false;
                    cur = n.right;
                }
                Ordering::Equal => return Err(value),
            }
        }

        let id = self.alloc(Node {
            key,
            value,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) if went_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }

        self.len += 1;
        self.bump();
        self.insert_fixup(id);
        Ok(id)
    }

    #[must_use]
    pub fn find_node(&self, key: u64) -> Option<NodeId> {
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            cur = match key.cmp(&n.key) {
                Ordering::Less => n.left,
                Ordering::Greater => n.right,
                Ordering::Equal => return Some(c),
            };
        }
        None
    }

    #[must_use]
    pub fn find(&self, key: u64) -> Option<&V> {
        self.find_node(key).map(|id| &self.node(id).value)
    }

    pub fn find_mut(&mut self, key: u64) -> Option<&mut V> {
        let id = self.find_node(key)?;
        Some(&mut self.node_mut(id).value)
    }

    #[must_use]
    pub fn contains_key(&self, key: u64) -> bool {
        self.find_node(key).is_some()
    }

    /// Smallest key `>= key`.
    #[must_use]
    pub fn find_geq(&self, key: u64) -> Option<NodeId> {
        let mut best = None;
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            match key.cmp(&n.key) {
                Ordering::Equal => return Some(c),
                Ordering::Less => {
                    best = Some(c);
                    cur = n.left;
                }
                Ordering::Greater => cur = n.right,
            }
        }
        best
    }

    /// Largest key `<= key`.
    #[must_use]
    pub fn find_leq(&self, key: u64) -> Option<NodeId> {
        let mut best = None;
        let mut cur = self.root;
        while let Some(c) = cur {
            let n = self.node(c);
            match key.cmp(&n.key) {
                Ordering::Equal => return Some(c),
                Ordering::Greater => {
                    best = Some(c);
                    cur = n.right;
                }
                Ordering::Less => cur = n.left,
            }
        }
        best
    }

    #[must_use]
    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|r| self.minimum(r))
    }

    #[must_use]
    pub fn last(&self) -> Option<NodeId> {
        self.root.map(|r| self.maximum(r))
    }

    /// In-order successor.
    #[must_use]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        let n = self.try_node(id)?;
        if let Some(r) = n.right {
            return Some(self.minimum(r));
        }
        let mut child = id;
        let mut parent = n.parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// In-order predecessor.
    #[must_use]
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        let n = self.try_node(id)?;
        if let Some(l) = n.left {
            return Some(self.maximum(l));
        }
        let mut child = id;
        let mut parent = n.parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<u64> {
        self.try_node(id).map(|n| n.key)
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&V> {
        self.try_node(id).map(|n| &n.value)
    }

    /// Values may be changed in place; the key and tree shape may not.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut V> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Occupied(n)) => Some(&mut n.value),
            _ => None,
        }
    }

    #[must_use]
    pub fn entry(&self, id: NodeId) -> Option<(u64, &V)> {
        self.try_node(id).map(|n| (n.key, &n.value))
    }

    pub fn remove_by_key(&mut self, key: u64) -> Option<V> {
        let id = self.find_node(key)?;
        self.remove(id).map(|(_, v)| v)
    }

    /// Unlink `id` and hand back its key and value.
    pub fn remove(&mut self, z: NodeId) -> Option<(u64, V)> {
        let (left, right, z_parent, z_color) = {
            let n = self.try_node(z)?;
            (n.left, n.right, n.parent, n.color)
        };

        let mut removed_color = z_color;
        let x;
        let x_parent;
        match (left, right) {
            (None, _) => {
                x = right;
                x_parent = z_parent;
                self.transplant(z, right);
            }
            (_, None) => {
                x = left;
                x_parent = z_parent;
                self.transplant(z, left);
            }
            (Some(l), Some(r)) => {
                let y = self.minimum(r);
                removed_color = self.node(y).color;
                x = self.node(y).right;
                if self.node(y).parent == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.node(y).parent;
                    self.transplant(y, x);
                    self.node_mut(y).right = Some(r);
                    self.node_mut(r).parent = Some(y);
                }
                self.transplant(z, Some(y));
                let y_node = self.node_mut(y);
                y_node.left = Some(l);
                y_node.color = z_color;
                self.node_mut(l).parent = Some(y);
            }
        }

        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.len -= 1;
        self.bump();
        let node = self.release(z);
        Some((node.key, node.value))
    }

    pub(crate) const fn version(&self) -> u64 {
        self.version
    }

    pub(crate) const fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn try_node(&self, id: NodeId) -> Option<&Node<V>> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied(n)) => Some(n),
            _ => None,
        }
    }

    /// Follow an internal link. Links always name occupied slots.
    pub(crate) fn node(&self, id: NodeId) -> &Node<V> {
        match &self.slots[id.0] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => unreachable!("tree link to vacant slot {}", id.0),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<V> {
        match &mut self.slots[id.0] {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => unreachable!("tree link to vacant slot {}", id.0),
        }
    }

    const fn bump(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    fn alloc(&mut self, node: Node<V>) -> NodeId {
        if let Some(idx) = self.free_head {
            if let Slot::Vacant(next) = &self.slots[idx] {
                self.free_head = *next;
            }
            self.slots[idx] = Slot::Occupied(node);
            NodeId(idx)
        } else {
            self.slots.push(Slot::Occupied(node));
            NodeId(self.slots.len() - 1)
        }
    }

    fn release(&mut self, id: NodeId) -> Node<V> {
        let slot = core::mem::replace(&mut self.slots[id.0], Slot::Vacant(self.free_head));
        self.free_head = Some(id.0);
        match slot {
            Slot::Occupied(n) => n,
            Slot::Vacant(_) => unreachable!("double release of slot {}", id.0),
        }
    }

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(l) = self.node(id).left {
            id = l;
        }
        id
    }

    fn maximum(&self, mut id: NodeId) -> NodeId {
        while let Some(r) = self.node(id).right {
            id = r;
        }
        id
    }

    fn is_red(&self, id: Option<NodeId>) -> bool {
        id.is_some_and(|i| self.node(i).color == Color::Red)
    }

    fn set_color(&mut self, id: NodeId, color: Color) {
        self.node_mut(id).color = color;
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let n = self.node_mut(p);
                if n.left == Some(old) {
                    n.left = new;
                } else {
                    n.right = new;
                }
            }
        }
    }

    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let up = self.node(u).parent;
        self.replace_child(up, u, v);
        if let Some(v) = v {
            self.node_mut(v).parent = up;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.node(x).right else {
            return;
        };
        let beta = self.node(y).left;
        self.node_mut(x).right = beta;
        if let Some(b) = beta {
            self.node_mut(b).parent = Some(x);
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.node(x).left else {
            return;
        };
        let beta = self.node(y).right;
        self.node_mut(x).left = beta;
        if let Some(b) = beta {
            self.node_mut(b).parent = Some(x);
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        self.replace_child(xp, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(p) = self.node(z).parent {
            if self.node(p).color == Color::Black {
                break;
            }
            // A red parent is never the root, so the grandparent exists.
            let Some(g) = self.node(p).parent else {
                break;
            };

            if self.node(g).left == Some(p) {
                match self.node(g).right {
                    Some(u) if self.is_red(Some(u)) => {
                        self.set_color(p, Color::Black);
                        self.set_color(u, Color::Black);
                        self.set_color(g, Color::Red);
                        z = g;
                    }
                    _ => {
                        let (child, top) = if self.node(p).right == Some(z) {
                            self.rotate_left(p);
                            (p, z)
                        } else {
                            (z, p)
                        };
                        self.set_color(top, Color::Black);
                        self.set_color(g, Color::Red);
                        self.rotate_right(g);
                        z = child;
                    }
                }
            } else {
                match self.node(g).left {
                    Some(u) if self.is_red(Some(u)) => {
                        self.set_color(p, Color::Black);
                        self.set_color(u, Color::Black);
                        self.set_color(g, Color::Red);
                        z = g;
                    }
                    _ => {
                        let (child, top) = if self.node(p).left == Some(z) {
                            self.rotate_right(p);
                            (p, z)
                        } else {
                            (z, p)
                        };
                        self.set_color(top, Color::Black);
                        self.set_color(g, Color::Red);
                        self.rotate_left(g);
                        z = child;
                    }
                }
            }
        }

        if let Some(r) = self.root {
            self.set_color(r, Color::Black);
        }
    }

    /// Restore the black height after unlinking a black node. `x` carries
    /// the extra black and may be nil, so its parent is tracked separately.
    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = parent else {
                break;
            };

            if x == self.node(p).left {
                let mut w = self.node(p).right;
                if let Some(s) = w.filter(|&s| self.is_red(Some(s))) {
                    self.set_color(s, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.node(p).right;
                }
                let Some(mut s) = w else {
                    break;
                };

                if !self.is_red(self.node(s).left) && !self.is_red(self.node(s).right) {
                    self.set_color(s, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(s).right) {
                        if let Some(sl) = self.node(s).left {
                            self.set_color(sl, Color::Black);
                        }
                        self.set_color(s, Color::Red);
                        self.rotate_right(s);
                        let Some(ns) = self.node(p).right else {
                            break;
                        };
                        s = ns;
                    }
                    let pc = self.node(p).color;
                    self.set_color(s, pc);
                    self.set_color(p, Color::Black);
                    if let Some(sr) = self.node(s).right {
                        self.set_color(sr, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self.node(p).left;
                if let Some(s) = w.filter(|&s| self.is_red(Some(s))) {
                    self.set_color(s, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.node(p).left;
                }
                let Some(mut s) = w else {
                    break;
                };

                if !self.is_red(self.node(s).left) && !self.is_red(self.node(s).right) {
                    self.set_color(s, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(s).left) {
                        if let Some(sr) = self.node(s).right {
                            self.set_color(sr, Color::Black);
                        }
                        self.set_color(s, Color::Red);
                        self.rotate_left(s);
                        let Some(ns) = self.node(p).left else {
                            break;
                        };
                        s = ns;
                    }
                    let pc = self.node(p).color;
                    self.set_color(s, pc);
                    self.set_color(p, Color::Black);
                    if let Some(sl) = self.node(s).left {
                        self.set_color(sl, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }

        if let Some(x) = x {
            self.set_color(x, Color::Black);
        }
    }
}
