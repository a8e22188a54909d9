use crate::rbtree::Color;
use crate::{Map, NodeId};

/// A broken red-black tree property, reported by [`Map::validate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeViolation {
    #[error("root node is red")]
    RedRoot,
    #[error("root node has a parent link")]
    RootHasParent,
    #[error("key {key:#x} is out of order")]
    Order { key: u64 },
    #[error("red node {key:#x} has a red child")]
    RedRed { key: u64 },
    #[error("subtrees of {key:#x} differ in black height")]
    BlackHeight { key: u64 },
    #[error("child of {key:#x} does not link back to it")]
    ParentLink { key: u64 },
    #[error("{reachable} nodes reachable from the root, but the map counts {len}")]
    Count { reachable: usize, len: usize },
}

impl<V> Map<V> {
    /// Exhaustively check ordering, coloring, black height and links.
    ///
    /// Returns the black height of the tree, not counting nil leaves.
    pub fn validate(&self) -> Result<usize, TreeViolation> {
        let Some(root) = self.root() else {
            return if self.is_empty() {
                Ok(0)
            } else {
                Err(TreeViolation::Count {
                    reachable: 0,
                    len: self.len(),
                })
            };
        };

        let r = self.node(root);
        if r.parent.is_some() {
            return Err(TreeViolation::RootHasParent);
        }
        if r.color == Color::Red {
            return Err(TreeViolation::RedRoot);
        }

        let mut reachable = 0;
        let height = self.check_subtree(root, None, None, &mut reachable)?;
        if reachable != self.len() {
            return Err(TreeViolation::Count {
                reachable,
                len: self.len(),
            });
        }
        Ok(height)
    }

    /// Keys under `id` must lie strictly between `lo` and `hi`.
    fn check_subtree(
        &self,
        id: NodeId,
        lo: Option<u64>,
        hi: Option<u64>,
        reachable: &mut usize,
    ) -> Result<usize, TreeViolation> {
        let n = self.node(id);
        *reachable += 1;

        if lo.is_some_and(|lo| n.key <= lo) || hi.is_some_and(|hi| n.key >= hi) {
            return Err(TreeViolation::Order { key: n.key });
        }

        let mut heights = [0usize; 2];
        for (slot, child, bounds) in [
            (0, n.left, (lo, Some(n.key))),
            (1, n.right, (Some(n.key), hi)),
        ] {
            let Some(c) = child else {
                continue;
            };
            let cn = self.node(c);
            if cn.parent != Some(id) {
                return Err(TreeViolation::ParentLink { key: n.key });
            }
            if n.color == Color::Red && cn.color == Color::Red {
                return Err(TreeViolation::RedRed { key: n.key });
            }
            heights[slot] = self.check_subtree(c, bounds.0, bounds.1, reachable)?;
        }

        if heights[0] != heights[1] {
            return Err(TreeViolation::BlackHeight { key: n.key });
        }
        Ok(heights[0] + usize::from(n.color == Color::Black))
    }
}
