//! Root-to-leaf paths, indexed by level.
//!
//! Level 0 is the leaf; the last level is the root. Each element records the
//! block id and the child slot it occupies in the block one level up. The
//! root's slot is always 0.

use std::fmt;

use smallvec::SmallVec;

use crate::store::BlockId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathNode {
    pub id: BlockId,
    pub parent_idx: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreePath {
    nodes: SmallVec<[PathNode; 8]>,
}

impl TreePath {
    /// Path consisting of the root only.
    pub fn from_root(root: BlockId) -> Self {
        let mut nodes = SmallVec::new();
        nodes.push(PathNode {
            id: root,
            parent_idx: 0,
        });
        Self { nodes }
    }

    /// Build from nodes listed root first.
    pub fn from_top_down(top_down: &[PathNode]) -> Self {
        Self {
            nodes: top_down.iter().rev().copied().collect(),
        }
    }

    /// Number of levels.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root_level(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn is_root_level(&self, level: usize) -> bool {
        level + 1 == self.nodes.len()
    }

    pub fn node(&self, level: usize) -> PathNode {
        self.nodes[level]
    }

    pub fn id(&self, level: usize) -> BlockId {
        self.nodes[level].id
    }

    pub fn parent_idx(&self, level: usize) -> usize {
        self.nodes[level].parent_idx
    }

    pub fn leaf(&self) -> BlockId {
        self.id(0)
    }

    pub fn root(&self) -> BlockId {
        self.id(self.root_level())
    }

    pub fn set_id(&mut self, level: usize, id: BlockId) {
        self.nodes[level].id = id;
    }

    pub fn set_parent_idx(&mut self, level: usize, idx: usize) {
        self.nodes[level].parent_idx = idx;
    }

    pub fn set(&mut self, level: usize, node: PathNode) {
        self.nodes[level] = node;
    }

    /// Put a new root above the current one, which becomes its child 0.
    pub fn add_root(&mut self, root: BlockId) {
        if let Some(top) = self.nodes.last_mut() {
            top.parent_idx = 0;
        }
        self.nodes.push(PathNode {
            id: root,
            parent_idx: 0,
        });
    }

    /// Drop the root level; the level below becomes the root.
    pub fn remove_root(&mut self) {
        self.nodes.pop();
        if let Some(top) = self.nodes.last_mut() {
            top.parent_idx = 0;
        }
    }

    /// Whether both paths run through the same block at `level`.
    pub fn same_at(&self, other: &TreePath, level: usize) -> bool {
        level < self.len() && level < other.len() && self.id(level) == other.id(level)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathNode> {
        self.nodes.iter()
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().rev().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}[{}]", node.id, node.parent_idx)?;
        }
        Ok(())
    }
}
