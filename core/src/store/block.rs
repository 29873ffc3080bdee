//! Block model: leaf and branch nodes as seen by the tree engine.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{BRANCH_ENTRY_SIZE, LEAF_ENTRY_SIZE, TreeConfig};
use crate::error::{TreeError, TreeResult};

/// Identifies the container (tree) that owns a root.
pub type OwnerId = Uuid;

/// Block identifier, the block's level-0 address in the allocation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BlockId(pub u64);

impl BlockId {
    pub const INVALID: BlockId = BlockId(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-child aggregate kept in a branch: entry count and value sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BranchEntry {
    pub size: u64,
    pub sum: u64,
}

impl BranchEntry {
    pub fn new(size: u64, sum: u64) -> Self {
        Self { size, sum }
    }

    pub fn from_values(values: &[u64]) -> Self {
        values.iter().fold(Self::default(), |acc, v| Self {
            size: acc.size + 1,
            sum: acc.sum.wrapping_add(*v),
        })
    }

    pub fn add(&mut self, other: &BranchEntry) {
        self.size += other.size;
        self.sum = self.sum.wrapping_add(other.sum);
    }
}

/// Container metadata carried only by the root block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootMetadata {
    pub owner: OwnerId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Leaf {
        values: Vec<u64>,
    },
    Branch {
        children: Vec<BlockId>,
        entries: Vec<BranchEntry>,
    },
}

/// A fixed-capacity tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    /// Generation of the writer that created this block
    pub generation: u64,
    pub root: Option<RootMetadata>,
    pub body: NodeBody,
}

impl Block {
    pub fn leaf(generation: u64, values: Vec<u64>) -> Self {
        Self {
            id: BlockId::INVALID,
            generation,
            root: None,
            body: NodeBody::Leaf { values },
        }
    }

    pub fn branch(generation: u64, children: Vec<BlockId>, entries: Vec<BranchEntry>) -> Self {
        Self {
            id: BlockId::INVALID,
            generation,
            root: None,
            body: NodeBody::Branch { children, entries },
        }
    }

    pub fn with_body(generation: u64, body: NodeBody) -> Self {
        Self {
            id: BlockId::INVALID,
            generation,
            root: None,
            body,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf { .. })
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    /// Number of values (leaf) or children (branch).
    pub fn len(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { values } => values.len(),
            NodeBody::Branch { children, .. } => children.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn aggregate(&self) -> BranchEntry {
        match &self.body {
            NodeBody::Leaf { values } => BranchEntry::from_values(values),
            NodeBody::Branch { entries, .. } => {
                entries.iter().fold(BranchEntry::default(), |mut acc, e| {
                    acc.add(e);
                    acc
                })
            }
        }
    }

    pub fn payload_bytes(&self) -> usize {
        match &self.body {
            NodeBody::Leaf { values } => values.len() * LEAF_ENTRY_SIZE,
            NodeBody::Branch { children, .. } => children.len() * BRANCH_ENTRY_SIZE,
        }
    }

    pub fn capacity(&self, config: &TreeConfig) -> usize {
        if self.is_leaf() {
            config.leaf_capacity(self.is_root())
        } else {
            config.branch_capacity(self.is_root())
        }
    }

    /// Capacity this node would have as a non-root node.
    pub fn sibling_capacity(&self, config: &TreeConfig) -> usize {
        if self.is_leaf() {
            config.leaf_capacity(false)
        } else {
            config.branch_capacity(false)
        }
    }

    pub fn is_full(&self, config: &TreeConfig) -> bool {
        self.len() >= self.capacity(config)
    }

    /// Less than half full, rounding up. A single-child branch always qualifies.
    pub fn is_underfull(&self, config: &TreeConfig) -> bool {
        self.len() < self.sibling_capacity(config).div_ceil(2)
    }

    /// Whether this block's payload fits next to the root metadata reservation.
    pub fn can_convert_to_root(&self, config: &TreeConfig) -> bool {
        self.payload_bytes() + config.root_metadata_size <= config.payload_budget()
    }

    pub fn values(&self) -> &[u64] {
        match &self.body {
            NodeBody::Leaf { values } => values,
            NodeBody::Branch { .. } => &[],
        }
    }

    pub fn children(&self) -> &[BlockId] {
        match &self.body {
            NodeBody::Branch { children, .. } => children,
            NodeBody::Leaf { .. } => &[],
        }
    }

    pub fn entries(&self) -> &[BranchEntry] {
        match &self.body {
            NodeBody::Branch { entries, .. } => entries,
            NodeBody::Leaf { .. } => &[],
        }
    }

    pub fn child(&self, idx: usize) -> Option<BlockId> {
        self.children().get(idx).copied()
    }

    pub fn entry(&self, idx: usize) -> Option<BranchEntry> {
        self.entries().get(idx).copied()
    }

    pub fn insert_value(&mut self, idx: usize, value: u64) -> TreeResult<()> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Leaf { values } if idx <= values.len() => {
                values.insert(idx, value);
                Ok(())
            }
            _ => Err(TreeError::Structural(format!(
                "cannot insert value at {} into block {}",
                idx, id
            ))),
        }
    }

    pub fn remove_value(&mut self, idx: usize) -> TreeResult<u64> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Leaf { values } if idx < values.len() => Ok(values.remove(idx)),
            _ => Err(TreeError::Structural(format!(
                "cannot remove value {} from block {}",
                idx, id
            ))),
        }
    }

    pub fn insert_child(&mut self, idx: usize, child: BlockId, entry: BranchEntry) -> TreeResult<()> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Branch { children, entries } if idx <= children.len() => {
                children.insert(idx, child);
                entries.insert(idx, entry);
                Ok(())
            }
            _ => Err(TreeError::Structural(format!(
                "cannot insert child at {} into block {}",
                idx, id
            ))),
        }
    }

    pub fn remove_child(&mut self, idx: usize) -> TreeResult<(BlockId, BranchEntry)> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Branch { children, entries } if idx < children.len() => {
                Ok((children.remove(idx), entries.remove(idx)))
            }
            _ => Err(TreeError::Structural(format!(
                "cannot remove child {} from block {}",
                idx, id
            ))),
        }
    }

    /// Point slot `idx` at `child`, returning the id it replaced.
    pub fn set_child(&mut self, idx: usize, child: BlockId) -> TreeResult<BlockId> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Branch { children, .. } if idx < children.len() => {
                Ok(std::mem::replace(&mut children[idx], child))
            }
            _ => Err(TreeError::Structural(format!(
                "block {} has no child slot {}",
                id, idx
            ))),
        }
    }

    pub fn set_entry(&mut self, idx: usize, entry: BranchEntry) -> TreeResult<()> {
        let id = self.id;
        match &mut self.body {
            NodeBody::Branch { entries, .. } if idx < entries.len() => {
                entries[idx] = entry;
                Ok(())
            }
            _ => Err(TreeError::Structural(format!(
                "block {} has no entry slot {}",
                id, idx
            ))),
        }
    }

    /// Move everything from `at` onwards into a new body.
    pub fn split_off(&mut self, at: usize) -> NodeBody {
        match &mut self.body {
            NodeBody::Leaf { values } => NodeBody::Leaf {
                values: values.split_off(at.min(values.len())),
            },
            NodeBody::Branch { children, entries } => {
                let at = at.min(children.len());
                NodeBody::Branch {
                    children: children.split_off(at),
                    entries: entries.split_off(at),
                }
            }
        }
    }

    /// Append the contents of a sibling body of the same kind.
    pub fn append(&mut self, other: NodeBody) -> TreeResult<()> {
        match (&mut self.body, other) {
            (NodeBody::Leaf { values }, NodeBody::Leaf { values: mut more }) => {
                values.append(&mut more);
                Ok(())
            }
            (
                NodeBody::Branch { children, entries },
                NodeBody::Branch {
                    children: mut more_children,
                    entries: mut more_entries,
                },
            ) => {
                children.append(&mut more_children);
                entries.append(&mut more_entries);
                Ok(())
            }
            _ => Err(TreeError::Structural(format!(
                "cannot merge nodes of different kinds into block {}",
                self.id
            ))),
        }
    }
}
