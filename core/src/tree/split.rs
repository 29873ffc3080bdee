//! Node splitting and root growth.

use super::discipline::Discipline;
use super::engine::TreeEngine;
use super::path::{PathNode, TreePath};
use crate::error::{TreeError, TreeResult};
use crate::store::{Block, BlockStore, RootMetadata};

/// Which half of a split node now holds the addressed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitResult {
    pub side: SplitSide,
    /// Position within the half named by `side`
    pub index: usize,
}

impl<S: BlockStore, D: Discipline> TreeEngine<S, D> {
    /// Split the node at `level` of `path` in two.
    ///
    /// The lower half stays, the upper half moves to a new right sibling. A
    /// full parent is split first, and a root is first pushed down under a
    /// new root. On return `path` addresses whichever half holds `target`.
    pub fn split(&self, path: &mut TreePath, level: usize, target: usize) -> TreeResult<SplitResult> {
        self.cow_clone_path(path, level)?;
        if path.is_root_level(level) {
            self.grow_root(path)?;
        }

        let parent_level = level + 1;
        if self.load(path.id(parent_level))?.is_full(&self.config) {
            let parent_split = self.split(path, parent_level, path.parent_idx(level))?;
            path.set_parent_idx(level, parent_split.index);
        }

        let node_id = path.id(level);
        let mut node = self.load_mut(node_id)?;
        let split_at = node.len() / 2;
        if split_at == 0 {
            return Err(TreeError::Structural(format!(
                "cannot split block {} with {} entries",
                node_id,
                node.len()
            )));
        }

        // children move with their links, so their reference counts stay put
        let sibling = Block::with_body(self.generation, node.split_off(split_at));
        let sibling_entry = sibling.aggregate();
        let node_entry = node.aggregate();
        let sibling_id = self.store.create_block(sibling, self.owner)?;
        self.save(node)?;

        let parent_id = path.id(parent_level);
        let idx = path.parent_idx(level);
        let mut parent = self.load_mut(parent_id)?;
        parent.set_entry(idx, node_entry)?;
        parent.insert_child(idx + 1, sibling_id, sibling_entry)?;
        self.save(parent)?;
        self.ref_block(sibling_id)?;

        self.verify_entry(parent_id, idx)?;
        self.verify_entry(parent_id, idx + 1)?;
        self.update_path(path, parent_level)?;

        tracing::debug!(level, node = %node_id, sibling = %sibling_id, split_at, "split node");

        if target < split_at {
            Ok(SplitResult {
                side: SplitSide::Left,
                index: target,
            })
        } else {
            path.set(
                level,
                PathNode {
                    id: sibling_id,
                    parent_idx: idx + 1,
                },
            );
            Ok(SplitResult {
                side: SplitSide::Right,
                index: target - split_at,
            })
        }
    }

    /// Put a new root branch above the current root.
    fn grow_root(&self, path: &mut TreePath) -> TreeResult<()> {
        let old_id = path.root();
        let mut old = self.load_mut(old_id)?;
        let meta = old.root.take();
        let entry = old.aggregate();
        self.save(old)?;

        let mut root = Block::branch(self.generation, vec![old_id], vec![entry]);
        root.root = Some(meta.unwrap_or(RootMetadata {
            owner: self.owner,
            generation: self.generation,
        }));
        let root_id = self.store.create_block(root, self.owner)?;

        // the container's reference moves to the new root; the old root is
        // now held by the new root's link
        self.store.set_root(self.owner, Some(root_id));
        self.ref_block(root_id)?;
        path.add_root(root_id);

        tracing::debug!(root = %root_id, height = path.len(), "grew tree");
        Ok(())
    }
}
