//! Tree maintenance engine: lifecycle, path cloning, reference handling,
//! subtree removal, root collapse and whole-tree checking.

use std::collections::HashSet;
use std::sync::Arc;

use super::discipline::Discipline;
use super::path::{PathNode, TreePath};
use crate::config::TreeConfig;
use crate::error::{TreeError, TreeResult};
use crate::store::{Block, BlockId, BlockStore, BranchEntry, OwnerId, RootMetadata};

/// Totals gathered by [`TreeEngine::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeSummary {
    pub height: usize,
    pub blocks: usize,
    pub entries: u64,
    pub sum: u64,
}

/// Keeps one container's tree valid while entries are inserted and removed.
///
/// The engine is generic over the block store and over the mutation
/// [`Discipline`]. Every structural algorithm is written once; the discipline
/// decides whether a block may be changed in place and how references are
/// counted.
pub struct TreeEngine<S: BlockStore, D: Discipline> {
    pub(super) store: Arc<S>,
    pub(super) discipline: D,
    pub(super) config: TreeConfig,
    pub(super) owner: OwnerId,
    pub(super) generation: u64,
}

impl<S: BlockStore, D: Discipline> TreeEngine<S, D> {
    /// Create an empty container with a single root leaf.
    pub fn create(store: Arc<S>, discipline: D, config: TreeConfig, owner: OwnerId) -> TreeResult<Self> {
        config.validate()?;
        if store.get_root(owner).is_some() {
            return Err(TreeError::InvalidState(format!(
                "container {} already exists",
                owner
            )));
        }

        let generation = store.next_generation();
        let mut root = Block::leaf(generation, Vec::new());
        root.root = Some(RootMetadata { owner, generation });
        let root_id = store.create_block(root, owner)?;
        store.set_root(owner, Some(root_id));
        discipline.acquire(&*store, root_id)?;

        tracing::debug!(%owner, root = %root_id, cow = discipline.is_copy_on_write(), "created container");
        Ok(Self {
            store,
            discipline,
            config,
            owner,
            generation,
        })
    }

    /// Attach to an existing container as a new writer generation.
    pub fn open(store: Arc<S>, discipline: D, config: TreeConfig, owner: OwnerId) -> TreeResult<Self> {
        config.validate()?;
        if store.get_root(owner).is_none() {
            return Err(TreeError::InvalidState(format!(
                "container {} does not exist",
                owner
            )));
        }
        let generation = store.next_generation();
        Ok(Self {
            store,
            discipline,
            config,
            owner,
            generation,
        })
    }

    /// Share this container's tree with `new_owner`.
    ///
    /// Both engines move to fresh generations, so every block reachable
    /// before the fork is cloned before either side changes it.
    pub fn fork(&mut self, new_owner: OwnerId) -> TreeResult<Self> {
        if !self.discipline.is_copy_on_write() {
            return Err(TreeError::InvalidState(
                "fork requires the copy-on-write discipline".into(),
            ));
        }
        if self.store.get_root(new_owner).is_some() {
            return Err(TreeError::InvalidState(format!(
                "container {} already exists",
                new_owner
            )));
        }

        let root = self.root_id()?;
        self.ref_block(root)?;
        self.store.set_root(new_owner, Some(root));
        self.generation = self.store.next_generation();
        let generation = self.store.next_generation();

        tracing::debug!(from = %self.owner, to = %new_owner, root = %root, "forked container");
        Ok(Self {
            store: Arc::clone(&self.store),
            discipline: self.discipline.clone(),
            config: self.config.clone(),
            owner: new_owner,
            generation,
        })
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn discipline(&self) -> &D {
        &self.discipline
    }

    pub fn root_id(&self) -> TreeResult<BlockId> {
        self.store
            .get_root(self.owner)
            .ok_or_else(|| TreeError::InvalidState(format!("container {} has no root", self.owner)))
    }

    pub(super) fn load(&self, id: BlockId) -> TreeResult<Arc<Block>> {
        self.store.get_block(id)
    }

    /// Owned copy of a block this writer is allowed to change.
    pub(super) fn load_mut(&self, id: BlockId) -> TreeResult<Block> {
        let block = self.store.get_block(id)?;
        if !self.discipline.is_mutable(&block, self.generation) {
            return Err(TreeError::Structural(format!(
                "block {} is shared and was not cloned before mutation",
                id
            )));
        }
        Ok((*block).clone())
    }

    pub(super) fn save(&self, block: Block) -> TreeResult<()> {
        self.store.update_block(block)
    }

    pub fn ref_block(&self, id: BlockId) -> TreeResult<()> {
        self.discipline.acquire(&*self.store, id)
    }

    /// Drop one reference to `id`, reclaiming the block and cascading into
    /// its children once nothing refers to it. No-op for in-place trees.
    pub fn unref_block(&self, id: BlockId) -> TreeResult<()> {
        if self.discipline.is_copy_on_write() {
            self.remove_subtree(id)
        } else {
            Ok(())
        }
    }

    /// Release `id` and, if that was its last referrer, every block below it.
    ///
    /// Children are handled before their parent. A child still reachable
    /// from another snapshot only loses one reference.
    pub fn remove_subtree(&self, id: BlockId) -> TreeResult<()> {
        if !self.discipline.release(&*self.store, id)? {
            return Ok(());
        }

        let block = self.load(id)?;
        for child in block.children() {
            self.remove_subtree(*child)?;
        }
        self.store.remove_block(id)
    }

    /// Remove the whole tree and clear the container's root.
    pub fn drop_container(&mut self) -> TreeResult<()> {
        if !self.store.is_active() {
            return Err(TreeError::InvalidState(
                "cannot drop a container while the store is inactive".into(),
            ));
        }

        let root = self.root_id()?;
        self.remove_subtree(root)?;
        self.store.set_root(self.owner, None);
        tracing::debug!(owner = %self.owner, root = %root, "dropped container");
        Ok(())
    }

    /// Clone every shared block on `path` from `from_level` up to the root.
    ///
    /// Works top-down so each clone's parent is already private. The clone
    /// takes a reference on each child, the parent is repointed, and the
    /// superseded block loses the parent's reference.
    pub fn cow_clone_path(&self, path: &mut TreePath, from_level: usize) -> TreeResult<()> {
        if !self.discipline.is_copy_on_write() {
            return Ok(());
        }

        for level in (from_level..path.len()).rev() {
            let old_id = path.id(level);
            let old = self.load(old_id)?;
            if self.discipline.is_mutable(&old, self.generation) {
                continue;
            }

            let new_id = self.store.clone_block(old_id, self.owner)?;
            let mut copy = (*self.load(new_id)?).clone();
            copy.generation = self.generation;
            if let Some(meta) = copy.root.as_mut() {
                meta.owner = self.owner;
            }
            self.save(copy)?;

            for child in old.children() {
                self.ref_block(*child)?;
            }

            if path.is_root_level(level) {
                self.store.set_root(self.owner, Some(new_id));
            } else {
                let mut parent = self.load_mut(path.id(level + 1))?;
                let replaced = parent.set_child(path.parent_idx(level), new_id)?;
                if replaced != old_id {
                    return Err(TreeError::Structural(format!(
                        "path expected {} under {} but found {}",
                        old_id,
                        parent.id,
                        replaced
                    )));
                }
                self.save(parent)?;
            }
            self.ref_block(new_id)?;
            self.unref_block(old_id)?;
            path.set_id(level, new_id);

            tracing::trace!(level, from = %old_id, to = %new_id, "cloned path block");
        }
        Ok(())
    }

    /// Collapse the root into its only child if that child can hold the root
    /// metadata. Walks up from `level` to the root; removes at most one level.
    pub fn remove_redundant_root(&self, path: &mut TreePath, level: usize) -> TreeResult<()> {
        let parent_level = level + 1;
        if parent_level >= path.len() {
            return Ok(());
        }
        if !path.is_root_level(parent_level) {
            return self.remove_redundant_root(path, parent_level);
        }

        let root = self.load(path.id(parent_level))?;
        if root.len() != 1 {
            return Ok(());
        }
        let child = self.load(path.id(level))?;
        if root.child(0) != Some(child.id) {
            return Err(TreeError::Structural(format!(
                "path child {} is not the only child of root {}",
                child.id, root.id
            )));
        }
        if !child.can_convert_to_root(&self.config) {
            tracing::warn!(
                root = %root.id,
                child = %child.id,
                payload = child.payload_bytes(),
                "redundant root kept, child cannot hold root metadata"
            );
            return Ok(());
        }

        self.cow_clone_path(path, level)?;
        let root_id = path.id(parent_level);
        let child_id = path.id(level);
        let meta = self.load(root_id)?.root;

        let mut promoted = self.load_mut(child_id)?;
        promoted.root = Some(meta.unwrap_or(RootMetadata {
            owner: self.owner,
            generation: self.generation,
        }));
        self.save(promoted)?;

        // the container's reference moves from the old root to the child,
        // and the old root's link to the child disappears with it
        self.store.set_root(self.owner, Some(child_id));
        self.store.remove_block(root_id)?;
        path.remove_root();

        tracing::debug!(old_root = %root_id, new_root = %child_id, height = path.len(), "collapsed redundant root");
        Ok(())
    }

    /// Refresh the parent entries of every node on `path` from `from_level` up.
    pub(super) fn update_path(&self, path: &TreePath, from_level: usize) -> TreeResult<()> {
        for level in from_level..path.root_level() {
            let child_id = path.id(level);
            let actual = self.load(child_id)?.aggregate();
            let parent_id = path.id(level + 1);
            let idx = path.parent_idx(level);

            let parent = self.load(parent_id)?;
            if parent.child(idx) != Some(child_id) {
                return Err(TreeError::Structural(format!(
                    "path expected {} at slot {} of {}",
                    child_id, idx, parent_id
                )));
            }
            if parent.entry(idx) != Some(actual) {
                let mut parent = self.load_mut(parent_id)?;
                parent.set_entry(idx, actual)?;
                self.save(parent)?;
            }
        }
        Ok(())
    }

    /// Fail if the entry at `idx` of `parent_id` disagrees with its child.
    pub(super) fn verify_entry(&self, parent_id: BlockId, idx: usize) -> TreeResult<()> {
        let parent = self.load(parent_id)?;
        let child = parent.child(idx).ok_or_else(|| {
            TreeError::Structural(format!("block {} has no child slot {}", parent_id, idx))
        })?;
        let actual = self.load(child)?.aggregate();
        if parent.entry(idx) != Some(actual) {
            return Err(TreeError::Structural(format!(
                "entry {} of {} is {:?}, child {} holds {:?}",
                idx,
                parent_id,
                parent.entry(idx),
                child,
                actual
            )));
        }
        Ok(())
    }

    /// Find the leaf holding position `index` and the offset within it.
    ///
    /// `index == len` addresses the slot just past the last entry.
    pub fn locate(&self, index: u64) -> TreeResult<(TreePath, usize)> {
        let root_id = self.root_id()?;
        let mut current = self.load(root_id)?;
        let len = current.aggregate().size;
        if index > len {
            return Err(TreeError::IndexOutOfBounds { index, len });
        }

        let mut nodes = vec![PathNode {
            id: root_id,
            parent_idx: 0,
        }];
        let mut remaining = index;
        while !current.is_leaf() {
            let entries = current.entries();
            if entries.is_empty() {
                return Err(TreeError::Structural(format!(
                    "branch {} has no children",
                    current.id
                )));
            }

            let last = entries.len() - 1;
            let mut slot = last;
            for (i, entry) in entries.iter().enumerate().take(last) {
                if remaining < entry.size {
                    slot = i;
                    break;
                }
                remaining -= entry.size;
            }

            let child = current.children()[slot];
            nodes.push(PathNode {
                id: child,
                parent_idx: slot,
            });
            current = self.load(child)?;
        }

        Ok((TreePath::from_top_down(&nodes), remaining as usize))
    }

    /// Walk the whole tree and verify its invariants.
    pub fn check(&self) -> TreeResult<TreeSummary> {
        let root = self.root_id()?;
        let mut walk = CheckWalk {
            leaf_depth: None,
            seen: HashSet::new(),
        };
        let total = self.check_node(root, true, 0, &mut walk)?;
        Ok(TreeSummary {
            height: walk.leaf_depth.map_or(1, |d| d + 1),
            blocks: walk.seen.len(),
            entries: total.size,
            sum: total.sum,
        })
    }

    fn check_node(&self, id: BlockId, is_root: bool, depth: usize, walk: &mut CheckWalk) -> TreeResult<BranchEntry> {
        if !walk.seen.insert(id) {
            return Err(TreeError::Structural(format!("block {} reachable twice", id)));
        }

        let block = self.load(id)?;
        if block.id != id {
            return Err(TreeError::Structural(format!("block {} stored as {}", id, block.id)));
        }
        if block.is_root() != is_root {
            return Err(TreeError::Structural(format!("root metadata misplaced on {}", id)));
        }
        if block.len() > block.capacity(&self.config) {
            return Err(TreeError::Structural(format!(
                "block {} holds {} entries, capacity {}",
                id,
                block.len(),
                block.capacity(&self.config)
            )));
        }
        if self.discipline.is_copy_on_write() && self.store.ref_count(id)? == 0 {
            return Err(TreeError::RefCount(format!("reachable block {} has no references", id)));
        }

        if block.is_leaf() {
            match walk.leaf_depth {
                Some(d) if d != depth => {
                    return Err(TreeError::Structural(format!(
                        "leaf {} at depth {}, expected {}",
                        id, depth, d
                    )));
                }
                Some(_) => {}
                None => walk.leaf_depth = Some(depth),
            }
            return Ok(block.aggregate());
        }

        if block.children().len() != block.entries().len() || block.is_empty() {
            return Err(TreeError::Structural(format!("malformed branch {}", id)));
        }
        for (child, entry) in block.children().iter().zip(block.entries()) {
            let actual = self.check_node(*child, false, depth + 1, walk)?;
            if actual != *entry {
                return Err(TreeError::Structural(format!(
                    "entry for {} in {} is {:?}, subtree holds {:?}",
                    child, id, entry, actual
                )));
            }
        }
        Ok(block.aggregate())
    }
}

struct CheckWalk {
    leaf_depth: Option<usize>,
    seen: HashSet<BlockId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig};
    use crate::store::MemoryBlockStore;
    use crate::tree::{CopyOnWriteDiscipline, InPlaceDiscipline};
    use uuid::Uuid;

    fn small() -> TreeConfig {
        // leaves hold 9 values (6 at the root), branches hold 3 (2 at the root)
        TreeConfig {
            block_size: 88,
            header_size: 16,
            root_metadata_size: 24,
        }
    }

    fn store() -> Arc<MemoryBlockStore> {
        Arc::new(MemoryBlockStore::new(
            &CacheConfig::default(),
            &PoolConfig::default(),
        ))
    }

    #[test]
    fn test_create_and_open() {
        let store = store();
        let owner = Uuid::new_v4();
        let engine = TreeEngine::create(Arc::clone(&store), InPlaceDiscipline, small(), owner).unwrap();
        let root = engine.root_id().unwrap();
        assert!(store.get_block(root).unwrap().is_root());

        assert!(matches!(
            TreeEngine::create(Arc::clone(&store), InPlaceDiscipline, small(), owner),
            Err(TreeError::InvalidState(_))
        ));
        let reopened = TreeEngine::open(Arc::clone(&store), InPlaceDiscipline, small(), owner).unwrap();
        assert_eq!(reopened.root_id().unwrap(), root);
        assert!(reopened.generation() > engine.generation());

        assert!(TreeEngine::open(store, InPlaceDiscipline, small(), Uuid::new_v4()).is_err());
    }

    #[test]
    fn test_locate_bounds() {
        let mut engine = TreeEngine::create(store(), InPlaceDiscipline, small(), Uuid::new_v4()).unwrap();
        for v in 0..20 {
            engine.push(v).unwrap();
        }
        let (path, local) = engine.locate(20).unwrap();
        assert_eq!(path.len(), engine.height().unwrap());
        let leaf = engine.store().get_block(path.leaf()).unwrap();
        assert_eq!(local, leaf.len());

        assert!(matches!(
            engine.locate(21),
            Err(TreeError::IndexOutOfBounds { index: 21, len: 20 })
        ));
    }

    #[test]
    fn test_drop_container_requires_active_store() {
        let store = store();
        let owner = Uuid::new_v4();
        let mut engine = TreeEngine::create(Arc::clone(&store), InPlaceDiscipline, small(), owner).unwrap();
        for v in 0..40 {
            engine.push(v).unwrap();
        }
        assert!(store.block_count() > 1);

        store.set_active(false);
        let err = engine.drop_container().unwrap_err();
        assert!(matches!(err, TreeError::InvalidState(_)));
        assert!(!err.is_fatal());
        assert!(store.get_root(owner).is_some());

        store.set_active(true);
        engine.drop_container().unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.get_root(owner), None);
    }

    #[test]
    fn test_cow_clone_path_rewrites_shared_path() {
        let store = store();
        let mut first = TreeEngine::create(Arc::clone(&store), CopyOnWriteDiscipline, small(), Uuid::new_v4()).unwrap();
        for v in 0..60 {
            first.push(v).unwrap();
        }
        assert!(first.height().unwrap() >= 3);

        let second = first.fork(Uuid::new_v4()).unwrap();
        let (mut path, _) = second.locate(0).unwrap();
        let old: Vec<_> = path.iter().map(|n| n.id).collect();
        second.cow_clone_path(&mut path, 0).unwrap();

        for (level, old_id) in old.iter().enumerate() {
            let new_id = path.id(level);
            assert_ne!(*old_id, new_id);
            assert_eq!(store.ref_count(new_id).unwrap(), 1);
            // still held by the first snapshot
            assert_eq!(store.ref_count(*old_id).unwrap(), 1);
        }
        assert_eq!(store.get_root(second.owner()), Some(path.root()));
        assert_eq!(first.root_id().unwrap(), old[old.len() - 1]);

        second.check().unwrap();
        first.check().unwrap();
        assert_eq!(first.entries().unwrap(), second.entries().unwrap());
    }

    #[test]
    fn test_cow_clone_path_is_noop_in_place() {
        let mut engine = TreeEngine::create(store(), InPlaceDiscipline, small(), Uuid::new_v4()).unwrap();
        for v in 0..30 {
            engine.push(v).unwrap();
        }
        let (mut path, _) = engine.locate(3).unwrap();
        let before = path.clone();
        engine.cow_clone_path(&mut path, 0).unwrap();
        assert_eq!(path, before);
    }

    #[test]
    fn test_remove_redundant_root_respects_budget() {
        let store = store();
        let owner = Uuid::new_v4();
        let engine = TreeEngine::create(Arc::clone(&store), InPlaceDiscipline, small(), owner).unwrap();
        let generation = engine.generation();

        // root branch over one leaf of 8 values, more than the 6-value root budget
        let leaf = store.create_block(Block::leaf(generation, (0..8).collect()), owner).unwrap();
        let old_root = engine.root_id().unwrap();
        let mut root = (*store.get_block(old_root).unwrap()).clone();
        root.body = crate::store::NodeBody::Branch {
            children: vec![leaf],
            entries: vec![BranchEntry::new(8, 28)],
        };
        store.update_block(root).unwrap();

        let (mut path, _) = engine.locate(0).unwrap();
        engine.remove_redundant_root(&mut path, 0).unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(engine.root_id().unwrap(), old_root);

        // shrink the leaf so it fits, then collapse
        let mut small_leaf = (*store.get_block(leaf).unwrap()).clone();
        small_leaf.body = crate::store::NodeBody::Leaf { values: vec![1, 2] };
        store.update_block(small_leaf).unwrap();
        let mut root = (*store.get_block(old_root).unwrap()).clone();
        root.set_entry(0, BranchEntry::new(2, 3)).unwrap();
        store.update_block(root).unwrap();

        engine.remove_redundant_root(&mut path, 0).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(engine.root_id().unwrap(), leaf);
        assert!(!store.contains(old_root));
        assert!(store.get_block(leaf).unwrap().is_root());
        engine.check().unwrap();
    }
}
