//! In-memory block store.
//!
//! Block addresses come from an [`AllocationPool`]; when the pool runs dry it
//! is grown by one extent at the configured growth level. Reads go through a
//! two-queue cache so scans over cold blocks do not evict hot ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::block::{Block, BlockId, OwnerId};
use super::traits::BlockStore;
use crate::alloc::{AllocationMetadata, AllocationPool};
use crate::cache::{CacheStats, TwoQueueCache};
use crate::config::{CacheConfig, EngineConfig, PoolConfig};
use crate::error::{TreeError, TreeResult};

struct StoreInner {
    blocks: HashMap<BlockId, Arc<Block>>,
    refs: HashMap<BlockId, u64>,
    owners: HashMap<BlockId, OwnerId>,
    roots: HashMap<OwnerId, BlockId>,
    pool: AllocationPool,
    growth_level: usize,
    /// Next level-0 address not yet handed to the pool
    high_water: u64,
}

impl StoreInner {
    fn allocate_id(&mut self) -> TreeResult<BlockId> {
        if let Some(meta) = self.pool.allocate_one(0)? {
            return Ok(BlockId(meta.start));
        }

        let extent = AllocationMetadata::new(self.high_water, 1, self.growth_level);
        let next = extent.limit();
        if next == u64::MAX {
            return Err(TreeError::OutOfSpace("block address space exhausted".into()));
        }
        self.pool.add(extent)?;
        self.high_water = next;
        tracing::debug!(
            start = extent.start,
            level = extent.level,
            units = extent.size_at_level0(),
            "grew allocation pool"
        );

        match self.pool.allocate_one(0)? {
            Some(meta) => Ok(BlockId(meta.start)),
            None => Err(TreeError::OutOfSpace(
                "allocation pool empty after growth".into(),
            )),
        }
    }

    fn release_id(&mut self, id: BlockId) -> TreeResult<()> {
        self.pool.add(AllocationMetadata::new(id.0, 1, 0))
    }
}

/// Point-in-time counters for a [`MemoryBlockStore`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub blocks: usize,
    pub roots: usize,
    pub free_units: u64,
    pub reserved_units: u64,
    pub physical_reads: u64,
    pub cache: CacheStats,
}

pub struct MemoryBlockStore {
    inner: Mutex<StoreInner>,
    cache: Mutex<TwoQueueCache<BlockId, Arc<Block>>>,
    active: AtomicBool,
    generation: AtomicU64,
    physical_reads: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new(cache: &CacheConfig, pool: &PoolConfig) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                blocks: HashMap::new(),
                refs: HashMap::new(),
                owners: HashMap::new(),
                roots: HashMap::new(),
                pool: AllocationPool::new(pool.levels),
                growth_level: pool.effective_growth_level(),
                high_water: 0,
            }),
            cache: Mutex::new(TwoQueueCache::from_config(cache)),
            active: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            physical_reads: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.cache, &config.pool)
    }

    /// Mark the store read-only (`false`) or writable (`true`).
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.inner.lock().blocks.contains_key(&id)
    }

    /// Ids of every live block, in address order.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<_> = self.inner.lock().blocks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn owner_of(&self, id: BlockId) -> Option<OwnerId> {
        self.inner.lock().owners.get(&id).copied()
    }

    /// Free level-0 units currently held by the pool.
    pub fn pool_level0_total(&self) -> u64 {
        self.inner.lock().pool.total_level0()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    pub fn stats(&self) -> StoreStats {
        let (blocks, roots, free_units, reserved_units) = {
            let inner = self.inner.lock();
            (
                inner.blocks.len(),
                inner.roots.len(),
                inner.pool.total_level0(),
                inner.high_water,
            )
        };
        StoreStats {
            blocks,
            roots,
            free_units,
            reserved_units,
            physical_reads: self.physical_reads.load(Ordering::Relaxed),
            cache: self.cache_stats(),
        }
    }

    fn cache_block(&self, id: BlockId, block: Arc<Block>) {
        let mut cache = self.cache.lock();
        cache.insert(id, block);
        cache.attach(&id, |ghost, entry| {
            if ghost {
                tracing::trace!(block = %entry.key(), "block demoted to ghost queue");
            } else {
                tracing::trace!(block = %entry.key(), "block evicted from cache");
            }
        });
    }
}

impl BlockStore for MemoryBlockStore {
    fn create_block(&self, mut block: Block, owner: OwnerId) -> TreeResult<BlockId> {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.allocate_id()?;
            block.id = id;
            inner.blocks.insert(id, Arc::new(block));
            inner.refs.insert(id, 0);
            inner.owners.insert(id, owner);
            id
        };
        tracing::trace!(block = %id, %owner, "created block");
        Ok(id)
    }

    fn clone_block(&self, existing: BlockId, owner: OwnerId) -> TreeResult<BlockId> {
        let source = self.get_block(existing)?;
        let copy = (*source).clone();
        let id = self.create_block(copy, owner)?;
        tracing::trace!(from = %existing, to = %id, "cloned block");
        Ok(id)
    }

    fn get_block(&self, id: BlockId) -> TreeResult<Arc<Block>> {
        {
            let mut cache = self.cache.lock();
            let hit = cache.get(&id).map(|entry| Arc::clone(entry.value()));
            if let Some(block) = hit {
                cache.attach(&id, |_, entry| {
                    tracing::trace!(block = %entry.key(), "block left cache");
                });
                return Ok(block);
            }
        }

        let block = {
            let inner = self.inner.lock();
            inner
                .blocks
                .get(&id)
                .cloned()
                .ok_or(TreeError::BlockNotFound(id))?
        };
        self.physical_reads.fetch_add(1, Ordering::Relaxed);
        self.cache_block(id, Arc::clone(&block));
        Ok(block)
    }

    fn update_block(&self, block: Block) -> TreeResult<()> {
        let id = block.id;
        let block = Arc::new(block);
        {
            let mut inner = self.inner.lock();
            match inner.blocks.get_mut(&id) {
                Some(slot) => *slot = Arc::clone(&block),
                None => return Err(TreeError::BlockNotFound(id)),
            }
        }

        let mut cache = self.cache.lock();
        if cache.has_entry(&id) {
            cache.insert(id, block);
        }
        Ok(())
    }

    fn remove_block(&self, id: BlockId) -> TreeResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.blocks.remove(&id).is_none() {
                return Err(TreeError::BlockNotFound(id));
            }
            inner.refs.remove(&id);
            inner.owners.remove(&id);
            inner.release_id(id)?;
        }
        self.cache.lock().remove(&id);
        tracing::trace!(block = %id, "removed block");
        Ok(())
    }

    fn ref_block(&self, id: BlockId) -> TreeResult<u64> {
        let mut inner = self.inner.lock();
        let count = inner.refs.get_mut(&id).ok_or(TreeError::BlockNotFound(id))?;
        *count += 1;
        tracing::trace!(block = %id, refs = *count, "ref");
        Ok(*count)
    }

    fn unref_block(&self, id: BlockId) -> TreeResult<u64> {
        let mut inner = self.inner.lock();
        let count = inner.refs.get_mut(&id).ok_or(TreeError::BlockNotFound(id))?;
        if *count == 0 {
            return Err(TreeError::RefCount(format!(
                "unref of block {} with no references",
                id
            )));
        }
        *count -= 1;
        tracing::trace!(block = %id, refs = *count, "unref");
        Ok(*count)
    }

    fn ref_count(&self, id: BlockId) -> TreeResult<u64> {
        self.inner
            .lock()
            .refs
            .get(&id)
            .copied()
            .ok_or(TreeError::BlockNotFound(id))
    }

    fn get_root(&self, owner: OwnerId) -> Option<BlockId> {
        self.inner.lock().roots.get(&owner).copied()
    }

    fn set_root(&self, owner: OwnerId, root: Option<BlockId>) {
        let mut inner = self.inner.lock();
        match root {
            Some(id) => {
                inner.roots.insert(owner, id);
            }
            None => {
                inner.roots.remove(&owner);
            }
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store() -> MemoryBlockStore {
        MemoryBlockStore::new(
            &CacheConfig {
                am_capacity: 4,
                a1_in_capacity: Some(2),
                a1_out_capacity: Some(4),
            },
            &PoolConfig {
                levels: 3,
                growth_level: None,
            },
        )
    }

    #[test]
    fn test_create_grows_pool_by_extent() {
        let store = store();
        let owner = Uuid::new_v4();

        let a = store.create_block(Block::leaf(1, vec![1]), owner).unwrap();
        assert_eq!(a, BlockId(0));
        // one level-2 extent is four units, one handed out
        assert_eq!(store.pool_level0_total(), 3);

        for _ in 0..3 {
            store.create_block(Block::leaf(1, vec![]), owner).unwrap();
        }
        assert_eq!(store.pool_level0_total(), 0);

        let e = store.create_block(Block::leaf(1, vec![]), owner).unwrap();
        assert_eq!(e, BlockId(4));
        assert_eq!(store.pool_level0_total(), 3);
        assert_eq!(store.block_count(), 5);
        assert_eq!(store.owner_of(e), Some(owner));
    }

    #[test]
    fn test_remove_returns_unit_to_pool() {
        let store = store();
        let owner = Uuid::new_v4();
        let a = store.create_block(Block::leaf(1, vec![]), owner).unwrap();
        let before = store.pool_level0_total();

        store.remove_block(a).unwrap();
        assert_eq!(store.pool_level0_total(), before + 1);
        assert!(matches!(
            store.get_block(a),
            Err(TreeError::BlockNotFound(id)) if id == a
        ));
        assert!(store.remove_block(a).is_err());
    }

    #[test]
    fn test_update_visible_through_cache() {
        let store = store();
        let owner = Uuid::new_v4();
        let id = store.create_block(Block::leaf(1, vec![1, 2]), owner).unwrap();

        assert_eq!(store.get_block(id).unwrap().values(), &[1, 2]);
        let mut block = (*store.get_block(id).unwrap()).clone();
        block.insert_value(2, 3).unwrap();
        store.update_block(block).unwrap();

        assert_eq!(store.get_block(id).unwrap().values(), &[1, 2, 3]);
        let stats = store.cache_stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_clone_copies_contents() {
        let store = store();
        let owner = Uuid::new_v4();
        let id = store.create_block(Block::leaf(3, vec![9, 8]), owner).unwrap();
        let copy = store.clone_block(id, owner).unwrap();

        assert_ne!(id, copy);
        let block = store.get_block(copy).unwrap();
        assert_eq!(block.id, copy);
        assert_eq!(block.values(), &[9, 8]);
        assert_eq!(store.ref_count(copy).unwrap(), 0);
    }

    #[test]
    fn test_ref_counting() {
        let store = store();
        let id = store
            .create_block(Block::leaf(1, vec![]), Uuid::new_v4())
            .unwrap();

        assert_eq!(store.ref_block(id).unwrap(), 1);
        assert_eq!(store.ref_block(id).unwrap(), 2);
        assert_eq!(store.unref_block(id).unwrap(), 1);
        assert_eq!(store.unref_block(id).unwrap(), 0);
        assert!(matches!(store.unref_block(id), Err(TreeError::RefCount(_))));
        assert!(matches!(
            store.ref_block(BlockId(99)),
            Err(TreeError::BlockNotFound(_))
        ));
    }

    #[test]
    fn test_oversized_pool_config_is_clamped() {
        let store = MemoryBlockStore::new(
            &CacheConfig::default(),
            &PoolConfig {
                levels: 65,
                growth_level: None,
            },
        );
        let owner = Uuid::new_v4();

        assert_eq!(store.create_block(Block::leaf(1, vec![]), owner).unwrap(), BlockId(0));
        assert_eq!(store.create_block(Block::leaf(1, vec![]), owner).unwrap(), BlockId(1));
        assert_eq!(store.pool_level0_total(), (1 << 63) - 2);
    }

    #[test]
    fn test_roots_and_generations() {
        let store = store();
        let owner = Uuid::new_v4();
        assert_eq!(store.get_root(owner), None);

        store.set_root(owner, Some(BlockId(3)));
        assert_eq!(store.get_root(owner), Some(BlockId(3)));
        store.set_root(owner, None);
        assert_eq!(store.get_root(owner), None);

        let g1 = store.next_generation();
        let g2 = store.next_generation();
        assert!(g2 > g1);

        assert!(store.is_active());
        store.set_active(false);
        assert!(!store.is_active());
    }

    #[test]
    fn test_scan_does_not_flush_hot_blocks() {
        let store = store();
        let owner = Uuid::new_v4();
        let hot = store.create_block(Block::leaf(1, vec![1]), owner).unwrap();
        store.get_block(hot).unwrap();
        // pushes `hot` into the ghost queue; the next read promotes it
        let cold: Vec<_> = (0..3)
            .map(|_| store.create_block(Block::leaf(1, vec![]), owner).unwrap())
            .collect();
        for id in &cold {
            store.get_block(*id).unwrap();
        }
        store.get_block(hot).unwrap();
        let reads = store.stats().physical_reads;

        for _ in 0..20 {
            let id = store.create_block(Block::leaf(1, vec![]), owner).unwrap();
            store.get_block(id).unwrap();
        }
        let after_scan = store.stats().physical_reads;
        store.get_block(hot).unwrap();
        assert_eq!(store.stats().physical_reads, after_scan);
        assert!(after_scan > reads);
    }
}
