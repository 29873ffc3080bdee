//! Hierarchical allocation pool.
//!
//! Free ranges are kept in one bucket per power-of-two level. Requests at a
//! fine level that the level itself cannot cover borrow whole or partial
//! runs from coarser levels, converting them down on the way.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::AllocationMetadata;
use super::metadata::scale_units;
use crate::error::{TreeError, TreeResult};

/// Deepest pool supported; level `L` units cover `2^L` level-0 units.
pub const MAX_POOL_LEVELS: usize = 64;

/// Free runs for a single level plus their running total.
#[derive(Debug, Default, Clone)]
struct LevelBucket {
    entries: VecDeque<AllocationMetadata>,
    total: u64,
}

impl LevelBucket {
    fn computed_total(&self) -> u64 {
        self.entries.iter().map(|meta| meta.size).sum()
    }
}

/// Serializable image of a pool, one list of runs per level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub levels: Vec<Vec<AllocationMetadata>>,
}

/// Multi-level free-space manager.
#[derive(Debug, Clone)]
pub struct AllocationPool {
    levels: Vec<LevelBucket>,
}

impl AllocationPool {
    /// Create an empty pool with `levels` granularity levels, clamped to
    /// `1..=MAX_POOL_LEVELS`.
    pub fn new(levels: usize) -> Self {
        Self {
            levels: vec![LevelBucket::default(); levels.clamp(1, MAX_POOL_LEVELS)],
        }
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    /// Running total (in level units) for `level`.
    pub fn total(&self, level: usize) -> u64 {
        self.levels.get(level).map(|b| b.total).unwrap_or(0)
    }

    /// Number of runs queued at `level`.
    pub fn len(&self, level: usize) -> usize {
        self.levels.get(level).map(|b| b.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|b| b.entries.is_empty())
    }

    /// Everything in the pool, scaled to level-0 units.
    pub fn total_level0(&self) -> u64 {
        self.levels
            .iter()
            .enumerate()
            .map(|(level, bucket)| scale_units(bucket.total, level))
            .fold(0, u64::saturating_add)
    }

    /// Units reachable from the levels above `level`, scaled to `level`.
    pub fn compute_reachable(&self, level: usize) -> u64 {
        self.levels
            .iter()
            .enumerate()
            .skip(level + 1)
            .map(|(ll, bucket)| scale_units(bucket.total, ll - level))
            .fold(0, u64::saturating_add)
    }

    /// Append a run to the bucket for its level.
    pub fn add(&mut self, meta: AllocationMetadata) -> TreeResult<()> {
        let levels = self.levels.len();
        let bucket = self.levels.get_mut(meta.level).ok_or_else(|| {
            TreeError::InvalidState(format!(
                "allocation level {} exceeds pool depth {}",
                meta.level, levels
            ))
        })?;

        bucket.total += meta.size;
        bucket.entries.push_back(meta);
        Ok(())
    }

    /// Serve exactly `amount` units at `level`, appending the runs to `out`.
    ///
    /// Returns `Ok(false)` without touching the pool when the request cannot
    /// be satisfied even after borrowing from coarser levels.
    pub fn allocate(
        &mut self,
        level: usize,
        amount: u64,
        out: &mut Vec<AllocationMetadata>,
    ) -> TreeResult<bool> {
        if level >= self.levels.len() {
            return Ok(false);
        }
        if amount == 0 {
            return Ok(true);
        }

        let available = self.levels[level].total;
        if available < amount && !self.populate_level_from_above(level, amount - available)? {
            return Ok(false);
        }

        let bucket = &mut self.levels[level];
        let mut remaining = amount;

        while remaining > 0 {
            let Some(front) = bucket.entries.front_mut() else {
                break;
            };

            if front.size <= remaining {
                let meta = *front;
                bucket.entries.pop_front();
                bucket.total -= meta.size;
                remaining -= meta.size;
                out.push(meta);
            } else {
                let prefix = front.take(remaining);
                bucket.total -= remaining;
                remaining = 0;
                out.push(prefix);
            }
        }

        if remaining > 0 {
            return Err(TreeError::Structural(format!(
                "level {} total claimed {} units but its bucket ran dry {} units short",
                level, available, remaining
            )));
        }

        self.check_level(level)?;
        Ok(true)
    }

    /// Allocate a single unit at `level`.
    pub fn allocate_one(&mut self, level: usize) -> TreeResult<Option<AllocationMetadata>> {
        let mut out = Vec::with_capacity(1);
        if self.allocate(level, 1, &mut out)? {
            Ok(out.pop())
        } else {
            Ok(None)
        }
    }

    /// Move at least `amount` units (at `level` granularity) down from the
    /// levels above. Nothing moves if the levels above cannot cover it.
    pub fn populate_level_from_above(&mut self, level: usize, amount: u64) -> TreeResult<bool> {
        let reachable = self.compute_reachable(level);
        if reachable < amount {
            tracing::warn!(
                level,
                amount,
                reachable,
                "not enough space above level to borrow"
            );
            return Ok(false);
        }

        let mut remaining = amount;
        let mut moved = Vec::new();

        for upper in level + 1..self.levels.len() {
            if remaining == 0 {
                break;
            }

            let scale = scale_units(1, upper - level);
            let bucket = &mut self.levels[upper];

            while remaining > 0 {
                let Some(front) = bucket.entries.front_mut() else {
                    break;
                };

                let scaled = front.size.saturating_mul(scale);
                if scaled <= remaining {
                    let meta = *front;
                    bucket.entries.pop_front();
                    bucket.total -= meta.size;
                    remaining -= scaled;
                    moved.push(meta.as_level(level));
                } else {
                    let units = remaining.div_ceil(scale);
                    let prefix = front.take(units);
                    if front.is_empty() {
                        bucket.entries.pop_front();
                    }
                    bucket.total -= units;
                    remaining = 0;
                    moved.push(prefix.as_level(level));
                }
            }
        }

        tracing::debug!(level, amount, runs = moved.len(), "borrowed space from upper levels");

        for meta in moved {
            self.add(meta)?;
        }

        for ll in level..self.levels.len() {
            self.check_level(ll)?;
        }

        Ok(true)
    }

    /// Recompute the running total for `level` from its bucket.
    pub fn refresh(&mut self, level: usize) {
        if let Some(bucket) = self.levels.get_mut(level) {
            bucket.total = bucket.computed_total();
        }
    }

    /// Direct access to a level's bucket. Call [`refresh`](Self::refresh) afterwards.
    pub fn bucket_mut(&mut self, level: usize) -> Option<&mut VecDeque<AllocationMetadata>> {
        self.levels.get_mut(level).map(|b| &mut b.entries)
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.levels {
            bucket.entries.clear();
            bucket.total = 0;
        }
    }

    pub fn reset(&mut self) {
        self.clear();
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&AllocationMetadata),
    {
        for bucket in &self.levels {
            for meta in &bucket.entries {
                f(meta);
            }
        }
    }

    /// Verify that a level's running total matches its bucket.
    pub fn check_level(&self, level: usize) -> TreeResult<()> {
        let Some(bucket) = self.levels.get(level) else {
            return Ok(());
        };

        let computed = bucket.computed_total();
        if computed != bucket.total {
            return Err(TreeError::Structural(format!(
                "allocation level {} records {} units but holds {}",
                level, bucket.total, computed
            )));
        }
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            levels: self
                .levels
                .iter()
                .map(|b| b.entries.iter().copied().collect())
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: &PoolSnapshot) -> TreeResult<Self> {
        let mut pool = AllocationPool::new(snapshot.levels.len());
        for (level, runs) in snapshot.levels.iter().enumerate() {
            for meta in runs {
                if meta.level != level {
                    return Err(TreeError::Serialization(format!(
                        "run {} stored under level {}",
                        meta, level
                    )));
                }
                pool.add(*meta)?;
            }
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_borrow_whole_run_from_above() {
        let mut pool = AllocationPool::new(4);
        pool.add(AllocationMetadata::new(0, 4, 2)).unwrap();

        let mut out = Vec::new();
        assert!(pool.allocate(0, 16, &mut out).unwrap());

        let served: u64 = out.iter().map(|m| m.size).sum();
        assert_eq!(served, 16);
        assert!(out.iter().all(|m| m.level == 0));
        assert!(pool.is_empty());
        assert_eq!(pool.total_level0(), 0);
    }

    #[test]
    fn test_greedy_drain_splits_last_run() {
        let mut pool = AllocationPool::new(2);
        pool.add(AllocationMetadata::new(0, 3, 0)).unwrap();
        pool.add(AllocationMetadata::new(10, 5, 0)).unwrap();

        let mut out = Vec::new();
        assert!(pool.allocate(0, 5, &mut out).unwrap());

        assert_eq!(
            out,
            vec![
                AllocationMetadata::new(0, 3, 0),
                AllocationMetadata::new(10, 2, 0)
            ]
        );
        assert_eq!(pool.total(0), 3);
        assert_eq!(pool.len(0), 1);
        assert!(pool.check_level(0).is_ok());
    }

    #[test]
    fn test_partial_borrow_leaves_remainder_at_level() {
        let mut pool = AllocationPool::new(3);
        pool.add(AllocationMetadata::new(0, 1, 0)).unwrap();
        pool.add(AllocationMetadata::new(32, 3, 2)).unwrap();

        let mut out = Vec::new();
        assert!(pool.allocate(0, 6, &mut out).unwrap());

        // 5 more units were needed, two level-2 units (8 at level 0) moved down
        assert_eq!(pool.total(2), 1);
        assert_eq!(pool.total(0), 3);
        assert_eq!(pool.total_level0(), 4 + 3);
        assert_eq!(out.iter().map(|m| m.size).sum::<u64>(), 6);
    }

    #[test]
    fn test_borrow_walks_several_levels() {
        let mut pool = AllocationPool::new(4);
        pool.add(AllocationMetadata::new(0, 1, 1)).unwrap();
        pool.add(AllocationMetadata::new(8, 1, 3)).unwrap();

        assert!(pool.populate_level_from_above(0, 5).unwrap());
        assert_eq!(pool.total(1), 0);
        assert_eq!(pool.total(3), 0);
        assert_eq!(pool.total(0), 10);
    }

    #[test]
    fn test_insufficient_leaves_pool_untouched() {
        let mut pool = AllocationPool::new(3);
        pool.add(AllocationMetadata::new(0, 2, 0)).unwrap();
        pool.add(AllocationMetadata::new(8, 1, 2)).unwrap();
        let before = pool.snapshot();

        let mut out = Vec::new();
        assert!(!pool.allocate(0, 7, &mut out).unwrap());
        assert!(out.is_empty());
        assert_eq!(pool.snapshot(), before);

        assert!(!pool.populate_level_from_above(0, 5).unwrap());
        assert_eq!(pool.snapshot(), before);
    }

    #[test]
    fn test_allocate_one() {
        let mut pool = AllocationPool::new(2);
        assert_eq!(pool.allocate_one(0).unwrap(), None);

        pool.add(AllocationMetadata::new(4, 1, 1)).unwrap();
        let first = pool.allocate_one(0).unwrap().unwrap();
        let second = pool.allocate_one(0).unwrap().unwrap();
        assert_eq!(first, AllocationMetadata::new(4, 1, 0));
        assert_eq!(second, AllocationMetadata::new(5, 1, 0));
        assert_eq!(pool.allocate_one(0).unwrap(), None);
    }

    #[test]
    fn test_refresh_after_external_mutation() {
        let mut pool = AllocationPool::new(2);
        pool.add(AllocationMetadata::new(0, 4, 0)).unwrap();

        pool.bucket_mut(0)
            .unwrap()
            .push_back(AllocationMetadata::new(4, 2, 0));
        assert!(pool.check_level(0).unwrap_err().is_fatal());

        pool.refresh(0);
        assert_eq!(pool.total(0), 6);
        assert!(pool.check_level(0).is_ok());
    }

    #[test]
    fn test_add_rejects_unknown_level() {
        let mut pool = AllocationPool::new(2);
        assert!(pool.add(AllocationMetadata::new(0, 1, 5)).is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut pool = AllocationPool::new(3);
        pool.add(AllocationMetadata::new(0, 3, 0)).unwrap();
        pool.add(AllocationMetadata::new(16, 2, 2)).unwrap();

        let json = serde_json::to_string(&pool.snapshot()).unwrap();
        let snapshot: PoolSnapshot = serde_json::from_str(&json).unwrap();
        let restored = AllocationPool::from_snapshot(&snapshot).unwrap();

        assert_eq!(restored.total(0), 3);
        assert_eq!(restored.total(2), 2);
        assert_eq!(restored.total_level0(), pool.total_level0());
    }

    #[test]
    fn test_deepest_levels_do_not_overflow() {
        let mut pool = AllocationPool::new(65);
        assert_eq!(pool.levels(), MAX_POOL_LEVELS);
        assert!(pool.add(AllocationMetadata::new(0, 1, 64)).is_err());

        pool.add(AllocationMetadata::new(0, 1, 63)).unwrap();
        assert_eq!(pool.compute_reachable(0), 1 << 63);
        pool.add(AllocationMetadata::new(1 << 63, 1, 63)).unwrap();
        assert_eq!(pool.compute_reachable(0), u64::MAX);
        assert_eq!(pool.total_level0(), u64::MAX);

        let first = pool.allocate_one(0).unwrap().unwrap();
        assert_eq!(first, AllocationMetadata::new(0, 1, 0));
        assert_eq!(pool.total(0), (1 << 63) - 1);
        assert_eq!(pool.total(63), 1);
    }

    #[test]
    fn test_conservation_under_random_workload() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut pool = AllocationPool::new(5);
        let mut added = 0u64;
        let mut allocated = 0u64;
        let mut next_start = 0u64;

        for _ in 0..500 {
            if rng.gen_bool(0.4) {
                let level = rng.gen_range(0..5);
                let size = rng.gen_range(1..6u64);
                pool.add(AllocationMetadata::new(next_start, size, level))
                    .unwrap();
                next_start += size << level;
                added += size << level;
            } else {
                let level = rng.gen_range(0..3);
                let amount = rng.gen_range(1..9u64);
                let mut out = Vec::new();
                if pool.allocate(level, amount, &mut out).unwrap() {
                    let served: u64 = out.iter().map(|m| m.size).sum();
                    assert_eq!(served, amount);
                    allocated += out.iter().map(|m| m.size_at_level0()).sum::<u64>();
                } else {
                    assert!(out.is_empty());
                }
            }

            for level in 0..pool.levels() {
                pool.check_level(level).unwrap();
            }
            assert_eq!(added, allocated + pool.total_level0());
        }
    }
}
