//! Positional sequence operations driving the structural algorithms.

use super::discipline::Discipline;
use super::engine::TreeEngine;
use crate::error::{TreeError, TreeResult};
use crate::store::BlockStore;

impl<S: BlockStore, D: Discipline> TreeEngine<S, D> {
    /// Number of entries in the container.
    pub fn len(&self) -> TreeResult<u64> {
        Ok(self.load(self.root_id()?)?.aggregate().size)
    }

    pub fn is_empty(&self) -> TreeResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Wrapping sum of all entries.
    pub fn sum(&self) -> TreeResult<u64> {
        Ok(self.load(self.root_id()?)?.aggregate().sum)
    }

    pub fn height(&self) -> TreeResult<usize> {
        let mut height = 1;
        let mut node = self.load(self.root_id()?)?;
        while let Some(child) = node.child(0) {
            node = self.load(child)?;
            height += 1;
        }
        Ok(height)
    }

    pub fn get(&self, index: u64) -> TreeResult<Option<u64>> {
        if index >= self.len()? {
            return Ok(None);
        }
        let (path, local) = self.locate(index)?;
        Ok(self.load(path.leaf())?.values().get(local).copied())
    }

    /// Wrapping sum of the first `end` entries.
    pub fn prefix_sum(&self, end: u64) -> TreeResult<u64> {
        let mut node = self.load(self.root_id()?)?;
        let mut remaining = end;
        let mut total = 0u64;
        loop {
            if node.is_leaf() {
                let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(node.len());
                return Ok(node.values()[..take]
                    .iter()
                    .fold(total, |acc, v| acc.wrapping_add(*v)));
            }

            let mut next = None;
            for (i, entry) in node.entries().iter().enumerate() {
                if remaining < entry.size {
                    next = node.child(i);
                    break;
                }
                total = total.wrapping_add(entry.sum);
                remaining -= entry.size;
            }
            match next {
                Some(child) => node = self.load(child)?,
                None => return Ok(total),
            }
        }
    }

    /// All entries in order.
    pub fn entries(&self) -> TreeResult<Vec<u64>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root_id()?];
        while let Some(id) = stack.pop() {
            let block = self.load(id)?;
            if block.is_leaf() {
                out.extend_from_slice(block.values());
            } else {
                stack.extend(block.children().iter().rev());
            }
        }
        Ok(out)
    }

    /// Insert `value` so that it ends up at position `index`.
    pub fn insert(&mut self, index: u64, value: u64) -> TreeResult<()> {
        let (mut path, mut local) = self.locate(index)?;
        self.cow_clone_path(&mut path, 0)?;

        if self.load(path.leaf())?.is_full(&self.config) {
            local = self.split(&mut path, 0, local)?.index;
        }

        let mut leaf = self.load_mut(path.leaf())?;
        leaf.insert_value(local, value)?;
        self.save(leaf)?;
        self.update_path(&path, 0)
    }

    pub fn push(&mut self, value: u64) -> TreeResult<()> {
        let len = self.len()?;
        self.insert(len, value)
    }

    /// Remove and return the entry at `index`.
    pub fn remove(&mut self, index: u64) -> TreeResult<u64> {
        let len = self.len()?;
        if index >= len {
            return Err(TreeError::IndexOutOfBounds { index, len });
        }

        let (mut path, local) = self.locate(index)?;
        self.cow_clone_path(&mut path, 0)?;

        let mut leaf = self.load_mut(path.leaf())?;
        let value = leaf.remove_value(local)?;
        self.save(leaf)?;
        self.update_path(&path, 0)?;

        self.rebalance(&mut path)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use crate::config::{CacheConfig, PoolConfig, TreeConfig};
    use crate::error::TreeError;
    use crate::store::MemoryBlockStore;
    use crate::tree::{InPlaceDiscipline, TreeEngine};

    fn engine() -> TreeEngine<MemoryBlockStore, InPlaceDiscipline> {
        let store = Arc::new(MemoryBlockStore::new(
            &CacheConfig::default(),
            &PoolConfig::default(),
        ));
        let config = TreeConfig {
            block_size: 88,
            header_size: 16,
            root_metadata_size: 24,
        };
        TreeEngine::create(store, InPlaceDiscipline, config, Uuid::new_v4()).unwrap()
    }

    #[test]
    fn test_insert_middle_and_read_back() {
        let mut engine = engine();
        let mut expected = Vec::new();
        for v in 0..50u64 {
            let at = (v * 7) % (expected.len() as u64 + 1);
            engine.insert(at, v).unwrap();
            expected.insert(at as usize, v);
        }

        assert_eq!(engine.entries().unwrap(), expected);
        for (i, v) in expected.iter().enumerate() {
            assert_eq!(engine.get(i as u64).unwrap(), Some(*v));
        }
        assert_eq!(engine.get(50).unwrap(), None);
        engine.check().unwrap();
    }

    #[test]
    fn test_sums() {
        let mut engine = engine();
        for v in 1..=40 {
            engine.push(v).unwrap();
        }
        assert_eq!(engine.sum().unwrap(), 820);
        assert_eq!(engine.prefix_sum(0).unwrap(), 0);
        assert_eq!(engine.prefix_sum(10).unwrap(), 55);
        assert_eq!(engine.prefix_sum(40).unwrap(), 820);
        assert_eq!(engine.prefix_sum(1000).unwrap(), 820);
    }

    #[test]
    fn test_remove_out_of_bounds() {
        let mut engine = engine();
        engine.push(1).unwrap();
        assert_eq!(engine.remove(0).unwrap(), 1);
        assert!(engine.is_empty().unwrap());
        assert!(matches!(
            engine.remove(0),
            Err(TreeError::IndexOutOfBounds { index: 0, len: 0 })
        ));
        assert!(matches!(
            engine.insert(2, 5),
            Err(TreeError::IndexOutOfBounds { index: 2, len: 0 })
        ));
    }
}
