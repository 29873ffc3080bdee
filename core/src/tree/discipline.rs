//! Storage disciplines: how the engine treats blocks it wants to mutate.

use crate::error::TreeResult;
use crate::store::{Block, BlockId, BlockStore};

/// Mutation policy injected into [`TreeEngine`](super::TreeEngine).
pub trait Discipline: Clone + Send + Sync {
    fn is_copy_on_write(&self) -> bool;

    /// Whether a writer at `generation` may modify `block` without cloning it.
    fn is_mutable(&self, block: &Block, generation: u64) -> bool;

    /// Record a new referrer of `id`.
    fn acquire<S: BlockStore + ?Sized>(&self, store: &S, id: BlockId) -> TreeResult<()>;

    /// Drop a referrer of `id`. Returns `true` when the caller must reclaim the block.
    fn release<S: BlockStore + ?Sized>(&self, store: &S, id: BlockId) -> TreeResult<bool>;
}

/// Blocks are exclusively owned and mutated where they stand.
#[derive(Debug, Clone, Copy, Default)]
pub struct InPlaceDiscipline;

impl Discipline for InPlaceDiscipline {
    fn is_copy_on_write(&self) -> bool {
        false
    }

    fn is_mutable(&self, _block: &Block, _generation: u64) -> bool {
        true
    }

    fn acquire<S: BlockStore + ?Sized>(&self, _store: &S, _id: BlockId) -> TreeResult<()> {
        Ok(())
    }

    fn release<S: BlockStore + ?Sized>(&self, _store: &S, _id: BlockId) -> TreeResult<bool> {
        Ok(true)
    }
}

/// Blocks from earlier generations are shared and cloned before mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOnWriteDiscipline;

impl Discipline for CopyOnWriteDiscipline {
    fn is_copy_on_write(&self) -> bool {
        true
    }

    fn is_mutable(&self, block: &Block, generation: u64) -> bool {
        block.generation == generation
    }

    fn acquire<S: BlockStore + ?Sized>(&self, store: &S, id: BlockId) -> TreeResult<()> {
        store.ref_block(id)?;
        Ok(())
    }

    fn release<S: BlockStore + ?Sized>(&self, store: &S, id: BlockId) -> TreeResult<bool> {
        Ok(store.unref_block(id)? == 0)
    }
}
