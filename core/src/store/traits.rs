use std::sync::Arc;

use super::block::{Block, BlockId, OwnerId};
use crate::error::TreeResult;

/// Block storage consumed by the tree engine.
///
/// Stores are shared between every snapshot of a container, so all methods
/// take `&self` and implementations synchronise internally.
pub trait BlockStore: Send + Sync {
    /// Persist a new block and assign it an id. The block starts with no references.
    fn create_block(&self, block: Block, owner: OwnerId) -> TreeResult<BlockId>;

    /// Copy an existing block's contents into a freshly allocated block.
    fn clone_block(&self, existing: BlockId, owner: OwnerId) -> TreeResult<BlockId>;

    fn get_block(&self, id: BlockId) -> TreeResult<Arc<Block>>;

    /// Replace the stored contents of `block.id`.
    fn update_block(&self, block: Block) -> TreeResult<()>;

    /// Physically remove a block, regardless of its reference count.
    fn remove_block(&self, id: BlockId) -> TreeResult<()>;

    /// Increment the reference count, returning the new count.
    fn ref_block(&self, id: BlockId) -> TreeResult<u64>;

    /// Decrement the reference count, returning the new count.
    fn unref_block(&self, id: BlockId) -> TreeResult<u64>;

    fn ref_count(&self, id: BlockId) -> TreeResult<u64>;

    fn get_root(&self, owner: OwnerId) -> Option<BlockId>;

    fn set_root(&self, owner: OwnerId, root: Option<BlockId>);

    /// Whether the store accepts destructive operations.
    fn is_active(&self) -> bool;

    /// Mint a generation number no writer has used yet.
    fn next_generation(&self) -> u64;
}
