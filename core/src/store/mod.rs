//! Block storage: the block model, the store interface and an in-memory store.

pub mod block;
pub mod memory;
pub mod traits;

pub use block::{Block, BlockId, BranchEntry, NodeBody, OwnerId, RootMetadata};
pub use memory::{MemoryBlockStore, StoreStats};
pub use traits::BlockStore;
