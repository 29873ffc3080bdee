//! cowtree - copy-on-write B+tree storage core
//!
//! Fixed-size blocks addressed through a hierarchical allocation pool, read
//! through a two-queue cache, and organised into trees that stay valid under
//! in-place or copy-on-write mutation.

pub mod alloc;
pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod tree;

pub use alloc::{AllocationMetadata, AllocationPool};
pub use cache::{QueueTag, TwoQueueCache};
pub use config::{CacheConfig, EngineConfig, PoolConfig, TreeConfig};
pub use error::{TreeError, TreeResult};
pub use store::{Block, BlockId, BlockStore, MemoryBlockStore};
pub use tree::{CopyOnWriteDiscipline, Discipline, InPlaceDiscipline, TreeEngine, TreePath};
