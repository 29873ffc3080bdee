//! Free-space management for block addresses.

pub mod metadata;
pub mod pool;

pub use metadata::AllocationMetadata;
pub use pool::{AllocationPool, MAX_POOL_LEVELS, PoolSnapshot};
