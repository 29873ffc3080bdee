//! Block residency cache.

pub mod two_queue;

pub use two_queue::{CacheEntry, CacheStats, QueueTag, TwoQueueCache};
