//! Tree maintenance engine.
//!
//! A container is a B+tree of fixed-size blocks. Leaves hold `u64` values;
//! branches hold child ids with a per-child [`BranchEntry`](crate::store::BranchEntry)
//! of entry count and value sum. The engine keeps those entries exact through
//! splits, merges, root growth and root collapse, under either an in-place or
//! a copy-on-write [`Discipline`].

pub mod discipline;
pub mod engine;
pub mod merge;
pub mod path;
pub mod sequence;
pub mod split;

pub use discipline::{CopyOnWriteDiscipline, Discipline, InPlaceDiscipline};
pub use engine::{TreeEngine, TreeSummary};
pub use path::{PathNode, TreePath};
pub use split::{SplitResult, SplitSide};
