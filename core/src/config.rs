//! Engine configuration.
//!
//! Configuration is stored as JSON. A missing file falls back to defaults,
//! and a handful of `COWTREE_*` environment variables override the result.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::alloc::MAX_POOL_LEVELS;
use crate::error::{TreeError, TreeResult};

/// Bytes occupied by one leaf entry.
pub const LEAF_ENTRY_SIZE: usize = 8;

/// Bytes occupied by one branch entry (child id, size counter, sum).
pub const BRANCH_ENTRY_SIZE: usize = 24;

/// Block geometry used by the tree engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Fixed capacity of every block in bytes
    pub block_size: usize,
    /// Bytes reserved for the block header
    pub header_size: usize,
    /// Bytes reserved in the root block for container metadata
    pub root_metadata_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            header_size: 64,
            root_metadata_size: 128,
        }
    }
}

impl TreeConfig {
    /// Bytes available for payload in a non-root block.
    pub fn payload_budget(&self) -> usize {
        self.block_size.saturating_sub(self.header_size)
    }

    /// Bytes available for payload in the root block.
    pub fn root_payload_budget(&self) -> usize {
        self.payload_budget()
            .saturating_sub(self.root_metadata_size)
    }

    /// Maximum number of entries a leaf may hold.
    pub fn leaf_capacity(&self, is_root: bool) -> usize {
        let budget = if is_root {
            self.root_payload_budget()
        } else {
            self.payload_budget()
        };
        (budget / LEAF_ENTRY_SIZE).max(1)
    }

    /// Maximum number of children a branch may hold.
    pub fn branch_capacity(&self, is_root: bool) -> usize {
        let budget = if is_root {
            self.root_payload_budget()
        } else {
            self.payload_budget()
        };
        (budget / BRANCH_ENTRY_SIZE).max(2)
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.payload_budget() < 3 * BRANCH_ENTRY_SIZE {
            return Err(TreeError::Config(format!(
                "block_size {} leaves no room for three branch entries",
                self.block_size
            )));
        }
        if self.root_payload_budget() < 2 * BRANCH_ENTRY_SIZE {
            return Err(TreeError::Config(format!(
                "root_metadata_size {} leaves no room for two branch entries in the root",
                self.root_metadata_size
            )));
        }
        Ok(())
    }
}

/// Two-queue cache sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity of the hot (Am) queue
    pub am_capacity: usize,
    /// Capacity of the probationary (A1_In) queue, defaults to a quarter of Am
    #[serde(default)]
    pub a1_in_capacity: Option<usize>,
    /// Capacity of the ghost (A1_Out) queue, unbounded when absent
    #[serde(default)]
    pub a1_out_capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            am_capacity: 1024,
            a1_in_capacity: None,
            a1_out_capacity: None,
        }
    }
}

impl CacheConfig {
    pub fn effective_a1_in(&self) -> usize {
        self.a1_in_capacity
            .unwrap_or(self.am_capacity / 4)
            .max(1)
    }
}

/// Hierarchical allocation pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of power-of-two levels
    pub levels: usize,
    /// Level at which the store grows the pool when it runs dry
    #[serde(default)]
    pub growth_level: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            levels: 8,
            growth_level: None,
        }
    }
}

impl PoolConfig {
    pub fn effective_growth_level(&self) -> usize {
        let top = self.levels.clamp(1, MAX_POOL_LEVELS) - 1;
        self.growth_level.unwrap_or(top).min(top)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl EngineConfig {
    /// Load config from a JSON file, with environment variable overrides.
    /// Falls back to defaults if the file is not found. COWTREE_CONFIG overrides the path.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> TreeResult<Self> {
        let cfg_path = env::var("COWTREE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let mut cfg = match fs::read_to_string(&cfg_path) {
            Ok(s) => serde_json::from_str::<EngineConfig>(&s).map_err(|e| {
                TreeError::Config(format!("Failed to parse {}: {}", cfg_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
            Err(e) => return Err(e.into()),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save config as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TreeResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> TreeResult<()> {
        self.tree.validate()?;
        if self.cache.am_capacity == 0 {
            return Err(TreeError::Config("cache.am_capacity must be positive".into()));
        }
        if self.pool.levels == 0 {
            return Err(TreeError::Config("pool.levels must be positive".into()));
        }
        if self.pool.levels > MAX_POOL_LEVELS {
            return Err(TreeError::Config(format!(
                "pool.levels is {}, at most {} levels fit 64-bit addresses",
                self.pool.levels, MAX_POOL_LEVELS
            )));
        }
        if let Some(level) = self.pool.growth_level
            && level >= self.pool.levels
        {
            return Err(TreeError::Config(format!(
                "pool.growth_level {} is outside the {} pool levels",
                level, self.pool.levels
            )));
        }
        Ok(())
    }

    /// Apply COWTREE_* environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("COWTREE_BLOCK_SIZE")
            && let Ok(size) = v.parse::<usize>()
        {
            self.tree.block_size = size;
        }

        if let Ok(v) = env::var("COWTREE_CACHE_CAPACITY")
            && let Ok(cap) = v.parse::<usize>()
        {
            self.cache.am_capacity = cap;
        }

        if let Ok(v) = env::var("COWTREE_POOL_LEVELS")
            && let Ok(levels) = v.parse::<usize>()
        {
            self.pool.levels = levels;
        }
    }
}
