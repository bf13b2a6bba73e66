pub mod attention;
pub mod block_store;
pub mod cache_wrapper;
pub mod logging;
mod metrics;
pub mod pager;
pub mod pinned_mem;
mod transfer;

pub use attention::kernel::SUPPORTED_HEAD_DIMS;
pub use attention::pipeline::PagedAttnContext;
pub use attention::pool::{ContextPool, PoolKey};
pub use block_store::{BlockKey, BlockMeta, BlockStore, BlockStoreConfig, StoreStats, Tier};
pub use cache_wrapper::{CellCache, TieredCache};
pub use pager::{HostRange, PageManager, PagerConfig, PagerStats};
pub use pinned_mem::{AllocStrategy, PinnedMemory};

// ============================================================================
// tierkv treats per-layer KV rows as pages in a four-tier hierarchy:
//
//   Tier 0 (hot)  : GPU VRAM          — owned by the runtime, not by us
//   Tier 1 (warm) : pinned host RAM   — PageManager arenas, async H2D copies
//   Tier 2 (cool) : local SSD         — BlockStore local root
//   Tier 3 (cold) : remote NFS/HDD    — BlockStore remote root
//
// The attention module consumes tier 1 through a double-buffered copy/compute
// pipeline so that only one chunk of K and one chunk of V occupy device
// memory at a time. Everything below tier 0 is host-side and synchronous;
// no lock is held across a device call.
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Crate-wide error type. Variants map one-to-one onto the failure modes of
/// the storage and attention paths; `String` payloads carry context the same
/// way the log lines do.
#[derive(Debug)]
pub enum TierError {
    Io(String),
    Decompression(String),
    BudgetExhausted { need: u64, local_free: u64 },
    HostBudgetExhausted { need: u64, budget: u64 },
    OutOfHostMemory(String),
    Device(String),
    UnsupportedHeadDim(usize),
    PoolExhausted { capacity: usize },
    InvalidArgument(String),
}

impl fmt::Display for TierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierError::Io(msg) => write!(f, "io error: {msg}"),
            TierError::Decompression(msg) => write!(f, "decompression failed: {msg}"),
            TierError::BudgetExhausted { need, local_free } => write!(
                f,
                "disk budget exhausted: need {need} bytes, {local_free} free on local and no remote headroom"
            ),
            TierError::HostBudgetExhausted { need, budget } => write!(
                f,
                "host budget exhausted: need {need} bytes against budget {budget} and no spill store configured"
            ),
            TierError::OutOfHostMemory(msg) => write!(f, "host allocation failed: {msg}"),
            TierError::Device(msg) => write!(f, "device error: {msg}"),
            TierError::UnsupportedHeadDim(dim) => write!(
                f,
                "unsupported head_dim {dim} (supported: {:?})",
                attention::kernel::SUPPORTED_HEAD_DIMS
            ),
            TierError::PoolExhausted { capacity } => {
                write!(f, "attention context pool full ({capacity} entries)")
            }
            TierError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for TierError {}

impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        TierError::Io(err.to_string())
    }
}

/// Top-level tiering configuration as surfaced by the host runtime.
///
/// Loadable from JSON; every field has a default so a partial file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    /// Master switch. When false the cache wrapper is a transparent no-op.
    pub tiering_enabled: bool,

    /// Directory root of the local (SSD) tier.
    pub local_path: PathBuf,

    /// Directory root of the remote (NFS/HDD) tier. Empty disables the tier.
    pub remote_path: Option<PathBuf>,

    /// Max bytes on the local tier before local→remote migration starts.
    pub local_budget_bytes: u64,

    /// Hard cap on the remote tier.
    pub remote_budget_bytes: u64,

    /// Apply zstd at the default level when writing blocks.
    pub compress: bool,

    /// Positions per wrapper-level block. Finer = more I/O operations,
    /// coarser = less prefix granularity.
    pub block_size: i32,

    /// Pinned host memory budget for the page manager, per session.
    pub host_budget_bytes: u64,

    /// Positions per attention chunk. 0 selects automatically at dispatch.
    pub chunk_size: usize,

    /// Sequence length above which the automatic chunk size jumps from 512
    /// to 2048 positions.
    pub auto_chunk_threshold: usize,

    /// KV row geometry.
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// 2 for f16, 4 for f32.
    pub elem_bytes: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            tiering_enabled: true,
            local_path: PathBuf::from("/tmp/tierkv/local"),
            remote_path: None,
            local_budget_bytes: 20 * 1024 * 1024 * 1024,
            remote_budget_bytes: 0,
            compress: true,
            block_size: 256,
            host_budget_bytes: 8 * 1024 * 1024 * 1024,
            chunk_size: 0,
            auto_chunk_threshold: 4096,
            num_kv_heads: 8,
            head_dim: 128,
            elem_bytes: 2,
        }
    }
}

impl TieringConfig {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self, TierError> {
        if !path.exists() {
            log::warn!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| TierError::InvalidArgument(format!("config parse: {e}")))
    }

    /// Bytes of one KV row (K or V) for one position on one layer.
    pub fn row_bytes(&self) -> usize {
        self.num_kv_heads * self.head_dim * self.elem_bytes
    }

    /// Bytes of one wrapper-level block on one layer: `block_size` positions,
    /// K and V.
    pub fn kv_block_bytes(&self) -> usize {
        self.block_size as usize * self.row_bytes() * 2
    }

    /// Chunk size to use for a given total sequence length.
    pub fn effective_chunk_size(&self, total_seq: usize) -> usize {
        if self.chunk_size != 0 {
            return self.chunk_size;
        }
        if total_seq > self.auto_chunk_threshold {
            2048
        } else {
            512
        }
    }

    /// Block store configuration for this tiering setup.
    pub fn store_config(&self) -> BlockStoreConfig {
        BlockStoreConfig {
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            local_budget: self.local_budget_bytes,
            remote_budget: self.remote_budget_bytes,
            compress: self.compress,
        }
    }

    /// Page manager configuration for a model with `num_layers` layers,
    /// spilling under sequence id `seq`.
    pub fn pager_config(&self, num_layers: usize, seq: u64) -> PagerConfig {
        PagerConfig {
            num_layers,
            num_kv_heads: self.num_kv_heads,
            head_dim: self.head_dim,
            elem_bytes: self.elem_bytes,
            host_budget_bytes: self.host_budget_bytes,
            seq,
        }
    }
}
