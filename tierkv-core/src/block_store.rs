// ============================================================================
// BlockStore: two-tier disk-backed storage for evicted KV rows.
//
// Blocks are written to a fast local tier (SSD) first and migrate to a slow
// remote tier (NFS/HDD) when the local tier fills up. Data is optionally
// compressed with zstd before writing. An in-memory index maps every key to
// its metadata and is persisted as JSON under the local root so the store
// survives restarts.
//
// Locking: a single RwLock guards the index and the usage counters. Lookups
// share the read side; Put/RemoveSeq/Close take the write side. Get upgrades
// to the write side only to bump accessed_at — the sole read→write upgrade
// on the request path.
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::metrics::core_metrics;
use crate::TierError;

const INDEX_FILE: &str = "index.json";
const BLOCK_EXT: &str = "kvblk";

/// Create a directory tree with mode 0755, the permission the on-disk
/// format promises regardless of the process umask default.
fn create_dir_0755(path: &Path) -> std::io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o755).create(path)
}

// ============================================================================
// Keys and metadata
// ============================================================================

/// Identifies one stored KV row: (sequence, layer, position range, K-or-V).
///
/// The (begin, end) pair permits grouping multiple positions per block in the
/// future; the base layout stores exactly one position per block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub seq: u64,
    pub layer: usize,
    pub begin_pos: i32,
    pub end_pos: i32,
    pub is_key: bool,
}

impl BlockKey {
    pub fn single(seq: u64, layer: usize, pos: i32, is_key: bool) -> Self {
        Self {
            seq,
            layer,
            begin_pos: pos,
            end_pos: pos + 1,
            is_key,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kv = if self.is_key { "k" } else { "v" };
        write!(
            f,
            "seq{}_L{}_{}_p{}-{}",
            self.seq, self.layer, kv, self.begin_pos, self.end_pos
        )
    }
}

/// Storage tier a block currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Remote,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// Per-block record, persisted as part of the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub key: BlockKey,
    pub dtype: String,
    pub shape: Vec<usize>,
    /// Uncompressed payload size. Tier usage is accounted in these units so
    /// the counters stay equal to the recomputed sums after every mutation.
    pub size_bytes: usize,
    pub compressed: bool,
    pub tier: Tier,
    pub stored_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

/// Storage statistics, per tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub local_blocks: usize,
    pub remote_blocks: usize,
    pub local_used: u64,
    pub remote_used: u64,
    pub local_budget: u64,
    pub remote_budget: u64,
}

// ============================================================================
// Store
// ============================================================================

/// Configuration for creating a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Local (SSD) tier root. Created with mode 0755 if absent.
    pub local_path: PathBuf,
    /// Remote (NFS/HDD) tier root. `None` disables migration.
    pub remote_path: Option<PathBuf>,
    /// Max bytes on the local tier.
    pub local_budget: u64,
    /// Max bytes on the remote tier.
    pub remote_budget: u64,
    /// zstd at the default level.
    pub compress: bool,
}

struct Inner {
    index: HashMap<BlockKey, BlockMeta>,
    local_used: u64,
    remote_used: u64,
}

pub struct BlockStore {
    local_path: PathBuf,
    remote_path: Option<PathBuf>,
    local_budget: u64,
    remote_budget: u64,
    compress: bool,
    inner: RwLock<Inner>,
}

impl BlockStore {
    /// Open a store, creating tier roots and loading any persisted index.
    ///
    /// Index entries whose files are missing keep their records; files
    /// without index entries are ignored and may be cleaned up out-of-band.
    pub fn open(cfg: BlockStoreConfig) -> Result<Self, TierError> {
        create_dir_0755(&cfg.local_path)
            .map_err(|e| TierError::Io(format!("create local root: {e}")))?;
        if let Some(remote) = &cfg.remote_path {
            create_dir_0755(remote)
                .map_err(|e| TierError::Io(format!("create remote root: {e}")))?;
        }

        let store = Self {
            local_path: cfg.local_path,
            remote_path: cfg.remote_path,
            local_budget: cfg.local_budget,
            remote_budget: cfg.remote_budget,
            compress: cfg.compress,
            inner: RwLock::new(Inner {
                index: HashMap::new(),
                local_used: 0,
                remote_used: 0,
            }),
        };
        store.load_index();

        {
            let inner = store.inner.read().expect("store lock poisoned");
            info!(
                "block store opened: blocks={} local_used={} remote_used={} compress={}",
                inner.index.len(),
                ByteSize(inner.local_used),
                ByteSize(inner.remote_used),
                store.compress
            );
        }
        Ok(store)
    }

    /// Store one KV row. The payload always lands on the local tier; under
    /// budget pressure the oldest local blocks migrate to remote first.
    pub fn put(
        &self,
        key: BlockKey,
        dtype: &str,
        shape: Vec<usize>,
        data: &[u8],
    ) -> Result<(), TierError> {
        let payload = if self.compress {
            zstd::encode_all(data, zstd::DEFAULT_COMPRESSION_LEVEL)
                .map_err(|e| TierError::Io(format!("zstd encode {key}: {e}")))?
        } else {
            data.to_vec()
        };

        let mut inner = self.inner.write().expect("store lock poisoned");

        // Replacing an existing key must not double-count its bytes.
        if inner.index.contains_key(&key) {
            self.remove_entry_locked(&mut inner, &key);
        }

        let size = data.len() as u64;
        while inner.local_used + size > self.local_budget {
            if !self.migrate_oldest_locked(&mut inner) {
                break;
            }
        }
        if inner.local_used + size > self.local_budget {
            return Err(TierError::BudgetExhausted {
                need: size,
                local_free: self.local_budget.saturating_sub(inner.local_used),
            });
        }

        let path = self.block_path(&key, Tier::Local);
        if let Some(dir) = path.parent() {
            create_dir_0755(dir).map_err(|e| TierError::Io(format!("create shard dir: {e}")))?;
        }
        fs::write(&path, &payload)
            .map_err(|e| TierError::Io(format!("write block {key}: {e}")))?;

        let now = Utc::now();
        inner.index.insert(
            key,
            BlockMeta {
                key,
                dtype: dtype.to_string(),
                shape,
                size_bytes: data.len(),
                compressed: self.compress,
                tier: Tier::Local,
                stored_at: now,
                accessed_at: now,
            },
        );
        inner.local_used += size;

        core_metrics().store_put_bytes.add(size, &[]);
        debug!("stored block {key}: {} on local", ByteSize(size));
        Ok(())
    }

    /// Retrieve a block's raw (decompressed) bytes and metadata.
    ///
    /// Returns `None` when the key is absent. Bumps `accessed_at` under the
    /// write lock after the file read completes.
    pub fn get(&self, key: &BlockKey) -> Result<Option<(Vec<u8>, BlockMeta)>, TierError> {
        let meta = {
            let inner = self.inner.read().expect("store lock poisoned");
            match inner.index.get(key) {
                Some(m) => m.clone(),
                None => return Ok(None),
            }
        };

        let path = self.block_path(key, meta.tier);
        let payload =
            fs::read(&path).map_err(|e| TierError::Io(format!("read block {key}: {e}")))?;

        let data = if meta.compressed {
            zstd::decode_all(payload.as_slice())
                .map_err(|e| TierError::Decompression(format!("block {key}: {e}")))?
        } else {
            payload
        };

        let mut inner = self.inner.write().expect("store lock poisoned");
        let meta = match inner.index.get_mut(key) {
            Some(m) => {
                m.accessed_at = Utc::now();
                m.clone()
            }
            // Removed between the file read and the upgrade; treat as absent.
            None => return Ok(None),
        };

        core_metrics().store_get_bytes.add(data.len() as u64, &[]);
        Ok(Some((data, meta)))
    }

    /// Whether a block exists in the index.
    pub fn has(&self, key: &BlockKey) -> bool {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.index.contains_key(key)
    }

    /// All blocks for (seq, layer, K-or-V) overlapping [begin, end), ordered
    /// by begin position ascending. Used for prefix extension.
    pub fn get_range(
        &self,
        seq: u64,
        layer: usize,
        is_key: bool,
        begin_pos: i32,
        end_pos: i32,
    ) -> Vec<BlockMeta> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut results: Vec<BlockMeta> = inner
            .index
            .values()
            .filter(|m| {
                m.key.seq == seq
                    && m.key.layer == layer
                    && m.key.is_key == is_key
                    && m.key.begin_pos < end_pos
                    && m.key.end_pos > begin_pos
            })
            .cloned()
            .collect();
        results.sort_by_key(|m| m.key.begin_pos);
        results
    }

    /// Remove one block (index entry and file). Returns whether it existed.
    pub fn remove(&self, key: &BlockKey) -> bool {
        let mut inner = self.inner.write().expect("store lock poisoned");
        self.remove_entry_locked(&mut inner, key)
    }

    /// Remove every block belonging to a sequence, on both tiers.
    /// Returns the number of blocks removed.
    pub fn remove_seq(&self, seq: u64) -> usize {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let victims: Vec<BlockKey> = inner
            .index
            .keys()
            .filter(|k| k.seq == seq)
            .copied()
            .collect();
        for key in &victims {
            self.remove_entry_locked(&mut inner, key);
        }
        if !victims.is_empty() {
            debug!("removed {} blocks for seq={seq}", victims.len());
        }
        victims.len()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut stats = StoreStats {
            local_used: inner.local_used,
            remote_used: inner.remote_used,
            local_budget: self.local_budget,
            remote_budget: self.remote_budget,
            ..Default::default()
        };
        for meta in inner.index.values() {
            match meta.tier {
                Tier::Local => stats.local_blocks += 1,
                Tier::Remote => stats.remote_blocks += 1,
            }
        }
        stats
    }

    /// Persist the index. Callers should close before dropping when the save
    /// outcome matters; Drop retries best-effort.
    pub fn close(&self) -> Result<(), TierError> {
        let inner = self.inner.read().expect("store lock poisoned");
        self.save_index(&inner)
    }

    // ── internal ────────────────────────────────────────────────────────────

    fn block_path(&self, key: &BlockKey, tier: Tier) -> PathBuf {
        let root = match tier {
            Tier::Local => &self.local_path,
            Tier::Remote => self
                .remote_path
                .as_ref()
                .unwrap_or(&self.local_path),
        };
        let shard = key.seq % 256;
        root.join(format!("{shard:02x}"))
            .join(format!("{key}.{BLOCK_EXT}"))
    }

    fn index_path(&self) -> PathBuf {
        self.local_path.join(INDEX_FILE)
    }

    /// Must be called with the write lock held. Deletes the file, fixes the
    /// usage counter, and drops the index entry.
    fn remove_entry_locked(&self, inner: &mut Inner, key: &BlockKey) -> bool {
        let meta = match inner.index.remove(key) {
            Some(m) => m,
            None => return false,
        };
        let path = self.block_path(key, meta.tier);
        if let Err(e) = fs::remove_file(&path) {
            warn!("failed to delete block file {}: {e}", path.display());
        }
        match meta.tier {
            Tier::Local => inner.local_used = inner.local_used.saturating_sub(meta.size_bytes as u64),
            Tier::Remote => {
                inner.remote_used = inner.remote_used.saturating_sub(meta.size_bytes as u64)
            }
        }
        true
    }

    /// Migrate the coldest local block to the remote tier. Order is strict
    /// LRU by accessed_at; ties break on earlier stored_at, then on the
    /// lexicographic key string. Returns false when no migration is possible
    /// (no remote tier, nothing local, or remote is full).
    ///
    /// The destination is written before the source is deleted, so an
    /// interrupted migration leaves the index pointing at an intact local
    /// copy; the orphaned remote file is overwritten on the next attempt.
    fn migrate_oldest_locked(&self, inner: &mut Inner) -> bool {
        if self.remote_path.is_none() {
            return false;
        }

        let oldest = inner
            .index
            .values()
            .filter(|m| m.tier == Tier::Local)
            .min_by(|a, b| {
                a.accessed_at
                    .cmp(&b.accessed_at)
                    .then(a.stored_at.cmp(&b.stored_at))
                    .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
            })
            .map(|m| (m.key, m.size_bytes as u64));
        let (key, size) = match oldest {
            Some(v) => v,
            None => return false,
        };

        if inner.remote_used + size > self.remote_budget {
            return false;
        }

        let src = self.block_path(&key, Tier::Local);
        let dst = self.block_path(&key, Tier::Remote);
        if let Some(dir) = dst.parent() {
            if create_dir_0755(dir).is_err() {
                return false;
            }
        }
        let payload = match fs::read(&src) {
            Ok(p) => p,
            Err(e) => {
                warn!("migration read failed for {key}: {e}");
                return false;
            }
        };
        if let Err(e) = fs::write(&dst, &payload) {
            warn!("migration write failed for {key}: {e}");
            return false;
        }
        if let Err(e) = fs::remove_file(&src) {
            warn!("migration source delete failed for {key}: {e}");
        }

        inner.local_used = inner.local_used.saturating_sub(size);
        inner.remote_used += size;
        if let Some(meta) = inner.index.get_mut(&key) {
            meta.tier = Tier::Remote;
        }

        core_metrics().store_migrations.add(1, &[]);
        debug!("migrated block {key} to remote ({})", ByteSize(size));
        true
    }

    fn save_index(&self, inner: &Inner) -> Result<(), TierError> {
        let by_name: std::collections::BTreeMap<String, &BlockMeta> = inner
            .index
            .iter()
            .map(|(k, m)| (k.to_string(), m))
            .collect();
        let data = serde_json::to_vec_pretty(&by_name)
            .map_err(|e| TierError::Io(format!("encode index: {e}")))?;
        fs::write(self.index_path(), data)
            .map_err(|e| TierError::Io(format!("write index: {e}")))?;
        Ok(())
    }

    /// Load the persisted index and recompute per-tier usage. A corrupt index
    /// is recovered by starting empty; orphaned block files stay on disk.
    fn load_index(&self) {
        let data = match fs::read(self.index_path()) {
            Ok(d) => d,
            Err(_) => return,
        };
        let by_name: HashMap<String, BlockMeta> = match serde_json::from_slice(&data) {
            Ok(m) => m,
            Err(e) => {
                warn!("corrupt index at {}: {e}; starting empty", self.index_path().display());
                return;
            }
        };

        let mut inner = self.inner.write().expect("store lock poisoned");
        for (_, meta) in by_name {
            match meta.tier {
                Tier::Local => inner.local_used += meta.size_bytes as u64,
                Tier::Remote => inner.remote_used += meta.size_bytes as u64,
            }
            inner.index.insert(meta.key, meta);
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        let inner = self.inner.read().expect("store lock poisoned");
        if let Err(e) = self.save_index(&inner) {
            warn!("failed to persist block index on drop: {e}");
        }
    }
}
