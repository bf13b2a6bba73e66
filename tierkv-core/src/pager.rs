// ============================================================================
// PageManager: per-layer contiguous host arenas for KV rows.
//
// Each layer owns a pinned K buffer and a pinned V buffer laid out as an
// ordered sequence of rows of `kv_heads * head_dim * elem_bytes` bytes, plus
// a per-position slot map {host, disk, empty}. Arenas grow geometrically and
// monotonically for the lifetime of the session; the host budget governs the
// bytes of *resident* rows. When the budget is exceeded and a spill store is
// configured, the least-recently-used rows are written to the BlockStore and
// their slots tagged disk; get_range pages them back into place on demand.
//
// Thread safety: a single mutex serializes all operations. The intended
// usage is one writer (the generate loop) and occasional stats readers.
// ============================================================================

use std::sync::{Arc, Mutex};

use bytesize::ByteSize;
use hashlink::LruCache;
use log::{debug, warn};

use crate::block_store::{BlockKey, BlockStore};
use crate::metrics::core_metrics;
use crate::pinned_mem::PinnedMemory;
use crate::TierError;

const INITIAL_ARENA_ROWS: usize = 256;

/// Residency of one position's row pair within a layer arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Host,
    Disk,
    Empty,
}

/// Geometry and budget for a [`PageManager`].
#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub num_layers: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// 2 for f16, 4 for f32.
    pub elem_bytes: usize,
    /// Budget for host-resident row bytes across all layers.
    pub host_budget_bytes: u64,
    /// Sequence id under which spilled rows are keyed in the block store.
    pub seq: u64,
}

impl PagerConfig {
    /// Bytes of one K (or V) row.
    pub fn row_bytes(&self) -> usize {
        self.num_kv_heads * self.head_dim * self.elem_bytes
    }

    fn dtype(&self) -> &'static str {
        match self.elem_bytes {
            2 => "f16",
            4 => "f32",
            _ => "u8",
        }
    }
}

/// Aggregate residency statistics.
#[derive(Debug, Clone, Default)]
pub struct PagerStats {
    pub total_positions: usize,
    pub host_positions: usize,
    pub disk_positions: usize,
    pub host_used_bytes: u64,
    pub host_budget_bytes: u64,
}

/// Contiguous pointers into a layer's pinned buffers, covering `len`
/// positions. Valid until the next `get_range` call on the manager or
/// teardown; a later call may page rows in or out underneath them.
#[derive(Debug, Clone, Copy)]
pub struct HostRange {
    pub k_ptr: *const u8,
    pub v_ptr: *const u8,
    pub len: usize,
}

impl HostRange {
    fn empty() -> Self {
        Self {
            k_ptr: std::ptr::null(),
            v_ptr: std::ptr::null(),
            len: 0,
        }
    }
}

struct LayerArena {
    k: Option<PinnedMemory>,
    v: Option<PinnedMemory>,
    /// Allocated rows.
    capacity: usize,
    /// Highest filled position + 1.
    count: usize,
    meta: Vec<SlotState>,
}

impl LayerArena {
    fn new() -> Self {
        Self {
            k: None,
            v: None,
            capacity: 0,
            count: 0,
            meta: Vec::new(),
        }
    }
}

struct PagerInner {
    layers: Vec<LayerArena>,
    host_used: u64,
    /// Recency of host-resident rows, keyed by (layer, position).
    lru: LruCache<(usize, i32), ()>,
}

pub struct PageManager {
    cfg: PagerConfig,
    spill: Option<Arc<BlockStore>>,
    inner: Mutex<PagerInner>,
}

impl PageManager {
    /// Create a manager. `spill` enables disk paging; without it, exceeding
    /// the host budget is a hard failure.
    pub fn new(cfg: PagerConfig, spill: Option<Arc<BlockStore>>) -> Self {
        let layers = (0..cfg.num_layers).map(|_| LayerArena::new()).collect();
        Self {
            cfg,
            spill,
            inner: Mutex::new(PagerInner {
                layers,
                host_used: 0,
                lru: LruCache::new_unbounded(),
            }),
        }
    }

    pub fn config(&self) -> &PagerConfig {
        &self.cfg
    }

    /// Append a KV row pair at the next free position of a layer.
    /// Returns the position index assigned.
    pub fn append(&self, layer: usize, k_row: &[u8], v_row: &[u8]) -> Result<i32, TierError> {
        let mut inner = self.inner.lock().expect("pager lock poisoned");
        let pos = inner.layers[self.check_layer(layer)?].count;
        self.write_row_locked(&mut inner, layer, pos, k_row, v_row)?;
        Ok(pos as i32)
    }

    /// Store a KV row pair at an explicit position, possibly extending the
    /// layer's count. Overwrites any existing data at that position.
    pub fn store(
        &self,
        layer: usize,
        pos: usize,
        k_row: &[u8],
        v_row: &[u8],
    ) -> Result<(), TierError> {
        let mut inner = self.inner.lock().expect("pager lock poisoned");
        self.check_layer(layer)?;
        self.write_row_locked(&mut inner, layer, pos, k_row, v_row)
    }

    /// Contiguous pointers covering `count` positions starting at `start`,
    /// clamped to what the layer holds. Disk-resident positions in the range
    /// are paged back into their slots first; rows outside the range may be
    /// spilled to stay within budget.
    pub fn get_range(
        &self,
        layer: usize,
        start: usize,
        count: usize,
    ) -> Result<HostRange, TierError> {
        let mut inner = self.inner.lock().expect("pager lock poisoned");
        self.check_layer(layer)?;

        let avail = inner.layers[layer].count.saturating_sub(start);
        let len = count.min(avail);
        if len == 0 {
            return Ok(HostRange::empty());
        }

        let rb = self.cfg.row_bytes();
        let mut paged_in = 0usize;
        for pos in start..start + len {
            match inner.layers[layer].meta[pos] {
                SlotState::Host => {
                    inner.lru.insert((layer, pos as i32), ());
                }
                SlotState::Disk => {
                    self.page_in_locked(&mut inner, layer, pos)?;
                    paged_in += 1;
                }
                SlotState::Empty => {}
            }
        }
        if paged_in > 0 {
            self.enforce_budget_locked(&mut inner, Some((layer, start, start + len)))?;
            debug!("paged in {paged_in} positions for layer {layer} [{start}, {})", start + len);
        }

        let arena = &inner.layers[layer];
        let k = arena.k.as_ref().expect("arena allocated for non-empty range");
        let v = arena.v.as_ref().expect("arena allocated for non-empty range");
        // SAFETY: start + len <= count <= capacity, so the offset stays
        // within the allocation.
        let k_ptr = unsafe { k.as_ptr().add(start * rb) };
        let v_ptr = unsafe { v.as_ptr().add(start * rb) };
        Ok(HostRange { k_ptr, v_ptr, len })
    }

    /// Full layer contents, equivalent to `get_range(layer, 0, count)`.
    pub fn get_layer(&self, layer: usize) -> Result<HostRange, TierError> {
        let count = {
            let inner = self.inner.lock().expect("pager lock poisoned");
            self.check_layer(layer)?;
            inner.layers[layer].count
        };
        self.get_range(layer, 0, count)
    }

    /// Mark positions [start, start+count) empty across all layers.
    /// Contiguous tail-emptying shrinks the count; interior removals leave
    /// holes. Spilled blocks for affected positions are deleted through the
    /// block store.
    pub fn remove_range(&self, start: usize, count: usize) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock().expect("pager lock poisoned");
        let rb = self.cfg.row_bytes() as u64;

        for layer in 0..self.cfg.num_layers {
            let layer_count = inner.layers[layer].count;
            if start >= layer_count {
                continue;
            }
            let end = (start + count).min(layer_count);

            for pos in start..end {
                match inner.layers[layer].meta[pos] {
                    SlotState::Host => {
                        inner.host_used = inner.host_used.saturating_sub(rb * 2);
                        inner.lru.remove(&(layer, pos as i32));
                    }
                    SlotState::Disk => self.drop_spilled_blocks(layer, pos),
                    SlotState::Empty => {}
                }
                inner.layers[layer].meta[pos] = SlotState::Empty;
            }

            if end >= layer_count {
                // Removing the tail: walk back over any earlier holes too.
                let arena = &mut inner.layers[layer];
                let mut new_count = 0;
                for pos in (0..start).rev() {
                    if arena.meta[pos] != SlotState::Empty {
                        new_count = pos + 1;
                        break;
                    }
                }
                arena.count = new_count;
            }
        }
    }

    /// Empty every layer and delete any spilled rows.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("pager lock poisoned");
        for arena in &mut inner.layers {
            arena.count = 0;
            arena.meta.fill(SlotState::Empty);
        }
        inner.host_used = 0;
        inner.lru.clear();
        if let Some(store) = &self.spill {
            let removed = store.remove_seq(self.cfg.seq);
            if removed > 0 {
                debug!("cleared {removed} spilled pager blocks");
            }
        }
    }

    pub fn stats(&self) -> PagerStats {
        let inner = self.inner.lock().expect("pager lock poisoned");
        let mut stats = PagerStats {
            host_used_bytes: inner.host_used,
            host_budget_bytes: self.cfg.host_budget_bytes,
            ..Default::default()
        };
        for arena in &inner.layers {
            stats.total_positions += arena.count;
            for pos in 0..arena.count {
                match arena.meta[pos] {
                    SlotState::Host => stats.host_positions += 1,
                    SlotState::Disk => stats.disk_positions += 1,
                    SlotState::Empty => {}
                }
            }
        }
        stats
    }

    // ── internal ────────────────────────────────────────────────────────────

    fn check_layer(&self, layer: usize) -> Result<usize, TierError> {
        if layer >= self.cfg.num_layers {
            return Err(TierError::InvalidArgument(format!(
                "layer {layer} out of range ({} layers)",
                self.cfg.num_layers
            )));
        }
        Ok(layer)
    }

    fn write_row_locked(
        &self,
        inner: &mut PagerInner,
        layer: usize,
        pos: usize,
        k_row: &[u8],
        v_row: &[u8],
    ) -> Result<(), TierError> {
        let rb = self.cfg.row_bytes();
        if k_row.len() != rb || v_row.len() != rb {
            return Err(TierError::InvalidArgument(format!(
                "row length {} / {} does not match stride {rb}",
                k_row.len(),
                v_row.len()
            )));
        }

        let prev = inner
            .layers[layer]
            .meta
            .get(pos)
            .copied()
            .unwrap_or(SlotState::Empty);
        let needed = if prev == SlotState::Host { 0 } else { (rb * 2) as u64 };

        if inner.host_used + needed > self.cfg.host_budget_bytes {
            if self.spill.is_none() {
                return Err(TierError::HostBudgetExhausted {
                    need: needed,
                    budget: self.cfg.host_budget_bytes,
                });
            }
            self.enforce_budget_headroom_locked(inner, needed)?;
        }

        self.ensure_capacity_locked(inner, layer, pos + 1)?;

        // An overwritten disk slot leaves dead blocks behind; drop them now.
        if prev == SlotState::Disk {
            self.drop_spilled_blocks(layer, pos);
        }

        let arena = &mut inner.layers[layer];
        // SAFETY: capacity >= pos + 1 after ensure_capacity, row length
        // checked against the stride above.
        unsafe {
            let k_dst = arena.k.as_mut().expect("arena allocated").as_mut_ptr().add(pos * rb);
            let v_dst = arena.v.as_mut().expect("arena allocated").as_mut_ptr().add(pos * rb);
            std::ptr::copy_nonoverlapping(k_row.as_ptr(), k_dst, rb);
            std::ptr::copy_nonoverlapping(v_row.as_ptr(), v_dst, rb);
        }
        arena.meta[pos] = SlotState::Host;
        if pos >= arena.count {
            arena.count = pos + 1;
        }
        inner.host_used += needed;
        inner.lru.insert((layer, pos as i32), ());
        Ok(())
    }

    /// Grow a layer's arenas (doubling from 256 rows) so `need` rows fit.
    /// Growth is monotonic; existing rows are copied into the new buffers.
    fn ensure_capacity_locked(
        &self,
        inner: &mut PagerInner,
        layer: usize,
        need: usize,
    ) -> Result<(), TierError> {
        let arena = &mut inner.layers[layer];
        if need <= arena.capacity {
            return Ok(());
        }

        let mut new_cap = if arena.capacity == 0 {
            INITIAL_ARENA_ROWS
        } else {
            arena.capacity * 2
        };
        while new_cap < need {
            new_cap *= 2;
        }

        let rb = self.cfg.row_bytes();
        let mut new_k = PinnedMemory::allocate(new_cap * rb).map_err(TierError::OutOfHostMemory)?;
        let mut new_v = PinnedMemory::allocate(new_cap * rb).map_err(TierError::OutOfHostMemory)?;

        if arena.capacity > 0 {
            let used = arena.count * rb;
            // SAFETY: both buffers hold at least `count` rows.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    arena.k.as_ref().expect("old arena").as_ptr(),
                    new_k.as_mut_ptr(),
                    used,
                );
                std::ptr::copy_nonoverlapping(
                    arena.v.as_ref().expect("old arena").as_ptr(),
                    new_v.as_mut_ptr(),
                    used,
                );
            }
        }

        arena.k = Some(new_k);
        arena.v = Some(new_v);
        arena.capacity = new_cap;
        arena.meta.resize(new_cap, SlotState::Empty);
        Ok(())
    }

    /// Spill LRU rows until `extra` more bytes fit under the budget.
    fn enforce_budget_headroom_locked(
        &self,
        inner: &mut PagerInner,
        extra: u64,
    ) -> Result<(), TierError> {
        while inner.host_used + extra > self.cfg.host_budget_bytes {
            if !self.spill_one_locked(inner, None)? {
                return Err(TierError::HostBudgetExhausted {
                    need: extra,
                    budget: self.cfg.host_budget_bytes,
                });
            }
        }
        Ok(())
    }

    /// Spill LRU rows outside the protected range until within budget.
    fn enforce_budget_locked(
        &self,
        inner: &mut PagerInner,
        protect: Option<(usize, usize, usize)>,
    ) -> Result<(), TierError> {
        while inner.host_used > self.cfg.host_budget_bytes {
            if !self.spill_one_locked(inner, protect)? {
                // Everything resident is protected; over-budget by at most
                // one in-use range. Let the caller proceed.
                break;
            }
        }
        Ok(())
    }

    /// Write the least-recently-used unprotected row pair to the block store
    /// and tag its slot disk. Returns false when no spillable row remains.
    fn spill_one_locked(
        &self,
        inner: &mut PagerInner,
        protect: Option<(usize, usize, usize)>,
    ) -> Result<bool, TierError> {
        let store = match &self.spill {
            Some(s) => s,
            None => return Ok(false),
        };

        let mut stash: Vec<(usize, i32)> = Vec::new();
        let victim = loop {
            match inner.lru.remove_lru() {
                Some(((layer, pos), ())) => {
                    let protected = matches!(
                        protect,
                        Some((pl, ps, pe)) if pl == layer && (ps..pe).contains(&(pos as usize))
                    );
                    if protected {
                        stash.push((layer, pos));
                    } else {
                        break Some((layer, pos));
                    }
                }
                None => break None,
            }
        };
        // Protected rows go back in at the hot end; they are in active use.
        for key in stash {
            inner.lru.insert(key, ());
        }

        let (layer, pos) = match victim {
            Some(v) => v,
            None => return Ok(false),
        };

        let rb = self.cfg.row_bytes();
        let shape = vec![self.cfg.num_kv_heads, self.cfg.head_dim];
        let arena = &inner.layers[layer];
        // SAFETY: pos was host-resident, so it lies within the allocation.
        let (k_row, v_row) = unsafe {
            (
                std::slice::from_raw_parts(arena.k.as_ref().expect("arena").as_ptr().add(pos as usize * rb), rb),
                std::slice::from_raw_parts(arena.v.as_ref().expect("arena").as_ptr().add(pos as usize * rb), rb),
            )
        };

        let k_key = BlockKey::single(self.cfg.seq, layer, pos, true);
        let v_key = BlockKey::single(self.cfg.seq, layer, pos, false);
        if let Err(e) = store
            .put(k_key, self.cfg.dtype(), shape.clone(), k_row)
            .and_then(|_| store.put(v_key, self.cfg.dtype(), shape, v_row))
        {
            warn!("spill of layer {layer} pos {pos} failed: {e}; keeping resident");
            inner.lru.insert((layer, pos), ());
            return Ok(false);
        }

        inner.layers[layer].meta[pos as usize] = SlotState::Disk;
        inner.host_used = inner.host_used.saturating_sub((rb * 2) as u64);
        core_metrics().pager_spills.add(1, &[]);
        debug!(
            "spilled layer {layer} pos {pos} ({} resident)",
            ByteSize(inner.host_used)
        );
        Ok(true)
    }

    /// Load a disk-resident position back into its arena slot.
    fn page_in_locked(
        &self,
        inner: &mut PagerInner,
        layer: usize,
        pos: usize,
    ) -> Result<(), TierError> {
        let store = self
            .spill
            .as_ref()
            .ok_or_else(|| TierError::Io(format!("layer {layer} pos {pos} tagged disk without a spill store")))?;

        let rb = self.cfg.row_bytes();
        let k_key = BlockKey::single(self.cfg.seq, layer, pos as i32, true);
        let v_key = BlockKey::single(self.cfg.seq, layer, pos as i32, false);
        let (k_data, _) = store
            .get(&k_key)?
            .ok_or_else(|| TierError::Io(format!("spilled block {k_key} missing from store")))?;
        let (v_data, _) = store
            .get(&v_key)?
            .ok_or_else(|| TierError::Io(format!("spilled block {v_key} missing from store")))?;
        if k_data.len() != rb || v_data.len() != rb {
            return Err(TierError::Io(format!(
                "spilled block {k_key} has {} bytes, expected {rb}",
                k_data.len()
            )));
        }

        let arena = &mut inner.layers[layer];
        // SAFETY: pos < count <= capacity; lengths checked above.
        unsafe {
            let k_dst = arena.k.as_mut().expect("arena").as_mut_ptr().add(pos * rb);
            let v_dst = arena.v.as_mut().expect("arena").as_mut_ptr().add(pos * rb);
            std::ptr::copy_nonoverlapping(k_data.as_ptr(), k_dst, rb);
            std::ptr::copy_nonoverlapping(v_data.as_ptr(), v_dst, rb);
        }
        arena.meta[pos] = SlotState::Host;
        inner.host_used += (rb * 2) as u64;
        inner.lru.insert((layer, pos as i32), ());
        core_metrics().pager_page_ins.add(1, &[]);
        Ok(())
    }

    /// Best-effort deletion of a position's spilled blocks.
    fn drop_spilled_blocks(&self, layer: usize, pos: usize) {
        if let Some(store) = &self.spill {
            store.remove(&BlockKey::single(self.cfg.seq, layer, pos as i32, true));
            store.remove(&BlockKey::single(self.cfg.seq, layer, pos as i32, false));
        }
    }
}
