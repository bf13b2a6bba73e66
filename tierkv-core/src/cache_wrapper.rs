// ============================================================================
// TieredCache: bridges the host runtime's causal KV cache to the BlockStore.
//
// The runtime calls `remove` right before it frees cache cells; the wrapper
// snapshots the raw K/V row bytes for the evicted positions so they survive
// on disk. After an in-memory prefix match, `restore_range` extends the
// match by copying rows back from disk into free cells, position by
// position, stopping at the first gap.
//
// Policy: tiering never aborts the containing request. A snapshot that fails
// to persist is dropped with a warning (the runtime already plans to discard
// the cells), and a restore that stops short simply leaves the remaining
// positions to recomputation.
// ============================================================================

use std::sync::Arc;

use log::{debug, warn};

use crate::block_store::{BlockKey, BlockStore};
use crate::metrics::core_metrics;

/// Access to the host runtime's cache tensors and cell table.
///
/// The byte views alias the runtime tensor's backing memory: contiguous
/// storage with a stable row stride, `stride * capacity` bytes long. They are
/// borrowed for the duration of a single wrapper call and never retained.
pub trait CellCache {
    fn num_layers(&self) -> usize;
    /// Number of cache cells per layer.
    fn capacity(&self) -> usize;
    /// Position held by cell `idx` if it is occupied by `seq`.
    fn cell_pos(&self, idx: usize, seq: u64) -> Option<i32>;
    /// Index of a free cell, if any.
    fn find_free_cell(&self) -> Option<usize>;
    /// Mark a cell occupied by (seq, pos).
    fn occupy_cell(&mut self, idx: usize, seq: u64, pos: i32);

    fn dtype(&self) -> &str;
    fn k_shape(&self, layer: usize) -> Vec<usize>;
    fn v_shape(&self, layer: usize) -> Vec<usize>;
    /// Bytes of one K row (one cell) in layer `layer`.
    fn k_row_stride(&self, layer: usize) -> usize;
    fn v_row_stride(&self, layer: usize) -> usize;
    /// Writable view over the layer's K tensor, `stride * capacity` long.
    fn k_bytes(&mut self, layer: usize) -> &mut [u8];
    fn v_bytes(&mut self, layer: usize) -> &mut [u8];
}

/// Disk-tiering wrapper around a runtime KV cache.
pub struct TieredCache {
    store: Arc<BlockStore>,
    /// Positions per wrapper-level block. The base layout snapshots one
    /// position per block; the key's (begin, end) range leaves room to
    /// coarsen this without a format change.
    pub block_size: i32,
    enabled: bool,
}

impl TieredCache {
    pub fn new(store: Arc<BlockStore>, block_size: i32, enabled: bool) -> Self {
        Self {
            store,
            block_size,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Snapshot the K and V rows of every cell of `seq` whose position lies
    /// in [begin, end), before the runtime releases those cells. Returns the
    /// number of rows persisted.
    pub fn remove<C: CellCache>(&self, cache: &mut C, seq: u64, begin: i32, end: i32) -> usize {
        if !self.enabled {
            return 0;
        }

        let matches: Vec<(usize, i32)> = (0..cache.capacity())
            .filter_map(|idx| {
                cache
                    .cell_pos(idx, seq)
                    .filter(|pos| (begin..end).contains(pos))
                    .map(|pos| (idx, pos))
            })
            .collect();
        if matches.is_empty() {
            return 0;
        }

        let dtype = cache.dtype().to_string();
        let mut stored = 0usize;
        for layer in 0..cache.num_layers() {
            let k_stride = cache.k_row_stride(layer);
            let v_stride = cache.v_row_stride(layer);
            let k_shape = cache.k_shape(layer);
            let v_shape = cache.v_shape(layer);

            for &(idx, pos) in &matches {
                let k_row = cache.k_bytes(layer)[idx * k_stride..][..k_stride].to_vec();
                let key = BlockKey::single(seq, layer, pos, true);
                match self.store.put(key, &dtype, k_shape.clone(), &k_row) {
                    Ok(()) => stored += 1,
                    Err(e) => {
                        warn!("snapshot of {key} dropped: {e}");
                        continue;
                    }
                }

                let v_row = cache.v_bytes(layer)[idx * v_stride..][..v_stride].to_vec();
                let key = BlockKey::single(seq, layer, pos, false);
                match self.store.put(key, &dtype, v_shape.clone(), &v_row) {
                    Ok(()) => stored += 1,
                    Err(e) => warn!("snapshot of {key} dropped: {e}"),
                }
            }
        }

        core_metrics().snapshot_rows.add(stored as u64, &[]);
        debug!(
            "snapshot: seq={seq} range=[{begin}, {end}) cells={} rows={stored}",
            matches.len()
        );
        stored
    }

    /// Restore positions [begin, end) of `seq` from disk into free cells,
    /// contiguously. Stops at the first position missing either row for any
    /// layer, or when no free cell remains. Returns positions restored.
    ///
    /// A position that already occupies a cell counts as restored without
    /// copying, so re-running over the same range is a no-op on content.
    pub fn restore_range<C: CellCache>(
        &self,
        cache: &mut C,
        seq: u64,
        begin: i32,
        end: i32,
    ) -> usize {
        if !self.enabled {
            return 0;
        }

        let mut restored = 0usize;
        'positions: for pos in begin..end {
            if self.find_cell(cache, seq, pos).is_some() {
                restored += 1;
                continue;
            }

            for layer in 0..cache.num_layers() {
                if !self.store.has(&BlockKey::single(seq, layer, pos, true))
                    || !self.store.has(&BlockKey::single(seq, layer, pos, false))
                {
                    break 'positions;
                }
            }

            let idx = match cache.find_free_cell() {
                Some(idx) => idx,
                None => {
                    debug!("restore: no free cell at seq={seq} pos={pos}");
                    break;
                }
            };

            for layer in 0..cache.num_layers() {
                if !self.restore_row(cache, seq, layer, pos, idx, true)
                    || !self.restore_row(cache, seq, layer, pos, idx, false)
                {
                    break 'positions;
                }
            }

            cache.occupy_cell(idx, seq, pos);
            restored += 1;
        }

        if restored > 0 {
            core_metrics()
                .restored_rows
                .add((restored * cache.num_layers() * 2) as u64, &[]);
            debug!("restored seq={seq} positions [{begin}, {})", begin + restored as i32);
        }
        restored
    }

    fn find_cell<C: CellCache>(&self, cache: &C, seq: u64, pos: i32) -> Option<usize> {
        (0..cache.capacity()).find(|&idx| cache.cell_pos(idx, seq) == Some(pos))
    }

    fn restore_row<C: CellCache>(
        &self,
        cache: &mut C,
        seq: u64,
        layer: usize,
        pos: i32,
        idx: usize,
        is_key: bool,
    ) -> bool {
        let key = BlockKey::single(seq, layer, pos, is_key);
        let data = match self.store.get(&key) {
            Ok(Some((data, _))) => data,
            Ok(None) => return false,
            Err(e) => {
                warn!("restore of {key} failed: {e}; falling back to recompute");
                return false;
            }
        };

        let stride = if is_key {
            cache.k_row_stride(layer)
        } else {
            cache.v_row_stride(layer)
        };
        if data.len() != stride {
            warn!("restore of {key}: {} bytes, row stride {stride}", data.len());
            return false;
        }

        let view = if is_key {
            cache.k_bytes(layer)
        } else {
            cache.v_bytes(layer)
        };
        view[idx * stride..][..stride].copy_from_slice(&data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStoreConfig;
    use tempfile::TempDir;

    struct MockCache {
        layers: usize,
        capacity: usize,
        stride: usize,
        k: Vec<Vec<u8>>,
        v: Vec<Vec<u8>>,
        cells: Vec<Option<(u64, i32)>>,
    }

    impl MockCache {
        fn new(layers: usize, capacity: usize, stride: usize) -> Self {
            Self {
                layers,
                capacity,
                stride,
                k: vec![vec![0u8; capacity * stride]; layers],
                v: vec![vec![0u8; capacity * stride]; layers],
                cells: vec![None; capacity],
            }
        }

        /// Fill one cell with recognizable per-(layer, pos, kv) bytes.
        fn seed(&mut self, idx: usize, seq: u64, pos: i32) {
            for layer in 0..self.layers {
                let fill = |kv: u8| (layer as u8) ^ (pos as u8) ^ kv;
                self.k[layer][idx * self.stride..][..self.stride].fill(fill(0x55));
                self.v[layer][idx * self.stride..][..self.stride].fill(fill(0xAA));
            }
            self.cells[idx] = Some((seq, pos));
        }

        fn release_all(&mut self) {
            self.cells.fill(None);
            for layer in 0..self.layers {
                self.k[layer].fill(0);
                self.v[layer].fill(0);
            }
        }

        fn row(&self, layer: usize, idx: usize, is_key: bool) -> &[u8] {
            let buf = if is_key { &self.k[layer] } else { &self.v[layer] };
            &buf[idx * self.stride..][..self.stride]
        }
    }

    impl CellCache for MockCache {
        fn num_layers(&self) -> usize {
            self.layers
        }
        fn capacity(&self) -> usize {
            self.capacity
        }
        fn cell_pos(&self, idx: usize, seq: u64) -> Option<i32> {
            match self.cells[idx] {
                Some((s, pos)) if s == seq => Some(pos),
                _ => None,
            }
        }
        fn find_free_cell(&self) -> Option<usize> {
            self.cells.iter().position(|c| c.is_none())
        }
        fn occupy_cell(&mut self, idx: usize, seq: u64, pos: i32) {
            self.cells[idx] = Some((seq, pos));
        }
        fn dtype(&self) -> &str {
            "f16"
        }
        fn k_shape(&self, _layer: usize) -> Vec<usize> {
            vec![self.stride / 2]
        }
        fn v_shape(&self, _layer: usize) -> Vec<usize> {
            vec![self.stride / 2]
        }
        fn k_row_stride(&self, _layer: usize) -> usize {
            self.stride
        }
        fn v_row_stride(&self, _layer: usize) -> usize {
            self.stride
        }
        fn k_bytes(&mut self, layer: usize) -> &mut [u8] {
            &mut self.k[layer]
        }
        fn v_bytes(&mut self, layer: usize) -> &mut [u8] {
            &mut self.v[layer]
        }
    }

    fn wrapper(dir: &TempDir, enabled: bool) -> TieredCache {
        let store = Arc::new(
            BlockStore::open(BlockStoreConfig {
                local_path: dir.path().join("local"),
                remote_path: None,
                local_budget: 1024 * 1024,
                remote_budget: 0,
                compress: false,
            })
            .unwrap(),
        );
        TieredCache::new(store, 256, enabled)
    }

    #[test]
    fn snapshot_then_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, true);
        let mut cache = MockCache::new(2, 16, 32);
        for pos in 0..8 {
            cache.seed(pos as usize, 3, pos);
        }

        let rows = tiered.remove(&mut cache, 3, 0, 8);
        assert_eq!(rows, 8 * 2 * 2); // positions × layers × (K + V)

        // The runtime frees and zeroes the cells; the prefix then resumes.
        cache.release_all();
        let restored = tiered.restore_range(&mut cache, 3, 0, 8);
        assert_eq!(restored, 8);

        for pos in 0..8i32 {
            let idx = tiered.find_cell(&cache, 3, pos).expect("cell reoccupied");
            for layer in 0..2usize {
                let fill_k = (layer as u8) ^ (pos as u8) ^ 0x55;
                let fill_v = (layer as u8) ^ (pos as u8) ^ 0xAA;
                assert!(cache.row(layer, idx, true).iter().all(|&b| b == fill_k));
                assert!(cache.row(layer, idx, false).iter().all(|&b| b == fill_v));
            }
        }
    }

    #[test]
    fn second_restore_is_a_content_noop() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, true);
        let mut cache = MockCache::new(1, 8, 16);
        for pos in 0..4 {
            cache.seed(pos as usize, 0, pos);
        }
        tiered.remove(&mut cache, 0, 0, 4);
        cache.release_all();

        assert_eq!(tiered.restore_range(&mut cache, 0, 0, 4), 4);
        let snapshot: Vec<Vec<u8>> = vec![cache.k[0].clone(), cache.v[0].clone()];
        let occupied = cache.cells.clone();

        assert_eq!(tiered.restore_range(&mut cache, 0, 0, 4), 4);
        assert_eq!(cache.k[0], snapshot[0]);
        assert_eq!(cache.v[0], snapshot[1]);
        assert_eq!(cache.cells, occupied);
    }

    #[test]
    fn restore_stops_at_first_gap() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, true);
        let mut cache = MockCache::new(2, 16, 32);
        for pos in 0..6 {
            cache.seed(pos as usize, 9, pos);
        }
        tiered.remove(&mut cache, 9, 0, 6);
        cache.release_all();

        // Punch a hole at position 3 (one layer's K row is enough).
        tiered
            .store
            .remove(&BlockKey::single(9, 1, 3, true));

        assert_eq!(tiered.restore_range(&mut cache, 9, 0, 6), 3);
        assert!(tiered.find_cell(&cache, 9, 2).is_some());
        assert!(tiered.find_cell(&cache, 9, 3).is_none());
        assert!(tiered.find_cell(&cache, 9, 4).is_none());
    }

    #[test]
    fn restore_stops_when_cells_run_out() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, true);
        let mut cache = MockCache::new(1, 4, 16);
        for pos in 0..4 {
            cache.seed(pos as usize, 0, pos);
        }
        tiered.remove(&mut cache, 0, 0, 4);

        // Only two cells come back free.
        cache.release_all();
        cache.occupy_cell(0, 77, 0);
        cache.occupy_cell(1, 77, 1);

        assert_eq!(tiered.restore_range(&mut cache, 0, 0, 4), 2);
    }

    #[test]
    fn disabled_wrapper_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, false);
        let mut cache = MockCache::new(1, 4, 16);
        cache.seed(0, 0, 0);

        assert_eq!(tiered.remove(&mut cache, 0, 0, 4), 0);
        assert_eq!(tiered.restore_range(&mut cache, 0, 0, 4), 0);
        assert_eq!(tiered.store.stats().local_blocks, 0);
    }

    #[test]
    fn remove_only_touches_requested_range_and_seq() {
        let dir = TempDir::new().unwrap();
        let tiered = wrapper(&dir, true);
        let mut cache = MockCache::new(1, 16, 16);
        for pos in 0..8 {
            cache.seed(pos as usize, 0, pos);
        }
        cache.seed(8, 5, 2); // other sequence at an in-range position

        let rows = tiered.remove(&mut cache, 0, 2, 5);
        assert_eq!(rows, 3 * 2); // positions 2, 3, 4 × (K + V)
        assert!(tiered.store.has(&BlockKey::single(0, 0, 2, true)));
        assert!(!tiered.store.has(&BlockKey::single(0, 0, 5, true)));
        assert!(!tiered.store.has(&BlockKey::single(5, 0, 2, true)));
    }
}
