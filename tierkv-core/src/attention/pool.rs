//! Pool of paged-attention contexts, keyed by KV geometry and device.
//!
//! The pool is process-wide: the host runtime wires it up during boot via
//! [`init`] and tears it down with [`shutdown`]. Initialization is guarded by
//! a one-shot primitive so concurrent callers observe a ready pool; it is
//! deliberately not implicit at first use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, info};

use crate::attention::pipeline::PagedAttnContext;
use crate::TierError;

/// Default bound on live contexts. Each context pins two chunk-sized K and V
/// buffers on its device, so the pool stays small.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub chunk_size: usize,
    pub device: i32,
}

pub struct ContextPool {
    capacity: usize,
    entries: Mutex<HashMap<PoolKey, Arc<Mutex<PagedAttnContext>>>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the context for a key, constructing it lazily. Fails with
    /// `PoolExhausted` when a new context would exceed the pool bound.
    pub fn get_or_create(&self, key: PoolKey) -> Result<Arc<Mutex<PagedAttnContext>>, TierError> {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        if let Some(ctx) = entries.get(&key) {
            return Ok(Arc::clone(ctx));
        }
        if entries.len() >= self.capacity {
            return Err(TierError::PoolExhausted {
                capacity: self.capacity,
            });
        }

        let ctx = PagedAttnContext::new(key.num_kv_heads, key.head_dim, key.chunk_size, key.device)?;
        let ctx = Arc::new(Mutex::new(ctx));
        entries.insert(key, Arc::clone(&ctx));
        debug!(
            "attention context created: kv_heads={} head_dim={} chunk_size={} device={} ({}/{} slots)",
            key.num_kv_heads,
            key.head_dim,
            key.chunk_size,
            key.device,
            entries.len(),
            self.capacity
        );
        Ok(ctx)
    }

    /// Tear down every context. Outstanding `Arc`s keep their contexts alive
    /// until the owners drop them.
    pub fn cleanup(&self) {
        let mut entries = self.entries.lock().expect("pool lock poisoned");
        let n = entries.len();
        entries.clear();
        if n > 0 {
            info!("attention context pool cleaned up ({n} contexts)");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static POOL: OnceLock<ContextPool> = OnceLock::new();

/// Initialize the process-wide pool. Runs exactly once; later calls return
/// the existing pool and ignore `capacity`.
pub fn init(capacity: usize) -> &'static ContextPool {
    POOL.get_or_init(|| ContextPool::new(capacity))
}

/// The process-wide pool, if [`init`] has run.
pub fn global() -> Option<&'static ContextPool> {
    POOL.get()
}

/// Tear down every pooled context. The pool itself stays initialized and
/// usable afterwards.
pub fn shutdown() {
    if let Some(pool) = POOL.get() {
        pool.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bound_is_enforced() {
        let pool = ContextPool::new(0);
        let err = pool
            .get_or_create(PoolKey {
                num_kv_heads: 8,
                head_dim: 128,
                chunk_size: 512,
                device: 0,
            })
            .unwrap_err();
        assert!(matches!(err, TierError::PoolExhausted { capacity: 0 }));
    }

    #[test]
    fn global_init_is_idempotent() {
        let a = init(DEFAULT_POOL_CAPACITY) as *const ContextPool;
        let b = init(1) as *const ContextPool;
        assert_eq!(a, b);
        assert!(global().is_some());
        shutdown();
        assert!(global().unwrap().is_empty());
    }

    #[test]
    fn contexts_are_shared_per_key() {
        if !crate::transfer::cuda_driver_available() {
            return; // no CUDA device
        }
        let pool = ContextPool::new(2);
        let key = PoolKey {
            num_kv_heads: 2,
            head_dim: 64,
            chunk_size: 32,
            device: 0,
        };
        let a = pool.get_or_create(key).unwrap();
        let b = pool.get_or_create(key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        pool.cleanup();
        assert_eq!(pool.len(), 0);
    }
}
