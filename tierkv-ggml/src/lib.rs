//! C ABI consumed by the host runtime's op dispatcher.
//!
//! During graph build the runtime places K and V for the paged attention op
//! on host memory while Q and dst stay on the device; during execution its
//! backend dispatches here. The bridge resolves a pipeline context from the
//! process-wide pool and runs the double-buffered chunk loop.
//!
//! Contract notes:
//! - `tierkv_paged_attn_init` must run during runtime boot, before the first
//!   compute call; compute does not initialize lazily.
//! - Tensor layouts follow the dispatcher convention, head_dim fastest:
//!   Q/dst `[head_dim, num_q_heads, seq_q, batch]`, K/V
//!   `[head_dim, num_kv_heads, total_seq]` on the host. Query rows are
//!   folded into the batch dimension, which is exact because every row
//!   attends over the same stored sequence.
//! - The bridge synchronizes its compute stream before returning, so the
//!   caller's stream ordering is preserved without adopting the foreign
//!   stream handle. The `stream` parameter is accepted for ABI stability.

use std::ffi::c_void;

use log::{error, warn};
use tierkv_core::attention::pool::{self, PoolKey, DEFAULT_POOL_CAPACITY};
use tierkv_core::TierError;

/// Success.
pub const TIERKV_OK: i32 = 0;
/// An argument was null, non-positive, or inconsistent.
pub const TIERKV_ERR_INVALID_ARGUMENT: i32 = -1;
/// head_dim has no kernel instantiation, or head_dim_v differs from head_dim.
pub const TIERKV_ERR_UNSUPPORTED_HEAD_DIM: i32 = -2;
/// CUDA failure; the destination contents are undefined.
pub const TIERKV_ERR_DEVICE: i32 = -3;
/// The context pool is full.
pub const TIERKV_ERR_POOL_EXHAUSTED: i32 = -4;
/// `tierkv_paged_attn_init` has not run.
pub const TIERKV_ERR_NOT_INITIALIZED: i32 = -5;

/// Sequence length above which the auto-selected chunk grows to 2048.
const AUTO_CHUNK_THRESHOLD: i32 = 4096;

fn error_code(err: &TierError) -> i32 {
    match err {
        TierError::UnsupportedHeadDim(_) => TIERKV_ERR_UNSUPPORTED_HEAD_DIM,
        TierError::PoolExhausted { .. } => TIERKV_ERR_POOL_EXHAUSTED,
        TierError::InvalidArgument(_) => TIERKV_ERR_INVALID_ARGUMENT,
        _ => TIERKV_ERR_DEVICE,
    }
}

/// One-time initialization of the attention context pool. Thread-safe; only
/// the first call takes effect. Called during runtime boot.
#[no_mangle]
pub extern "C" fn tierkv_paged_attn_init() {
    pool::init(DEFAULT_POOL_CAPACITY);
}

/// Tear down every pooled context. Called at program exit.
#[no_mangle]
pub extern "C" fn tierkv_paged_attn_cleanup() {
    pool::shutdown();
}

/// Compute paged attention for one layer.
///
/// Q and dst are device pointers; K and V are host pointers (pinned memory
/// for full transfer overlap). `chunk_size == 0` selects automatically: 2048
/// positions when `total_seq` exceeds 4096, else 512. `head_dim_v` must
/// equal `head_dim` in this revision. Returns 0 on success or a negative
/// `TIERKV_ERR_*` code.
///
/// # Safety
///
/// Pointers must cover the sizes implied by the dimension arguments and stay
/// valid for the duration of the call.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn tierkv_paged_attn_compute(
    q_dev: *const c_void,
    k_host: *const c_void,
    v_host: *const c_void,
    dst_dev: *mut c_void,
    head_dim: i32,
    head_dim_v: i32,
    num_q_heads: i32,
    num_kv_heads: i32,
    seq_q: i32,
    total_seq: i32,
    batch: i32,
    scale: f32,
    chunk_size: i32,
    device: i32,
    _stream: *mut c_void,
) -> i32 {
    if q_dev.is_null() || dst_dev.is_null() {
        return TIERKV_ERR_INVALID_ARGUMENT;
    }
    if (k_host.is_null() || v_host.is_null()) && total_seq > 0 {
        return TIERKV_ERR_INVALID_ARGUMENT;
    }
    if head_dim <= 0
        || num_q_heads <= 0
        || num_kv_heads <= 0
        || seq_q <= 0
        || total_seq < 0
        || batch <= 0
        || chunk_size < 0
        || device < 0
    {
        return TIERKV_ERR_INVALID_ARGUMENT;
    }
    if head_dim_v != head_dim {
        warn!("head_dim_v {head_dim_v} != head_dim {head_dim}: general case not supported");
        return TIERKV_ERR_UNSUPPORTED_HEAD_DIM;
    }

    let pool = match pool::global() {
        Some(pool) => pool,
        None => {
            error!("tierkv_paged_attn_compute before tierkv_paged_attn_init");
            return TIERKV_ERR_NOT_INITIALIZED;
        }
    };

    let chunk = if chunk_size == 0 {
        if total_seq > AUTO_CHUNK_THRESHOLD {
            2048
        } else {
            512
        }
    } else {
        chunk_size
    };

    let key = PoolKey {
        num_kv_heads: num_kv_heads as usize,
        head_dim: head_dim as usize,
        chunk_size: chunk as usize,
        device,
    };
    let ctx = match pool.get_or_create(key) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("paged attention context unavailable: {e}");
            return error_code(&e);
        }
    };

    let mut pipeline = ctx.lock().expect("attention context lock poisoned");
    let compute_stream = match pipeline.cuda_context().new_stream() {
        Ok(s) => s,
        Err(e) => {
            error!("compute stream creation failed: {e:?}");
            return TIERKV_ERR_DEVICE;
        }
    };

    // Every query row attends over the same stored positions, so seq_q folds
    // into batch with the dispatcher's row ordering intact.
    let rows = (batch as usize) * (seq_q as usize);
    let result = pipeline.forward(
        k_host as *const u8,
        v_host as *const u8,
        total_seq as usize,
        q_dev as u64,
        dst_dev as u64,
        rows,
        num_q_heads as usize,
        scale,
        &compute_stream,
    );
    if let Err(e) = result {
        error!("paged attention forward failed: {e}");
        return error_code(&e);
    }

    if let Err(e) = compute_stream.synchronize() {
        error!("compute stream sync failed: {e:?}");
        return TIERKV_ERR_DEVICE;
    }
    TIERKV_OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_compute(head_dim: i32, head_dim_v: i32, total_seq: i32) -> i32 {
        // Non-null markers; argument validation rejects before any deref.
        let q = 0x1000 as *const c_void;
        let k = 0x2000 as *const c_void;
        let v = 0x3000 as *const c_void;
        let dst = 0x4000 as *mut c_void;
        unsafe {
            tierkv_paged_attn_compute(
                q,
                k,
                v,
                dst,
                head_dim,
                head_dim_v,
                8,
                8,
                1,
                total_seq,
                1,
                0.088,
                0,
                0,
                std::ptr::null_mut(),
            )
        }
    }

    #[test]
    fn null_pointers_rejected() {
        let code = unsafe {
            tierkv_paged_attn_compute(
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null_mut(),
                128,
                128,
                8,
                8,
                1,
                64,
                1,
                0.088,
                0,
                0,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(code, TIERKV_ERR_INVALID_ARGUMENT);
    }

    #[test]
    fn mismatched_value_head_dim_rejected() {
        assert_eq!(dummy_compute(128, 64, 64), TIERKV_ERR_UNSUPPORTED_HEAD_DIM);
    }

    #[test]
    fn compute_requires_explicit_init() {
        // The pool may already be initialized by a sibling test; only the
        // uninitialized half of the contract can be asserted determinately.
        if pool::global().is_none() {
            assert_eq!(dummy_compute(128, 128, 64), TIERKV_ERR_NOT_INITIALIZED);
        }
        tierkv_paged_attn_init();
        assert!(pool::global().is_some());
        tierkv_paged_attn_cleanup();
        assert!(pool::global().unwrap().is_empty());
    }
}
