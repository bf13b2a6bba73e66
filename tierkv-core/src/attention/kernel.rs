//! CUDA kernel wrapper for the online-softmax chunk loop.

use std::sync::Arc;

use cudarc::driver::{CudaContext, CudaFunction, CudaModule, CudaStream, LaunchConfig, PushKernelArg};
use log::debug;

use crate::TierError;

/// Head dimensions with a compiled kernel instantiation.
pub const SUPPORTED_HEAD_DIMS: [usize; 5] = [64, 80, 96, 128, 256];

/// Threads per block; power of two so the shared-memory reductions stay
/// branch-free, independent of head_dim.
pub(crate) const BLOCK_THREADS: u32 = 128;

const NORMALIZE_FN: &str = "paged_attn_normalize";

/// CUDA source, compiled with NVRTC at context creation and JIT-loaded, so
/// the kernels run on whatever architecture the driver supports.
const KERNEL_SOURCE: &str = include_str!("kernels/paged_attn.cu");

/// Compiled chunk + normalize kernels for one head dimension.
#[derive(Debug)]
pub struct PagedAttnKernel {
    #[allow(dead_code)]
    module: Arc<CudaModule>,
    chunk_fn: CudaFunction,
    normalize_fn: CudaFunction,
    head_dim: usize,
}

impl PagedAttnKernel {
    /// Compile and load the kernels for `head_dim` on the given context.
    pub fn new(ctx: &Arc<CudaContext>, head_dim: usize) -> Result<Self, TierError> {
        if !SUPPORTED_HEAD_DIMS.contains(&head_dim) {
            return Err(TierError::UnsupportedHeadDim(head_dim));
        }

        let ptx = cudarc::nvrtc::compile_ptx(KERNEL_SOURCE)
            .map_err(|e| TierError::Device(format!("nvrtc compile failed: {e}")))?;
        let module = ctx
            .load_module(ptx)
            .map_err(|e| TierError::Device(format!("module load failed: {e:?}")))?;

        let chunk_name = format!("paged_attn_chunk_hd{head_dim}");
        let chunk_fn = module
            .load_function(&chunk_name)
            .map_err(|e| TierError::Device(format!("kernel {chunk_name} missing: {e:?}")))?;
        let normalize_fn = module
            .load_function(NORMALIZE_FN)
            .map_err(|e| TierError::Device(format!("kernel {NORMALIZE_FN} missing: {e:?}")))?;

        debug!("paged attention kernels loaded for head_dim={head_dim}");
        Ok(Self {
            module,
            chunk_fn,
            normalize_fn,
            head_dim,
        })
    }

    /// Fold one KV chunk into the running (m, l, O) state. All buffers are
    /// raw device addresses owned by the caller.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn launch_chunk(
        &self,
        stream: &Arc<CudaStream>,
        q_dev: u64,
        k_chunk: u64,
        v_chunk: u64,
        m_state: u64,
        l_state: u64,
        o_state: u64,
        chunk_len: usize,
        batch: usize,
        q_heads: usize,
        kv_heads: usize,
        scale: f32,
        is_first: bool,
    ) -> Result<(), TierError> {
        let cfg = LaunchConfig {
            grid_dim: (q_heads as u32, batch as u32, 1),
            block_dim: (BLOCK_THREADS, 1, 1),
            shared_mem_bytes: ((chunk_len + BLOCK_THREADS as usize)
                * std::mem::size_of::<f32>()) as u32,
        };

        let chunk_len_i = chunk_len as i32;
        let q_heads_i = q_heads as i32;
        let kv_heads_i = kv_heads as i32;
        let is_first_i = is_first as i32;

        // SAFETY: the kernel signature matches the argument list below; the
        // caller guarantees every address covers the sizes implied by the
        // geometry and stays live until the stream has consumed it.
        unsafe {
            let mut builder = stream.launch_builder(&self.chunk_fn);
            builder.arg(&q_dev);
            builder.arg(&k_chunk);
            builder.arg(&v_chunk);
            builder.arg(&m_state);
            builder.arg(&l_state);
            builder.arg(&o_state);
            builder.arg(&chunk_len_i);
            builder.arg(&q_heads_i);
            builder.arg(&kv_heads_i);
            builder.arg(&scale);
            builder.arg(&is_first_i);
            builder
                .launch(cfg)
                .map_err(|e| TierError::Device(format!("chunk kernel launch: {e:?}")))?;
        }
        Ok(())
    }

    /// Divide the accumulator by the running exp-sum and write f16 output.
    pub(crate) fn launch_normalize(
        &self,
        stream: &Arc<CudaStream>,
        o_state: u64,
        l_state: u64,
        dst_dev: u64,
        batch: usize,
        q_heads: usize,
    ) -> Result<(), TierError> {
        let cfg = LaunchConfig {
            grid_dim: (q_heads as u32, batch as u32, 1),
            block_dim: (BLOCK_THREADS, 1, 1),
            shared_mem_bytes: 0,
        };
        let q_heads_i = q_heads as i32;
        let head_dim_i = self.head_dim as i32;

        // SAFETY: see launch_chunk; dst covers [batch, q_heads, head_dim]
        // halves on the device.
        unsafe {
            let mut builder = stream.launch_builder(&self.normalize_fn);
            builder.arg(&o_state);
            builder.arg(&l_state);
            builder.arg(&dst_dev);
            builder.arg(&q_heads_i);
            builder.arg(&head_dim_i);
            builder
                .launch(cfg)
                .map_err(|e| TierError::Device(format!("normalize kernel launch: {e:?}")))?;
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }
}
