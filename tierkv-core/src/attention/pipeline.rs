// ============================================================================
// PagedAttnContext: double-buffered copy/compute loop for one layer forward.
//
//   host KV (pinned)  ──HtoD async──▶  ping/pong chunk buffers (device)
//        ▲                  copy stream         │
//        │                                      ▼  compute stream
//   PageManager / bridge            online-softmax chunk kernel
//                                         (m, l, O) running state
//
// Only one chunk of K and one chunk of V occupy device memory at a time.
// Two events cross-synchronize the streams: the chunk kernel starts only
// after its chunk has landed, and a buffer is not overwritten while the
// kernel still reads it. The caller serializes successive forwards through
// the compute stream it provides.
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use bytesize::ByteSize;
use cudarc::driver::{CudaContext, CudaStream};
use log::debug;

use crate::attention::kernel::PagedAttnKernel;
use crate::metrics::core_metrics;
use crate::pager::PageManager;
use crate::transfer::{self, DeviceBuffer, SyncEvent};
use crate::TierError;

/// K and V rows move through the pipeline as f16.
pub const ELEM_BYTES: usize = 2;

/// Running (m, l, O) state sized for `rows = batch * q_heads`.
#[derive(Debug)]
struct RunningState {
    m: DeviceBuffer,
    l: DeviceBuffer,
    o: DeviceBuffer,
    rows: usize,
}

#[derive(Debug)]
pub struct PagedAttnContext {
    ctx: Arc<CudaContext>,
    copy_stream: Arc<CudaStream>,
    kernel: PagedAttnKernel,
    num_kv_heads: usize,
    head_dim: usize,
    chunk_size: usize,
    device: i32,
    /// Ping/pong chunk buffers, index = chunk parity.
    k_bufs: [DeviceBuffer; 2],
    v_bufs: [DeviceBuffer; 2],
    state: Option<RunningState>,
    copy_done: SyncEvent,
    compute_done: SyncEvent,
}

impl PagedAttnContext {
    pub fn new(
        num_kv_heads: usize,
        head_dim: usize,
        chunk_size: usize,
        device: i32,
    ) -> Result<Self, TierError> {
        if chunk_size == 0 {
            return Err(TierError::InvalidArgument("chunk_size must be >= 1".into()));
        }
        if num_kv_heads == 0 {
            return Err(TierError::InvalidArgument("num_kv_heads must be >= 1".into()));
        }
        if !transfer::cuda_driver_available() {
            return Err(TierError::Device("no usable CUDA driver".into()));
        }

        let ctx = CudaContext::new(device as usize)
            .map_err(|e| TierError::Device(format!("create CUDA context: {e:?}")))?;
        let kernel = PagedAttnKernel::new(&ctx, head_dim)?;
        let copy_stream = ctx
            .new_stream()
            .map_err(|e| TierError::Device(format!("create copy stream: {e:?}")))?;

        let chunk_bytes = chunk_size * num_kv_heads * head_dim * ELEM_BYTES;
        let k_bufs = [
            DeviceBuffer::alloc(&ctx, chunk_bytes)?,
            DeviceBuffer::alloc(&ctx, chunk_bytes)?,
        ];
        let v_bufs = [
            DeviceBuffer::alloc(&ctx, chunk_bytes)?,
            DeviceBuffer::alloc(&ctx, chunk_bytes)?,
        ];

        debug!(
            "paged attention context ready: device={device} head_dim={head_dim} kv_heads={num_kv_heads} chunk_size={chunk_size} chunk_bytes={}",
            ByteSize(chunk_bytes as u64)
        );
        Ok(Self {
            ctx,
            copy_stream,
            kernel,
            num_kv_heads,
            head_dim,
            chunk_size,
            device,
            k_bufs,
            v_bufs,
            state: None,
            copy_done: SyncEvent::new()?,
            compute_done: SyncEvent::new()?,
        })
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn cuda_context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Attention forward over host-resident KV.
    ///
    /// `k_host`/`v_host` point at `total_seq` contiguous rows of
    /// `num_kv_heads * head_dim` f16 values each (pinned for async transfer;
    /// pageable memory degrades to staged copies inside the driver).
    /// `q_dev` holds [batch, q_heads, head_dim] f16 on the device and
    /// `dst_dev` receives the same shape. On error the destination contents
    /// are undefined.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &mut self,
        k_host: *const u8,
        v_host: *const u8,
        total_seq: usize,
        q_dev: u64,
        dst_dev: u64,
        batch: usize,
        q_heads: usize,
        scale: f32,
        compute_stream: &Arc<CudaStream>,
    ) -> Result<(), TierError> {
        if q_heads == 0 || batch == 0 {
            return Err(TierError::InvalidArgument(
                "batch and q_heads must be >= 1".into(),
            ));
        }
        self.ctx
            .bind_to_thread()
            .map_err(|e| TierError::Device(format!("bind context: {e:?}")))?;

        let out_bytes = batch * q_heads * self.head_dim * ELEM_BYTES;
        if total_seq == 0 {
            return transfer::memset_device_async(dst_dev, out_bytes, compute_stream);
        }

        let start = Instant::now();
        let row_bytes = self.num_kv_heads * self.head_dim * ELEM_BYTES;
        let num_chunks = total_seq.div_ceil(self.chunk_size);
        self.ensure_state(batch * q_heads)?;
        let state = self.state.as_ref().expect("state allocated above");
        let (m_ptr, l_ptr, o_ptr) = (
            state.m.device_ptr(),
            state.l.device_ptr(),
            state.o.device_ptr(),
        );

        let chunk_span = |c: usize| -> (usize, usize) {
            let begin = c * self.chunk_size;
            let len = self.chunk_size.min(total_seq - begin);
            (begin, len)
        };

        // Chunk 0 lands before the loop starts; this is the one bounded
        // host-side wait in the forward.
        let (_, len0) = chunk_span(0);
        self.copy_chunk(k_host, v_host, 0, len0, row_bytes, 0)?;
        self.copy_stream
            .synchronize()
            .map_err(|e| TierError::Device(format!("copy stream sync: {e:?}")))?;

        let mut total_copied = len0 * row_bytes * 2;
        for c in 0..num_chunks {
            let buf = c & 1;
            let (_, len) = chunk_span(c);

            // Compute may start once everything issued so far on the copy
            // stream (which includes chunk c) has landed.
            self.copy_done.record(&self.copy_stream)?;
            self.copy_done.wait(compute_stream)?;

            if c + 1 < num_chunks {
                let (_, next_len) = chunk_span(c + 1);
                self.copy_chunk(k_host, v_host, c + 1, next_len, row_bytes, 1 - buf)?;
                total_copied += next_len * row_bytes * 2;
            }

            self.kernel.launch_chunk(
                compute_stream,
                q_dev,
                self.k_bufs[buf].device_ptr(),
                self.v_bufs[buf].device_ptr(),
                m_ptr,
                l_ptr,
                o_ptr,
                len,
                batch,
                q_heads,
                self.num_kv_heads,
                scale,
                c == 0,
            )?;

            // The buffer the kernel is reading must not be refilled until it
            // finishes; the copy two chunks ahead waits here.
            self.compute_done.record(compute_stream)?;
            self.compute_done.wait(&self.copy_stream)?;
        }

        self.kernel
            .launch_normalize(compute_stream, o_ptr, l_ptr, dst_dev, batch, q_heads)?;

        let metrics = core_metrics();
        metrics.chunks_processed.add(num_chunks as u64, &[]);
        metrics.h2d_bytes.add(total_copied as u64, &[]);
        metrics
            .forward_duration_seconds
            .record(start.elapsed().as_secs_f64(), &[]);
        debug!(
            "forward dispatched: seq={total_seq} chunks={num_chunks} copied={}",
            ByteSize(total_copied as u64)
        );
        Ok(())
    }

    /// Forward over the first `total_seq` positions of a page-managed layer.
    /// Disk-resident positions are paged in by the manager before the copy
    /// loop touches them.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_layer(
        &mut self,
        pager: &PageManager,
        layer: usize,
        total_seq: usize,
        q_dev: u64,
        dst_dev: u64,
        batch: usize,
        q_heads: usize,
        scale: f32,
        compute_stream: &Arc<CudaStream>,
    ) -> Result<(), TierError> {
        let range = pager.get_range(layer, 0, total_seq)?;
        if range.len < total_seq {
            return Err(TierError::InvalidArgument(format!(
                "layer {layer} holds {} positions, forward wants {total_seq}",
                range.len
            )));
        }
        self.forward(
            range.k_ptr,
            range.v_ptr,
            total_seq,
            q_dev,
            dst_dev,
            batch,
            q_heads,
            scale,
            compute_stream,
        )
    }

    fn copy_chunk(
        &self,
        k_host: *const u8,
        v_host: *const u8,
        chunk: usize,
        len: usize,
        row_bytes: usize,
        buf: usize,
    ) -> Result<(), TierError> {
        let offset = chunk * self.chunk_size * row_bytes;
        let bytes = len * row_bytes;
        // SAFETY: the caller's KV region covers total_seq rows and
        // offset + bytes stays inside it; buffers hold chunk_size rows.
        unsafe {
            transfer::copy_host_to_device_async(
                self.k_bufs[buf].device_ptr(),
                k_host.add(offset),
                bytes,
                &self.copy_stream,
            )?;
            transfer::copy_host_to_device_async(
                self.v_bufs[buf].device_ptr(),
                v_host.add(offset),
                bytes,
                &self.copy_stream,
            )?;
        }
        Ok(())
    }

    /// (Re)allocate running state when `rows` outgrows the current buffers.
    /// Contents never survive a forward, so growth does not copy.
    fn ensure_state(&mut self, rows: usize) -> Result<(), TierError> {
        if let Some(state) = &self.state {
            if state.rows >= rows {
                return Ok(());
            }
        }
        let scalar_bytes = rows * std::mem::size_of::<f32>();
        self.state = Some(RunningState {
            m: DeviceBuffer::alloc(&self.ctx, scalar_bytes)?,
            l: DeviceBuffer::alloc(&self.ctx, scalar_bytes)?,
            o: DeviceBuffer::alloc(&self.ctx, scalar_bytes * self.head_dim)?,
            rows,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::reference::{
        chunked_attention, reference_attention, relative_error_stats, AttnShape,
    };
    use cudarc::driver::sys;
    use half::f16;

    fn upload(ctx: &Arc<CudaContext>, bytes: &[u8]) -> DeviceBuffer {
        let buf = DeviceBuffer::alloc(ctx, bytes.len()).unwrap();
        // SAFETY: buf covers bytes.len() device bytes.
        let result = unsafe {
            sys::cuMemcpyHtoD_v2(
                buf.device_ptr(),
                bytes.as_ptr() as *const std::ffi::c_void,
                bytes.len(),
            )
        };
        assert_eq!(result, sys::cudaError_enum::CUDA_SUCCESS);
        buf
    }

    fn to_bytes(vals: &[f16]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn from_bytes(bytes: &[u8]) -> Vec<f16> {
        bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn context_rejects_zero_chunk() {
        // Argument validation happens before any device call.
        let err = PagedAttnContext::new(8, 128, 0, 0).unwrap_err();
        assert!(matches!(err, TierError::InvalidArgument(_)));
    }

    #[test]
    fn gpu_forward_matches_host_mirror() {
        if !transfer::cuda_driver_available() {
            return; // no CUDA device
        }
        let ctx = CudaContext::new(0).unwrap();

        let shape = AttnShape {
            batch: 2,
            q_heads: 4,
            kv_heads: 2,
            head_dim: 64,
            seq_len: 100,
        };
        let chunk_size = 32;

        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use rand_distr::StandardNormal;
        let mut rng = StdRng::seed_from_u64(11);
        let mut gauss = |n: usize| -> Vec<f16> {
            (0..n)
                .map(|_| {
                    let x: f32 = rng.sample(StandardNormal);
                    f16::from_f32(x * 0.1)
                })
                .collect()
        };

        let q = gauss(shape.batch * shape.q_heads * shape.head_dim);
        let k = gauss(shape.seq_len * shape.kv_heads * shape.head_dim);
        let v = gauss(shape.seq_len * shape.kv_heads * shape.head_dim);

        let k_bytes = to_bytes(&k);
        let v_bytes = to_bytes(&v);
        let q_dev = upload(&ctx, &to_bytes(&q));
        let dst_dev = DeviceBuffer::alloc(&ctx, q.len() * 2).unwrap();
        let compute = ctx.new_stream().unwrap();

        let mut pipeline =
            PagedAttnContext::new(shape.kv_heads, shape.head_dim, chunk_size, 0).unwrap();
        pipeline
            .forward(
                k_bytes.as_ptr(),
                v_bytes.as_ptr(),
                shape.seq_len,
                q_dev.device_ptr(),
                dst_dev.device_ptr(),
                shape.batch,
                shape.q_heads,
                shape.scale(),
                &compute,
            )
            .unwrap();
        compute.synchronize().unwrap();

        let mut out_bytes = vec![0u8; dst_dev.len()];
        transfer::copy_device_to_host(out_bytes.as_mut_ptr(), dst_dev.device_ptr(), out_bytes.len())
            .unwrap();
        let got = from_bytes(&out_bytes);

        let want = reference_attention(&q, &k, &v, shape);
        let (mean, max) = relative_error_stats(&got, &want);
        assert!(mean < 0.005, "mean rel err {mean}");
        assert!(max < 0.05, "max rel err {max}");

        // And the device path agrees with the host mirror of the recurrence.
        let mirror = chunked_attention(&q, &k, &v, shape, chunk_size);
        let mirror_f32: Vec<f32> = mirror.output.iter().map(|x| x.to_f32()).collect();
        let (mean, max) = relative_error_stats(&got, &mirror_f32);
        assert!(mean < 0.005 && max < 0.05, "device/mirror diverge: {mean} / {max}");
    }

    #[test]
    fn gpu_empty_sequence_zeroes_dst() {
        if !transfer::cuda_driver_available() {
            return;
        }
        let ctx = CudaContext::new(0).unwrap();
        let compute = ctx.new_stream().unwrap();
        let dst = DeviceBuffer::alloc(&ctx, 4 * 64 * 2).unwrap();

        let mut pipeline = PagedAttnContext::new(1, 64, 16, 0).unwrap();
        pipeline
            .forward(
                std::ptr::null(),
                std::ptr::null(),
                0,
                0,
                dst.device_ptr(),
                1,
                4,
                1.0,
                &compute,
            )
            .unwrap();
        compute.synchronize().unwrap();

        let mut out = vec![0xFFu8; dst.len()];
        transfer::copy_device_to_host(out.as_mut_ptr(), dst.device_ptr(), out.len()).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }
}
