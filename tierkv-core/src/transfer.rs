use std::sync::Arc;

use cudarc::driver::{sys, CudaContext, CudaStream};
use tracing::instrument;

use crate::TierError;

// ============================================================================
// Transfer primitives for the attention pipeline:
// - async host→device copies on the dedicated copy stream
// - sync device→host readback (bridge/diagnostics path)
// - lightweight events for cross-stream handshakes
// ============================================================================

/// Whether the CUDA driver can be loaded and device 0 opened. Probed once;
/// with dynamic loading the first driver call may unwind instead of erroring
/// when no library exists, so the probe contains it.
pub(crate) fn cuda_driver_available() -> bool {
    use std::sync::OnceLock;
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        std::panic::catch_unwind(|| CudaContext::new(0).is_ok()).unwrap_or(false)
    })
}

/// Copy pinned host bytes to a raw device address on the given stream.
#[instrument(level = "debug", skip(src, stream), fields(bytes), err)]
pub(crate) fn copy_host_to_device_async(
    dst_dev: u64,
    src: *const u8,
    bytes: usize,
    stream: &CudaStream,
) -> Result<(), TierError> {
    if bytes == 0 {
        return Ok(());
    }
    // SAFETY: caller guarantees `src` covers `bytes` host bytes that stay
    // alive until the stream has consumed them, and `dst_dev` covers `bytes`
    // device bytes.
    unsafe {
        let result = sys::cuMemcpyHtoDAsync_v2(
            dst_dev,
            src as *const std::ffi::c_void,
            bytes,
            stream.cu_stream(),
        );
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuMemcpyHtoDAsync failed: {result:?}")));
        }
    }
    Ok(())
}

/// Synchronous device→host copy from a raw device address.
#[instrument(level = "debug", skip(dst), fields(bytes), err)]
pub(crate) fn copy_device_to_host(
    dst: *mut u8,
    src_dev: u64,
    bytes: usize,
) -> Result<(), TierError> {
    if bytes == 0 {
        return Ok(());
    }
    // SAFETY: caller guarantees both regions cover `bytes`.
    unsafe {
        let result = sys::cuMemcpyDtoH_v2(dst as *mut std::ffi::c_void, src_dev, bytes);
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuMemcpyDtoH failed: {result:?}")));
        }
    }
    Ok(())
}

/// Zero `bytes` device bytes asynchronously on the given stream.
pub(crate) fn memset_device_async(
    dst_dev: u64,
    bytes: usize,
    stream: &CudaStream,
) -> Result<(), TierError> {
    if bytes == 0 {
        return Ok(());
    }
    // SAFETY: caller guarantees dst covers `bytes` device bytes.
    unsafe {
        let result = sys::cuMemsetD8Async(dst_dev, 0, bytes, stream.cu_stream());
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuMemsetD8Async failed: {result:?}")));
        }
    }
    Ok(())
}

/// RAII device allocation addressed by its raw `CUdeviceptr`. The context is
/// held so the free lands in the right context regardless of drop thread.
#[derive(Debug)]
pub(crate) struct DeviceBuffer {
    ptr: sys::CUdeviceptr,
    bytes: usize,
    ctx: Arc<CudaContext>,
}

// SAFETY: a device address has no host-thread affinity; all accesses go
// through streams owned by the same context.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub fn alloc(ctx: &Arc<CudaContext>, bytes: usize) -> Result<Self, TierError> {
        ctx.bind_to_thread()
            .map_err(|e| TierError::Device(format!("bind context: {e:?}")))?;
        let mut ptr: sys::CUdeviceptr = 0;
        // SAFETY: out-pointer valid; bytes > 0 enforced below.
        let result = unsafe { sys::cuMemAlloc_v2(&mut ptr, bytes.max(1)) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!(
                "cuMemAlloc of {bytes} bytes failed: {result:?}"
            )));
        }
        Ok(Self {
            ptr,
            bytes,
            ctx: Arc::clone(ctx),
        })
    }

    #[inline]
    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.ctx.bind_to_thread().is_err() {
            return;
        }
        // SAFETY: ptr came from cuMemAlloc_v2 and is freed exactly once.
        unsafe {
            sys::cuMemFree_v2(self.ptr);
        }
    }
}

/// Timing-free CUDA event used for the copy/compute handshake.
#[derive(Debug)]
pub(crate) struct SyncEvent {
    event: sys::CUevent,
}

// SAFETY: a CUevent handle is process-wide and has no thread affinity; the
// driver serializes access internally.
unsafe impl Send for SyncEvent {}
unsafe impl Sync for SyncEvent {}

impl SyncEvent {
    pub fn new() -> Result<Self, TierError> {
        let mut event: sys::CUevent = std::ptr::null_mut();
        // SAFETY: out-pointer is valid; flags request a timing-free event.
        let result = unsafe {
            sys::cuEventCreate(
                &mut event,
                sys::CUevent_flags_enum::CU_EVENT_DISABLE_TIMING as u32,
            )
        };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuEventCreate failed: {result:?}")));
        }
        Ok(Self { event })
    }

    /// Record this event on a stream.
    pub fn record(&self, stream: &CudaStream) -> Result<(), TierError> {
        // SAFETY: event and stream handles are live.
        let result = unsafe { sys::cuEventRecord(self.event, stream.cu_stream()) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuEventRecord failed: {result:?}")));
        }
        Ok(())
    }

    /// Make a stream wait for the last recorded occurrence of this event.
    pub fn wait(&self, stream: &CudaStream) -> Result<(), TierError> {
        // SAFETY: event and stream handles are live.
        let result = unsafe { sys::cuStreamWaitEvent(stream.cu_stream(), self.event, 0) };
        if result != sys::cudaError_enum::CUDA_SUCCESS {
            return Err(TierError::Device(format!("cuStreamWaitEvent failed: {result:?}")));
        }
        Ok(())
    }
}

impl Drop for SyncEvent {
    fn drop(&mut self) {
        // SAFETY: the handle was created by cuEventCreate and not destroyed.
        unsafe {
            sys::cuEventDestroy_v2(self.event);
        }
    }
}
