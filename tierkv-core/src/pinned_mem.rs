//! Low-level host memory allocation for KV arenas.
//!
//! Two allocation strategies:
//!
//! 1. **Pinned** (`cudaHostAlloc`): page-locked memory registered with the
//!    CUDA driver so the copy stream can DMA it asynchronously. The default
//!    flag is used rather than write-combined because the page manager reads
//!    rows back on the CPU when spilling to disk.
//!
//! 2. **Pageable** (`std::alloc`): ordinary aligned heap memory. Selected
//!    automatically when no CUDA driver is present so the host-side paths
//!    stay usable (and testable) on CPU-only machines; transfers from a
//!    pageable arena fall back to synchronous copies.
//!
//! # Safety
//!
//! The memory returned is valid for the lifetime of the `PinnedMemory`
//! struct and freed on drop through the allocator that produced it.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use cudarc::runtime::sys as rt;
use log::warn;

/// Alignment for pageable fallback allocations (cache line / SIMD friendly).
const PAGEABLE_ALIGN: usize = 64;

static PAGEABLE_FALLBACK_LOGGED: AtomicBool = AtomicBool::new(false);

/// Whether the CUDA runtime library can be loaded at all. Probed once; with
/// dynamic loading the first runtime call may unwind instead of erroring
/// when no library exists, so the probe contains it.
fn cuda_runtime_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        std::panic::catch_unwind(|| {
            let mut count = 0i32;
            let result = unsafe { rt::cudaGetDeviceCount(&mut count) };
            result == rt::cudaError::cudaSuccess && count > 0
        })
        .unwrap_or(false)
    })
}

/// Allocation strategy actually used for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Page-locked via cudaHostAlloc.
    Pinned,
    /// Plain aligned heap memory (no CUDA driver available).
    Pageable,
}

/// RAII wrapper for a host buffer used as KV arena backing.
pub struct PinnedMemory {
    ptr: NonNull<u8>,
    size: usize,
    strategy: AllocStrategy,
}

// SAFETY: the region is fixed for the lifetime of the struct and carries no
// thread affinity; pinned memory is explicitly safe to touch from any host
// thread, and the pageable fallback is an ordinary heap allocation.
unsafe impl Send for PinnedMemory {}
unsafe impl Sync for PinnedMemory {}

impl PinnedMemory {
    /// Allocate pinned memory, falling back to pageable memory when the CUDA
    /// runtime is unavailable. The fallback is logged once per process.
    pub fn allocate(size: usize) -> Result<Self, String> {
        if size == 0 {
            return Err("size must be greater than zero".to_string());
        }

        if cuda_runtime_available() {
            let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            let result = unsafe { rt::cudaHostAlloc(&mut ptr, size, rt::cudaHostAllocDefault) };
            if result == rt::cudaError::cudaSuccess && !ptr.is_null() {
                let ptr = NonNull::new(ptr as *mut u8).expect("cudaHostAlloc returned null");
                return Ok(Self {
                    ptr,
                    size,
                    strategy: AllocStrategy::Pinned,
                });
            }
            warn!("cudaHostAlloc of {size} bytes failed ({result:?}); using pageable memory");
        } else if !PAGEABLE_FALLBACK_LOGGED.swap(true, Ordering::Relaxed) {
            warn!("CUDA runtime unavailable; arenas fall back to pageable memory");
        }
        Self::allocate_pageable(size)
    }

    /// Allocate plain aligned heap memory, never touching the CUDA runtime.
    pub fn allocate_pageable(size: usize) -> Result<Self, String> {
        if size == 0 {
            return Err("size must be greater than zero".to_string());
        }
        let layout = Layout::from_size_align(size, PAGEABLE_ALIGN)
            .map_err(|e| format!("bad layout for {size} bytes: {e}"))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| format!("allocation of {size} bytes failed"))?;
        Ok(Self {
            ptr,
            size,
            strategy: AllocStrategy::Pageable,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn strategy(&self) -> AllocStrategy {
        self.strategy
    }
}

impl Drop for PinnedMemory {
    fn drop(&mut self) {
        match self.strategy {
            AllocStrategy::Pinned => {
                // SAFETY: ptr was allocated with cudaHostAlloc.
                let result = unsafe { rt::cudaFreeHost(self.ptr.as_ptr() as *mut std::ffi::c_void) };
                if result != rt::cudaError::cudaSuccess {
                    warn!("cudaFreeHost failed: {result:?}");
                }
            }
            AllocStrategy::Pageable => {
                let layout = Layout::from_size_align(self.size, PAGEABLE_ALIGN)
                    .expect("layout was validated at allocation");
                // SAFETY: ptr was allocated with this exact layout.
                unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}
