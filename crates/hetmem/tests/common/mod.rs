//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::mpsc;

use hetmem::prelude::*;
use tracing_subscriber::EnvFilter;

pub const GPU0: DeviceId = simulated_gpu(0);
pub const GPU1: DeviceId = simulated_gpu(1);

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host runtime with `gpus` simulated GPUs.
pub fn runtime(gpus: usize) -> MemoryRuntime {
    init_tracing();
    HostRuntime::builder()
        .gpus(gpus)
        .build()
        .expect("Failed to create runtime")
}

/// `0, step, 2 * step, ...`
pub fn ramp(len: usize, step: f32) -> Vec<f32> {
    (0..len).map(|i| i as f32 * step).collect()
}

/// Copy `len` floats out of host-addressable memory.
///
/// # Safety
///
/// `ptr` must point to at least `len` initialized floats.
pub unsafe fn read_f32(ptr: DevicePtr, len: usize) -> Vec<f32> {
    std::slice::from_raw_parts(ptr.as_ptr::<f32>(), len).to_vec()
}

/// Kernel doing nothing.
pub fn noop() -> Work {
    Work::kernel(|| Ok(()))
}

/// Kernel writing `values` to `ptr`.
pub fn fill(ptr: DevicePtr, values: Vec<f32>) -> Work {
    Work::kernel(move || {
        // SAFETY: the runtime hands out allocations of the array's size.
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), ptr.as_mut_ptr::<f32>(), values.len())
        };
        Ok(())
    })
}

/// Kernel writing `values` to `ptr` once `gate` fires.
pub fn gated_fill(ptr: DevicePtr, values: Vec<f32>, gate: mpsc::Receiver<()>) -> Work {
    Work::kernel(move || {
        gate.recv()
            .map_err(|_| HetmemError::KernelFailed("gate dropped".to_string()))?;
        // SAFETY: the runtime hands out allocations of the array's size.
        unsafe {
            std::ptr::copy_nonoverlapping(values.as_ptr(), ptr.as_mut_ptr::<f32>(), values.len())
        };
        Ok(())
    })
}

/// Kernel sending the `len` floats at `ptr` through `tx`.
pub fn capture(ptr: DevicePtr, len: usize, tx: mpsc::Sender<Vec<f32>>) -> Work {
    Work::kernel(move || {
        // SAFETY: the runtime hands out allocations of the array's size.
        let values = unsafe { read_f32(ptr, len) };
        tx.send(values)
            .map_err(|_| HetmemError::KernelFailed("receiver dropped".to_string()))
    })
}
