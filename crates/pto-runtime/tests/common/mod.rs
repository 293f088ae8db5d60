//! Common test utilities for end-to-end runtime tests.
//!
//! This module provides the simulated vector kernels, the four-task vector
//! orchestration and an allocation-counting memory stub shared across the
//! integration test files.

#![allow(dead_code)]

use parking_lot::Mutex;
use pto_core::{BuildMode, CapabilityError, CoreType, DeviceMemory, DevicePtr, Scalar, TaskArg, TaskId};
use pto_runtime::{
    DeviceSession, GraphBuilder, HostTensor, Kernel, KernelContext, KernelError, KernelTable,
    RuntimeArgs, RuntimeConfig, RuntimeError, SimDevice, SimPlatform,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Element count of the vector example.
pub const SIZE: usize = 6;

/// Install a test log subscriber once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}

// ── Kernels ──

fn binary_op(ctx: &KernelContext<'_>, op: impl Fn(f32, f32) -> f32) -> Result<(), KernelError> {
    let n = ctx.arg_u64(3)? as usize;
    let a = ctx.read::<f32>(ctx.arg_address(0)?, n)?;
    let b = ctx.read::<f32>(ctx.arg_address(1)?, n)?;
    let out: Vec<f32> = a.iter().zip(&b).map(|(&x, &y)| op(x, y)).collect();
    ctx.write(ctx.arg_address(2)?, &out)
}

/// out = a + b. Args: [a, b, out, n]
pub fn kernel_add(ctx: &KernelContext<'_>) -> Result<(), KernelError> {
    binary_op(ctx, |x, y| x + y)
}

/// out = a * b. Args: [a, b, out, n]
pub fn kernel_mul(ctx: &KernelContext<'_>) -> Result<(), KernelError> {
    binary_op(ctx, |x, y| x * y)
}

/// out = src + scalar. Args: [src, scalar: f32, out, n]
pub fn kernel_add_scalar(ctx: &KernelContext<'_>) -> Result<(), KernelError> {
    let n = ctx.arg_u64(3)? as usize;
    let scalar = ctx.arg_f32(1)?;
    let src = ctx.read::<f32>(ctx.arg_address(0)?, n)?;
    let out: Vec<f32> = src.iter().map(|&x| x + scalar).collect();
    ctx.write(ctx.arg_address(2)?, &out)
}

pub fn kernel_fail(ctx: &KernelContext<'_>) -> Result<(), KernelError> {
    Err(KernelError::Failed(format!("task {} refused to run", ctx.task_id())))
}

pub fn kernel_panic(_: &KernelContext<'_>) -> Result<(), KernelError> {
    panic!("kernel bug")
}

fn kernel_fn<F>(f: F) -> F
where
    F: Fn(&KernelContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
{
    f
}

/// A kernel that records the order in which tasks run.
pub fn log_kernel(log: Arc<Mutex<Vec<TaskId>>>) -> impl Kernel {
    kernel_fn(move |ctx| {
        log.lock().push(ctx.task_id());
        Ok(())
    })
}

pub fn vector_kernels() -> KernelTable {
    let mut kernels = KernelTable::new();
    kernels
        .register("kernel_add", kernel_add)
        .register("kernel_add_scalar", kernel_add_scalar)
        .register("kernel_mul", kernel_mul)
        .register("kernel_fail", kernel_fail)
        .register("kernel_panic", kernel_panic);
    kernels
}

/// Function ids: 0 = add, 1 = add scalar, 2 = mul, 3 = fail, 4 = panic.
pub fn register_vector_functions(session: &mut DeviceSession) -> pto_runtime::Result<()> {
    session.register_functions(&[
        (0, b"kernel_add".as_slice()),
        (1, b"kernel_add_scalar".as_slice()),
        (2, b"kernel_mul".as_slice()),
        (3, b"kernel_fail".as_slice()),
        (4, b"kernel_panic".as_slice()),
    ])
}

// ── Orchestration ──

/// Four tasks over vectors of `SIZE` f32:
/// c = a + b; d = c + 1; e = c + 2; f = d * e
///
/// Orchestration args: [a, b, f, bytes_a, bytes_b, bytes_f, size]
pub fn vector_orchestration(b: &GraphBuilder<'_>) -> pto_runtime::Result<()> {
    let dev_a = b.arg_address(0)?;
    let dev_b = b.arg_address(1)?;
    let dev_f = b.arg_address(2)?;
    let size = b.arg_u64(6)?;
    let bytes = size as usize * std::mem::size_of::<f32>();

    let scratch = |name: &str| {
        b.device_malloc(bytes)
            .ok_or_else(|| RuntimeError::ResourceExhausted(format!("no device memory for {name}")))
    };
    let dev_c = scratch("c")?;
    let dev_d = scratch("d")?;
    let dev_e = scratch("e")?;
    let n = TaskArg::from(size);

    let t0 = b.add_task(&[dev_a.into(), dev_b.into(), dev_c.into(), n], 0, CoreType::Aiv)?;
    b.publish_task(t0)?;

    let t1 = b.add_task(&[dev_c.into(), 1.0f32.into(), dev_d.into(), n], 1, CoreType::Aiv)?;
    let t2 = b.add_task(&[dev_c.into(), 2.0f32.into(), dev_e.into(), n], 1, CoreType::Aiv)?;
    b.add_successor(t0, t1)?;
    b.add_successor(t0, t2)?;
    b.publish_task(t1)?;
    b.publish_task(t2)?;

    let t3 = b.add_task(&[dev_d.into(), dev_e.into(), dev_f.into(), n], 2, CoreType::Aiv)?;
    b.add_successor(t1, t3)?;
    b.add_successor(t2, t3)?;
    b.publish_task(t3)?;
    Ok(())
}

pub struct VectorIo {
    pub a: HostTensor,
    pub b: HostTensor,
    pub f: HostTensor,
}

impl VectorIo {
    pub fn new() -> Self {
        Self {
            a: HostTensor::from_vec(vec![1.0f32; SIZE]),
            b: HostTensor::from_vec(vec![2.0f32; SIZE]),
            f: HostTensor::zeroed(SIZE * std::mem::size_of::<f32>()),
        }
    }

    pub fn args(&self) -> RuntimeArgs {
        let bytes = |t: &HostTensor| Scalar::U64(t.len_bytes() as u64);
        RuntimeArgs::from_fn(vector_orchestration)
            .input(self.a.clone())
            .input(self.b.clone())
            .output(self.f.clone())
            .scalar(bytes(&self.a))
            .scalar(bytes(&self.b))
            .scalar(bytes(&self.f))
            .scalar(Scalar::U64(SIZE as u64))
    }
}

// ── Sessions ──

pub fn sim_session(memory: Arc<dyn DeviceMemory>, kernels: KernelTable, mode: BuildMode) -> DeviceSession {
    let platform = SimPlatform::with_memory(memory, kernels);
    DeviceSession::new(
        Arc::new(platform),
        RuntimeConfig::default().with_build_mode(mode),
    )
}

/// Device memory stub that records every allocation and free.
#[derive(Default)]
pub struct CountingDevice {
    inner: SimDevice,
    attempts: AtomicUsize,
    fail_at: Option<usize>,
    allocated: Mutex<Vec<DevicePtr>>,
    frees: Mutex<HashMap<DevicePtr, usize>>,
}

impl CountingDevice {
    /// A device whose `n`-th allocation (counting from 1) runs out of memory.
    pub fn failing_at(n: usize) -> Self {
        Self {
            fail_at: Some(n),
            ..Self::default()
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.lock().len()
    }

    /// Addresses allocated but never freed.
    pub fn leaked(&self) -> Vec<DevicePtr> {
        let frees = self.frees.lock();
        self.allocated
            .lock()
            .iter()
            .filter(|p| !frees.contains_key(p))
            .copied()
            .collect()
    }

    /// Addresses freed more than once.
    pub fn double_freed(&self) -> Vec<DevicePtr> {
        self.frees
            .lock()
            .iter()
            .filter(|(_, &n)| n > 1)
            .map(|(&p, _)| p)
            .collect()
    }

    pub fn live_allocations(&self) -> usize {
        self.inner.live_allocations()
    }
}

impl DeviceMemory for CountingDevice {
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, CapabilityError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(attempt) {
            return Err(CapabilityError::OutOfMemory { bytes });
        }
        let ptr = self.inner.allocate(bytes)?;
        self.allocated.lock().push(ptr);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        if !ptr.is_null() {
            *self.frees.lock().entry(ptr).or_insert(0) += 1;
        }
        self.inner.free(ptr);
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), CapabilityError> {
        self.inner.copy_to_device(dst, src)
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), CapabilityError> {
        self.inner.copy_from_device(dst, src)
    }
}
