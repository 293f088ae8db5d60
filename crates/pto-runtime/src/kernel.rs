//! Kernels run by simulated compute cores.
//!
//! A function binary resident in device memory is a length-prefixed record
//! whose payload names a kernel symbol. Compute cores read the record at a
//! task's function address and look the symbol up in a [`KernelTable`].

use bytemuck::Pod;
use pto_core::function_cache::RECORD_PREFIX_SIZE;
use pto_core::{CapabilityError, DeviceMemory, DevicePtr, Task, TaskArg, TaskId};
use std::collections::HashMap;
use std::sync::Arc;

const MAX_SYMBOL_RECORD: usize = 4096;

/// Kernel failures. Any failure is fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Missing argument {0}")]
    MissingArg(usize),

    #[error("Argument {index} is not {expected}")]
    ArgType { index: usize, expected: &'static str },

    #[error("Unknown kernel symbol: {0}")]
    UnknownKernel(String),

    #[error(transparent)]
    Memory(#[from] CapabilityError),

    #[error("{0}")]
    Failed(String),
}

/// A kernel body.
pub trait Kernel: Send + Sync {
    fn run(&self, ctx: &KernelContext<'_>) -> Result<(), KernelError>;
}

impl<F> Kernel for F
where
    F: Fn(&KernelContext<'_>) -> Result<(), KernelError> + Send + Sync,
{
    fn run(&self, ctx: &KernelContext<'_>) -> Result<(), KernelError> {
        self(ctx)
    }
}

/// What a kernel sees while it runs.
pub struct KernelContext<'a> {
    task: &'a Task,
    memory: &'a dyn DeviceMemory,
}

impl<'a> KernelContext<'a> {
    pub fn new(task: &'a Task, memory: &'a dyn DeviceMemory) -> Self {
        Self { task, memory }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn args(&self) -> &[TaskArg] {
        &self.task.args
    }

    pub fn arg(&self, index: usize) -> Result<&TaskArg, KernelError> {
        self.task.args.get(index).ok_or(KernelError::MissingArg(index))
    }

    pub fn arg_address(&self, index: usize) -> Result<DevicePtr, KernelError> {
        self.arg(index)?.as_address().ok_or(KernelError::ArgType {
            index,
            expected: "an address",
        })
    }

    pub fn arg_f32(&self, index: usize) -> Result<f32, KernelError> {
        self.arg(index)?.as_f32().ok_or(KernelError::ArgType {
            index,
            expected: "an f32",
        })
    }

    pub fn arg_u64(&self, index: usize) -> Result<u64, KernelError> {
        self.arg(index)?.as_u64().ok_or(KernelError::ArgType {
            index,
            expected: "an unsigned integer",
        })
    }

    /// Read `count` values of `T` starting at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, count: usize) -> Result<Vec<T>, KernelError> {
        let len = count.checked_mul(std::mem::size_of::<T>()).ok_or_else(|| {
            KernelError::Failed(format!(
                "reading {count} values of {} overflows",
                std::any::type_name::<T>()
            ))
        })?;
        let mut bytes = vec![0u8; len];
        self.memory.copy_from_device(&mut bytes, ptr)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Write `values` starting at `ptr`.
    pub fn write<T: Pod>(&self, ptr: DevicePtr, values: &[T]) -> Result<(), KernelError> {
        self.memory.copy_to_device(ptr, bytemuck::cast_slice(values))?;
        Ok(())
    }
}

/// Registry of kernels by symbol.
#[derive(Default)]
pub struct KernelTable {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kernel` under `symbol`, replacing any previous entry.
    pub fn register<K: Kernel + 'static>(&mut self, symbol: impl Into<String>, kernel: K) -> &mut Self {
        self.kernels.insert(symbol.into(), Arc::new(kernel));
        self
    }

    pub fn get(&self, symbol: &str) -> Option<&Arc<dyn Kernel>> {
        self.kernels.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.kernels.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Resolve the function binary at `addr` to a kernel.
    pub fn resolve(
        &self,
        memory: &dyn DeviceMemory,
        addr: DevicePtr,
    ) -> Result<Arc<dyn Kernel>, KernelError> {
        let mut prefix = [0u8; RECORD_PREFIX_SIZE];
        memory.copy_from_device(&mut prefix, addr)?;
        let len = u64::from_le_bytes(prefix) as usize;
        if len == 0 || len > MAX_SYMBOL_RECORD {
            return Err(KernelError::Failed(format!(
                "function record at {addr} has implausible length {len}"
            )));
        }

        let mut payload = vec![0u8; len];
        memory.copy_from_device(&mut payload, addr.offset(RECORD_PREFIX_SIZE)?)?;
        let symbol = String::from_utf8_lossy(&payload);
        let symbol = symbol.trim_end_matches('\0');

        self.kernels
            .get(symbol)
            .cloned()
            .ok_or_else(|| KernelError::UnknownKernel(symbol.to_string()))
    }
}
