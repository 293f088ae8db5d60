//! Status-code surface.
//!
//! Mirrors the host-facing control calls: the caller asks how much storage
//! a run needs, provides it, and drives initialize / execute / finalize
//! against it. Every call returns `0` on success or one of the negative
//! `STATUS_*` codes.

use crate::descriptor::{RuntimeArgs, RuntimeDescriptor};
use crate::device::LaunchConfig;
use crate::error::{Result, RuntimeError, STATUS_OK};
use crate::session::DeviceSession;

/// Bytes of storage a caller must provide for one run.
pub fn runtime_size() -> usize {
    std::mem::size_of::<RuntimeDescriptor>()
}

/// Stands in for the caller-provided runtime memory.
///
/// Only the offered size is checked: `initialize` requires at least
/// [`runtime_size`] bytes. The run itself is owned here, not placed in
/// caller bytes, and the storage holds at most one run at a time.
#[derive(Debug)]
pub struct RuntimeStorage {
    capacity: usize,
    runtime: Option<RuntimeDescriptor>,
}

impl RuntimeStorage {
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: bytes,
            runtime: None,
        }
    }

    /// Size the caller offered, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn runtime(&self) -> Option<&RuntimeDescriptor> {
        self.runtime.as_ref()
    }
}

fn status<T>(call: &str, result: Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(err) => {
            tracing::error!(call, error = %err, "call failed");
            err.status_code()
        }
    }
}

/// Construct a run in `storage`. Nothing is left in `storage` on failure.
pub fn initialize(session: &mut DeviceSession, storage: &mut RuntimeStorage, args: RuntimeArgs) -> i32 {
    status("initialize", try_initialize(session, storage, args))
}

fn try_initialize(
    session: &mut DeviceSession,
    storage: &mut RuntimeStorage,
    args: RuntimeArgs,
) -> Result<()> {
    if storage.capacity < runtime_size() {
        return Err(RuntimeError::InvalidInput(format!(
            "storage of {} bytes, {} required",
            storage.capacity,
            runtime_size()
        )));
    }
    if storage.runtime.is_some() {
        return Err(RuntimeError::InvalidState(
            "storage already holds a run".to_string(),
        ));
    }
    storage.runtime = Some(session.initialize_runtime(args)?);
    Ok(())
}

/// Execute the run held in `storage`.
pub fn execute(
    session: &mut DeviceSession,
    storage: &mut RuntimeStorage,
    thread_count: usize,
    block_dim: usize,
    device_id: i32,
    control_binary: &[u8],
    compute_binary: &[u8],
) -> i32 {
    let result = match storage.runtime.as_mut() {
        Some(runtime) => session.execute(
            runtime,
            &LaunchConfig::new(thread_count, block_dim, device_id),
            control_binary,
            compute_binary,
        ),
        None => Err(RuntimeError::InvalidInput(
            "storage holds no initialized run".to_string(),
        )),
    };
    status("execute", result)
}

/// Finalize and destroy the run held in `storage`.
pub fn finalize(session: &mut DeviceSession, storage: &mut RuntimeStorage) -> i32 {
    let result = match storage.runtime.take() {
        Some(mut runtime) => session.finalize(&mut runtime),
        None => Err(RuntimeError::InvalidInput(
            "storage holds no initialized run".to_string(),
        )),
    };
    status("finalize", result)
}

pub fn select_device(session: &mut DeviceSession, device_id: i32) -> i32 {
    status("select_device", session.select_device(device_id))
}

pub fn register_function(session: &mut DeviceSession, func_id: usize, binary: &[u8]) -> i32 {
    status("register_function", session.register_function(func_id, binary))
}
