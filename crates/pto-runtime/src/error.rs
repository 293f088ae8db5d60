//! Error types for the runtime crate.

use pto_core::{CapabilityError, ErrorKind, TaskId};
use thiserror::Error;

/// Status code for success.
pub const STATUS_OK: i32 = 0;
/// Bad pointer, size, identifier or index.
pub const STATUS_INVALID_INPUT: i32 = -1;
/// Allocation failure or a full fixed-capacity structure.
pub const STATUS_RESOURCE_EXHAUSTED: i32 = -2;
/// A kernel or device step failed during a run.
pub const STATUS_EXECUTION_FAILED: i32 = -3;
/// A required low-level capability could not be located.
pub const STATUS_CAPABILITY_UNAVAILABLE: i32 = -4;
/// The call is not valid in the current session or handle state.
pub const STATUS_INVALID_STATE: i32 = -5;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Allocation or capacity failure.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// A kernel reported failure; fatal to the run.
    #[error("Kernel for task {task} failed: {message}")]
    KernelFailed { task: TaskId, message: String },

    /// Capability unavailable.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Call not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Function registration needs a selected device.
    #[error("No device selected")]
    DeviceNotSelected,

    /// Device error.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Host tensor error.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Task graph or function cache error.
    #[error(transparent)]
    Core(#[from] pto_core::Error),
}

impl From<CapabilityError> for RuntimeError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Unavailable(msg) => RuntimeError::CapabilityUnavailable(msg),
            CapabilityError::OutOfMemory { .. } => RuntimeError::ResourceExhausted(err.to_string()),
            CapabilityError::Device(msg) => RuntimeError::DeviceError(msg),
            other => RuntimeError::InvalidInput(other.to_string()),
        }
    }
}

impl RuntimeError {
    /// Integer status code for the handle surface.
    pub fn status_code(&self) -> i32 {
        match self {
            RuntimeError::InvalidInput(_) | RuntimeError::TensorError(_) => STATUS_INVALID_INPUT,
            RuntimeError::ResourceExhausted(_) => STATUS_RESOURCE_EXHAUSTED,
            RuntimeError::ExecutionError(_)
            | RuntimeError::KernelFailed { .. }
            | RuntimeError::DeviceError(_) => STATUS_EXECUTION_FAILED,
            RuntimeError::CapabilityUnavailable(_) => STATUS_CAPABILITY_UNAVAILABLE,
            RuntimeError::InvalidState(_) | RuntimeError::DeviceNotSelected => STATUS_INVALID_STATE,
            RuntimeError::Core(err) => match err.kind() {
                ErrorKind::InvalidInput => STATUS_INVALID_INPUT,
                ErrorKind::ResourceExhausted => STATUS_RESOURCE_EXHAUSTED,
                ErrorKind::CapabilityUnavailable => STATUS_CAPABILITY_UNAVAILABLE,
                ErrorKind::Device => STATUS_EXECUTION_FAILED,
            },
        }
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Collapse a result into a status code.
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(err) => err.status_code(),
    }
}
