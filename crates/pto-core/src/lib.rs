//! Core task-graph, function-cache and device-memory types for the PTO runtime.
//!
//! This crate provides the foundational pieces shared by the host orchestrator
//! and the programs running on the control cores:
//! - Device memory capability (`DeviceMemory`, `DevicePtr`)
//! - Packed kernel binary cache (`FunctionBinCache`) and the function address table
//! - Tagged task arguments (`TaskArg`, `Scalar`)
//! - The concurrent, fixed-capacity task graph (`TaskGraph`)

pub mod arg;
pub mod function_cache;
pub mod graph;
pub mod graph_dot;
pub mod memory;
pub mod platform;
pub mod task;

// Re-export commonly used types
pub use arg::{Scalar, TaskArg};
pub use function_cache::{FunctionBinCache, FunctionTable};
pub use graph::{EdgeStatus, TaskGraph};
pub use graph_dot::to_task_graph_dot;
pub use memory::{CapabilityError, DeviceMemory, DevicePtr};
pub use task::{BuildMode, CoreType, Task, TaskId, TaskState};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for pto-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task graph is at capacity ({capacity} tasks)")]
    GraphFull { capacity: usize },

    #[error("Task graph is sealed, no more tasks can be added")]
    GraphSealed,

    #[error("Task has {count} arguments, the limit is {limit}")]
    TooManyArgs { count: usize, limit: usize },

    #[error("Function {0} has no resolved device address")]
    UnresolvedFunction(usize),

    #[error("Task {0} does not exist")]
    InvalidTask(TaskId),

    #[error("Task {0} is already published")]
    AlreadyPublished(TaskId),

    #[error("Cannot add edge {pred} -> {succ}: successor is already published")]
    SuccessorPublished { pred: TaskId, succ: TaskId },

    #[error("Task {task} is in state {state:?}, expected {expected:?}")]
    InvalidTransition {
        task: TaskId,
        state: TaskState,
        expected: TaskState,
    },

    #[error("Build mode cannot change after tasks are published")]
    BuildModeLocked,

    #[error("Malformed function cache: {0}")]
    FunctionCache(String),

    #[error("Binary index {index} out of range (cache holds {count})")]
    BinaryIndexOutOfRange { index: usize, count: usize },

    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Broad classification of an error, used to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad pointers, sizes, identifiers or indices; nothing was mutated.
    InvalidInput,
    /// Allocation failure or a fixed-capacity structure is full.
    ResourceExhausted,
    /// A required low-level capability could not be located.
    CapabilityUnavailable,
    /// The device or the run reported a failure.
    Device,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::GraphFull { .. } => ErrorKind::ResourceExhausted,
            Error::Capability(err) => err.kind(),
            Error::InvalidTransition { .. } => ErrorKind::Device,
            _ => ErrorKind::InvalidInput,
        }
    }
}
