//! Task types.

use crate::arg::TaskArg;
use crate::memory::DevicePtr;

/// Index of a task in its graph.
pub type TaskId = usize;

/// Compute core class a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    /// Cube core.
    Aic,
    /// Vector core.
    Aiv,
}

impl CoreType {
    pub const ALL: [CoreType; 2] = [CoreType::Aic, CoreType::Aiv];

    /// Dense index, used for per-class ready queues.
    pub fn index(self) -> usize {
        match self {
            CoreType::Aic => 0,
            CoreType::Aiv => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreType::Aic => "AIC",
            CoreType::Aiv => "AIV",
        }
    }
}

/// Lifecycle of a task: `Unpublished → Pending → Ready → Running → Done`.
///
/// `Pending` covers a published task still waiting on predecessors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unpublished = 0,
    Pending = 1,
    Ready = 2,
    Running = 3,
    Done = 4,
}

impl TaskState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Unpublished,
            1 => TaskState::Pending,
            2 => TaskState::Ready,
            3 => TaskState::Running,
            _ => TaskState::Done,
        }
    }

    pub fn is_published(self) -> bool {
        self != TaskState::Unpublished
    }
}

/// Whether graph construction and dispatch may interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Build the whole graph, then dispatch.
    Serialized,
    /// Dispatch ready tasks while the graph is still being built.
    #[default]
    Overlapped,
}

/// A single kernel invocation node.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub func_id: usize,
    /// Device address of the length-prefixed kernel binary.
    pub function_addr: DevicePtr,
    pub core_type: CoreType,
    pub args: Vec<TaskArg>,
    pub flags: u32,
}
