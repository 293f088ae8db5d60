//! Graph-building programs.
//!
//! An [`Orchestration`] runs on a control core at the start of a launch and
//! builds the run's task graph through a [`GraphBuilder`]. In overlapped
//! mode the schedulers dispatch published tasks while it is still running.

use crate::descriptor::RuntimeDescriptor;
use crate::error::{Result, RuntimeError};
use crate::scheduler::RunControl;
use crate::tracker::TransferTracker;
use parking_lot::Mutex;
use pto_core::{
    BuildMode, CoreType, DeviceMemory, DevicePtr, EdgeStatus, FunctionTable, TaskArg, TaskGraph,
    TaskId,
};

/// A graph-building program.
pub trait Orchestration: Send + Sync {
    fn build(&self, builder: &GraphBuilder<'_>) -> Result<()>;
}

impl<F> Orchestration for F
where
    F: Fn(&GraphBuilder<'_>) -> Result<()> + Send + Sync,
{
    fn build(&self, builder: &GraphBuilder<'_>) -> Result<()> {
        self(builder)
    }
}

/// Task-graph API handed to an orchestration.
pub struct GraphBuilder<'a> {
    graph: &'a TaskGraph,
    functions: &'a FunctionTable,
    orch_args: &'a [TaskArg],
    memory: &'a dyn DeviceMemory,
    tracker: &'a Mutex<TransferTracker>,
    control: &'a RunControl,
}

impl<'a> GraphBuilder<'a> {
    pub(crate) fn new(
        runtime: &'a RuntimeDescriptor,
        memory: &'a dyn DeviceMemory,
        control: &'a RunControl,
    ) -> Self {
        Self {
            graph: runtime.graph(),
            functions: runtime.functions(),
            orch_args: runtime.orch_args(),
            memory,
            tracker: runtime.tracker(),
            control,
        }
    }

    // ── Orchestration arguments ──

    pub fn orch_args(&self) -> &[TaskArg] {
        self.orch_args
    }

    pub fn arg(&self, index: usize) -> Result<TaskArg> {
        self.orch_args.get(index).copied().ok_or_else(|| {
            RuntimeError::InvalidInput(format!(
                "orchestration argument {index} missing ({} given)",
                self.orch_args.len()
            ))
        })
    }

    pub fn arg_address(&self, index: usize) -> Result<DevicePtr> {
        self.arg(index)?.as_address().ok_or_else(|| {
            RuntimeError::InvalidInput(format!("orchestration argument {index} is not an address"))
        })
    }

    pub fn arg_u64(&self, index: usize) -> Result<u64> {
        self.arg(index)?.as_u64().ok_or_else(|| {
            RuntimeError::InvalidInput(format!(
                "orchestration argument {index} is not an unsigned integer"
            ))
        })
    }

    // ── Graph construction ──

    pub fn add_task(&self, args: &[TaskArg], func_id: usize, core_type: CoreType) -> Result<TaskId> {
        self.add_task_with_flags(args, func_id, core_type, 0)
    }

    pub fn add_task_with_flags(
        &self,
        args: &[TaskArg],
        func_id: usize,
        core_type: CoreType,
        flags: u32,
    ) -> Result<TaskId> {
        self.check_running()?;
        Ok(self
            .graph
            .add_task(args, func_id, core_type, flags, self.functions)?)
    }

    /// Make `succ` wait for `pred`. `pred` may already be published or even
    /// completed; in the latter case no wait is recorded.
    pub fn add_successor(&self, pred: TaskId, succ: TaskId) -> Result<EdgeStatus> {
        self.check_running()?;
        Ok(self.graph.add_successor(pred, succ)?)
    }

    pub fn publish_task(&self, id: TaskId) -> Result<()> {
        self.check_running()?;
        Ok(self.graph.publish_task(id)?)
    }

    /// Allocate an intermediate buffer visible to the compute cores.
    ///
    /// The buffer belongs to the run and is freed at finalize. Returns `None`
    /// when the device is out of memory or the run's tracker is full.
    pub fn device_malloc(&self, bytes: usize) -> Option<DevicePtr> {
        let ptr = match self.memory.allocate(bytes) {
            Ok(ptr) => ptr,
            Err(err) => {
                tracing::warn!(bytes, error = %err, "device_malloc failed");
                return None;
            }
        };
        if let Err(err) = self.tracker.lock().record_allocation(ptr) {
            tracing::warn!(bytes, error = %err, "device_malloc could not be tracked");
            self.memory.free(ptr);
            return None;
        }
        Some(ptr)
    }

    pub fn build_mode(&self) -> BuildMode {
        self.graph.build_mode()
    }

    pub fn graph(&self) -> &TaskGraph {
        self.graph
    }

    fn check_running(&self) -> Result<()> {
        if self.control.is_aborted() {
            return Err(RuntimeError::ExecutionError("run aborted".to_string()));
        }
        Ok(())
    }
}
