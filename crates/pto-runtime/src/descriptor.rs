//! The runtime descriptor shared by host and device for one run.

use crate::error::Result;
use crate::orchestration::{GraphBuilder, Orchestration};
use crate::tensor::HostTensor;
use crate::tracker::TransferTracker;
use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use pto_core::platform::RUNTIME_MAX_FUNC_ID;
use pto_core::{BuildMode, FunctionTable, Scalar, TaskArg, TaskGraph};
use std::sync::Arc;

/// A host-side argument of a run.
#[derive(Debug, Clone)]
pub enum HostArg {
    /// Passed through to the orchestration unchanged.
    Scalar(Scalar),
    /// Copied to a fresh device buffer before the run.
    Input(HostTensor),
    /// Fresh device buffer copied back at finalize.
    Output(HostTensor),
    /// Copied in before the run and back at finalize.
    InOut(HostTensor),
}

/// Everything needed to create a run.
#[derive(Clone)]
pub struct RuntimeArgs {
    pub(crate) orchestration: Arc<dyn Orchestration>,
    pub(crate) args: Vec<HostArg>,
    pub(crate) build_mode: Option<BuildMode>,
}

impl RuntimeArgs {
    pub fn new(orchestration: Arc<dyn Orchestration>) -> Self {
        Self {
            orchestration,
            args: Vec::new(),
            build_mode: None,
        }
    }

    pub fn from_fn<F>(orchestration: F) -> Self
    where
        F: Fn(&GraphBuilder<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(Arc::new(orchestration))
    }

    pub fn arg(mut self, arg: HostArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn input(self, tensor: HostTensor) -> Self {
        self.arg(HostArg::Input(tensor))
    }

    pub fn output(self, tensor: HostTensor) -> Self {
        self.arg(HostArg::Output(tensor))
    }

    pub fn inout(self, tensor: HostTensor) -> Self {
        self.arg(HostArg::InOut(tensor))
    }

    pub fn scalar(self, value: Scalar) -> Self {
        self.arg(HostArg::Scalar(value))
    }

    /// Override the session's default build mode for this run.
    pub fn build_mode(mut self, mode: BuildMode) -> Self {
        self.build_mode = Some(mode);
        self
    }

    pub fn args(&self) -> &[HostArg] {
        &self.args
    }
}

/// Fixed prefix of the device image of a descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DescriptorHeader {
    /// 0 = serialized, 1 = overlapped.
    pub build_mode: u32,
    pub orch_arg_count: u32,
    pub task_capacity: u64,
    pub function_slots: u64,
}

/// One run: task graph, orchestration arguments, function addresses and the
/// run's tracked device memory.
///
/// Created by `DeviceSession::initialize_runtime`, executed once, then
/// finalized.
pub struct RuntimeDescriptor {
    graph: TaskGraph,
    orch_args: Vec<TaskArg>,
    functions: FunctionTable,
    tracker: Mutex<TransferTracker>,
    orchestration: Arc<dyn Orchestration>,
    executed: bool,
}

impl RuntimeDescriptor {
    pub(crate) fn new(
        task_capacity: usize,
        build_mode: BuildMode,
        orch_args: Vec<TaskArg>,
        tracker: TransferTracker,
        orchestration: Arc<dyn Orchestration>,
    ) -> Self {
        Self {
            graph: TaskGraph::with_build_mode(task_capacity, build_mode),
            orch_args,
            functions: FunctionTable::new(),
            tracker: Mutex::new(tracker),
            orchestration,
            executed: false,
        }
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn orch_args(&self) -> &[TaskArg] {
        &self.orch_args
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn build_mode(&self) -> BuildMode {
        self.graph.build_mode()
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub(crate) fn orchestration(&self) -> &dyn Orchestration {
        self.orchestration.as_ref()
    }

    pub(crate) fn tracker(&self) -> &Mutex<TransferTracker> {
        &self.tracker
    }

    pub(crate) fn set_functions(&mut self, functions: FunctionTable) {
        self.functions = functions;
    }

    pub(crate) fn mark_executed(&mut self) {
        self.executed = true;
    }

    /// Encode the descriptor for transfer to device memory.
    ///
    /// Layout: [`DescriptorHeader`], one u64 slot per orchestration argument,
    /// then one u64 address per function identifier (0 when unresolved).
    pub fn encode_image(&self) -> Vec<u8> {
        let header = DescriptorHeader {
            build_mode: match self.build_mode() {
                BuildMode::Serialized => 0,
                BuildMode::Overlapped => 1,
            },
            orch_arg_count: self.orch_args.len() as u32,
            task_capacity: self.graph.capacity() as u64,
            function_slots: RUNTIME_MAX_FUNC_ID as u64,
        };

        let mut image = Vec::with_capacity(
            std::mem::size_of::<DescriptorHeader>() + 8 * (self.orch_args.len() + RUNTIME_MAX_FUNC_ID),
        );
        image.extend_from_slice(bytemuck::bytes_of(&header));
        for arg in &self.orch_args {
            image.extend_from_slice(&arg.to_bits().to_le_bytes());
        }
        for func_id in 0..RUNTIME_MAX_FUNC_ID {
            let addr = self.functions.get(func_id).map_or(0, |a| a.addr());
            image.extend_from_slice(&addr.to_le_bytes());
        }
        image
    }
}

impl Drop for RuntimeDescriptor {
    fn drop(&mut self) {
        if !self.tracker.get_mut().is_empty() {
            tracing::warn!("runtime descriptor dropped before finalize, device memory leaked");
        }
    }
}

impl std::fmt::Debug for RuntimeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeDescriptor")
            .field("graph", &self.graph)
            .field("orch_args", &self.orch_args)
            .field("functions", &self.functions.resolved_count())
            .field("executed", &self.executed)
            .finish()
    }
}
