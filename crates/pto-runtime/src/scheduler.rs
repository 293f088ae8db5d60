//! Control-core scheduling and compute-core execution.
//!
//! Each scheduling thread owns a disjoint partition of compute cores: block
//! `b` goes to thread `b % threads`, and every block brings one AIC and two
//! AIV cores. A scheduling thread takes ready tasks of a core's class from
//! the shared task graph, hands them to its idle cores, and completes them
//! when the core reports back. Completing a task releases its successors to
//! the shared ready queues, where any thread may pick them up.

use crate::descriptor::RuntimeDescriptor;
use crate::device::LaunchConfig;
use crate::error::{Result, RuntimeError};
use crate::kernel::{Kernel, KernelContext, KernelError, KernelTable};
use crate::orchestration::GraphBuilder;
use parking_lot::Mutex;
use pto_core::platform::{
    PLATFORM_AIC_CORES_PER_BLOCKDIM, PLATFORM_AIV_CORES_PER_BLOCKDIM, PLATFORM_MAX_AIC_PER_THREAD,
    PLATFORM_MAX_AIV_PER_THREAD, PLATFORM_MAX_CORES_PER_THREAD,
};
use pto_core::{BuildMode, CoreType, DeviceMemory, DevicePtr, TaskGraph, TaskId};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A compute core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoreId {
    pub block: usize,
    pub core_type: CoreType,
    /// Index of the core among its class within the block.
    pub lane: usize,
}

/// The compute cores owned by one scheduling thread.
#[derive(Debug, Clone)]
pub struct CorePartition {
    pub thread: usize,
    pub cores: Vec<CoreId>,
}

impl CorePartition {
    pub fn count(&self, core_type: CoreType) -> usize {
        self.cores.iter().filter(|c| c.core_type == core_type).count()
    }
}

/// Split `block_dim` blocks across `threads` scheduling threads.
pub fn partition_cores(block_dim: usize, threads: usize) -> Result<Vec<CorePartition>> {
    if threads == 0 {
        return Err(RuntimeError::InvalidInput(
            "at least one scheduling thread is required".to_string(),
        ));
    }
    let mut partitions: Vec<CorePartition> = (0..threads)
        .map(|thread| CorePartition {
            thread,
            cores: Vec::new(),
        })
        .collect();

    for block in 0..block_dim {
        let partition = &mut partitions[block % threads];
        for lane in 0..PLATFORM_AIC_CORES_PER_BLOCKDIM {
            partition.cores.push(CoreId {
                block,
                core_type: CoreType::Aic,
                lane,
            });
        }
        for lane in 0..PLATFORM_AIV_CORES_PER_BLOCKDIM {
            partition.cores.push(CoreId {
                block,
                core_type: CoreType::Aiv,
                lane,
            });
        }
    }

    for partition in &partitions {
        if partition.count(CoreType::Aic) > PLATFORM_MAX_AIC_PER_THREAD
            || partition.count(CoreType::Aiv) > PLATFORM_MAX_AIV_PER_THREAD
            || partition.cores.len() > PLATFORM_MAX_CORES_PER_THREAD
        {
            return Err(RuntimeError::ResourceExhausted(format!(
                "thread {} would own {} cores, over the per-thread budget",
                partition.thread,
                partition.cores.len()
            )));
        }
    }
    Ok(partitions)
}

/// Shared abort flag and first error of a run.
#[derive(Default)]
pub struct RunControl {
    aborted: AtomicBool,
    error: Mutex<Option<RuntimeError>>,
}

impl RunControl {
    /// Stop the run. Only the first error is kept.
    pub fn abort(&self, err: RuntimeError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::error!(error = %err, "run aborted");
            *slot = Some(err);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn into_result(self) -> Result<()> {
        match self.error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct Completion {
    slot: usize,
    task: TaskId,
    result: std::result::Result<(), KernelError>,
}

struct CoreHandle {
    id: CoreId,
    dispatch: Sender<TaskId>,
}

/// Run one launch to completion: build the graph and dispatch it across
/// the compute cores.
///
/// Overlapped mode dedicates one control thread to graph building and
/// schedules on the rest; with a single control thread the graph is built
/// first instead.
pub(crate) fn run_device(
    runtime: &RuntimeDescriptor,
    memory: &dyn DeviceMemory,
    kernels: &KernelTable,
    config: &LaunchConfig,
    idle_backoff: Duration,
) -> Result<()> {
    let overlapped = runtime.build_mode() == BuildMode::Overlapped && config.thread_count > 1;
    if runtime.build_mode() == BuildMode::Overlapped && !overlapped {
        tracing::debug!("single control thread, building the graph before dispatch");
    }
    let scheduler_threads = if overlapped {
        config.thread_count - 1
    } else {
        config.thread_count
    };

    let partitions = partition_cores(config.block_dim, scheduler_threads)?;
    for partition in &partitions {
        tracing::debug!(
            thread = partition.thread,
            aic = partition.count(CoreType::Aic),
            aiv = partition.count(CoreType::Aiv),
            "control thread initialized"
        );
    }

    let control = RunControl::default();
    let builder = GraphBuilder::new(runtime, memory, &control);
    let graph = runtime.graph();

    thread::scope(|s| {
        let control = &control;
        let builder = &builder;

        if overlapped {
            s.spawn(move || build_graph(runtime, builder, control));
        } else {
            build_graph(runtime, builder, control);
            if control.is_aborted() {
                return;
            }
        }

        for partition in &partitions {
            let (done_tx, done_rx) = mpsc::channel::<Completion>();
            let mut cores = Vec::with_capacity(partition.cores.len());
            for (slot, &core) in partition.cores.iter().enumerate() {
                let (dispatch_tx, dispatch_rx) = mpsc::channel::<TaskId>();
                let done_tx = done_tx.clone();
                s.spawn(move || compute_core(slot, dispatch_rx, done_tx, graph, memory, kernels));
                cores.push(CoreHandle {
                    id: core,
                    dispatch: dispatch_tx,
                });
            }
            drop(done_tx);

            let thread = partition.thread;
            s.spawn(move || dispatch_loop(thread, cores, done_rx, graph, control, idle_backoff));
        }
    });

    control.into_result()
}

fn build_graph(runtime: &RuntimeDescriptor, builder: &GraphBuilder<'_>, control: &RunControl) {
    let _span = tracing::debug_span!("orchestration", mode = ?runtime.build_mode()).entered();
    let result = panic::catch_unwind(AssertUnwindSafe(|| runtime.orchestration().build(builder)))
        .unwrap_or_else(|payload| {
            Err(RuntimeError::ExecutionError(format!(
                "orchestration panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    // Sealed even on failure so no scheduler waits for more tasks.
    runtime.graph().seal();
    match result {
        Ok(()) => tracing::debug!(tasks = runtime.graph().len(), "graph built"),
        Err(err) => control.abort(err),
    }
}

fn compute_core(
    slot: usize,
    tasks: Receiver<TaskId>,
    done: Sender<Completion>,
    graph: &TaskGraph,
    memory: &dyn DeviceMemory,
    kernels: &KernelTable,
) {
    let mut resolved: HashMap<DevicePtr, Arc<dyn Kernel>> = HashMap::new();
    while let Ok(task) = tasks.recv() {
        let result = run_task(graph, task, memory, kernels, &mut resolved);
        if done.send(Completion { slot, task, result }).is_err() {
            break;
        }
    }
}

fn run_task(
    graph: &TaskGraph,
    id: TaskId,
    memory: &dyn DeviceMemory,
    kernels: &KernelTable,
    resolved: &mut HashMap<DevicePtr, Arc<dyn Kernel>>,
) -> std::result::Result<(), KernelError> {
    let task = graph
        .task(id)
        .ok_or_else(|| KernelError::Failed(format!("task {id} does not exist")))?;
    let kernel = match resolved.get(&task.function_addr) {
        Some(kernel) => Arc::clone(kernel),
        None => {
            let kernel = kernels.resolve(memory, task.function_addr)?;
            resolved.insert(task.function_addr, Arc::clone(&kernel));
            kernel
        }
    };
    let ctx = KernelContext::new(task, memory);
    panic::catch_unwind(AssertUnwindSafe(|| kernel.run(&ctx))).unwrap_or_else(|payload| {
        Err(KernelError::Failed(format!(
            "kernel panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn dispatch_loop(
    thread: usize,
    cores: Vec<CoreHandle>,
    done: Receiver<Completion>,
    graph: &TaskGraph,
    control: &RunControl,
    idle_backoff: Duration,
) {
    let mut idle = vec![true; cores.len()];
    let mut busy = 0usize;
    let mut executed = 0usize;

    let mut finish = |completion: Completion, idle: &mut [bool], busy: &mut usize| {
        idle[completion.slot] = true;
        *busy -= 1;
        let outcome = match completion.result {
            Ok(()) => graph.complete_task(completion.task).map(|_| ()).map_err(RuntimeError::from),
            Err(err) => Err(RuntimeError::KernelFailed {
                task: completion.task,
                message: err.to_string(),
            }),
        };
        match outcome {
            Ok(()) => executed += 1,
            Err(err) => control.abort(err),
        }
    };

    loop {
        if control.is_aborted() {
            break;
        }
        let mut progressed = false;

        while let Ok(completion) = done.try_recv() {
            finish(completion, &mut idle, &mut busy);
            progressed = true;
        }
        if control.is_aborted() {
            break;
        }

        for (slot, core) in cores.iter().enumerate() {
            if !idle[slot] {
                continue;
            }
            let Some(task) = graph.take_ready(core.id.core_type) else {
                continue;
            };
            tracing::trace!(thread, task, core = ?core.id, "dispatch");
            if core.dispatch.send(task).is_err() {
                control.abort(RuntimeError::ExecutionError(format!(
                    "compute core {:?} exited",
                    core.id
                )));
                break;
            }
            idle[slot] = false;
            busy += 1;
            progressed = true;
        }

        if busy == 0 && graph.is_complete() {
            break;
        }
        if busy == 0 && graph.is_stalled() {
            control.abort(stall_error(graph));
            break;
        }

        if !progressed {
            if busy > 0 {
                match done.recv_timeout(idle_backoff) {
                    Ok(completion) => finish(completion, &mut idle, &mut busy),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        control.abort(RuntimeError::ExecutionError(
                            "compute cores disconnected".to_string(),
                        ));
                        break;
                    }
                }
            } else if idle_backoff.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(idle_backoff);
            }
        }
    }

    tracing::debug!(thread, executed, "control thread finished");
}

fn stall_error(graph: &TaskGraph) -> RuntimeError {
    let remaining = graph.len() - graph.completed_count();
    let cyclic = graph.cyclic_tasks();
    let detail = if cyclic.is_empty() {
        String::new()
    } else {
        format!("; dependency cycle through tasks {cyclic:?}")
    };
    RuntimeError::ExecutionError(format!(
        "{remaining} of {} tasks can never run (unpublished or waiting on unresolvable dependencies){detail}",
        graph.len()
    ))
}
