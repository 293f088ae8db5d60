//! Concurrent fixed-capacity task graph.
//!
//! The graph is built incrementally by a single graph-building program while
//! scheduler threads may already be dispatching (overlapped build mode).
//!
//! Each task carries a pending count that starts at one: the extra count is a
//! publication token. `add_successor` adds one per predecessor edge,
//! `publish_task` removes the token, and every predecessor completion removes
//! one. Whoever brings the count to zero moves the task to its core class's
//! ready queue, so a task becomes ready exactly once and only after it is
//! published and all predecessors are done.
//!
//! Edges are recorded under the predecessor's fanout lock. Completion takes
//! the same lock, so an edge either lands before the predecessor finishes
//! (and is decremented by it) or observes the completion and is reported as
//! [`EdgeStatus::AlreadySatisfied`].

use crate::arg::TaskArg;
use crate::function_cache::FunctionTable;
use crate::platform::{RUNTIME_MAX_ARGS, RUNTIME_MAX_TASKS};
use crate::task::{BuildMode, CoreType, Task, TaskId, TaskState};
use crate::{Error, Result};
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Outcome of [`TaskGraph::add_successor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    /// The successor now waits on the predecessor.
    Added,
    /// The predecessor had already completed; no wait was recorded.
    AlreadySatisfied,
}

#[derive(Default)]
struct Fanout {
    completed: bool,
    successors: Vec<TaskId>,
}

struct TaskSlot {
    task: OnceLock<Task>,
    state: AtomicU8,
    pending: AtomicU32,
    fanout: Mutex<Fanout>,
}

impl TaskSlot {
    fn new() -> Self {
        Self {
            task: OnceLock::new(),
            state: AtomicU8::new(TaskState::Unpublished as u8),
            pending: AtomicU32::new(1),
            fanout: Mutex::new(Fanout::default()),
        }
    }

    fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Append-only task DAG shared between the graph builder and the schedulers.
///
/// Construction calls (`add_task`, `add_successor`, `publish_task`) are
/// expected from one builder thread; dispatch calls (`take_ready`,
/// `complete_task`) may come from any number of scheduler threads.
pub struct TaskGraph {
    slots: Box<[TaskSlot]>,
    len: AtomicUsize,
    append: Mutex<()>,
    published: AtomicUsize,
    completed: AtomicUsize,
    /// Tasks taken (or being taken) from a ready queue and not yet completed.
    in_flight: AtomicUsize,
    sealed: AtomicBool,
    build_mode: BuildMode,
    ready: [Injector<TaskId>; 2],
}

impl TaskGraph {
    /// Create an empty graph holding at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| TaskSlot::new()).collect(),
            len: AtomicUsize::new(0),
            append: Mutex::new(()),
            published: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            build_mode: BuildMode::default(),
            ready: [Injector::new(), Injector::new()],
        }
    }

    /// Create an empty graph with its build mode already fixed.
    pub fn with_build_mode(capacity: usize, mode: BuildMode) -> Self {
        Self {
            build_mode: mode,
            ..Self::new(capacity)
        }
    }

    // ── Construction ──

    /// Append an unpublished task and return its id.
    pub fn add_task(
        &self,
        args: &[TaskArg],
        func_id: usize,
        core_type: CoreType,
        flags: u32,
        functions: &FunctionTable,
    ) -> Result<TaskId> {
        if self.is_sealed() {
            return Err(Error::GraphSealed);
        }
        if args.len() > RUNTIME_MAX_ARGS {
            return Err(Error::TooManyArgs {
                count: args.len(),
                limit: RUNTIME_MAX_ARGS,
            });
        }
        let function_addr = functions
            .get(func_id)
            .ok_or(Error::UnresolvedFunction(func_id))?;

        let _guard = self.append.lock();
        let id = self.len.load(Ordering::Acquire);
        let slot = self.slots.get(id).ok_or(Error::GraphFull {
            capacity: self.capacity(),
        })?;
        slot.task
            .set(Task {
                id,
                func_id,
                function_addr,
                core_type,
                args: args.to_vec(),
                flags,
            })
            .map_err(|_| Error::InvalidTask(id))?;
        self.len.store(id + 1, Ordering::Release);

        tracing::trace!(task = id, func_id, core = core_type.name(), "task added");
        Ok(id)
    }

    /// Make `succ` wait for `pred`.
    ///
    /// No cycle check is performed; callers add edges between created tasks
    /// in creation order.
    pub fn add_successor(&self, pred: TaskId, succ: TaskId) -> Result<EdgeStatus> {
        let pred_slot = self.slot(pred)?;
        let succ_slot = self.slot(succ)?;
        if succ_slot.state().is_published() {
            return Err(Error::SuccessorPublished { pred, succ });
        }

        let mut fanout = pred_slot.fanout.lock();
        if fanout.completed {
            tracing::trace!(pred, succ, "edge already satisfied");
            return Ok(EdgeStatus::AlreadySatisfied);
        }
        succ_slot.pending.fetch_add(1, Ordering::AcqRel);
        fanout.successors.push(succ);
        Ok(EdgeStatus::Added)
    }

    /// Make `id` visible to the schedulers.
    pub fn publish_task(&self, id: TaskId) -> Result<()> {
        let slot = self.slot(id)?;
        slot.state
            .compare_exchange(
                TaskState::Unpublished as u8,
                TaskState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyPublished(id))?;
        self.published.fetch_add(1, Ordering::SeqCst);

        if slot.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.make_ready(id, slot);
        }
        Ok(())
    }

    /// Mark construction finished. No task can be added afterwards.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn build_mode(&self) -> BuildMode {
        self.build_mode
    }

    /// Fix the build mode. Refused once any task is published.
    pub fn set_build_mode(&mut self, mode: BuildMode) -> Result<()> {
        if *self.published.get_mut() > 0 {
            return Err(Error::BuildModeLocked);
        }
        self.build_mode = mode;
        Ok(())
    }

    // ── Dispatch ──

    /// Take one ready task of class `core`, moving it to `Running`.
    pub fn take_ready(&self, core: CoreType) -> Option<TaskId> {
        // Counted before the steal so a stall check never sees an empty queue
        // and zero in-flight while a task is changing hands.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        loop {
            match self.ready[core.index()].steal() {
                Steal::Success(id) => {
                    let prev = self.slots[id]
                        .state
                        .swap(TaskState::Running as u8, Ordering::AcqRel);
                    debug_assert_eq!(prev, TaskState::Ready as u8);
                    return Some(id);
                }
                Steal::Empty => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                Steal::Retry => continue,
            }
        }
    }

    /// Record completion of a running task and release its successors.
    ///
    /// Returns the successors that became ready.
    pub fn complete_task(&self, id: TaskId) -> Result<Vec<TaskId>> {
        let slot = self.slot(id)?;
        let state = slot.state();
        if state != TaskState::Running {
            return Err(Error::InvalidTransition {
                task: id,
                state,
                expected: TaskState::Running,
            });
        }

        let successors = {
            let mut fanout = slot.fanout.lock();
            fanout.completed = true;
            fanout.successors.clone()
        };
        slot.state.store(TaskState::Done as u8, Ordering::Release);

        let mut released = Vec::new();
        for &succ in &successors {
            let succ_slot = &self.slots[succ];
            if succ_slot.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.make_ready(succ, succ_slot);
                released.push(succ);
            }
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(task = id, released = released.len(), "task completed");
        Ok(released)
    }

    fn make_ready(&self, id: TaskId, slot: &TaskSlot) {
        slot.state.store(TaskState::Ready as u8, Ordering::Release);
        let core = slot
            .task
            .get()
            .map(|t| t.core_type)
            .unwrap_or(CoreType::Aiv);
        self.ready[core.index()].push(id);
    }

    /// Every created task has completed and construction is finished.
    pub fn is_complete(&self) -> bool {
        self.is_sealed() && self.completed.load(Ordering::SeqCst) == self.len()
    }

    /// Construction is finished but incomplete tasks can never become ready.
    ///
    /// True when nothing is queued or running yet tasks remain, which means
    /// some task was never published or waits on a dependency that cannot
    /// resolve.
    pub fn is_stalled(&self) -> bool {
        if !self.is_sealed() {
            return false;
        }
        let completed = self.completed.load(Ordering::SeqCst);
        if completed == self.len() || self.in_flight.load(Ordering::SeqCst) != 0 {
            return false;
        }
        if self.ready.iter().any(|q| !q.is_empty()) {
            return false;
        }
        self.in_flight.load(Ordering::SeqCst) == 0
            && self.completed.load(Ordering::SeqCst) == completed
    }

    // ── Inspection ──

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id)?.task.get()
    }

    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.slot(id).ok().map(TaskSlot::state)
    }

    /// Unresolved predecessor count of `id`.
    pub fn pending_dependencies(&self, id: TaskId) -> Option<u32> {
        let slot = self.slot(id).ok()?;
        let pending = slot.pending.load(Ordering::Acquire);
        if slot.state().is_published() {
            Some(pending)
        } else {
            Some(pending.saturating_sub(1))
        }
    }

    pub fn successors(&self, id: TaskId) -> Vec<TaskId> {
        self.slot(id)
            .map(|slot| slot.fanout.lock().successors.clone())
            .unwrap_or_default()
    }

    /// Iterate over created tasks in creation order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.slots[..self.len()].iter().filter_map(|s| s.task.get())
    }

    /// Edge relation as a petgraph graph; node index `i` is task `i`.
    pub fn dependency_graph(&self) -> DiGraph<TaskId, ()> {
        let len = self.len();
        let mut graph = DiGraph::with_capacity(len, len);
        for id in 0..len {
            graph.add_node(id);
        }
        for id in 0..len {
            for succ in self.successors(id) {
                graph.add_edge(NodeIndex::new(id), NodeIndex::new(succ), ());
            }
        }
        graph
    }

    /// Tasks that sit on a dependency cycle, sorted by id.
    pub fn cyclic_tasks(&self) -> Vec<TaskId> {
        let graph = self.dependency_graph();
        let mut cyclic: Vec<TaskId> = kosaraju_scc(&graph)
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || graph.contains_edge(scc[0], scc[0])
            })
            .flatten()
            .map(|node| graph[node])
            .collect();
        cyclic.sort_unstable();
        cyclic
    }

    fn slot(&self, id: TaskId) -> Result<&TaskSlot> {
        if id >= self.len() {
            return Err(Error::InvalidTask(id));
        }
        Ok(&self.slots[id])
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new(RUNTIME_MAX_TASKS)
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("published", &self.published_count())
            .field("completed", &self.completed_count())
            .field("sealed", &self.is_sealed())
            .field("build_mode", &self.build_mode)
            .finish()
    }
}
