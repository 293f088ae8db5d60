//! Device session: the host execution orchestrator.
//!
//! A session owns one device from selection to close:
//!
//! ```text
//! Uninitialized → DeviceSelected → BinariesLoaded → Ready ⇄ Executing
//!                                                    ↑         ↓
//!                                                    └ Finalizing
//! ```
//!
//! The device is selected lazily by the first allocation, and the control
//! and compute program images are loaded by the first execute. Both stay
//! in place for later runs until [`DeviceSession::close`].

use crate::config::RuntimeConfig;
use crate::descriptor::{HostArg, RuntimeArgs, RuntimeDescriptor};
use crate::device::{DeviceContext, Launch, LaunchConfig, Platform};
use crate::error::{Result, RuntimeError};
use crate::tracker::{FinalizeReport, TensorPair, TransferTracker};
use pto_core::platform::{RUNTIME_MAX_FUNC_ID, RUNTIME_MAX_ORCH_ARGS};
use pto_core::{DeviceMemory, DevicePtr, FunctionBinCache, FunctionTable, TaskArg};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    DeviceSelected,
    BinariesLoaded,
    Ready,
    Executing,
    Finalizing,
}

#[derive(Debug, Clone, Copy)]
struct LoadedImages {
    control: DevicePtr,
    compute: DevicePtr,
}

/// An explicit, caller-owned device session.
pub struct DeviceSession {
    platform: Arc<dyn Platform>,
    config: RuntimeConfig,
    state: SessionState,
    device: Option<DeviceContext>,
    functions: FunctionTable,
    function_blocks: Vec<DevicePtr>,
    images: Option<LoadedImages>,
}

impl DeviceSession {
    pub fn new(platform: Arc<dyn Platform>, config: RuntimeConfig) -> Self {
        Self {
            platform,
            config,
            state: SessionState::Uninitialized,
            device: None,
            functions: FunctionTable::new(),
            function_blocks: Vec::new(),
            images: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device_id(&self) -> Option<i32> {
        self.device.as_ref().map(|d| d.device_id)
    }

    // ── Device ──

    /// Select the session's device. Selecting the same device again is a
    /// no-op; switching devices requires `close` first.
    pub fn select_device(&mut self, device_id: i32) -> Result<()> {
        if let Some(current) = self.device_id() {
            if current == device_id {
                return Ok(());
            }
            return Err(RuntimeError::InvalidState(format!(
                "device {current} already selected, cannot switch to {device_id}"
            )));
        }
        let device = self.platform.select_device(device_id)?;
        if let Err(err) = device.memory.get() {
            tracing::error!(device_id, error = %err, "device has no memory capability");
        }
        tracing::info!(device_id, platform = self.platform.name(), "device selected");
        self.device = Some(device);
        self.state = SessionState::DeviceSelected;
        Ok(())
    }

    fn memory(&self) -> Result<Arc<dyn DeviceMemory>> {
        let device = self.device.as_ref().ok_or(RuntimeError::DeviceNotSelected)?;
        Ok(Arc::clone(device.memory.get()?))
    }

    /// Memory of the selected device, selecting the configured default
    /// device first if needed.
    fn ensure_device(&mut self) -> Result<Arc<dyn DeviceMemory>> {
        if self.device.is_none() {
            self.select_device(self.config.device_id)?;
        }
        self.memory()
    }

    // ── Functions ──

    /// Register one kernel binary. Returns its device address.
    pub fn register_function(&mut self, func_id: usize, binary: &[u8]) -> Result<DevicePtr> {
        self.register_functions(&[(func_id, binary)])?;
        self.function_address(func_id)
            .ok_or_else(|| RuntimeError::ExecutionError(format!("function {func_id} not bound")))
    }

    /// Pack `functions` into one cache block, transfer it with a single
    /// allocation and copy, and bind each identifier to its record.
    #[tracing::instrument(skip_all, fields(count = functions.len()))]
    pub fn register_functions(&mut self, functions: &[(usize, &[u8])]) -> Result<()> {
        if functions.is_empty() {
            return Err(RuntimeError::InvalidInput("no functions to register".to_string()));
        }
        let mut seen = HashSet::new();
        for &(func_id, binary) in functions {
            if func_id >= RUNTIME_MAX_FUNC_ID {
                return Err(RuntimeError::InvalidInput(format!(
                    "function id {func_id} out of range (limit {RUNTIME_MAX_FUNC_ID})"
                )));
            }
            if binary.is_empty() {
                return Err(RuntimeError::InvalidInput(format!(
                    "function {func_id} has an empty binary"
                )));
            }
            if !seen.insert(func_id) {
                return Err(RuntimeError::InvalidInput(format!(
                    "function {func_id} listed twice"
                )));
            }
        }
        let memory = self.memory()?;

        let binaries: Vec<&[u8]> = functions.iter().map(|&(_, b)| b).collect();
        let cache = FunctionBinCache::build(&binaries)?;
        let base = upload(memory.as_ref(), cache.as_bytes())?;
        self.function_blocks.push(base);

        for (index, &(func_id, _)) in functions.iter().enumerate() {
            let addr = base.offset(cache.record_offset(index)?)?;
            self.functions.set(func_id, addr)?;
            tracing::debug!(func_id, addr = %addr, "function registered");
        }
        Ok(())
    }

    /// Device address of a registered function.
    pub fn function_address(&self, func_id: usize) -> Option<DevicePtr> {
        self.functions.get(func_id)
    }

    // ── Runs ──

    /// Create a run: marshal host arguments to the device and prepare an
    /// empty task graph.
    ///
    /// On failure every allocation made for the run is released and no
    /// descriptor is returned.
    #[tracing::instrument(skip_all, fields(args = args.args.len()))]
    pub fn initialize_runtime(&mut self, args: RuntimeArgs) -> Result<RuntimeDescriptor> {
        if args.args.len() > RUNTIME_MAX_ORCH_ARGS {
            return Err(RuntimeError::InvalidInput(format!(
                "{} orchestration arguments, the limit is {RUNTIME_MAX_ORCH_ARGS}",
                args.args.len()
            )));
        }
        let memory = self.ensure_device()?;

        let mut tracker = TransferTracker::new();
        let mut orch_args = Vec::with_capacity(args.args.len());
        for (index, arg) in args.args.iter().enumerate() {
            match marshal_arg(memory.as_ref(), arg, &mut tracker) {
                Ok(arg) => orch_args.push(arg),
                Err(err) => {
                    let freed = tracker.discard(memory.as_ref());
                    tracing::warn!(index, freed, error = %err, "argument marshalling failed, rolled back");
                    return Err(err);
                }
            }
        }

        let build_mode = args.build_mode.unwrap_or(self.config.build_mode);
        let mut runtime = RuntimeDescriptor::new(
            self.config.task_capacity,
            build_mode,
            orch_args,
            tracker,
            args.orchestration,
        );
        runtime.set_functions(self.functions.clone());
        tracing::info!(?build_mode, "runtime initialized");
        Ok(runtime)
    }

    /// Execute a run on `launch.device_id`.
    ///
    /// The program images are loaded on the first execute of the session and
    /// reused afterwards. Once the arguments are validated, any failure
    /// releases the run's tracked memory before the error is returned.
    #[tracing::instrument(skip_all, fields(threads = launch.thread_count, blocks = launch.block_dim))]
    pub fn execute(
        &mut self,
        runtime: &mut RuntimeDescriptor,
        launch: &LaunchConfig,
        control_binary: &[u8],
        compute_binary: &[u8],
    ) -> Result<()> {
        launch.validate()?;
        if control_binary.is_empty() || compute_binary.is_empty() {
            return Err(RuntimeError::InvalidInput(
                "control and compute binaries must be non-empty".to_string(),
            ));
        }
        if runtime.is_executed() {
            return Err(RuntimeError::InvalidState(
                "runtime descriptor was already executed".to_string(),
            ));
        }
        if let Some(current) = self.device_id() {
            if current != launch.device_id {
                return Err(RuntimeError::InvalidState(format!(
                    "run belongs to device {current}, cannot execute on {}",
                    launch.device_id
                )));
            }
        }

        let result = self.run(runtime, launch, control_binary, compute_binary);
        runtime.mark_executed();

        match result {
            Ok(()) => {
                self.state = SessionState::Ready;
                tracing::info!(tasks = runtime.graph().len(), "run completed");
                Ok(())
            }
            Err(err) => {
                self.release_failed_run(runtime, &err);
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        runtime: &mut RuntimeDescriptor,
        launch: &LaunchConfig,
        control_binary: &[u8],
        compute_binary: &[u8],
    ) -> Result<()> {
        self.select_device(launch.device_id)?;
        let memory = self.memory()?;
        self.ensure_binaries_loaded(memory.as_ref(), control_binary, compute_binary)?;

        runtime.set_functions(self.functions.clone());
        self.state = SessionState::Ready;
        self.launch(runtime, launch, memory.as_ref())
    }

    fn release_failed_run(&mut self, runtime: &RuntimeDescriptor, err: &RuntimeError) {
        self.state = SessionState::Finalizing;
        match self.memory() {
            Ok(memory) => {
                let report = runtime.tracker().lock().finalize(memory.as_ref());
                tracing::error!(error = %err, freed = report.freed, "run failed, resources released");
            }
            Err(unreachable) => {
                tracing::error!(error = %err, memory = %unreachable, "run failed, device memory unreachable");
            }
        }
        self.state = self.idle_state();
    }

    /// The state the session rests in between runs.
    fn idle_state(&self) -> SessionState {
        if self.images.is_some() {
            SessionState::Ready
        } else if self.device.is_some() {
            SessionState::DeviceSelected
        } else {
            SessionState::Uninitialized
        }
    }

    fn launch(
        &mut self,
        runtime: &RuntimeDescriptor,
        config: &LaunchConfig,
        memory: &dyn DeviceMemory,
    ) -> Result<()> {
        let device = self.device.clone().ok_or(RuntimeError::DeviceNotSelected)?;
        let images = self
            .images
            .ok_or_else(|| RuntimeError::InvalidState("binaries not loaded".to_string()))?;

        let image = runtime.encode_image();
        let descriptor_addr = memory.allocate(image.len())?;
        if let Err(err) = runtime.tracker().lock().record_allocation(descriptor_addr) {
            memory.free(descriptor_addr);
            return Err(err);
        }
        memory.copy_to_device(descriptor_addr, &image)?;

        self.state = SessionState::Executing;
        self.platform.launch(
            &device,
            &Launch {
                descriptor: runtime,
                config,
                descriptor_addr,
                control_image: images.control,
                compute_image: images.compute,
                idle_backoff: self.config.idle_backoff,
            },
        )
    }

    fn ensure_binaries_loaded(
        &mut self,
        memory: &dyn DeviceMemory,
        control_binary: &[u8],
        compute_binary: &[u8],
    ) -> Result<()> {
        if self.images.is_some() {
            return Ok(());
        }
        let control = upload(memory, control_binary)?;
        let compute = match upload(memory, compute_binary) {
            Ok(ptr) => ptr,
            Err(err) => {
                memory.free(control);
                return Err(err);
            }
        };
        self.images = Some(LoadedImages { control, compute });
        self.state = SessionState::BinariesLoaded;
        tracing::info!(control = %control, compute = %compute, "program images loaded");
        Ok(())
    }

    /// Copy outputs back and release every device buffer of the run.
    ///
    /// Every buffer is released even when a copy-back fails; the first
    /// copy-back error is returned afterwards.
    #[tracing::instrument(skip_all)]
    pub fn finalize(&mut self, runtime: &mut RuntimeDescriptor) -> Result<FinalizeReport> {
        let memory = self.memory()?;
        self.state = SessionState::Finalizing;
        let mut report = runtime.tracker().lock().finalize(memory.as_ref());
        self.state = self.idle_state();

        if let Some(err) = report.copy_error.take() {
            return Err(err.into());
        }
        tracing::info!(copied_back = report.copied_back, freed = report.freed, "run finalized");
        Ok(report)
    }

    /// Release session-owned device memory and return to `Uninitialized`.
    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            if let Ok(memory) = device.memory.get() {
                for ptr in self.function_blocks.drain(..) {
                    memory.free(ptr);
                }
                if let Some(images) = self.images.take() {
                    memory.free(images.control);
                    memory.free(images.compute);
                }
            }
            tracing::info!(device_id = device.device_id, "session closed");
        }
        self.function_blocks.clear();
        self.images = None;
        self.functions = FunctionTable::new();
        self.state = SessionState::Uninitialized;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Allocate a device buffer and copy `bytes` into it.
fn upload(memory: &dyn DeviceMemory, bytes: &[u8]) -> Result<DevicePtr> {
    let ptr = memory.allocate(bytes.len())?;
    if let Err(err) = memory.copy_to_device(ptr, bytes) {
        memory.free(ptr);
        return Err(err.into());
    }
    Ok(ptr)
}

fn marshal_arg(
    memory: &dyn DeviceMemory,
    arg: &HostArg,
    tracker: &mut TransferTracker,
) -> Result<TaskArg> {
    let (tensor, copy_in, copy_out) = match arg {
        HostArg::Scalar(value) => return Ok(TaskArg::Scalar(*value)),
        HostArg::Input(t) => (t, true, false),
        HostArg::Output(t) => (t, false, true),
        HostArg::InOut(t) => (t, true, true),
    };
    let len = tensor.len_bytes();
    if len == 0 {
        return Err(RuntimeError::InvalidInput("zero-length tensor argument".to_string()));
    }

    let ptr = memory.allocate(len)?;
    if let Err(err) = tracker.record_allocation(ptr) {
        memory.free(ptr);
        return Err(err);
    }
    if copy_in {
        tensor.with_bytes(|bytes| memory.copy_to_device(ptr, bytes))?;
    }
    if copy_out {
        tracker.record_tensor_pair(TensorPair {
            host: tensor.clone(),
            device: ptr,
            len,
        })?;
    }
    Ok(TaskArg::Address(ptr))
}
