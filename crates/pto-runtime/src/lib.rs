//! Host execution orchestrator and task scheduler for the PTO runtime.
//!
//! This crate drives runs of a task graph on a device with two classes of
//! cores: control cores (AICPU) that build and schedule the graph, and
//! compute cores (AIC/AIV) that execute kernels.
//!
//! # Architecture
//!
//! The runtime manages four main responsibilities:
//! 1. **Session lifecycle** - Select the device, load kernel binaries and program images once
//! 2. **Run setup** - Marshal host arguments into device buffers tracked per run
//! 3. **Execution** - Build the task graph on a control core and dispatch it across compute cores
//! 4. **Finalize** - Copy outputs back and free every buffer of the run
//!
//! # Example
//!
//! ```no_run
//! use pto_runtime::{
//!     DeviceSession, GraphBuilder, HostTensor, KernelTable, LaunchConfig, RuntimeArgs,
//!     RuntimeConfig, SimPlatform,
//! };
//! use pto_core::{CoreType, TaskArg};
//! use std::sync::Arc;
//!
//! fn orchestrate(b: &GraphBuilder<'_>) -> pto_runtime::Result<()> {
//!     let out = b.arg_address(0)?;
//!     let t0 = b.add_task(&[TaskArg::from(out)], 0, CoreType::Aiv)?;
//!     b.publish_task(t0)
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let kernels = KernelTable::new();
//!     let platform = Arc::new(SimPlatform::new(kernels));
//!     let mut session = DeviceSession::new(platform, RuntimeConfig::from_env());
//!
//!     session.select_device(0)?;
//!     session.register_function(0, b"kernel_fill")?;
//!
//!     let out = HostTensor::zeroed(64);
//!     let mut run = session.initialize_runtime(RuntimeArgs::from_fn(orchestrate).output(out.clone()))?;
//!     session.execute(&mut run, &LaunchConfig::new(3, 3, 0), b"aicpu", b"aicore")?;
//!     session.finalize(&mut run)?;
//!
//!     println!("{:?}", out.to_vec::<f32>()?);
//!     Ok(())
//! }
//! ```

pub mod api;
mod config;
mod descriptor;
mod device;
mod error;
mod hal;
mod kernel;
mod orchestration;
mod scheduler;
mod session;
mod sim;
mod tensor;
mod tracker;

// Public exports
pub use config::{parse_build_mode, RuntimeConfig, BUILD_MODE_ENV, DEVICE_ID_ENV};
pub use descriptor::{DescriptorHeader, HostArg, RuntimeArgs, RuntimeDescriptor};
pub use device::{DeviceContext, Launch, LaunchConfig, MemoryCapability, Platform};
pub use error::{
    status_of, Result, RuntimeError, STATUS_CAPABILITY_UNAVAILABLE, STATUS_EXECUTION_FAILED,
    STATUS_INVALID_INPUT, STATUS_INVALID_STATE, STATUS_OK, STATUS_RESOURCE_EXHAUSTED,
};
pub use hal::{HalMemory, HAL_LIBRARY};
pub use kernel::{Kernel, KernelContext, KernelError, KernelTable};
pub use orchestration::{GraphBuilder, Orchestration};
pub use scheduler::{partition_cores, CoreId, CorePartition, RunControl};
pub use session::{DeviceSession, SessionState};
pub use sim::{SimDevice, SimPlatform};
pub use tensor::HostTensor;
pub use tracker::{FinalizeReport, TensorPair, TransferTracker};
