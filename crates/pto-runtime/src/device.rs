//! Deployment-target seam.
//!
//! A [`Platform`] opens devices and runs launches. The memory capability of
//! an opened device is resolved once and carried as a typed value, so a
//! missing primitive surfaces as `CapabilityUnavailable` at the call that
//! needs it.

use crate::descriptor::RuntimeDescriptor;
use crate::error::{Result, RuntimeError};
use pto_core::platform::{PLATFORM_MAX_AICPU_THREADS, PLATFORM_MAX_BLOCKDIM};
use pto_core::{DeviceMemory, DevicePtr};
use std::sync::Arc;
use std::time::Duration;

/// Memory capability of a device, resolved once.
#[derive(Clone)]
pub enum MemoryCapability {
    Available(Arc<dyn DeviceMemory>),
    Unavailable(String),
}

impl MemoryCapability {
    pub fn get(&self) -> Result<&Arc<dyn DeviceMemory>> {
        match self {
            MemoryCapability::Available(memory) => Ok(memory),
            MemoryCapability::Unavailable(reason) => {
                Err(RuntimeError::CapabilityUnavailable(reason.clone()))
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, MemoryCapability::Available(_))
    }
}

impl std::fmt::Debug for MemoryCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryCapability::Available(_) => f.write_str("Available"),
            MemoryCapability::Unavailable(reason) => write!(f, "Unavailable({reason})"),
        }
    }
}

/// An opened device.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device_id: i32,
    pub memory: MemoryCapability,
}

/// Shape of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Control-core (AICPU) threads.
    pub thread_count: usize,
    /// Blocks of compute cores; each block is one AIC and two AIV cores.
    pub block_dim: usize,
    pub device_id: i32,
}

impl LaunchConfig {
    pub fn new(thread_count: usize, block_dim: usize, device_id: i32) -> Self {
        Self {
            thread_count,
            block_dim,
            device_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 || self.thread_count > PLATFORM_MAX_AICPU_THREADS {
            return Err(RuntimeError::InvalidInput(format!(
                "thread count {} outside 1..={PLATFORM_MAX_AICPU_THREADS}",
                self.thread_count
            )));
        }
        if self.block_dim == 0 || self.block_dim > PLATFORM_MAX_BLOCKDIM {
            return Err(RuntimeError::InvalidInput(format!(
                "block dim {} outside 1..={PLATFORM_MAX_BLOCKDIM}",
                self.block_dim
            )));
        }
        if self.device_id < 0 {
            return Err(RuntimeError::InvalidInput(format!(
                "device id {} is negative",
                self.device_id
            )));
        }
        Ok(())
    }
}

/// Everything a platform needs to run a prepared descriptor.
pub struct Launch<'a> {
    pub descriptor: &'a RuntimeDescriptor,
    pub config: &'a LaunchConfig,
    /// Device copy of the encoded descriptor.
    pub descriptor_addr: DevicePtr,
    pub control_image: DevicePtr,
    pub compute_image: DevicePtr,
    pub idle_backoff: Duration,
}

/// A deployment target.
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    /// Open device `device_id`.
    fn select_device(&self, device_id: i32) -> Result<DeviceContext>;

    /// Run the control-core programs and the compute-core program to
    /// completion.
    fn launch(&self, device: &DeviceContext, launch: &Launch<'_>) -> Result<()>;
}
