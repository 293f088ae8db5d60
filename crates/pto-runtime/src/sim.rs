//! Shared-memory simulation target.
//!
//! Device memory is a host-side arena addressed from a fixed base, and the
//! control and compute cores are host threads.

use crate::device::{DeviceContext, Launch, MemoryCapability, Platform};
use crate::error::{Result, RuntimeError};
use crate::kernel::KernelTable;
use crate::scheduler;
use parking_lot::Mutex;
use pto_core::{CapabilityError, DeviceMemory, DevicePtr};
use std::collections::BTreeMap;
use std::sync::Arc;

const SIM_BASE_ADDR: u64 = 0x1_0000_0000;
const SIM_ALIGN: u64 = 512;
const SIM_DEFAULT_CAPACITY: usize = 1 << 30;

struct Arena {
    blocks: BTreeMap<u64, Vec<u8>>,
    next: u64,
    bytes_in_use: usize,
}

/// Simulated device memory.
pub struct SimDevice {
    arena: Mutex<Arena>,
    capacity: usize,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::with_capacity(SIM_DEFAULT_CAPACITY)
    }

    /// A device that fails allocations once `capacity` bytes are live.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Mutex::new(Arena {
                blocks: BTreeMap::new(),
                next: SIM_BASE_ADDR,
                bytes_in_use: 0,
            }),
            capacity,
        }
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.arena.lock().blocks.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.arena.lock().bytes_in_use
    }

    /// Run `f` over the bytes `[addr, addr + len)` of one live allocation.
    fn with_region<R>(
        &self,
        addr: DevicePtr,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> std::result::Result<R, CapabilityError> {
        let mut arena = self.arena.lock();
        let (&base, block) = arena
            .blocks
            .range_mut(..=addr.addr())
            .next_back()
            .ok_or(CapabilityError::InvalidAddress(addr))?;
        let offset = (addr.addr() - base) as usize;
        if offset >= block.len() {
            return Err(CapabilityError::InvalidAddress(addr));
        }
        let region = offset
            .checked_add(len)
            .and_then(|end| block.get_mut(offset..end))
            .ok_or(CapabilityError::OutOfBounds { addr, len })?;
        Ok(f(region))
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for SimDevice {
    fn allocate(&self, bytes: usize) -> std::result::Result<DevicePtr, CapabilityError> {
        if bytes == 0 {
            return Err(CapabilityError::InvalidSize);
        }
        let mut arena = self.arena.lock();
        if arena.bytes_in_use.saturating_add(bytes) > self.capacity {
            return Err(CapabilityError::OutOfMemory { bytes });
        }
        let addr = arena.next;
        arena.next += (bytes as u64).div_ceil(SIM_ALIGN) * SIM_ALIGN;
        arena.blocks.insert(addr, vec![0; bytes]);
        arena.bytes_in_use += bytes;
        Ok(DevicePtr::new(addr))
    }

    fn free(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            return;
        }
        let mut arena = self.arena.lock();
        match arena.blocks.remove(&ptr.addr()) {
            Some(block) => arena.bytes_in_use -= block.len(),
            None => tracing::warn!(addr = %ptr, "free of unknown device address"),
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> std::result::Result<(), CapabilityError> {
        self.with_region(dst, src.len(), |region| region.copy_from_slice(src))
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> std::result::Result<(), CapabilityError> {
        self.with_region(src, dst.len(), |region| dst.copy_from_slice(region))
    }
}

/// Simulation platform: host threads stand in for control and compute cores.
pub struct SimPlatform {
    memory: MemoryCapability,
    kernels: Arc<KernelTable>,
}

impl SimPlatform {
    /// A platform over a fresh [`SimDevice`].
    pub fn new(kernels: KernelTable) -> Self {
        Self::with_memory(Arc::new(SimDevice::new()), kernels)
    }

    /// A platform over caller-provided memory.
    pub fn with_memory(memory: Arc<dyn DeviceMemory>, kernels: KernelTable) -> Self {
        Self::with_capability(MemoryCapability::Available(memory), kernels)
    }

    pub fn with_capability(memory: MemoryCapability, kernels: KernelTable) -> Self {
        Self {
            memory,
            kernels: Arc::new(kernels),
        }
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }
}

impl Platform for SimPlatform {
    fn name(&self) -> &str {
        "sim"
    }

    fn select_device(&self, device_id: i32) -> Result<DeviceContext> {
        if device_id < 0 {
            return Err(RuntimeError::InvalidInput(format!(
                "device id {device_id} is negative"
            )));
        }
        Ok(DeviceContext {
            device_id,
            memory: self.memory.clone(),
        })
    }

    fn launch(&self, device: &DeviceContext, launch: &Launch<'_>) -> Result<()> {
        let memory = device.memory.get()?;
        tracing::debug!(
            descriptor = %launch.descriptor_addr,
            control = %launch.control_image,
            compute = %launch.compute_image,
            "sim launch"
        );
        scheduler::run_device(
            launch.descriptor,
            memory.as_ref(),
            &self.kernels,
            launch.config,
            launch.idle_backoff,
        )
    }
}
