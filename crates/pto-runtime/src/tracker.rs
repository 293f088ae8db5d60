//! Memory & transfer tracking for one run.
//!
//! Two independent lists: device allocations owned by the run, freed
//! unconditionally at finalize, and tensor pairs copied back device→host at
//! finalize. A pair's device address is freed afterwards only when the
//! allocation list does not already cover it.

use crate::error::{Result, RuntimeError};
use crate::tensor::HostTensor;
use pto_core::platform::{RUNTIME_MAX_DEVICE_ALLOCS, RUNTIME_MAX_TENSOR_PAIRS};
use pto_core::{CapabilityError, DeviceMemory, DevicePtr};
use std::collections::HashSet;

/// A host buffer that receives the contents of a device buffer at finalize.
#[derive(Debug, Clone)]
pub struct TensorPair {
    pub host: HostTensor,
    pub device: DevicePtr,
    pub len: usize,
}

/// What a finalize pass did.
#[derive(Debug, Default)]
pub struct FinalizeReport {
    pub copied_back: usize,
    pub freed: usize,
    /// First copy-back failure; later pairs are still attempted.
    pub copy_error: Option<CapabilityError>,
}

#[derive(Debug, Default)]
pub struct TransferTracker {
    allocations: Vec<DevicePtr>,
    tensor_pairs: Vec<TensorPair>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&mut self, ptr: DevicePtr) -> Result<()> {
        if self.allocations.len() >= RUNTIME_MAX_DEVICE_ALLOCS {
            return Err(RuntimeError::ResourceExhausted(format!(
                "more than {RUNTIME_MAX_DEVICE_ALLOCS} tracked allocations"
            )));
        }
        self.allocations.push(ptr);
        Ok(())
    }

    pub fn record_tensor_pair(&mut self, pair: TensorPair) -> Result<()> {
        if self.tensor_pairs.len() >= RUNTIME_MAX_TENSOR_PAIRS {
            return Err(RuntimeError::ResourceExhausted(format!(
                "more than {RUNTIME_MAX_TENSOR_PAIRS} tensor pairs"
            )));
        }
        self.tensor_pairs.push(pair);
        Ok(())
    }

    pub fn allocations(&self) -> &[DevicePtr] {
        &self.allocations
    }

    pub fn tensor_pairs(&self) -> &[TensorPair] {
        &self.tensor_pairs
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty() && self.tensor_pairs.is_empty()
    }

    /// Copy every tensor pair back, then free everything.
    ///
    /// Both lists are cleared, so a second call does nothing.
    pub fn finalize(&mut self, memory: &dyn DeviceMemory) -> FinalizeReport {
        let mut report = FinalizeReport::default();

        for pair in &self.tensor_pairs {
            let copied = pair.host.with_bytes_mut(|host| {
                let len = pair.len.min(host.len());
                memory.copy_from_device(&mut host[..len], pair.device)
            });
            match copied {
                Ok(()) => report.copied_back += 1,
                Err(err) => {
                    tracing::error!(device = %pair.device, error = %err, "copy-back failed");
                    report.copy_error.get_or_insert(err);
                }
            }
        }

        report.freed = self.release(memory);
        tracing::debug!(
            copied_back = report.copied_back,
            freed = report.freed,
            "run resources released"
        );
        report
    }

    /// Free everything without copying back. Used to roll back a failed setup.
    pub fn discard(&mut self, memory: &dyn DeviceMemory) -> usize {
        self.release(memory)
    }

    fn release(&mut self, memory: &dyn DeviceMemory) -> usize {
        let mut freed: HashSet<DevicePtr> = HashSet::new();
        for ptr in self.allocations.drain(..) {
            if !ptr.is_null() && freed.insert(ptr) {
                memory.free(ptr);
            }
        }
        for pair in self.tensor_pairs.drain(..) {
            if !pair.device.is_null() && freed.insert(pair.device) {
                memory.free(pair.device);
            }
        }
        freed.len()
    }
}
