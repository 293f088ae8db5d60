//! Device memory capability.
//!
//! The four operations the runtime needs from a deployment target: allocate,
//! free, and copy in either direction. Real hardware and the shared-memory
//! simulation implement the same contract.

use crate::ErrorKind;
use std::fmt;

/// An address in device memory.
///
/// Address zero is the null pointer; `free(DevicePtr::NULL)` is always a no-op.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// The null device address.
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw address value.
    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    ///
    /// Fails when the result does not fit the 64-bit address space.
    pub fn offset(self, bytes: usize) -> Result<Self, CapabilityError> {
        self.0
            .checked_add(bytes as u64)
            .map(Self)
            .ok_or(CapabilityError::OutOfBounds { addr: self, len: bytes })
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors reported by a device memory capability.
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    /// The underlying primitive could not be located.
    #[error("Capability unavailable: {0}")]
    Unavailable(String),

    #[error("Device out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },

    #[error("Zero-byte allocation requested")]
    InvalidSize,

    #[error("Address {0} is not inside a live device allocation")]
    InvalidAddress(DevicePtr),

    #[error("Access of {len} bytes at {addr} runs past the end of its allocation")]
    OutOfBounds { addr: DevicePtr, len: usize },

    #[error("Device error: {0}")]
    Device(String),
}

impl CapabilityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CapabilityError::Unavailable(_) => ErrorKind::CapabilityUnavailable,
            CapabilityError::OutOfMemory { .. } => ErrorKind::ResourceExhausted,
            CapabilityError::InvalidSize
            | CapabilityError::InvalidAddress(_)
            | CapabilityError::OutOfBounds { .. } => ErrorKind::InvalidInput,
            CapabilityError::Device(_) => ErrorKind::Device,
        }
    }
}

/// Memory operations a deployment target provides.
///
/// A failed `allocate` never partially succeeds, and `free` of the null
/// address is a no-op.
pub trait DeviceMemory: Send + Sync {
    /// Allocate `bytes` of device memory visible to the compute cores.
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, CapabilityError>;

    /// Release an allocation.
    fn free(&self, ptr: DevicePtr);

    /// Copy `src` from the host into device memory at `dst`.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), CapabilityError>;

    /// Copy `dst.len()` bytes from device memory at `src` into `dst`.
    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), CapabilityError>;
}
