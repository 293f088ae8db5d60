//! HAL-backed memory capability for code running on the control cores.
//!
//! The HAL allocator is resolved from the driver library once, when the
//! capability is created. Device memory is directly addressable from the
//! control cores, so copies are plain memory moves, allowed only inside
//! allocations this capability handed out and has not yet freed.

use crate::device::MemoryCapability;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use pto_core::{CapabilityError, DeviceMemory, DevicePtr};
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::Arc;

/// Driver library exporting `halMemAlloc` / `halMemFree`.
pub const HAL_LIBRARY: &str = "libascend_hal.so";

/// High-bandwidth memory placement flag.
const MEM_TYPE_HBM: u64 = 0x1 << 14;

type HalMemAllocFn = unsafe extern "C" fn(*mut *mut c_void, u64, u64) -> i32;
type HalMemFreeFn = unsafe extern "C" fn(*mut c_void) -> i32;

/// Live HAL allocations by base address, with their sizes.
#[derive(Debug, Default)]
struct LiveRegions {
    blocks: BTreeMap<u64, usize>,
}

impl LiveRegions {
    fn insert(&mut self, ptr: DevicePtr, len: usize) {
        self.blocks.insert(ptr.addr(), len);
    }

    fn remove(&mut self, ptr: DevicePtr) -> bool {
        self.blocks.remove(&ptr.addr()).is_some()
    }

    /// `[addr, addr + len)` must lie inside one live allocation.
    fn check(&self, addr: DevicePtr, len: usize) -> Result<(), CapabilityError> {
        let (&base, &size) = self
            .blocks
            .range(..=addr.addr())
            .next_back()
            .ok_or(CapabilityError::InvalidAddress(addr))?;
        let offset = addr.addr() - base;
        if offset >= size as u64 {
            return Err(CapabilityError::InvalidAddress(addr));
        }
        match offset.checked_add(len as u64) {
            Some(end) if end <= size as u64 => Ok(()),
            _ => Err(CapabilityError::OutOfBounds { addr, len }),
        }
    }
}

pub struct HalMemory {
    alloc: HalMemAllocFn,
    free: HalMemFreeFn,
    // Copies are only allowed inside these.
    live: Mutex<LiveRegions>,
    // Keeps the resolved symbols valid.
    _driver: Library,
}

impl HalMemory {
    /// Load `path` and resolve the HAL allocator symbols.
    pub fn load(path: &str) -> Result<Self, CapabilityError> {
        unsafe {
            let driver = Library::new(path)
                .map_err(|e| CapabilityError::Unavailable(format!("{path}: {e}")))?;

            let alloc: Symbol<HalMemAllocFn> = driver
                .get(b"halMemAlloc\0")
                .map_err(|_| CapabilityError::Unavailable("halMemAlloc".into()))?;
            let free: Symbol<HalMemFreeFn> = driver
                .get(b"halMemFree\0")
                .map_err(|_| CapabilityError::Unavailable("halMemFree".into()))?;
            let (alloc, free) = (*alloc, *free);

            Ok(Self {
                alloc,
                free,
                live: Mutex::new(LiveRegions::default()),
                _driver: driver,
            })
        }
    }

    /// Resolve the capability from [`HAL_LIBRARY`].
    pub fn resolve() -> MemoryCapability {
        Self::resolve_from(HAL_LIBRARY)
    }

    pub fn resolve_from(path: &str) -> MemoryCapability {
        match Self::load(path) {
            Ok(hal) => {
                tracing::debug!(path, "HAL memory capability resolved");
                MemoryCapability::Available(Arc::new(hal))
            }
            Err(err) => {
                tracing::error!(path, error = %err, "HAL memory capability unavailable");
                MemoryCapability::Unavailable(err.to_string())
            }
        }
    }
}

impl DeviceMemory for HalMemory {
    fn allocate(&self, bytes: usize) -> Result<DevicePtr, CapabilityError> {
        if bytes == 0 {
            return Err(CapabilityError::InvalidSize);
        }
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let rc = unsafe { (self.alloc)(&mut ptr, bytes as u64, MEM_TYPE_HBM) };
        if rc != 0 || ptr.is_null() {
            return Err(CapabilityError::OutOfMemory { bytes });
        }
        let ptr = DevicePtr::new(ptr as u64);
        self.live.lock().insert(ptr, bytes);
        Ok(ptr)
    }

    fn free(&self, ptr: DevicePtr) {
        if ptr.is_null() {
            return;
        }
        if !self.live.lock().remove(ptr) {
            tracing::warn!(addr = %ptr, "free of unknown device address");
            return;
        }
        let rc = unsafe { (self.free)(ptr.addr() as *mut c_void) };
        if rc != 0 {
            tracing::warn!(addr = %ptr, rc, "halMemFree failed");
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<(), CapabilityError> {
        let live = self.live.lock();
        live.check(dst, src.len())?;
        // The region lies inside a live allocation, held live by the lock.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.addr() as *mut u8, src.len()) };
        Ok(())
    }

    fn copy_from_device(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), CapabilityError> {
        let live = self.live.lock();
        live.check(src, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.addr() as *const u8, dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }
}
