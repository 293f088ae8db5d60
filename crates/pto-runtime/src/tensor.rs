//! Host-side buffers for run inputs and outputs.

use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use parking_lot::RwLock;
use std::sync::Arc;

/// A shared host buffer.
///
/// Clones share storage, so a caller keeps one handle to read results that
/// finalize copies back into the other.
#[derive(Debug, Clone, Default)]
pub struct HostTensor {
    data: Arc<RwLock<Vec<u8>>>,
}

impl HostTensor {
    /// Create a tensor from a vector of plain values.
    ///
    /// # Example
    /// ```
    /// # use pto_runtime::HostTensor;
    /// let a = HostTensor::from_vec(vec![1.0f32; 6]);
    /// assert_eq!(a.len_bytes(), 24);
    /// ```
    pub fn from_vec<T: Pod>(data: Vec<T>) -> Self {
        Self::from_bytes(bytemuck::cast_slice(&data).to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(bytes)),
        }
    }

    /// A zero-filled buffer of `bytes` bytes.
    pub fn zeroed(bytes: usize) -> Self {
        Self::from_bytes(vec![0; bytes])
    }

    /// Convert the contents to a Vec.
    ///
    /// # Errors
    /// Returns an error if the byte length is not a multiple of `T`'s size.
    pub fn to_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let bytes = self.data.read();
        if bytes.len() % std::mem::size_of::<T>() != 0 {
            return Err(RuntimeError::TensorError(format!(
                "{} bytes is not a whole number of {}",
                bytes.len(),
                std::any::type_name::<T>()
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn len_bytes(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes() == 0
    }

    /// Run `f` over the current contents.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// Run `f` over the contents mutably.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }
}
