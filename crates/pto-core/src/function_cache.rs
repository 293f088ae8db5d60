//! Packed kernel binary cache.
//!
//! N compiled kernel binaries are packed into one contiguous block so the
//! whole set costs a single device allocation and a single transfer:
//!
//! ```text
//! [total_payload_size: u64][binary_count: u64]
//! [offset_0 .. offset_{n-1}: u64]
//! [binary_0: len u64, payload][binary_1: len u64, payload]...
//! ```
//!
//! Offsets are measured from the start of the payload region (right after
//! the offset table). All integers are little-endian.

use crate::memory::DevicePtr;
use crate::platform::RUNTIME_MAX_FUNC_ID;
use crate::{Error, Result};
use bytemuck::{Pod, Zeroable};

const WORD: usize = std::mem::size_of::<u64>();

/// Fixed header at the start of a packed cache.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CacheHeader {
    pub total_payload_size: u64,
    pub binary_count: u64,
}

const HEADER_SIZE: usize = std::mem::size_of::<CacheHeader>();

/// An immutable, validated packed binary cache.
#[derive(Debug, Clone)]
pub struct FunctionBinCache {
    bytes: Vec<u8>,
    count: usize,
}

impl FunctionBinCache {
    /// Pack `binaries` into one block.
    ///
    /// Fails on an empty set or on any zero-length binary.
    pub fn build<B: AsRef<[u8]>>(binaries: &[B]) -> Result<Self> {
        if binaries.is_empty() {
            return Err(Error::InvalidArgument(
                "function cache needs at least one binary".to_string(),
            ));
        }
        if let Some(i) = binaries.iter().position(|b| b.as_ref().is_empty()) {
            return Err(Error::InvalidArgument(format!("binary {i} is empty")));
        }

        let count = binaries.len();
        let payload_size: usize = binaries.iter().map(|b| WORD + b.as_ref().len()).sum();

        let mut bytes = Vec::with_capacity(HEADER_SIZE + count * WORD + payload_size);
        let header = CacheHeader {
            total_payload_size: payload_size as u64,
            binary_count: count as u64,
        };
        bytes.extend_from_slice(bytemuck::bytes_of(&header));

        let mut offset = 0u64;
        for binary in binaries {
            bytes.extend_from_slice(&offset.to_le_bytes());
            offset += (WORD + binary.as_ref().len()) as u64;
        }
        for binary in binaries {
            let binary = binary.as_ref();
            bytes.extend_from_slice(&(binary.len() as u64).to_le_bytes());
            bytes.extend_from_slice(binary);
        }

        Ok(Self { bytes, count })
    }

    /// Validate an existing packed block.
    ///
    /// The block length must match the declared payload size exactly, and
    /// every record must fit inside the payload region.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::FunctionCache(format!(
                "{} bytes is shorter than the header",
                bytes.len()
            )));
        }
        let header: CacheHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        let count = usize::try_from(header.binary_count)
            .map_err(|_| Error::FunctionCache("binary count overflows".to_string()))?;
        let payload_size = usize::try_from(header.total_payload_size)
            .map_err(|_| Error::FunctionCache("payload size overflows".to_string()))?;

        let expected = count
            .checked_mul(WORD)
            .and_then(|table| table.checked_add(HEADER_SIZE))
            .and_then(|prefix| prefix.checked_add(payload_size))
            .ok_or_else(|| Error::FunctionCache("declared sizes overflow".to_string()))?;
        if expected != bytes.len() {
            return Err(Error::FunctionCache(format!(
                "declared size {expected} does not match block size {}",
                bytes.len()
            )));
        }

        let cache = Self { bytes, count };
        for i in 0..count {
            cache.record_bounds(i)?;
        }
        Ok(cache)
    }

    /// Number of binaries.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the whole block in bytes.
    pub fn total_size(&self) -> usize {
        self.bytes.len()
    }

    /// Size of the payload region in bytes.
    pub fn payload_size(&self) -> usize {
        self.bytes.len() - self.payload_start()
    }

    /// The offset table, one entry per binary.
    pub fn offset_table(&self) -> impl Iterator<Item = u64> + '_ {
        self.bytes[HEADER_SIZE..self.payload_start()]
            .chunks_exact(WORD)
            .map(read_u64)
    }

    /// The payload region (length-prefixed records).
    pub fn payload_region(&self) -> &[u8] {
        &self.bytes[self.payload_start()..]
    }

    /// Byte offset of record `index` from the start of the whole block.
    ///
    /// Adding this to the device address of the block gives the address of
    /// the length-prefixed record.
    pub fn record_offset(&self, index: usize) -> Result<usize> {
        let (start, _) = self.record_bounds(index)?;
        Ok(self.payload_start() + start)
    }

    /// Payload of binary `index`.
    pub fn binary_at(&self, index: usize) -> Result<&[u8]> {
        let (start, len) = self.record_bounds(index)?;
        let begin = start + WORD;
        Ok(&self.payload_region()[begin..begin + len])
    }

    /// The packed block, ready for transfer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn payload_start(&self) -> usize {
        HEADER_SIZE + self.count * WORD
    }

    /// (record start within payload, payload length)
    fn record_bounds(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.count {
            return Err(Error::BinaryIndexOutOfRange {
                index,
                count: self.count,
            });
        }
        let at = HEADER_SIZE + index * WORD;
        let start = usize::try_from(read_u64(&self.bytes[at..at + WORD]))
            .map_err(|_| Error::FunctionCache(format!("offset {index} overflows")))?;
        let payload = self.payload_region();
        let prefix_end = start
            .checked_add(WORD)
            .filter(|&end| end <= payload.len())
            .ok_or_else(|| Error::FunctionCache(format!("record {index} starts out of range")))?;
        let len = decode_binary_record(&payload[start..])
            .map(<[u8]>::len)
            .ok_or_else(|| Error::FunctionCache(format!("record {index} overruns payload")))?;
        debug_assert!(prefix_end + len <= payload.len());
        Ok((start, len))
    }
}

/// Split a length-prefixed record into its payload.
///
/// Returns `None` when the buffer is shorter than the declared length.
pub fn decode_binary_record(record: &[u8]) -> Option<&[u8]> {
    let prefix = record.get(..WORD)?;
    let len = usize::try_from(read_u64(prefix)).ok()?;
    record.get(WORD..WORD.checked_add(len)?)
}

/// Length of the record prefix in bytes.
pub const RECORD_PREFIX_SIZE: usize = WORD;

fn read_u64(bytes: &[u8]) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

/// Function-identifier → device address map.
///
/// Each resolved entry points at a length-prefixed binary record resident
/// in device memory.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    addrs: [Option<DevicePtr>; RUNTIME_MAX_FUNC_ID],
}

impl FunctionTable {
    pub fn new() -> Self {
        Self {
            addrs: [None; RUNTIME_MAX_FUNC_ID],
        }
    }

    /// Bind `func_id` to `addr`, replacing any previous binding.
    pub fn set(&mut self, func_id: usize, addr: DevicePtr) -> Result<()> {
        if addr.is_null() {
            return Err(Error::InvalidArgument(format!(
                "function {func_id} bound to null address"
            )));
        }
        let slot = self.addrs.get_mut(func_id).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "function id {func_id} out of range (limit {RUNTIME_MAX_FUNC_ID})"
            ))
        })?;
        *slot = Some(addr);
        Ok(())
    }

    /// Resolved address of `func_id`, if any.
    pub fn get(&self, func_id: usize) -> Option<DevicePtr> {
        self.addrs.get(func_id).copied().flatten()
    }

    pub fn resolved_count(&self) -> usize {
        self.addrs.iter().filter(|a| a.is_some()).count()
    }

    /// Iterate over resolved `(func_id, address)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, DevicePtr)> + '_ {
        self.addrs
            .iter()
            .enumerate()
            .filter_map(|(id, addr)| addr.map(|a| (id, a)))
    }
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}
