//! Tagged task and orchestration arguments.
//!
//! Every argument slot handed to a kernel or to a graph-building program is
//! either a device address or a scalar with an explicit width and
//! interpretation. The 64-bit slot encoding is produced only when an
//! argument vector is marshalled for the device.

use crate::memory::DevicePtr;

/// A scalar argument value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// Width of the value in bytes.
    pub fn width(&self) -> usize {
        match self {
            Scalar::U32(_) | Scalar::I32(_) | Scalar::F32(_) => 4,
            Scalar::U64(_) | Scalar::I64(_) | Scalar::F64(_) => 8,
        }
    }

    /// Raw bits of the value, zero-extended to a 64-bit slot.
    ///
    /// 32-bit values occupy the low half of the slot, so an `F32` slot holds
    /// `f32::to_bits` in bits 0..32.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Scalar::U32(v) => u64::from(v),
            Scalar::I32(v) => u64::from(v as u32),
            Scalar::U64(v) => v,
            Scalar::I64(v) => v as u64,
            Scalar::F32(v) => u64::from(v.to_bits()),
            Scalar::F64(v) => v.to_bits(),
        }
    }
}

/// One argument slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskArg {
    Address(DevicePtr),
    Scalar(Scalar),
}

impl TaskArg {
    /// 64-bit slot encoding of this argument.
    pub fn to_bits(&self) -> u64 {
        match self {
            TaskArg::Address(ptr) => ptr.addr(),
            TaskArg::Scalar(s) => s.to_bits(),
        }
    }

    pub fn as_address(&self) -> Option<DevicePtr> {
        match self {
            TaskArg::Address(ptr) => Some(*ptr),
            TaskArg::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            TaskArg::Scalar(s) => Some(*s),
            TaskArg::Address(_) => None,
        }
    }

    /// The value as `f32`, only for `F32` scalars.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            TaskArg::Scalar(Scalar::F32(v)) => Some(*v),
            _ => None,
        }
    }

    /// The value as `u64`, for unsigned and non-negative signed integers.
    pub fn as_u64(&self) -> Option<u64> {
        match self.as_scalar()? {
            Scalar::U32(v) => Some(u64::from(v)),
            Scalar::U64(v) => Some(v),
            Scalar::I32(v) => u64::try_from(v).ok(),
            Scalar::I64(v) => u64::try_from(v).ok(),
            Scalar::F32(_) | Scalar::F64(_) => None,
        }
    }
}

impl From<DevicePtr> for TaskArg {
    fn from(ptr: DevicePtr) -> Self {
        TaskArg::Address(ptr)
    }
}

impl From<Scalar> for TaskArg {
    fn from(s: Scalar) -> Self {
        TaskArg::Scalar(s)
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for TaskArg {
                fn from(v: $ty) -> Self {
                    TaskArg::Scalar(Scalar::$variant(v))
                }
            }
        )*
    };
}

scalar_from!(u32 => U32, i32 => I32, u64 => U64, i64 => I64, f32 => F32, f64 => F64);

/// Marshal an argument vector into 64-bit slots.
pub fn pack_args(args: &[TaskArg]) -> Vec<u64> {
    args.iter().map(TaskArg::to_bits).collect()
}
