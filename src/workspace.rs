//! Auxiliary buffers and engine-supplied constants.
//!
//! Nodes only compute sizes here. The caller owns the device memory and the
//! stream the copies are issued on.

use std::collections::{BTreeMap, HashMap};

use half::{bf16, f16};

use crate::{
    error::Result,
    tensor::{DataType, TensorHandle, TensorUid},
};

/// Opaque address inside device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Value the engine binds to a pass-by-value tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassByValue {
    Float(f32),
    Half(f16),
    BFloat16(bf16),
    /// Region of the caller's workspace holding a host-computed buffer.
    Buffer(DevicePtr),
}

impl PassByValue {
    /// Scalar in the requested storage type; anything but the 16-bit types is
    /// passed as FP32.
    pub fn scalar(value: f32, data_type: DataType) -> Self {
        match data_type {
            DataType::Half => PassByValue::Half(f16::from_f32(value)),
            DataType::BFloat16 => PassByValue::BFloat16(bf16::from_f32(value)),
            _ => PassByValue::Float(value),
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PassByValue::Float(value) => Some(*value),
            PassByValue::Half(value) => Some(value.to_f32()),
            PassByValue::BFloat16(value) => Some(value.to_f32()),
            PassByValue::Buffer(_) => None,
        }
    }
}

pub type PassByValueMap = BTreeMap<TensorHandle, PassByValue>;

/// Device pointers the caller bound to external tensors, keyed by uid.
pub type DevicePointerMap = HashMap<TensorUid, DevicePtr>;

/// Stream the asynchronous copies are enqueued on.
///
/// Calls are fire-and-forget: ordering with later launches on the same stream
/// is the caller's concern.
pub trait ExecutionHandle {
    fn copy_host_to_device_async(&mut self, destination: DevicePtr, bytes: &[u8]) -> Result<()>;
    fn memset_async(&mut self, destination: DevicePtr, value: u8, len: usize) -> Result<()>;
}

/// Hands out consecutive regions of the workspace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkspaceCursor {
    next: DevicePtr,
}

impl WorkspaceCursor {
    pub(crate) fn new(base: DevicePtr) -> Self {
        WorkspaceCursor { next: base }
    }

    pub(crate) fn take(&mut self, bytes: usize) -> DevicePtr {
        let region = self.next;
        self.next = self.next.offset(bytes);
        region
    }
}
