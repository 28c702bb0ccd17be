//! Device placement, numeric precision and device-memory management

use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Where tensors are placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

/// Numeric precision activations are computed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
    BF16,
}

impl DType {
    /// Rounds `value` to the nearest value representable in this precision.
    pub fn round(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        };
        write!(f, "{}", name)
    }
}

/// Hooks into the numeric runtime's device-memory allocator.
pub trait DeviceRuntime: Send {
    /// Returns cached but unused device memory to the allocator.
    fn empty_cache(&mut self);
}

/// Host runtime; there is no allocator cache to release.
#[derive(Debug, Default, Clone)]
pub struct CpuRuntime;

impl DeviceRuntime for CpuRuntime {
    fn empty_cache(&mut self) {
        trace!("empty_cache: nothing cached on cpu");
    }
}
