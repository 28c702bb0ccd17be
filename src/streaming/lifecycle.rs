use ndarray::{Array4, Axis};
use serde::{Deserialize, Serialize};

use super::StreamingError;
use crate::runtime::{DType, Device};

pub(crate) fn imagenet_mean() -> Vec<f32> {
    vec![0.485, 0.456, 0.406]
}

pub(crate) fn imagenet_std() -> Vec<f32> {
    vec![0.229, 0.224, 0.225]
}

/// Placement, precision and input-normalization constants the engine reads
/// on every call.
///
/// The training module owns the authoritative copy and hands a clone to the
/// engine at every phase boundary; the engine never writes it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleState {
    pub device: Device,
    pub dtype: DType,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            dtype: DType::F32,
            mean: imagenet_mean(),
            std: imagenet_std(),
        }
    }
}

impl LifecycleState {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self, StreamingError> {
        let state = Self { mean, std, ..Self::default() };
        state.validate()?;
        Ok(state)
    }

    pub fn validate(&self) -> Result<(), StreamingError> {
        if self.mean.is_empty() || self.mean.len() != self.std.len() {
            return Err(StreamingError::Config(format!(
                "mean ({}) and std ({}) must be non-empty and the same length",
                self.mean.len(),
                self.std.len()
            )));
        }
        if let Some(bad) = self.std.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(StreamingError::Config(format!("std entries must be positive, got {}", bad)));
        }
        Ok(())
    }

    /// Applies `(x - mean[c]) / std[c]` to every channel in place.
    pub fn normalize(&self, image: &mut Array4<f32>) -> Result<(), StreamingError> {
        let channels = image.dim().1;
        if channels != self.mean.len() {
            return Err(StreamingError::Geometry(format!(
                "image has {} channels but normalization has {}",
                channels,
                self.mean.len()
            )));
        }
        for (c, mut plane) in image.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[c], self.std[c]);
            plane.mapv_inplace(|v| (v - m) / s);
        }
        Ok(())
    }

    /// Rounds every element to the configured precision.
    pub fn cast(&self, image: &mut Array4<f32>) {
        if self.dtype != DType::F32 {
            let dtype = self.dtype;
            image.mapv_inplace(|v| dtype.round(v));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_default_is_imagenet_on_cpu() {
        let state = LifecycleState::default();
        assert_eq!(state.device, Device::Cpu);
        assert_eq!(state.dtype, DType::F32);
        assert_eq!(state.mean.len(), 3);
        assert!(state.validate().is_ok());
    }

    #[test]
    fn test_mismatched_lengths_are_rejected() {
        assert!(LifecycleState::new(vec![0.5], vec![0.1, 0.2]).is_err());
        assert!(LifecycleState::new(vec![0.5], vec![0.0]).is_err());
    }

    #[test]
    fn test_normalize_per_channel() {
        let state = LifecycleState::new(vec![1.0, 0.0], vec![2.0, 0.5]).unwrap();
        let mut image = Array4::from_elem((1, 2, 1, 1), 3.0);
        state.normalize(&mut image).unwrap();
        assert_abs_diff_eq!(image[[0, 0, 0, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(image[[0, 1, 0, 0]], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_normalize_channel_mismatch() {
        let state = LifecycleState::default();
        let mut image = Array4::zeros((1, 1, 2, 2));
        assert!(matches!(state.normalize(&mut image), Err(StreamingError::Geometry(_))));
    }
}
