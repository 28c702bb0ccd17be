use ndarray::{Array2, Array4, Axis};

use crate::model::ModelError;

/// Averages every channel over its spatial extent.
#[derive(Debug, Clone, Default)]
pub struct GlobalAvgPool;

impl GlobalAvgPool {
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
        let (batch, channels, height, width) = x.dim();
        if height == 0 || width == 0 {
            return Err(ModelError::ForwardError("cannot pool an empty feature map".into()));
        }
        let summed = x.sum_axis(Axis(3)).sum_axis(Axis(2));
        debug_assert_eq!(summed.dim(), (batch, channels));
        Ok(summed / (height * width) as f32)
    }

    /// Spreads `grad_output` evenly back over the pooled window.
    pub fn backward(
        &self,
        input_dim: (usize, usize, usize, usize),
        grad_output: &Array2<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        let (batch, channels, height, width) = input_dim;
        if grad_output.dim() != (batch, channels) {
            return Err(ModelError::BackwardError(format!(
                "pool gradient shape {:?} does not match ({}, {})",
                grad_output.shape(),
                batch,
                channels
            )));
        }
        let scale = 1.0 / (height * width) as f32;
        Ok(Array4::from_shape_fn(input_dim, |(b, c, _, _)| grad_output[[b, c]] * scale))
    }
}
