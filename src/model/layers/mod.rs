//! Neural network layers

mod activation;
mod conv;
mod linear;
mod norm;
mod pool;

pub use activation::ReLU;
pub use conv::Conv2d;
pub use linear::Linear;
pub use norm::BatchNorm2d;
pub use pool::GlobalAvgPool;

use ndarray::Array4;

use super::{ModelError, Parameter};

/// Spatial footprint of a layer, used to derive receptive field and stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerGeometry {
    pub kernel_size: usize,
    pub stride: usize,
}

impl LayerGeometry {
    pub const POINTWISE: LayerGeometry = LayerGeometry {
        kernel_size: 1,
        stride: 1,
    };
}

/// A backbone layer mapping `[batch, channels, height, width]` to the same rank.
///
/// `backward` recomputes whatever it needs from the layer input instead of
/// relying on state cached by `forward`, so the same layer can be replayed
/// tile by tile.
pub trait Layer: Send {
    fn name(&self) -> &str;

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError>;

    /// Accumulates parameter gradients and returns the gradient w.r.t. `x`.
    fn backward(
        &mut self,
        x: &Array4<f32>,
        grad_output: &Array4<f32>,
    ) -> Result<Array4<f32>, ModelError>;

    /// Folds `x` into any running statistics the layer keeps.
    fn update_statistics(&mut self, _x: &Array4<f32>) -> Result<(), ModelError> {
        Ok(())
    }

    fn geometry(&self) -> LayerGeometry {
        LayerGeometry::POINTWISE
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn is_normalization(&self) -> bool {
        false
    }

    fn set_training(&mut self, _training: bool) {}

    fn is_training(&self) -> bool {
        false
    }
}
