use ndarray::{Array2, Array4};
use rand::Rng;

use super::layers::{GlobalAvgPool, Linear};
use super::{ModelError, Parameter};

/// The non-streamed trainable tail of the model.
///
/// The head keeps an ordinary dense graph: `backward` receives the same
/// feature map that went into `forward` and returns the gradient at that
/// feature map, which is where the backbone's own backward picks up.
pub trait HeadNetwork: Send {
    fn forward(&self, feature_map: &Array4<f32>) -> Result<Array2<f32>, ModelError>;

    fn backward(
        &mut self,
        feature_map: &Array4<f32>,
        grad_output: &Array2<f32>,
    ) -> Result<Array4<f32>, ModelError>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;
}

/// Global average pooling followed by a linear classifier.
#[derive(Debug)]
pub struct ClassifierHead {
    pool: GlobalAvgPool,
    fc: Linear,
}

impl ClassifierHead {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if in_channels == 0 || num_classes == 0 {
            return Err(ModelError::ConfigError(format!(
                "classifier head needs positive sizes, got {} -> {}",
                in_channels, num_classes
            )));
        }
        Ok(Self::from_linear(Linear::new("head.fc", in_channels, num_classes, rng)?))
    }

    pub fn from_linear(fc: Linear) -> Self {
        Self { pool: GlobalAvgPool, fc }
    }
}

impl HeadNetwork for ClassifierHead {
    fn forward(&self, feature_map: &Array4<f32>) -> Result<Array2<f32>, ModelError> {
        let pooled = self.pool.forward(feature_map)?;
        self.fc.forward(&pooled)
    }

    fn backward(
        &mut self,
        feature_map: &Array4<f32>,
        grad_output: &Array2<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        let pooled = self.pool.forward(feature_map)?;
        let grad_pooled = self.fc.backward(&pooled, grad_output)?;
        self.pool.backward(feature_map.dim(), &grad_pooled)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.fc.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.fc.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_head_forward_and_backward() {
        let fc = Linear::from_weights("fc", array![[1.0, -1.0], [2.0, 0.0]], array![0.0, 1.0]);
        let mut head = ClassifierHead::from_linear(fc);
        let fmap = Array4::from_shape_fn((1, 2, 2, 2), |(_, c, _, _)| (c + 1) as f32);

        let logits = head.forward(&fmap).unwrap();
        // pooled = [1, 2]
        assert_eq!(logits, array![[5.0f32, 0.0]]);

        let grad = head.backward(&fmap, &array![[1.0f32, 0.0]]).unwrap();
        assert_eq!(grad.dim(), fmap.dim());
        // d pooled = [1, 2], spread over 4 pixels
        assert_abs_diff_eq!(grad[[0, 0, 1, 1]], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[[0, 1, 0, 0]], 0.5, epsilon = 1e-6);
        assert!(head.parameters().iter().all(|p| p.grad().is_some()));
    }
}
