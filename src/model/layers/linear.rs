use super::super::error::ModelError;
use crate::model::Parameter;
use ndarray::{Array1, Array2, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// A linear (fully-connected) layer over `[batch, features]` input.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(
        name: &str,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let normal = Normal::new(0.0, 0.02).map_err(|e| {
            ModelError::InitializationError(e.to_string())
        })?;

        Ok(Self::from_weights(
            name,
            Array2::from_shape_fn((input_dim, output_dim), |_| normal.sample(&mut *rng)),
            Array1::zeros(output_dim),
        ))
    }

    pub fn from_weights(name: &str, weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self {
            weight: Parameter::new(format!("{}.weight", name), weight),
            bias: Parameter::new(format!("{}.bias", name), bias),
        }
    }

    fn weight(&self) -> Result<ndarray::ArrayView2<'_, f32>, ModelError> {
        self.weight.value().view().into_dimensionality::<Ix2>().map_err(ModelError::shape)
    }

    /// Forward pass: `y = x · W + b`
    pub fn forward(&self, x: &Array2<f32>) -> Result<Array2<f32>, ModelError> {
        let weight = self.weight()?;
        if x.ncols() != weight.nrows() {
            return Err(ModelError::DimensionMismatch(format!(
                "linear expects {} features, got {}",
                weight.nrows(),
                x.ncols()
            )));
        }
        let bias = self.bias.value().view().into_dimensionality::<Ix1>().map_err(ModelError::shape)?;
        Ok(x.dot(&weight) + &bias)
    }

    /// Accumulates `dW = xᵀ·g`, `db = Σ g` and returns `g·Wᵀ`.
    pub fn backward(&mut self, x: &Array2<f32>, grad_output: &Array2<f32>) -> Result<Array2<f32>, ModelError> {
        let grad_input = {
            let weight = self.weight()?;
            if grad_output.dim() != (x.nrows(), weight.ncols()) {
                return Err(ModelError::BackwardError(format!(
                    "linear gradient shape {:?} does not match ({}, {})",
                    grad_output.shape(),
                    x.nrows(),
                    weight.ncols()
                )));
            }
            grad_output.dot(&weight.t())
        };
        self.weight.accumulate_grad(x.t().dot(grad_output))?;
        self.bias.accumulate_grad(grad_output.sum_axis(Axis(0)))?;
        Ok(grad_input)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_linear_initialization() {
        let mut rng = StdRng::seed_from_u64(3);
        let linear = Linear::new("fc", 4, 3, &mut rng).unwrap();

        assert_eq!(linear.weight.value().shape(), &[4, 3]);
        assert_eq!(linear.bias.value().shape(), &[3]);
    }

    #[test]
    fn test_forward_computation_known_weights() {
        let weight = array![[1.0, 2.0], [0.0, 1.0], [-1.0, 0.0]];
        let bias = array![0.5, -0.5];
        let linear = Linear::from_weights("fc", weight, bias);

        let input = array![[2.0f32, 3.0, 4.0]];
        let output = linear.forward(&input).unwrap();

        // [2, 3, 4] · W + b = [-1.5, 6.5]
        let expected = array![[-1.5f32, 6.5]];
        for (o, e) in output.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-5, "got {}, expected {}", o, e);
        }
    }

    #[test]
    fn test_backward_gradients() {
        let weight = array![[1.0, 2.0], [0.0, 1.0]];
        let mut linear = Linear::from_weights("fc", weight, array![0.0, 0.0]);
        let input = array![[1.0f32, 2.0], [3.0, 4.0]];
        let grad_out = array![[1.0f32, 0.0], [0.0, 1.0]];

        let grad_in = linear.backward(&input, &grad_out).unwrap();
        assert_eq!(grad_in, array![[1.0f32, 0.0], [2.0, 1.0]]);

        let grad_w = linear.weight.grad().unwrap();
        assert_eq!(grad_w.as_slice().unwrap(), &[1.0, 3.0, 2.0, 4.0]);
        let grad_b = linear.bias.grad().unwrap();
        assert_eq!(grad_b.as_slice().unwrap(), &[1.0, 1.0]);
    }
}
