use ndarray::{Array4, Zip};

use super::Layer;
use crate::model::ModelError;

/// Rectified linear unit.
#[derive(Debug, Clone)]
pub struct ReLU {
    name: String,
}

impl ReLU {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Layer for ReLU {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn backward(
        &mut self,
        x: &Array4<f32>,
        grad_output: &Array4<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        if x.dim() != grad_output.dim() {
            return Err(ModelError::BackwardError(format!(
                "{}: gradient shape {:?} does not match input {:?}",
                self.name,
                grad_output.shape(),
                x.shape()
            )));
        }
        let mut grad_input = grad_output.clone();
        Zip::from(&mut grad_input).and(x).for_each(|g, &v| {
            if v <= 0.0 {
                *g = 0.0;
            }
        });
        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_relu_masks_negative_inputs() {
        let mut relu = ReLU::new("relu");
        let x = Array::from_shape_vec((1, 1, 1, 4), vec![-1.0, 0.0, 2.0, 3.0]).unwrap();
        let y = relu.forward(&x).unwrap();
        assert_eq!(y.as_slice().unwrap(), &[0.0, 0.0, 2.0, 3.0]);

        let g = relu.backward(&x, &Array4::ones((1, 1, 1, 4))).unwrap();
        assert_eq!(g.as_slice().unwrap(), &[0.0, 0.0, 1.0, 1.0]);
    }
}
