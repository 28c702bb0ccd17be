use super::optimizer::{Optimizer, OptimizerError};
use crate::model::{ParamId, Parameter};

/// Plain stochastic gradient descent: `w -= lr * g`.
#[derive(Debug)]
pub struct SgdOptimizer {
    learning_rate: f32,
    params: Vec<ParamId>,
}

impl SgdOptimizer {
    pub fn new(learning_rate: f32, params: Vec<ParamId>) -> Self {
        Self { learning_rate, params }
    }
}

impl Optimizer for SgdOptimizer {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<(), OptimizerError> {
        let lr = self.learning_rate;
        for param in params.iter_mut() {
            let id = param.id();
            if !self.params.contains(&id) {
                continue;
            }
            let (value, grad) = param.value_and_grad_mut();
            let Some(grad) = grad else { continue };
            if grad.shape() != value.shape() {
                return Err(OptimizerError::Optimization(format!(
                    "gradient shape {:?} does not match parameter {} {:?}",
                    grad.shape(),
                    id,
                    value.shape()
                )));
            }
            value.scaled_add(-lr, grad);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }

    fn parameter_ids(&self) -> &[ParamId] {
        &self.params
    }
}
