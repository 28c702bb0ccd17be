use ndarray::ArrayD;
use std::collections::HashMap;

use super::optimizer::{Optimizer, OptimizerError};
use crate::model::{ParamId, Parameter};

#[derive(Debug)]
struct Moments {
    m: ArrayD<f32>, // First moment estimate
    v: ArrayD<f32>, // Second moment estimate
}

/// Adam optimizer implementation
#[derive(Debug)]
pub struct AdamOptimizer {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: usize,
    params: Vec<ParamId>,
    state: HashMap<ParamId, Moments>,
}

impl AdamOptimizer {
    pub fn new(learning_rate: f32, params: Vec<ParamId>) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            step: 0,
            params,
            state: HashMap::new(),
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<(), OptimizerError> {
        self.step += 1;
        let t = self.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);

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

            let moments = self.state.entry(id).or_insert_with(|| Moments {
                m: ArrayD::zeros(value.raw_dim()),
                v: ArrayD::zeros(value.raw_dim()),
            });
            moments.m.zip_mut_with(grad, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            moments.v.zip_mut_with(grad, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            ndarray::Zip::from(value)
                .and(&moments.m)
                .and(&moments.v)
                .for_each(|w, &m, &v| {
                    let m_hat = m / bias1;
                    let v_hat = v / bias2;
                    *w -= lr * m_hat / (v_hat.sqrt() + eps);
                });
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
