use ndarray::{Array1, Array4, Axis, Ix1, Zip};

use super::Layer;
use crate::model::{ModelError, Parameter};

/// Batch normalization over the `[batch, height, width]` axes of each channel.
///
/// In training mode the layer normalizes with statistics of the current input
/// and folds them into running estimates. Once frozen (eval mode) it applies
/// the running estimates as a fixed per-channel affine map, which is the only
/// form that stays valid when the input is a single tile of a larger image.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    eps: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    training: bool,
}

impl BatchNorm2d {
    pub fn new(name: impl Into<String>, channels: usize) -> Result<Self, ModelError> {
        if channels == 0 {
            return Err(ModelError::ConfigError("batch norm needs at least one channel".into()));
        }
        let name = name.into();
        Ok(Self {
            gamma: Parameter::new(format!("{}.gamma", name), Array1::<f32>::ones(channels)),
            beta: Parameter::new(format!("{}.beta", name), Array1::<f32>::zeros(channels)),
            name,
            channels,
            eps: 1e-5,
            momentum: 0.1,
            running_mean: Array1::zeros(channels),
            running_var: Array1::ones(channels),
            training: true,
        })
    }

    pub fn running_mean(&self) -> &Array1<f32> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<f32> {
        &self.running_var
    }

    pub fn set_running_stats(&mut self, mean: Array1<f32>, var: Array1<f32>) -> Result<(), ModelError> {
        if mean.len() != self.channels || var.len() != self.channels {
            return Err(ModelError::DimensionMismatch(format!(
                "{}: running stats must have {} entries",
                self.name, self.channels
            )));
        }
        self.running_mean = mean;
        self.running_var = var;
        Ok(())
    }

    fn check_input(&self, x: &Array4<f32>) -> Result<(), ModelError> {
        if x.dim().1 != self.channels {
            return Err(ModelError::DimensionMismatch(format!(
                "{}: expected {} channels, got {}",
                self.name,
                self.channels,
                x.dim().1
            )));
        }
        Ok(())
    }

    /// Per-channel mean and biased variance of `x`.
    fn batch_stats(x: &Array4<f32>) -> (Array1<f32>, Array1<f32>) {
        let channels = x.dim().1;
        let mut mean = Array1::zeros(channels);
        let mut var = Array1::zeros(channels);
        for (c, plane) in x.axis_iter(Axis(1)).enumerate() {
            let m = plane.mean().unwrap_or(0.0);
            mean[c] = m;
            var[c] = plane.mapv(|v| (v - m) * (v - m)).mean().unwrap_or(0.0);
        }
        (mean, var)
    }

    fn stats_for(&self, x: &Array4<f32>) -> (Array1<f32>, Array1<f32>) {
        if self.training {
            Self::batch_stats(x)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        }
    }

    fn affine(&self) -> Result<(Array1<f32>, Array1<f32>), ModelError> {
        let gamma = self.gamma.value().view().into_dimensionality::<Ix1>().map_err(ModelError::shape)?;
        let beta = self.beta.value().view().into_dimensionality::<Ix1>().map_err(ModelError::shape)?;
        Ok((gamma.to_owned(), beta.to_owned()))
    }
}

impl Layer for BatchNorm2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        self.check_input(x)?;
        let (mean, var) = self.stats_for(x);
        let (gamma, beta) = self.affine()?;

        let mut output = x.clone();
        for (c, mut plane) in output.axis_iter_mut(Axis(1)).enumerate() {
            let inv_std = 1.0 / (var[c] + self.eps).sqrt();
            let (m, g, b) = (mean[c], gamma[c], beta[c]);
            plane.mapv_inplace(|v| (v - m) * inv_std * g + b);
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        x: &Array4<f32>,
        grad_output: &Array4<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        self.check_input(x)?;
        if grad_output.dim() != x.dim() {
            return Err(ModelError::BackwardError(format!(
                "{}: gradient shape {:?} does not match input {:?}",
                self.name,
                grad_output.shape(),
                x.shape()
            )));
        }
        let (mean, var) = self.stats_for(x);
        let (gamma, _) = self.affine()?;

        let mut grad_input = Array4::zeros(x.dim());
        let mut grad_gamma = Array1::<f32>::zeros(self.channels);
        let mut grad_beta = Array1::<f32>::zeros(self.channels);

        for c in 0..self.channels {
            let x_c = x.index_axis(Axis(1), c);
            let g_c = grad_output.index_axis(Axis(1), c);
            let inv_std = 1.0 / (var[c] + self.eps).sqrt();
            let x_hat = x_c.mapv(|v| (v - mean[c]) * inv_std);

            let sum_g = g_c.sum();
            let sum_g_xhat = Zip::from(&g_c).and(&x_hat).fold(0.0f32, |acc, &g, &h| acc + g * h);
            grad_gamma[c] = sum_g_xhat;
            grad_beta[c] = sum_g;

            let mut dx = grad_input.index_axis_mut(Axis(1), c);
            if self.training {
                // batch statistics depend on every element of the channel
                let m = x_c.len() as f32;
                let scale = gamma[c] * inv_std / m;
                Zip::from(&mut dx).and(&g_c).and(&x_hat).for_each(|d, &g, &h| {
                    *d = scale * (m * g - sum_g - h * sum_g_xhat);
                });
            } else {
                let scale = gamma[c] * inv_std;
                Zip::from(&mut dx).and(&g_c).for_each(|d, &g| *d = scale * g);
            }
        }

        self.gamma.accumulate_grad(grad_gamma)?;
        self.beta.accumulate_grad(grad_beta)?;
        Ok(grad_input)
    }

    fn update_statistics(&mut self, x: &Array4<f32>) -> Result<(), ModelError> {
        if !self.training {
            return Ok(());
        }
        self.check_input(x)?;
        let (mean, var) = Self::batch_stats(x);
        let count = (x.len() / self.channels) as f32;
        let unbiased = if count > 1.0 {
            var.mapv(|v| v * count / (count - 1.0))
        } else {
            var
        };
        let m = self.momentum;
        self.running_mean = &self.running_mean * (1.0 - m) + &mean * m;
        self.running_var = &self.running_var * (1.0 - m) + &unbiased * m;
        Ok(())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.gamma, &mut self.beta]
    }

    fn is_normalization(&self) -> bool {
        true
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}
