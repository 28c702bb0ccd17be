use ndarray::{s, Array1, Array4, Ix1, Ix4};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{Layer, LayerGeometry};
use crate::model::{ModelError, Parameter};

/// Unpadded 2D convolution over `[batch, channels, height, width]` input.
///
/// Having no padding means every output pixel depends only on input pixels
/// inside its receptive field, which is what makes tile-wise evaluation exact.
#[derive(Debug)]
pub struct Conv2d {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    stride: usize,
    weight: Parameter,
    bias: Parameter,
}

impl Conv2d {
    /// Builds a convolution with He-normal weights and zero bias.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if in_channels == 0 || out_channels == 0 || kernel_size == 0 || stride == 0 {
            return Err(ModelError::ConfigError(format!(
                "conv needs positive channels, kernel and stride (got {}→{}, k={}, s={})",
                in_channels, out_channels, kernel_size, stride
            )));
        }
        let fan_in = (in_channels * kernel_size * kernel_size) as f32;
        let normal = Normal::new(0.0, (2.0 / fan_in).sqrt())
            .map_err(|e| ModelError::InitializationError(e.to_string()))?;
        let weight = Array4::from_shape_fn(
            (out_channels, in_channels, kernel_size, kernel_size),
            |_| normal.sample(&mut *rng),
        );
        Self::from_weights(name, weight, Array1::zeros(out_channels), stride)
    }

    /// Builds a convolution from explicit `[out, in, k, k]` weights.
    pub fn from_weights(
        name: impl Into<String>,
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: usize,
    ) -> Result<Self, ModelError> {
        let (out_channels, in_channels, kh, kw) = weight.dim();
        if kh != kw {
            return Err(ModelError::ConfigError(format!(
                "only square kernels are supported, got {}x{}",
                kh, kw
            )));
        }
        if bias.len() != out_channels {
            return Err(ModelError::DimensionMismatch(format!(
                "bias has {} entries for {} output channels",
                bias.len(),
                out_channels
            )));
        }
        if stride == 0 {
            return Err(ModelError::ConfigError("stride must be positive".into()));
        }
        let name = name.into();
        Ok(Self {
            weight: Parameter::new(format!("{}.weight", name), weight),
            bias: Parameter::new(format!("{}.bias", name), bias),
            name,
            in_channels,
            out_channels,
            kernel_size: kh,
            stride,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn output_len(&self, len: usize) -> Result<usize, ModelError> {
        if len < self.kernel_size {
            return Err(ModelError::ForwardError(format!(
                "{}: spatial extent {} is smaller than kernel {}",
                self.name, len, self.kernel_size
            )));
        }
        Ok((len - self.kernel_size) / self.stride + 1)
    }

    fn check_input(&self, x: &Array4<f32>) -> Result<(usize, usize), ModelError> {
        let (_, channels, height, width) = x.dim();
        if channels != self.in_channels {
            return Err(ModelError::DimensionMismatch(format!(
                "{}: expected {} input channels, got {}",
                self.name, self.in_channels, channels
            )));
        }
        Ok((self.output_len(height)?, self.output_len(width)?))
    }
}

impl Layer for Conv2d {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let (out_h, out_w) = self.check_input(x)?;
        let batch = x.dim().0;
        let (k, st) = (self.kernel_size, self.stride);
        let weight = self.weight.value().view().into_dimensionality::<Ix4>().map_err(ModelError::shape)?;
        let bias = self.bias.value().view().into_dimensionality::<Ix1>().map_err(ModelError::shape)?;

        let mut output = Array4::zeros((batch, self.out_channels, out_h, out_w));
        for b in 0..batch {
            for oc in 0..self.out_channels {
                let kernel = weight.slice(s![oc, .., .., ..]);
                for y in 0..out_h {
                    for xx in 0..out_w {
                        let patch = x.slice(s![b, .., y * st..y * st + k, xx * st..xx * st + k]);
                        let acc: f32 = patch.iter().zip(kernel.iter()).map(|(a, w)| a * w).sum();
                        output[[b, oc, y, xx]] = acc + bias[oc];
                    }
                }
            }
        }
        Ok(output)
    }

    fn backward(
        &mut self,
        x: &Array4<f32>,
        grad_output: &Array4<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        let (out_h, out_w) = self.check_input(x)?;
        let batch = x.dim().0;
        if grad_output.dim() != (batch, self.out_channels, out_h, out_w) {
            return Err(ModelError::BackwardError(format!(
                "{}: gradient shape {:?} does not match output ({}, {}, {}, {})",
                self.name,
                grad_output.shape(),
                batch,
                self.out_channels,
                out_h,
                out_w
            )));
        }
        let (k, st) = (self.kernel_size, self.stride);

        let mut grad_input = Array4::zeros(x.dim());
        let mut grad_weight = Array4::<f32>::zeros((self.out_channels, self.in_channels, k, k));
        let mut grad_bias = Array1::<f32>::zeros(self.out_channels);
        {
            let weight = self.weight.value().view().into_dimensionality::<Ix4>().map_err(ModelError::shape)?;
            for b in 0..batch {
                for oc in 0..self.out_channels {
                    let kernel = weight.slice(s![oc, .., .., ..]);
                    for y in 0..out_h {
                        for xx in 0..out_w {
                            let g = grad_output[[b, oc, y, xx]];
                            if g == 0.0 {
                                continue;
                            }
                            grad_bias[oc] += g;
                            let rows = y * st..y * st + k;
                            let cols = xx * st..xx * st + k;
                            let patch = x.slice(s![b, .., rows.clone(), cols.clone()]);
                            grad_weight.slice_mut(s![oc, .., .., ..]).scaled_add(g, &patch);
                            grad_input.slice_mut(s![b, .., rows, cols]).scaled_add(g, &kernel);
                        }
                    }
                }
            }
        }
        self.weight.accumulate_grad(grad_weight)?;
        self.bias.accumulate_grad(grad_bias)?;
        Ok(grad_input)
    }

    fn geometry(&self) -> LayerGeometry {
        LayerGeometry {
            kernel_size: self.kernel_size,
            stride: self.stride,
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}
