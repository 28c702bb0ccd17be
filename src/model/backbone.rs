use ndarray::Array4;

use super::layers::Layer;
use super::{ModelError, Parameter};

/// Receptive field and cumulative stride of a layer stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceptiveField {
    /// Input pixels that influence one output pixel, per axis.
    pub size: usize,
    /// Cumulative stride after each layer; the last entry is the total.
    pub output_stride: Vec<usize>,
}

impl ReceptiveField {
    pub fn total_stride(&self) -> usize {
        self.output_stride.last().copied().unwrap_or(1)
    }
}

/// The streaming-eligible part of the model: an ordered stack of layers.
///
/// The layer list is fixed at construction; afterwards only train/eval
/// flags and parameter values change.
pub struct Backbone {
    layers: Vec<Box<dyn Layer>>,
}

impl std::fmt::Debug for Backbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.layers.iter().map(|l| l.name())).finish()
    }
}

impl Backbone {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self, ModelError> {
        if layers.is_empty() {
            return Err(ModelError::ConfigError("backbone needs at least one layer".into()));
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn receptive_field(&self) -> ReceptiveField {
        let mut size = 1;
        let mut jump = 1;
        let mut output_stride = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let geometry = layer.geometry();
            size += (geometry.kernel_size - 1) * jump;
            jump *= geometry.stride;
            output_stride.push(jump);
        }
        ReceptiveField { size, output_stride }
    }

    /// Dense forward over the whole input. Layers in training mode also fold
    /// the input into their running statistics.
    pub fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        let mut hidden = x.clone();
        for layer in self.layers.iter_mut() {
            layer.update_statistics(&hidden)?;
            hidden = layer.forward(&hidden)?;
        }
        Ok(hidden)
    }

    /// Replays the forward pass without touching running statistics, then
    /// backpropagates `grad_output`. Returns the gradient w.r.t. `x`.
    pub fn backward(
        &mut self,
        x: &Array4<f32>,
        grad_output: &Array4<f32>,
    ) -> Result<Array4<f32>, ModelError> {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut hidden = x.clone();
        for layer in &self.layers {
            let next = layer.forward(&hidden)?;
            inputs.push(hidden);
            hidden = next;
        }
        if hidden.dim() != grad_output.dim() {
            return Err(ModelError::BackwardError(format!(
                "backbone output {:?} does not match gradient {:?}",
                hidden.shape(),
                grad_output.shape()
            )));
        }

        let mut grad = grad_output.clone();
        for (layer, input) in self.layers.iter_mut().zip(inputs.iter()).rev() {
            grad = layer.backward(input, &grad)?;
        }
        Ok(grad)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }

    pub fn requires_grad(&self) -> bool {
        self.parameters().iter().any(|p| p.requires_grad())
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    pub fn normalization_layers_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Layer>> {
        self.layers.iter_mut().filter(|l| l.is_normalization())
    }
}
