use ndarray::Array4;
use std::sync::{Arc, Weak};

use super::StreamingError;

/// Backbone output handed to the head for one step.
///
/// Not `Clone`: the training module holds the only strong
/// reference, so dropping it releases the activations. Tests observe that
/// through [`FeatureMap::downgrade`].
#[derive(Debug)]
pub struct FeatureMap {
    value: Arc<Array4<f32>>,
    requires_grad: bool,
}

impl FeatureMap {
    pub fn new(value: Array4<f32>) -> Self {
        Self {
            value: Arc::new(value),
            requires_grad: false,
        }
    }

    pub fn value(&self) -> &Array4<f32> {
        &self.value
    }

    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.value.dim()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    pub fn downgrade(&self) -> Weak<Array4<f32>> {
        Arc::downgrade(&self.value)
    }
}

/// Everything needed to resume the backbone's backward pass for one step:
/// a shared handle to the input image and, once the head has run, the
/// gradient at the feature map.
#[derive(Debug)]
pub struct GradientSink {
    step: u64,
    image: Arc<Array4<f32>>,
    output_dim: (usize, usize, usize, usize),
    gradient: Option<Array4<f32>>,
}

impl GradientSink {
    pub fn new(step: u64, image: Arc<Array4<f32>>, output_dim: (usize, usize, usize, usize)) -> Self {
        Self {
            step,
            image,
            output_dim,
            gradient: None,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn image(&self) -> &Array4<f32> {
        &self.image
    }

    pub fn gradient(&self) -> Option<&Array4<f32>> {
        self.gradient.as_ref()
    }

    /// Stores the gradient at the feature map, adding to any earlier deposit.
    pub fn deposit(&mut self, gradient: Array4<f32>) -> Result<(), StreamingError> {
        if gradient.dim() != self.output_dim {
            return Err(StreamingError::Geometry(format!(
                "gradient {:?} does not match feature map {:?}",
                gradient.shape(),
                self.output_dim
            )));
        }
        match self.gradient.as_mut() {
            Some(existing) => *existing += &gradient,
            None => self.gradient = Some(gradient),
        }
        Ok(())
    }

    /// Splits the sink into its image and the deposited gradient.
    pub fn into_parts(self) -> Result<(Arc<Array4<f32>>, Array4<f32>), StreamingError> {
        match self.gradient {
            Some(gradient) => Ok((self.image, gradient)),
            None => Err(StreamingError::MissingGradient(self.step)),
        }
    }
}

/// Split-backward contract between the training loop and the backbone.
///
/// `capture_output` runs the backbone and detaches its result; the caller
/// fills the returned sink with the feature-map gradient and hands it back to
/// `apply_gradient`, which recomputes the backbone and accumulates parameter
/// gradients.
pub trait Checkpoint {
    fn capture_output(
        &mut self,
        step: u64,
        image: Arc<Array4<f32>>,
    ) -> Result<(FeatureMap, GradientSink), StreamingError>;

    fn apply_gradient(&mut self, sink: GradientSink) -> Result<(), StreamingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_map_release_is_observable() {
        let fmap = FeatureMap::new(Array4::zeros((1, 2, 3, 3)));
        let probe = fmap.downgrade();
        assert!(probe.upgrade().is_some());
        drop(fmap);
        assert!(probe.upgrade().is_none());
    }

    #[test]
    fn test_deposit_accumulates() {
        let mut sink = GradientSink::new(3, Arc::new(Array4::zeros((1, 1, 4, 4))), (1, 2, 2, 2));
        sink.deposit(Array4::ones((1, 2, 2, 2))).unwrap();
        sink.deposit(Array4::ones((1, 2, 2, 2))).unwrap();
        assert_eq!(sink.gradient().unwrap()[[0, 1, 1, 1]], 2.0);
    }

    #[test]
    fn test_deposit_rejects_wrong_shape() {
        let mut sink = GradientSink::new(0, Arc::new(Array4::zeros((1, 1, 4, 4))), (1, 2, 2, 2));
        assert!(sink.deposit(Array4::ones((1, 2, 3, 2))).is_err());
    }

    #[test]
    fn test_empty_sink_reports_its_step() {
        let sink = GradientSink::new(7, Arc::new(Array4::zeros((1, 1, 4, 4))), (1, 2, 2, 2));
        assert!(matches!(sink.into_parts(), Err(StreamingError::MissingGradient(7))));
    }
}
