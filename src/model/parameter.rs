use ndarray::{ArrayD, Dimension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::error::ModelError;

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a trainable tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(u64);

impl ParamId {
    fn next() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A trainable tensor together with its accumulated gradient.
///
/// The gradient stays `None` until something is accumulated into it, so a
/// parameter that was never reached by a backward pass is distinguishable from
/// one whose gradient happens to be zero.
pub struct Parameter {
    id: ParamId,
    name: String,
    value: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    requires_grad: bool,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter(id={},name={},shape={:?},requires_grad={},has_grad={})",
            self.id,
            self.name,
            self.value.shape(),
            self.requires_grad,
            self.grad.is_some()
        )
    }
}

impl Parameter {
    pub fn new<D: Dimension>(name: impl Into<String>, value: ndarray::Array<f32, D>) -> Self {
        Self {
            id: ParamId::next(),
            name: name.into(),
            value: value.into_dyn(),
            grad: None,
            requires_grad: true,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &ArrayD<f32> {
        &self.value
    }

    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref()
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.grad = None;
        }
    }

    /// Adds `update` into the gradient buffer. Frozen parameters ignore it.
    pub fn accumulate_grad<D: Dimension>(
        &mut self,
        update: ndarray::Array<f32, D>,
    ) -> Result<(), ModelError> {
        if !self.requires_grad {
            return Ok(());
        }
        if update.shape() != self.value.shape() {
            return Err(ModelError::DimensionMismatch(format!(
                "gradient for {} has shape {:?}, expected {:?}",
                self.name,
                update.shape(),
                self.value.shape()
            )));
        }
        let update = update.into_dyn();
        match self.grad.as_mut() {
            Some(existing) => *existing += &update,
            None => self.grad = Some(update),
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Takes the gradient and the value at the same time so an optimizer can
    /// update one from the other.
    pub fn value_and_grad_mut(&mut self) -> (&mut ArrayD<f32>, Option<&ArrayD<f32>>) {
        (&mut self.value, self.grad.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_ids_are_unique() {
        let a = Parameter::new("a", Array1::<f32>::zeros(2));
        let b = Parameter::new("b", Array1::<f32>::zeros(2));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_accumulate_sums_updates() {
        let mut p = Parameter::new("p", array![1.0f32, 2.0]);
        assert!(p.grad().is_none());
        p.accumulate_grad(array![0.5f32, 0.5]).unwrap();
        p.accumulate_grad(array![1.0f32, -1.0]).unwrap();
        let grad = p.grad().unwrap();
        assert_eq!(grad.as_slice().unwrap(), &[1.5, -0.5]);
    }

    #[test]
    fn test_frozen_parameter_ignores_gradient() {
        let mut p = Parameter::new("p", array![1.0f32, 2.0]);
        p.set_requires_grad(false);
        p.accumulate_grad(array![1.0f32, 1.0]).unwrap();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut p = Parameter::new("p", array![1.0f32, 2.0]);
        let err = p.accumulate_grad(array![1.0f32, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, ModelError::DimensionMismatch(_)));
    }
}
