use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::adam::AdamOptimizer;
use super::params::TrainableParameterSet;
use super::sgd::SgdOptimizer;
use crate::model::{ParamId, Parameter};

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimization failed: {0}")]
    Optimization(String),

    #[error("Invalid learning rate: {0}")]
    InvalidLearningRate(f32),
}

/// Trait for optimization algorithms
///
/// An optimizer is bound to a fixed set of parameter ids at construction.
/// `step` ignores any parameter outside that set and any parameter that has
/// no gradient yet.
pub trait Optimizer: Send {
    /// Performs a parameter update step
    fn step(&mut self, params: &mut [&mut Parameter]) -> Result<(), OptimizerError>;

    /// Returns the current learning rate
    fn learning_rate(&self) -> f32;

    /// Sets the learning rate
    fn set_learning_rate(&mut self, lr: f32);

    fn parameter_ids(&self) -> &[ParamId];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    #[default]
    Adam,
    Sgd,
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::Sgd => write!(f, "sgd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub kind: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

fn default_learning_rate() -> f32 { 1e-3 }

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerType::default(),
            learning_rate: default_learning_rate(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), OptimizerError> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(OptimizerError::InvalidLearningRate(self.learning_rate));
        }
        Ok(())
    }
}

pub fn build_optimizer(
    config: &OptimizerConfig,
    params: &TrainableParameterSet,
) -> Result<Box<dyn Optimizer>, OptimizerError> {
    config.validate()?;
    Ok(match config.kind {
        OptimizerType::Adam => Box::new(AdamOptimizer::new(config.learning_rate, params.ids())),
        OptimizerType::Sgd => Box::new(SgdOptimizer::new(config.learning_rate, params.ids())),
    })
}
