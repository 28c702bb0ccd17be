use thiserror::Error;

use super::optimizer::OptimizerError;
use crate::model::ModelError;
use crate::streaming::StreamingError;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Invalid training configuration: {0}")]
    Config(String),

    #[error("Out-of-order training call: {0}")]
    Sequencing(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
}
