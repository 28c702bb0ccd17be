use std::path::PathBuf;
use thiserror::Error;

use crate::model::ModelError;
use crate::streaming::StreamingError;
use crate::training::{OptimizerError, TrainingError};

#[derive(Error, Debug)]
pub enum TileStreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),
}
