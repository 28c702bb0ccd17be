use thiserror::Error;

use crate::model::ModelError;

#[derive(Error, Debug)]
pub enum StreamingError {
    #[error("Invalid streaming configuration: {0}")]
    Config(String),

    #[error("Streaming engine is disabled; tiled backward is unavailable")]
    NotEnabled,

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("No gradient was deposited for step {0}")]
    MissingGradient(u64),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),
}
