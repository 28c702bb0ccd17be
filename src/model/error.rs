use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Forward pass error: {0}")]
    ForwardError(String),

    #[error("Backward pass error: {0}")]
    BackwardError(String),
}

impl ModelError {
    pub fn shape<E: std::fmt::Display>(error: E) -> Self {
        ModelError::DimensionMismatch(error.to_string())
    }
}
