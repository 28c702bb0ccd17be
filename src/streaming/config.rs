use serde::{Deserialize, Serialize};

use super::engine::EngineOptions;
use super::lifecycle::{imagenet_mean, imagenet_std};
use super::{LifecycleState, StreamingError, StreamingMode};

/// Configuration for the streaming adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Side length of one square input tile, in pixels
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,
    #[serde(default = "default_true")]
    pub use_streaming: bool,
    /// Whether backbone parameters receive gradients
    #[serde(default = "default_true")]
    pub train_streaming_layers: bool,
    #[serde(default = "imagenet_mean")]
    pub mean: Vec<f32>,
    #[serde(default = "imagenet_std")]
    pub std: Vec<f32>,
    #[serde(default)]
    pub normalize_on_device: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_tile_size() -> usize { 512 }
fn default_true() -> bool { true }

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            tile_size: default_tile_size(),
            use_streaming: true,
            train_streaming_layers: true,
            mean: imagenet_mean(),
            std: imagenet_std(),
            normalize_on_device: false,
            verbose: false,
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), StreamingError> {
        if self.tile_size == 0 {
            return Err(StreamingError::Config("tile_size must be positive".into()));
        }
        self.lifecycle().validate()
    }

    pub fn mode(&self) -> StreamingMode {
        StreamingMode::from_flag(self.use_streaming)
    }

    /// Initial lifecycle state: host placement, full precision.
    pub fn lifecycle(&self) -> LifecycleState {
        LifecycleState {
            mean: self.mean.clone(),
            std: self.std.clone(),
            ..LifecycleState::default()
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            normalize_on_device: self.normalize_on_device,
            verbose: self.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_table() {
        let config: StreamingConfig = toml::from_str("").unwrap();
        assert_eq!(config, StreamingConfig::default());
        assert_eq!(config.mode(), StreamingMode::Enabled);
    }

    #[test]
    fn test_zero_tile_is_rejected() {
        let config = StreamingConfig { tile_size: 0, ..StreamingConfig::default() };
        assert!(matches!(config.validate(), Err(StreamingError::Config(_))));
    }

    #[test]
    fn test_lifecycle_carries_normalization() {
        let config = StreamingConfig { mean: vec![0.5], std: vec![0.25], ..StreamingConfig::default() };
        let state = config.lifecycle();
        assert_eq!(state.mean, vec![0.5]);
        assert_eq!(state.std, vec![0.25]);
    }
}
