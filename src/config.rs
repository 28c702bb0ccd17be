use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::TileStreamError;
use crate::model::ModelConfig;
use crate::streaming::StreamingConfig;
use crate::training::{OptimizerConfig, TrainerConfig};

/// Top-level configuration, one TOML table per section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, TileStreamError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TileStreamError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TileStreamError::ConfigNotFound(path.to_path_buf())
            } else {
                TileStreamError::Io(e)
            }
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks each section and the agreements between them.
    pub fn validate(&self) -> Result<(), TileStreamError> {
        self.streaming.validate()?;
        self.model.validate()?;
        self.optimizer.validate()?;
        self.trainer.validate()?;
        if self.streaming.normalize_on_device && self.streaming.mean.len() != self.model.in_channels {
            return Err(TileStreamError::Config(format!(
                "normalization has {} channels but the model expects {}",
                self.streaming.mean.len(),
                self.model.in_channels
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::OptimizerType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[streaming]
tile_size = 64
train_streaming_layers = false

[model]
in_channels = 1
num_classes = 3
stages = [
    { out_channels = 4, stride = 2 },
    { out_channels = 8, kernel_size = 5, batch_norm = true },
]

[optimizer]
kind = "sgd"
learning_rate = 0.01

[trainer]
epochs = 2
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.streaming.tile_size, 64);
        assert!(!config.streaming.train_streaming_layers);
        assert!(config.streaming.use_streaming);
        assert_eq!(config.model.stages[1].kernel_size, 5);
        assert_eq!(config.model.stages[0].kernel_size, 3);
        assert_eq!(config.optimizer.kind, OptimizerType::Sgd);
        assert_eq!(config.trainer.epochs, 2);
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.model.num_classes, 3);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, TileStreamError::ConfigNotFound(_)));
    }

    #[test]
    fn test_normalization_channels_must_match_model() {
        let text = "[streaming]\nnormalize_on_device = true\n[model]\nin_channels = 1\n";
        assert!(matches!(Config::from_toml_str(text), Err(TileStreamError::Config(_))));
    }
}
