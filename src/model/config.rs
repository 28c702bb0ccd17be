use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::backbone::Backbone;
use super::error::ModelError;
use super::head::ClassifierHead;
use super::layers::{BatchNorm2d, Conv2d, Layer, ReLU};

/// One convolution stage of the backbone: conv, optional batch norm, ReLU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub out_channels: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub batch_norm: bool,
}

/// Configuration for the backbone/head pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Seed for weight initialization
    #[serde(default)]
    pub seed: u64,
}

// Default values for optional fields
fn default_kernel_size() -> usize { 3 }
fn default_stride() -> usize { 1 }
fn default_in_channels() -> usize { 3 }
fn default_num_classes() -> usize { 2 }
fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig { out_channels: 8, kernel_size: 3, stride: 2, batch_norm: true },
        StageConfig { out_channels: 16, kernel_size: 3, stride: 2, batch_norm: true },
    ]
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            stages: default_stages(),
            num_classes: default_num_classes(),
            seed: 0,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.in_channels == 0 || self.num_classes == 0 {
            return Err(ModelError::ConfigError(
                "in_channels and num_classes must be positive".into(),
            ));
        }
        if self.stages.is_empty() {
            return Err(ModelError::ConfigError("at least one stage is required".into()));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.out_channels == 0 || stage.kernel_size == 0 || stage.stride == 0 {
                return Err(ModelError::ConfigError(format!(
                    "stage {} needs positive out_channels, kernel_size and stride",
                    i
                )));
            }
        }
        Ok(())
    }

    /// Channel count of the backbone's output feature map.
    pub fn feature_channels(&self) -> usize {
        self.stages.last().map_or(self.in_channels, |s| s.out_channels)
    }

    /// Builds a freshly initialized backbone and classifier head.
    pub fn build(&self) -> Result<(Backbone, ClassifierHead), ModelError> {
        self.validate()?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut layers: Vec<Box<dyn Layer>> = Vec::new();
        let mut channels = self.in_channels;
        for (i, stage) in self.stages.iter().enumerate() {
            layers.push(Box::new(Conv2d::new(
                format!("stage{}.conv", i),
                channels,
                stage.out_channels,
                stage.kernel_size,
                stage.stride,
                &mut rng,
            )?));
            if stage.batch_norm {
                layers.push(Box::new(BatchNorm2d::new(format!("stage{}.bn", i), stage.out_channels)?));
            }
            layers.push(Box::new(ReLU::new(format!("stage{}.relu", i))));
            channels = stage.out_channels;
        }

        let backbone = Backbone::new(layers)?;
        let head = ClassifierHead::new(channels, self.num_classes, &mut rng)?;
        Ok((backbone, head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HeadNetwork;

    #[test]
    fn test_default_builds() {
        let config = ModelConfig::default();
        let (backbone, head) = config.build().unwrap();
        // conv + bn + relu per stage
        assert_eq!(backbone.layers().len(), 6);
        assert_eq!(backbone.receptive_field().total_stride(), 4);
        assert_eq!(head.parameters().len(), 2);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let config = ModelConfig { seed: 42, ..ModelConfig::default() };
        let (a, _) = config.build().unwrap();
        let (b, _) = config.build().unwrap();
        let first = |net: &Backbone| net.parameters()[0].value().clone();
        assert_eq!(first(&a), first(&b));
    }

    #[test]
    fn test_zero_stride_is_rejected() {
        let mut config = ModelConfig::default();
        config.stages[0].stride = 0;
        assert!(matches!(config.validate(), Err(ModelError::ConfigError(_))));
    }
}
