use serde::{Deserialize, Serialize};
use tracing::info;

use super::dataset::ImageDataset;
use super::metrics::EpochSummary;
use super::module::TrainingModule;
use super::TrainingError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrainerConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Emit a loss line every n training steps; 0 disables per-step logging
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

fn default_epochs() -> usize { 1 }
fn default_batch_size() -> usize { 4 }
fn default_log_every_n_steps() -> usize { 10 }

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(TrainingError::Config("epochs and batch_size must be positive".into()));
        }
        Ok(())
    }
}

/// Drives a [`TrainingModule`] through its phase hooks, epochs and steps.
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Main training loop
    ///
    /// Each epoch puts the module in training mode, fires the epoch hook
    /// (which re-freezes normalization layers), then runs step, backward and
    /// optimizer update per batch. Validation, when given, runs in eval mode
    /// after every epoch.
    pub fn fit(
        &self,
        module: &mut TrainingModule,
        train: &ImageDataset,
        validation: Option<&ImageDataset>,
    ) -> Result<Vec<EpochSummary>, TrainingError> {
        if train.is_empty() {
            return Err(TrainingError::Dataset("training set is empty".into()));
        }
        module.on_train_phase_start()?;
        let mut optimizer = module.configure_optimizer()?;
        let mut summaries = Vec::with_capacity(self.config.epochs);

        for epoch in 0..self.config.epochs {
            module.set_training(true);
            module.on_train_epoch_start(epoch);

            for batch in train.batch_iter(self.config.batch_size) {
                module.zero_grad();
                let loss = module.training_step(&batch)?;
                module.custom_backward(loss)?;
                module.optimizer_step(optimizer.as_mut())?;
            }

            if let Some(validation) = validation {
                module.set_training(false);
                module.on_validation_phase_start()?;
                for batch in validation.batch_iter(self.config.batch_size) {
                    module.validation_step(&batch)?;
                }
                // back to the train lifecycle for the next epoch
                module.on_train_phase_start()?;
            }

            summaries.push(module.metrics_mut().finalize_epoch());
        }

        info!(epochs = self.config.epochs, "training finished");
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_epochs_is_rejected() {
        let config = TrainerConfig { epochs: 0, ..TrainerConfig::default() };
        assert!(matches!(Trainer::new(config), Err(TrainingError::Config(_))));
    }

    #[test]
    fn test_defaults_from_toml() {
        let config: TrainerConfig = toml::from_str("epochs = 3").unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 4);
    }
}
