//! Training loop pieces around the streaming adapter

mod adam;
mod dataset;
mod error;
mod loss;
mod metrics;
mod module;
mod optimizer;
mod params;
mod sgd;
mod trainer;

pub use adam::AdamOptimizer;
pub use dataset::{Batch, BatchIterator, ImageDataset};
pub use error::TrainingError;
pub use loss::{CrossEntropy, LossFunction};
pub use metrics::{EpochSummary, Metrics, Phase, StepMetrics};
pub use module::{Loss, TrainingModule};
pub use optimizer::{build_optimizer, Optimizer, OptimizerConfig, OptimizerError, OptimizerType};
pub use params::TrainableParameterSet;
pub use sgd::SgdOptimizer;
pub use trainer::{Trainer, TrainerConfig};
