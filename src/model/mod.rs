//! Backbone layers, the head network and their trainable parameters

mod backbone;
mod config;
mod error;
mod head;
pub mod layers;
mod parameter;

pub use backbone::{Backbone, ReceptiveField};
pub use config::{ModelConfig, StageConfig};
pub use error::ModelError;
pub use head::{ClassifierHead, HeadNetwork};
pub use layers::{BatchNorm2d, Conv2d, GlobalAvgPool, Layer, LayerGeometry, Linear, ReLU};
pub use parameter::{ParamId, Parameter};
