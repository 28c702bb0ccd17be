//! Train convolutional networks on images larger than device memory by
//! streaming the backbone tile by tile.
//!
//! [`streaming::StreamingAdapter`] wraps a backbone and a tiled engine;
//! [`training::TrainingModule`] pairs it with a head and a loss and runs the
//! split backward pass.

pub mod config;
pub mod error;
pub mod model;
pub mod runtime;
pub mod streaming;
pub mod training;

pub use config::Config;
pub use error::TileStreamError;
pub use model::{Backbone, ModelConfig};
pub use runtime::{CpuRuntime, DType, Device, DeviceRuntime};
pub use streaming::{quantize_tile_delta, StreamingAdapter, StreamingConfig, StreamingMode};
pub use training::{Trainer, TrainingModule};
