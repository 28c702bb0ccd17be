//! Tile-based streaming execution of the backbone and the adapter that
//! connects it to a gradient-descent training loop

mod adapter;
mod checkpoint;
mod config;
mod engine;
mod error;
pub mod geometry;
mod lifecycle;
mod mode;

pub use adapter::StreamingAdapter;
pub use checkpoint::{Checkpoint, FeatureMap, GradientSink};
pub use config::StreamingConfig;
pub use engine::{EngineOptions, PassStats, StreamingEngine, TiledEngine};
pub use error::StreamingError;
pub use geometry::{quantize_tile_delta, Geometry, LostMargin};
pub use lifecycle::LifecycleState;
pub use mode::{build_strategy, Direct, ExecutionStrategy, Streaming, StreamingMode};
