use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{StreamingEngine, StreamingError};

/// Whether the backbone runs through the tiled engine or as one dense pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    #[default]
    Enabled,
    Disabled,
}

impl StreamingMode {
    pub fn from_flag(use_streaming: bool) -> Self {
        if use_streaming {
            StreamingMode::Enabled
        } else {
            StreamingMode::Disabled
        }
    }
}

impl fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamingMode::Enabled => write!(f, "streaming"),
            StreamingMode::Disabled => write!(f, "direct"),
        }
    }
}

/// How the adapter routes forward and backward calls in one mode.
pub trait ExecutionStrategy: Send + fmt::Debug {
    fn mode(&self) -> StreamingMode;

    fn forward(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
    ) -> Result<Array4<f32>, StreamingError>;

    /// Backbone gradients from the engine's own recomputation.
    fn backward(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError>;

    /// Backbone gradients from an ordinary reverse pass through the graph.
    fn propagate_through_graph(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError>;
}

/// Tiled forward; the feature map is detached so the backbone only learns
/// through the engine's recomputation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Streaming;

impl ExecutionStrategy for Streaming {
    fn mode(&self) -> StreamingMode {
        StreamingMode::Enabled
    }

    fn forward(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
    ) -> Result<Array4<f32>, StreamingError> {
        engine.forward(image)
    }

    fn backward(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        engine.backward(image, feature_map_grad)
    }

    fn propagate_through_graph(
        &self,
        _engine: &mut dyn StreamingEngine,
        _image: &Array4<f32>,
        _feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        Ok(())
    }
}

/// The backbone runs once on the whole image, prepared the same way the
/// engine prepares each tile.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl ExecutionStrategy for Direct {
    fn mode(&self) -> StreamingMode {
        StreamingMode::Disabled
    }

    fn forward(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
    ) -> Result<Array4<f32>, StreamingError> {
        let prepared = engine.prepare_input(image)?;
        Ok(engine.backbone_mut().forward(&prepared)?)
    }

    fn backward(
        &self,
        _engine: &mut dyn StreamingEngine,
        _image: &Array4<f32>,
        _feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        Ok(())
    }

    fn propagate_through_graph(
        &self,
        engine: &mut dyn StreamingEngine,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        if engine.backbone().requires_grad() {
            let prepared = engine.prepare_input(image)?;
            engine.backbone_mut().backward(&prepared, feature_map_grad)?;
        }
        Ok(())
    }
}

pub fn build_strategy(mode: StreamingMode) -> Box<dyn ExecutionStrategy> {
    match mode {
        StreamingMode::Enabled => Box::new(Streaming),
        StreamingMode::Disabled => Box::new(Direct),
    }
}
