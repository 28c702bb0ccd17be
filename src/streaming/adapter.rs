use ndarray::Array4;
use std::sync::Arc;
use tracing::{debug, info};

use super::checkpoint::{Checkpoint, FeatureMap, GradientSink};
use super::engine::{StreamingEngine, TiledEngine};
use super::geometry::quantize_tile_delta;
use super::mode::{build_strategy, ExecutionStrategy, StreamingMode};
use super::{LifecycleState, StreamingConfig, StreamingError};
use crate::model::{Backbone, Parameter};

/// Wraps a backbone and its streaming engine behind a mode switch.
///
/// In streaming mode the backbone's output is detached and its gradients come
/// from the engine's tile-wise recomputation; in direct mode the backbone is an
/// ordinary part of the graph.
///
/// `enable_streaming`/`disable_streaming` must not be called between a
/// forward and its backward.
pub struct StreamingAdapter {
    engine: Box<dyn StreamingEngine>,
    strategy: Box<dyn ExecutionStrategy>,
    tile_size: usize,
    tile_delta: usize,
    train_streaming_layers: bool,
}

impl std::fmt::Debug for StreamingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAdapter")
            .field("mode", &self.mode())
            .field("engine_enabled", &self.engine.is_enabled())
            .field("tile_size", &self.tile_size)
            .field("tile_delta", &self.tile_delta)
            .field("train_streaming_layers", &self.train_streaming_layers)
            .finish()
    }
}

impl StreamingAdapter {
    /// Builds the reference [`TiledEngine`] around `backbone`.
    pub fn new(backbone: Backbone, config: &StreamingConfig) -> Result<Self, StreamingError> {
        let engine = TiledEngine::new(backbone, config.tile_size, config.engine_options())?;
        Self::from_engine(Box::new(engine), config)
    }

    /// Wraps an existing engine, which must tile with `config.tile_size`.
    pub fn from_engine(
        engine: Box<dyn StreamingEngine>,
        config: &StreamingConfig,
    ) -> Result<Self, StreamingError> {
        config.validate()?;
        let (tile_h, tile_w) = engine.geometry().tile_shape;
        if (tile_h, tile_w) != (config.tile_size, config.tile_size) {
            return Err(StreamingError::Config(format!(
                "engine tiles {}x{} but the configured tile size is {}",
                tile_h, tile_w, config.tile_size
            )));
        }
        let mut adapter = Self {
            engine,
            strategy: build_strategy(config.mode()),
            tile_size: tile_h,
            tile_delta: 0,
            train_streaming_layers: config.train_streaming_layers,
        };
        adapter.tile_delta = adapter.compute_tile_delta()?;

        match config.mode() {
            StreamingMode::Enabled => adapter.engine.enable(),
            StreamingMode::Disabled => adapter.engine.disable(),
        }
        if !adapter.train_streaming_layers {
            for param in adapter.engine.backbone_mut().parameters_mut() {
                param.set_requires_grad(false);
            }
        }
        adapter.propagate_lifecycle_state(&config.lifecycle())?;

        info!(
            mode = %adapter.mode(),
            tile_size = adapter.tile_size,
            tile_delta = adapter.tile_delta,
            trainable = adapter.train_streaming_layers,
            "streaming adapter ready"
        );
        Ok(adapter)
    }

    pub fn forward_streaming(&mut self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError> {
        self.strategy.forward(self.engine.as_mut(), image)
    }

    /// Tile-wise backbone backward; a no-op in direct mode.
    pub fn backward_streaming(
        &mut self,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        self.strategy.backward(self.engine.as_mut(), image, feature_map_grad)
    }

    /// Continues the reverse pass into the backbone; a no-op in streaming mode.
    pub fn propagate_through_graph(
        &mut self,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        self.strategy
            .propagate_through_graph(self.engine.as_mut(), image, feature_map_grad)
    }

    pub fn enable_streaming(&mut self) {
        if self.mode() != StreamingMode::Enabled {
            self.strategy = build_strategy(StreamingMode::Enabled);
            debug!("streaming enabled");
        }
        self.engine.enable();
    }

    pub fn disable_streaming(&mut self) {
        if self.mode() != StreamingMode::Disabled {
            self.strategy = build_strategy(StreamingMode::Disabled);
            debug!("streaming disabled");
        }
        self.engine.disable();
    }

    pub fn mode(&self) -> StreamingMode {
        self.strategy.mode()
    }

    /// Puts every normalization layer of the backbone in eval mode, so tiles
    /// are normalized with running statistics instead of per-tile batch
    /// statistics. Returns how many layers were frozen.
    pub fn freeze_normalization_layers(&mut self) -> usize {
        let mut frozen = 0;
        for layer in self.engine.backbone_mut().normalization_layers_mut() {
            layer.set_training(false);
            frozen += 1;
        }
        debug!(frozen, "normalization layers frozen");
        frozen
    }

    /// Copies `state` into the engine. An invalid state is rejected and the
    /// engine keeps its previous copy.
    pub fn propagate_lifecycle_state(&mut self, state: &LifecycleState) -> Result<(), StreamingError> {
        state.validate()?;
        debug!(device = %state.device, dtype = %state.dtype, "lifecycle state propagated");
        self.engine.set_lifecycle(state.clone());
        Ok(())
    }

    /// Stride-aligned count of valid output pixels per tile, in input pixels.
    pub fn compute_tile_delta(&self) -> Result<usize, StreamingError> {
        let geometry = self.engine.geometry();
        let margin = geometry.lost_margin;
        let stride = geometry.total_stride();
        match quantize_tile_delta(self.tile_size, margin.left, margin.right, stride) {
            0 => Err(StreamingError::Config(format!(
                "tile size {} is not larger than the lost margin {}+{} at stride {}",
                self.tile_size, margin.left, margin.right, stride
            ))),
            delta => Ok(delta),
        }
    }

    pub fn tile_delta(&self) -> usize {
        self.tile_delta
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn train_streaming_layers(&self) -> bool {
        self.train_streaming_layers
    }

    pub fn set_training(&mut self, training: bool) {
        self.engine.backbone_mut().set_training(training);
    }

    pub fn engine(&self) -> &dyn StreamingEngine {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> &mut dyn StreamingEngine {
        self.engine.as_mut()
    }

    pub fn backbone(&self) -> &Backbone {
        self.engine.backbone()
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.engine.backbone().parameters()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.engine.backbone_mut().parameters_mut()
    }
}

impl Checkpoint for StreamingAdapter {
    fn capture_output(
        &mut self,
        step: u64,
        image: Arc<Array4<f32>>,
    ) -> Result<(FeatureMap, GradientSink), StreamingError> {
        let output = self.forward_streaming(&image)?;
        let sink = GradientSink::new(step, image, output.dim());
        Ok((FeatureMap::new(output), sink))
    }

    fn apply_gradient(&mut self, sink: GradientSink) -> Result<(), StreamingError> {
        let (image, gradient) = sink.into_parts()?;
        self.backward_streaming(&image, &gradient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchNorm2d, Conv2d, Layer, ReLU};
    use crate::streaming::EngineOptions;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::{rngs::StdRng, SeedableRng};

    fn backbone() -> Backbone {
        let mut rng = StdRng::seed_from_u64(5);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(Conv2d::new("c1", 3, 4, 3, 1, &mut rng).unwrap()),
            Box::new(BatchNorm2d::new("bn1", 4).unwrap()),
            Box::new(ReLU::new("r1")),
            Box::new(Conv2d::new("c2", 4, 4, 3, 2, &mut rng).unwrap()),
            Box::new(BatchNorm2d::new("bn2", 4).unwrap()),
        ];
        Backbone::new(layers).unwrap()
    }

    fn config(tile_size: usize) -> StreamingConfig {
        StreamingConfig { tile_size, ..StreamingConfig::default() }
    }

    fn image() -> Array4<f32> {
        Array4::from_shape_fn((2, 3, 25, 21), |(b, c, y, x)| {
            ((b * 5 + c * 3 + y * 7 + x * 2) % 13) as f32 / 6.0 - 1.0
        })
    }

    #[test]
    fn test_tile_delta_from_geometry() {
        // R = 5, S = 2: margin 1 + 2, (16 - 3) / 2 * 2 = 12
        let adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        assert_eq!(adapter.tile_delta(), 12);
        assert_eq!(adapter.compute_tile_delta().unwrap(), 12);
    }

    #[test]
    fn test_tile_within_margin_is_a_config_error() {
        let err = StreamingAdapter::new(backbone(), &config(3)).unwrap_err();
        assert!(matches!(err, StreamingError::Config(_)));
    }

    #[test]
    fn test_toggle_is_idempotent_and_keeps_parameters() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        let ids: Vec<_> = adapter.parameters().iter().map(|p| p.id()).collect();

        adapter.disable_streaming();
        adapter.disable_streaming();
        assert_eq!(adapter.mode(), StreamingMode::Disabled);
        assert!(!adapter.engine().is_enabled());

        adapter.enable_streaming();
        adapter.enable_streaming();
        assert_eq!(adapter.mode(), StreamingMode::Enabled);
        assert!(adapter.engine().is_enabled());

        let after: Vec<_> = adapter.parameters().iter().map(|p| p.id()).collect();
        assert_eq!(ids, after);
    }

    #[test]
    fn test_streamed_and_direct_feature_maps_agree() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        adapter.freeze_normalization_layers();

        let streamed = adapter.forward_streaming(&image()).unwrap();
        adapter.disable_streaming();
        let dense = adapter.forward_streaming(&image()).unwrap();

        assert_eq!(streamed.dim(), dense.dim());
        for (s, d) in streamed.iter().zip(dense.iter()) {
            assert_abs_diff_eq!(*s, *d, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_freeze_counts_normalization_layers() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        adapter.set_training(true);
        assert_eq!(adapter.freeze_normalization_layers(), 2);
        let layers = adapter.backbone().layers();
        assert!(layers.iter().filter(|l| l.is_normalization()).all(|l| !l.is_training()));
    }

    #[test]
    fn test_frozen_backbone_parameters_do_not_require_grad() {
        let config = StreamingConfig { train_streaming_layers: false, ..config(16) };
        let adapter = StreamingAdapter::new(backbone(), &config).unwrap();
        assert!(adapter.parameters().iter().all(|p| !p.requires_grad()));
    }

    #[test]
    fn test_direct_backward_is_a_noop() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        adapter.disable_streaming();
        let out = adapter.forward_streaming(&image()).unwrap();
        adapter.backward_streaming(&image(), &Array4::ones(out.dim())).unwrap();
        assert!(adapter.parameters().iter().all(|p| p.grad().is_none()));

        adapter.propagate_through_graph(&image(), &Array4::ones(out.dim())).unwrap();
        assert!(adapter.parameters().iter().all(|p| p.grad().is_some()));
    }

    #[test]
    fn test_checkpoint_round_trip_populates_gradients() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        adapter.freeze_normalization_layers();
        let (fmap, mut sink) = adapter.capture_output(0, Arc::new(image())).unwrap();
        sink.deposit(Array4::ones(fmap.dim())).unwrap();
        adapter.apply_gradient(sink).unwrap();
        assert!(adapter.parameters().iter().all(|p| p.grad().is_some()));
    }

    #[test]
    fn test_apply_without_deposit_fails() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        let (_fmap, sink) = adapter.capture_output(4, Arc::new(image())).unwrap();
        assert!(matches!(adapter.apply_gradient(sink), Err(StreamingError::MissingGradient(4))));
    }

    #[test]
    fn test_lifecycle_reaches_engine() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        let state = LifecycleState {
            dtype: crate::runtime::DType::F16,
            ..LifecycleState::default()
        };
        adapter.propagate_lifecycle_state(&state).unwrap();
        assert_eq!(adapter.engine().lifecycle(), &state);
    }

    #[test]
    fn test_invalid_lifecycle_is_rejected() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        let before = adapter.engine().lifecycle().clone();
        let state = LifecycleState {
            std: vec![0.5],
            ..LifecycleState::default()
        };
        let err = adapter.propagate_lifecycle_state(&state).unwrap_err();
        assert!(matches!(err, StreamingError::Config(_)));
        assert_eq!(adapter.engine().lifecycle(), &before);
    }

    #[test]
    fn test_normalized_streamed_and_direct_feature_maps_agree() {
        let config = StreamingConfig { normalize_on_device: true, ..config(16) };
        let mut adapter = StreamingAdapter::new(backbone(), &config).unwrap();
        adapter.freeze_normalization_layers();

        let streamed = adapter.forward_streaming(&image()).unwrap();
        adapter.disable_streaming();
        let dense = adapter.forward_streaming(&image()).unwrap();

        for (s, d) in streamed.iter().zip(dense.iter()) {
            assert_abs_diff_eq!(*s, *d, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_normalized_direct_backward_sees_prepared_input() {
        let config = StreamingConfig { normalize_on_device: true, ..config(16) };
        let mut streamed = StreamingAdapter::new(backbone(), &config).unwrap();
        let mut direct = StreamingAdapter::new(backbone(), &config).unwrap();
        direct.disable_streaming();
        for adapter in [&mut streamed, &mut direct] {
            adapter.freeze_normalization_layers();
        }

        let out = streamed.forward_streaming(&image()).unwrap();
        let grad = Array4::from_shape_fn(out.dim(), |(b, c, y, x)| (b + c + y + x) as f32 * 0.05);
        streamed.backward_streaming(&image(), &grad).unwrap();
        direct.forward_streaming(&image()).unwrap();
        direct.propagate_through_graph(&image(), &grad).unwrap();

        for (a, b) in streamed.parameters().iter().zip(direct.parameters().iter()) {
            for (x, y) in a.grad().unwrap().iter().zip(b.grad().unwrap().iter()) {
                assert_relative_eq!(*x, *y, epsilon = 1e-3, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn test_engine_tile_size_must_match_config() {
        let engine = TiledEngine::new(backbone(), 12, EngineOptions::default()).unwrap();
        let err = StreamingAdapter::from_engine(Box::new(engine), &config(16)).unwrap_err();
        assert!(matches!(err, StreamingError::Config(_)));

        let engine = TiledEngine::new(backbone(), 12, EngineOptions::default()).unwrap();
        let adapter = StreamingAdapter::from_engine(Box::new(engine), &config(12)).unwrap();
        assert_eq!(adapter.tile_size(), 12);
        assert_eq!(adapter.tile_delta(), 8);
    }

    #[test]
    fn test_captured_image_is_shared_not_copied() {
        let mut adapter = StreamingAdapter::new(backbone(), &config(16)).unwrap();
        let image = Arc::new(image());
        let (_fmap, sink) = adapter.capture_output(1, Arc::clone(&image)).unwrap();
        assert!(std::ptr::eq(sink.image(), &*image));
        assert_eq!(Arc::strong_count(&image), 2);
    }
}
