use ndarray::{s, Array4};
use tracing::debug;

use super::geometry::{quantize_tile_delta, tile_spans, Geometry, TileSpan};
use super::{LifecycleState, StreamingError};
use crate::model::Backbone;

/// Contract of a tile-based streaming compute engine wrapping the backbone.
///
/// The adapter owns the engine and decides when it is enabled; the engine
/// reads its [`LifecycleState`] on every call but never changes it.
pub trait StreamingEngine: Send {
    /// Tiled evaluation when enabled, a single dense pass otherwise.
    fn forward(&mut self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError>;

    /// Recomputes the backbone tile by tile and accumulates parameter
    /// gradients from `feature_map_grad`. Only valid while enabled.
    fn backward(
        &mut self,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError>;

    fn enable(&mut self);

    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    /// Applies the lifecycle's normalization and precision to a whole image,
    /// exactly as every tile is prepared.
    fn prepare_input(&self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError>;

    fn geometry(&self) -> &Geometry;

    fn lifecycle(&self) -> &LifecycleState;

    fn set_lifecycle(&mut self, state: LifecycleState);

    fn backbone(&self) -> &Backbone;

    fn backbone_mut(&mut self) -> &mut Backbone;
}

/// Options for [`TiledEngine`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Normalize each tile with the lifecycle mean/std before the backbone.
    pub normalize_on_device: bool,
    /// Log a summary line for every tiled pass.
    pub verbose: bool,
}

/// What the last tiled pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub tiles: usize,
    /// Largest input tile processed, as `(height, width)`.
    pub largest_tile: (usize, usize),
}

/// Reference engine for unpadded backbones.
///
/// Output tiles are `delta / stride` pixels wide and read overlapping input
/// crops of at most `tile_size` pixels, so only one crop's activations are
/// alive at a time. Backward replays each crop and backpropagates the matching
/// slice of the feature-map gradient; parameter gradients sum over tiles.
pub struct TiledEngine {
    backbone: Backbone,
    geometry: Geometry,
    delta: usize,
    lifecycle: LifecycleState,
    options: EngineOptions,
    enabled: bool,
    last_forward: PassStats,
    last_backward: PassStats,
    last_pass: PassStats,
}

impl std::fmt::Debug for TiledEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledEngine")
            .field("geometry", &self.geometry)
            .field("delta", &self.delta)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl TiledEngine {
    pub fn new(
        backbone: Backbone,
        tile_size: usize,
        options: EngineOptions,
    ) -> Result<Self, StreamingError> {
        let geometry = Geometry::from_receptive_field(&backbone.receptive_field(), tile_size);
        let stride = geometry.total_stride();
        let margin = geometry.lost_margin;
        let delta = quantize_tile_delta(tile_size, margin.left, margin.right, stride);
        if delta == 0 {
            return Err(StreamingError::Config(format!(
                "tile size {} leaves no valid output (lost margin {}+{}, stride {})",
                tile_size, margin.left, margin.right, stride
            )));
        }
        debug!(
            tile_size,
            delta,
            receptive_field = geometry.receptive_field,
            stride,
            "streaming engine ready"
        );
        Ok(Self {
            backbone,
            geometry,
            delta,
            lifecycle: LifecycleState::default(),
            options,
            enabled: true,
            last_forward: PassStats::default(),
            last_backward: PassStats::default(),
            last_pass: PassStats::default(),
        })
    }

    pub fn last_forward(&self) -> PassStats {
        self.last_forward
    }

    pub fn last_backward(&self) -> PassStats {
        self.last_backward
    }

    /// Stats of whichever tiled pass ran most recently.
    pub fn last_pass(&self) -> PassStats {
        self.last_pass
    }

    fn prepare(&self, mut image: Array4<f32>) -> Result<Array4<f32>, StreamingError> {
        if self.options.normalize_on_device {
            self.lifecycle.normalize(&mut image)?;
        }
        self.lifecycle.cast(&mut image);
        Ok(image)
    }

    fn spans(&self, image: &Array4<f32>) -> Result<(Vec<TileSpan>, Vec<TileSpan>), StreamingError> {
        let (_, _, height, width) = image.dim();
        let field = self.geometry.receptive_field;
        let stride = self.geometry.total_stride();
        Ok((
            tile_spans(height, field, stride, self.delta)?,
            tile_spans(width, field, stride, self.delta)?,
        ))
    }

    fn crop(&self, image: &Array4<f32>, row: &TileSpan, col: &TileSpan) -> Result<Array4<f32>, StreamingError> {
        let tile = image
            .slice(s![.., .., row.input_start..row.input_end, col.input_start..col.input_end])
            .to_owned();
        self.prepare(tile)
    }

    fn forward_tiled(&mut self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError> {
        let (rows, cols) = self.spans(image)?;
        let out_h = rows.last().map_or(0, |r| r.output_end);
        let out_w = cols.last().map_or(0, |c| c.output_end);

        let mut output: Option<Array4<f32>> = None;
        let mut stats = PassStats::default();
        for row in &rows {
            for col in &cols {
                let tile = self.crop(image, row, col)?;
                let tile_out = self.backbone.forward(&tile)?;
                let (batch, channels, th, tw) = tile_out.dim();
                if (th, tw) != (row.output_len(), col.output_len()) {
                    return Err(StreamingError::Geometry(format!(
                        "tile produced {}x{} outputs, expected {}x{}",
                        th,
                        tw,
                        row.output_len(),
                        col.output_len()
                    )));
                }
                output
                    .get_or_insert_with(|| Array4::zeros((batch, channels, out_h, out_w)))
                    .slice_mut(s![.., .., row.output_start..row.output_end, col.output_start..col.output_end])
                    .assign(&tile_out);
                stats.record(row, col);
            }
        }

        self.last_forward = stats;
        self.last_pass = stats;
        if self.options.verbose {
            debug!(tiles = stats.tiles, largest_tile = ?stats.largest_tile, "tiled forward");
        }
        output.ok_or_else(|| StreamingError::Geometry("image produced no tiles".into()))
    }
}

impl PassStats {
    fn record(&mut self, row: &TileSpan, col: &TileSpan) {
        self.tiles += 1;
        let (h, w) = (row.input_len(), col.input_len());
        if h * w > self.largest_tile.0 * self.largest_tile.1 {
            self.largest_tile = (h, w);
        }
    }
}

impl StreamingEngine for TiledEngine {
    fn forward(&mut self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError> {
        if self.enabled {
            return self.forward_tiled(image);
        }
        let prepared = self.prepare_input(image)?;
        Ok(self.backbone.forward(&prepared)?)
    }

    fn backward(
        &mut self,
        image: &Array4<f32>,
        feature_map_grad: &Array4<f32>,
    ) -> Result<(), StreamingError> {
        if !self.enabled {
            return Err(StreamingError::NotEnabled);
        }
        let (rows, cols) = self.spans(image)?;
        let out_h = rows.last().map_or(0, |r| r.output_end);
        let out_w = cols.last().map_or(0, |c| c.output_end);
        let (g_batch, _, g_h, g_w) = feature_map_grad.dim();
        if g_batch != image.dim().0 || (g_h, g_w) != (out_h, out_w) {
            return Err(StreamingError::Geometry(format!(
                "feature map gradient {:?} does not match output {}x{} for batch {}",
                feature_map_grad.shape(),
                out_h,
                out_w,
                image.dim().0
            )));
        }

        let mut stats = PassStats::default();
        for row in &rows {
            for col in &cols {
                let tile = self.crop(image, row, col)?;
                let tile_grad = feature_map_grad
                    .slice(s![.., .., row.output_start..row.output_end, col.output_start..col.output_end])
                    .to_owned();
                self.backbone.backward(&tile, &tile_grad)?;
                stats.record(row, col);
            }
        }

        self.last_backward = stats;
        self.last_pass = stats;
        if self.options.verbose {
            debug!(tiles = stats.tiles, largest_tile = ?stats.largest_tile, "tiled backward");
        }
        Ok(())
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn prepare_input(&self, image: &Array4<f32>) -> Result<Array4<f32>, StreamingError> {
        self.prepare(image.to_owned())
    }

    fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    fn set_lifecycle(&mut self, state: LifecycleState) {
        self.lifecycle = state;
    }

    fn backbone(&self) -> &Backbone {
        &self.backbone
    }

    fn backbone_mut(&mut self) -> &mut Backbone {
        &mut self.backbone
    }
}
