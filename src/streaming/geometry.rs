use super::StreamingError;
use crate::model::ReceptiveField;

/// Output pixels lost to missing context at each tile edge, in input pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LostMargin {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

/// Read-only tiling geometry exposed by a streaming engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub lost_margin: LostMargin,
    /// Cumulative stride after each backbone layer.
    pub output_stride: Vec<usize>,
    /// Spatial `(height, width)` of one input tile.
    pub tile_shape: (usize, usize),
    /// Receptive field of one output pixel, per axis.
    pub receptive_field: usize,
}

impl Geometry {
    /// Derives the geometry of an unpadded layer stack.
    ///
    /// A tile of `T` input pixels yields `(T - R) / S + 1` output pixels, which
    /// advance the output by exactly `(T - (R - S)) / S * S` input pixels, so
    /// the overhang `R - S` is what each tile loses. It is split between the
    /// two sides of an axis with the odd pixel on the right/bottom.
    pub fn from_receptive_field(field: &ReceptiveField, tile_size: usize) -> Self {
        let stride = field.total_stride();
        let lost = field.size.saturating_sub(stride);
        let near = lost / 2;
        let far = lost - near;
        Self {
            lost_margin: LostMargin {
                left: near,
                right: far,
                top: near,
                bottom: far,
            },
            output_stride: field.output_stride.clone(),
            tile_shape: (tile_size, tile_size),
            receptive_field: field.size,
        }
    }

    pub fn total_stride(&self) -> usize {
        self.output_stride.last().copied().unwrap_or(1)
    }
}

/// Stride-aligned count of trustworthy pixels per tile axis.
///
/// `(tile - left - right)` is floor-divided by `stride` and multiplied back,
/// discarding any remainder. Tiles no larger than the combined margin, and a
/// zero stride, yield 0.
pub fn quantize_tile_delta(tile_size: usize, left: usize, right: usize, stride: usize) -> usize {
    let lost = left.saturating_add(right);
    if stride == 0 || tile_size <= lost {
        return 0;
    }
    (tile_size - lost) / stride * stride
}

/// One tile along a single axis, in both input and output coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSpan {
    pub input_start: usize,
    pub input_end: usize,
    pub output_start: usize,
    pub output_end: usize,
}

impl TileSpan {
    pub fn input_len(&self) -> usize {
        self.input_end - self.input_start
    }

    pub fn output_len(&self) -> usize {
        self.output_end - self.output_start
    }
}

/// Partitions one axis of length `len` into tiles whose outputs abut exactly.
///
/// Every tile except possibly the last produces `delta / stride` output
/// pixels and starts `delta` input pixels after the previous one.
pub fn tile_spans(
    len: usize,
    receptive_field: usize,
    stride: usize,
    delta: usize,
) -> Result<Vec<TileSpan>, StreamingError> {
    if stride == 0 || delta == 0 || delta % stride != 0 {
        return Err(StreamingError::Config(format!(
            "tile delta {} must be a positive multiple of stride {}",
            delta, stride
        )));
    }
    if len < receptive_field {
        return Err(StreamingError::Geometry(format!(
            "axis of {} pixels is smaller than the receptive field {}",
            len, receptive_field
        )));
    }
    let outputs = (len - receptive_field) / stride + 1;
    let per_tile = delta / stride;

    let mut spans = Vec::with_capacity(outputs.div_ceil(per_tile));
    let mut start = 0;
    while start < outputs {
        let end = (start + per_tile).min(outputs);
        spans.push(TileSpan {
            input_start: start * stride,
            input_end: (end - 1) * stride + receptive_field,
            output_start: start,
            output_end: end,
        });
        start = end;
    }
    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_scenario() {
        assert_eq!(quantize_tile_delta(512, 32, 32, 16), 448);
    }

    #[test]
    fn test_remainder_is_truncated() {
        // 100 - 10 = 90 -> 5 * 16 = 80, not rounded up to 96
        assert_eq!(quantize_tile_delta(100, 4, 6, 16), 80);
    }

    #[test]
    fn test_tile_within_margin_yields_zero() {
        assert_eq!(quantize_tile_delta(64, 32, 32, 16), 0);
        assert_eq!(quantize_tile_delta(10, 32, 32, 16), 0);
        assert_eq!(quantize_tile_delta(70, 32, 32, 16), 0);
    }

    #[test]
    fn test_geometry_from_receptive_field() {
        let field = ReceptiveField {
            size: 7,
            output_stride: vec![1, 2],
        };
        let geometry = Geometry::from_receptive_field(&field, 32);
        assert_eq!(geometry.lost_margin.left, 2);
        assert_eq!(geometry.lost_margin.right, 3);
        assert_eq!(geometry.total_stride(), 2);
        assert_eq!(geometry.tile_shape, (32, 32));
    }

    #[test]
    fn test_spans_cover_every_output_once() {
        // R = 5, S = 2, delta = 6 -> 3 outputs per tile
        let spans = tile_spans(21, 5, 2, 6).unwrap();
        // (21 - 5) / 2 + 1 = 9 outputs
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0], TileSpan { input_start: 0, input_end: 9, output_start: 0, output_end: 3 });
        assert_eq!(spans[1].input_start, 6);
        assert_eq!(spans[2].output_end, 9);
        assert_eq!(spans[2].input_end, 21);
    }

    #[test]
    fn test_short_last_tile() {
        let spans = tile_spans(12, 3, 1, 4).unwrap();
        // 10 outputs in tiles of 4: 4 + 4 + 2
        let lens: Vec<_> = spans.iter().map(TileSpan::output_len).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert_eq!(spans[2].input_len(), 4);
    }

    #[test]
    fn test_axis_smaller_than_receptive_field() {
        assert!(matches!(tile_spans(4, 5, 1, 2), Err(StreamingError::Geometry(_))));
    }

    proptest! {
        #[test]
        fn prop_delta_is_greatest_stride_multiple(
            left in 0usize..256,
            right in 0usize..256,
            extra in 1usize..2048,
            stride in 1usize..64,
        ) {
            let tile = left + right + extra;
            let delta = quantize_tile_delta(tile, left, right, stride);
            prop_assert_eq!(delta % stride, 0);
            prop_assert!(delta <= tile - left - right);
            prop_assert!(delta + stride > tile - left - right);
        }

        #[test]
        fn prop_tile_within_margin_never_positive(
            left in 0usize..256,
            right in 0usize..256,
            shortfall in 0usize..512,
            stride in 1usize..64,
        ) {
            let tile = (left + right).saturating_sub(shortfall);
            prop_assert_eq!(quantize_tile_delta(tile, left, right, stride), 0);
        }

        #[test]
        fn prop_spans_tile_the_output_without_gaps(
            len in 8usize..200,
            receptive_field in 1usize..8,
            stride in 1usize..4,
            tiles_per in 1usize..6,
        ) {
            prop_assume!(len >= receptive_field);
            let spans = tile_spans(len, receptive_field, stride, tiles_per * stride).unwrap();
            let outputs = (len - receptive_field) / stride + 1;
            let mut next = 0;
            for span in &spans {
                prop_assert_eq!(span.output_start, next);
                prop_assert!(span.input_end <= len);
                next = span.output_end;
            }
            prop_assert_eq!(next, outputs);
        }
    }
}
