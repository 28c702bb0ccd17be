use ndarray::{Array3, Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

use super::TrainingError;

/// In-memory labelled images sharing one `[channels, height, width]` shape.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    images: Vec<Array3<f32>>,
    labels: Vec<usize>,
}

impl ImageDataset {
    pub fn new(images: Vec<Array3<f32>>, labels: Vec<usize>) -> Result<Self, TrainingError> {
        if images.len() != labels.len() {
            return Err(TrainingError::Dataset(format!(
                "{} images but {} labels",
                images.len(),
                labels.len()
            )));
        }
        if let Some(first) = images.first() {
            if let Some(bad) = images.iter().position(|img| img.dim() != first.dim()) {
                return Err(TrainingError::Dataset(format!(
                    "image {} has shape {:?}, expected {:?}",
                    bad,
                    images[bad].shape(),
                    first.shape()
                )));
            }
        }
        Ok(Self { images, labels })
    }

    /// Two-class toy data: class 1 images carry a bright square in the
    /// centre, class 0 images are plain noise.
    pub fn synthetic(
        len: usize,
        channels: usize,
        size: usize,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (lo, hi) = (size / 4, size - size / 4);
        let mut images = Vec::with_capacity(len);
        let mut labels = Vec::with_capacity(len);
        for i in 0..len {
            let label = i % 2;
            let image = Array3::from_shape_fn((channels, size, size), |(_, y, x)| {
                let noise: f32 = rng.gen_range(0.0..0.2);
                if label == 1 && (lo..hi).contains(&y) && (lo..hi).contains(&x) {
                    0.8 + noise
                } else {
                    noise
                }
            });
            images.push(image);
            labels.push(label);
        }
        Self::new(images, labels)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn batch_iter(&self, batch_size: usize) -> BatchIterator<'_> {
        BatchIterator::new(self, batch_size)
    }
}

/// A single training batch. Images are shared so the backbone's recompute
/// pass can hold them without a copy.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Arc<Array4<f32>>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn new(images: Array4<f32>, labels: Vec<usize>) -> Self {
        Self {
            images: Arc::new(images),
            labels,
        }
    }
}

/// Iterator over batches in dataset order; the last batch may be short.
pub struct BatchIterator<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    current_pos: usize,
    step: usize,
}

impl<'a> BatchIterator<'a> {
    pub fn new(dataset: &'a ImageDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            current_pos: 0,
            step: 0,
        }
    }

    /// Batches yielded so far.
    pub fn step(&self) -> usize {
        self.step
    }
}

impl Iterator for BatchIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        let end = (self.current_pos + self.batch_size).min(self.dataset.len());
        if self.current_pos >= end {
            return None;
        }
        let views: Vec<_> = self.dataset.images[self.current_pos..end]
            .iter()
            .map(|img| img.view())
            .collect();
        let images = ndarray::stack(Axis(0), &views).ok()?;
        let labels = self.dataset.labels[self.current_pos..end].to_vec();
        self.current_pos = end;
        self.step += 1;
        Some(Batch::new(images, labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_cover_dataset() {
        let dataset = ImageDataset::synthetic(5, 3, 8, 0).unwrap();
        let mut iter = dataset.batch_iter(2);
        let sizes: Vec<_> = iter.by_ref().map(|b| b.images.dim().0).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(iter.step(), 3);
    }

    #[test]
    fn test_synthetic_labels_alternate() {
        let dataset = ImageDataset::synthetic(4, 1, 8, 1).unwrap();
        let batch = dataset.batch_iter(4).next().unwrap();
        assert_eq!(batch.labels, vec![0, 1, 0, 1]);
        assert_eq!(batch.images.dim(), (4, 1, 8, 8));
        // the bright square only appears in class 1
        assert!(batch.images[[1, 0, 4, 4]] > 0.7);
        assert!(batch.images[[0, 0, 4, 4]] < 0.3);
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let images = vec![Array3::zeros((1, 4, 4)), Array3::zeros((1, 5, 4))];
        assert!(matches!(
            ImageDataset::new(images, vec![0, 1]),
            Err(TrainingError::Dataset(_))
        ));
    }
}
