use ndarray::{Array2, ArrayView1};

use crate::model::ModelError;

/// Scalar objective over head outputs and integer class targets.
pub trait LossFunction: Send {
    fn name(&self) -> &str;

    fn forward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<f32, ModelError>;

    /// Gradient of the loss w.r.t. `logits`.
    fn backward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<Array2<f32>, ModelError>;
}

/// Mean softmax cross-entropy over the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropy;

impl CrossEntropy {
    fn check(logits: &Array2<f32>, targets: &[usize]) -> Result<(), ModelError> {
        if logits.nrows() != targets.len() {
            return Err(ModelError::DimensionMismatch(format!(
                "Expected {} rows, got {}",
                targets.len(),
                logits.nrows()
            )));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= logits.ncols()) {
            return Err(ModelError::DimensionMismatch(format!(
                "target class {} out of range for {} classes",
                bad,
                logits.ncols()
            )));
        }
        Ok(())
    }

    fn row_max(row: ArrayView1<f32>) -> f32 {
        row.fold(f32::NEG_INFINITY, |a, &b| a.max(b))
    }
}

impl LossFunction for CrossEntropy {
    fn name(&self) -> &str {
        "cross_entropy"
    }

    fn forward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<f32, ModelError> {
        Self::check(logits, targets)?;
        if targets.is_empty() {
            return Ok(0.0);
        }
        let mut loss = 0.0;
        for (i, &target) in targets.iter().enumerate() {
            let row = logits.row(i);
            let max = Self::row_max(row);
            let sum_exp: f32 = row.iter().map(|&x| (x - max).exp()).sum();
            loss -= (row[target] - max) - sum_exp.ln();
        }
        Ok(loss / targets.len() as f32)
    }

    fn backward(&self, logits: &Array2<f32>, targets: &[usize]) -> Result<Array2<f32>, ModelError> {
        Self::check(logits, targets)?;
        let batch = targets.len().max(1) as f32;
        let mut dlogits = logits.clone();
        for (mut row, &target) in dlogits.rows_mut().into_iter().zip(targets) {
            let max = Self::row_max(row.view());
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row.mapv_inplace(|x| x / sum);
            row[target] -= 1.0;
            row.mapv_inplace(|x| x / batch);
        }
        Ok(dlogits)
    }
}
