use serde::Serialize;
use std::fmt;
use std::time::SystemTime;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Train,
    Validation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Validation => write!(f, "validation"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub phase: Phase,
    pub epoch: usize,
    pub step: u64,
    pub loss: f32,
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: Option<f32>,
    pub val_loss: Option<f32>,
    pub steps: usize,
}

/// In-memory record of every logged loss, summarized per epoch.
#[derive(Debug, Default)]
pub struct Metrics {
    history: Vec<StepMetrics>,
    epochs: Vec<EpochSummary>,
    epoch: usize,
    log_every_n_steps: usize,
}

impl Metrics {
    pub fn new(log_every_n_steps: usize) -> Self {
        Self {
            log_every_n_steps,
            ..Self::default()
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn record(&mut self, phase: Phase, step: u64, loss: f32) {
        if phase == Phase::Train && self.log_every_n_steps > 0 && step % self.log_every_n_steps as u64 == 0 {
            info!(epoch = self.epoch, step, loss, "train_loss");
        }
        self.history.push(StepMetrics {
            phase,
            epoch: self.epoch,
            step,
            loss,
            timestamp: SystemTime::now(),
        });
    }

    /// Averages the current epoch's losses per phase.
    pub fn finalize_epoch(&mut self) -> EpochSummary {
        let epoch = self.epoch;
        let mean = |phase: Phase| {
            let losses: Vec<f32> = self
                .history
                .iter()
                .filter(|m| m.epoch == epoch && m.phase == phase)
                .map(|m| m.loss)
                .collect();
            (!losses.is_empty()).then(|| losses.iter().sum::<f32>() / losses.len() as f32)
        };
        let summary = EpochSummary {
            epoch,
            train_loss: mean(Phase::Train),
            val_loss: mean(Phase::Validation),
            steps: self
                .history
                .iter()
                .filter(|m| m.epoch == epoch && m.phase == Phase::Train)
                .count(),
        };
        info!(
            epoch,
            train_loss = ?summary.train_loss,
            val_loss = ?summary.val_loss,
            steps = summary.steps,
            "epoch finished"
        );
        self.epochs.push(summary.clone());
        summary
    }

    pub fn history(&self) -> &[StepMetrics] {
        &self.history
    }

    pub fn epochs(&self) -> &[EpochSummary] {
        &self.epochs
    }

    pub fn last_loss(&self, phase: Phase) -> Option<f32> {
        self.history.iter().rev().find(|m| m.phase == phase).map(|m| m.loss)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.epochs)
    }
}
