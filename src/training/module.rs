use ndarray::{Array2, Array4};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::dataset::Batch;
use super::loss::LossFunction;
use super::metrics::{Metrics, Phase};
use super::optimizer::{build_optimizer, Optimizer, OptimizerConfig};
use super::params::TrainableParameterSet;
use super::TrainingError;
use crate::model::{HeadNetwork, Parameter};
use crate::runtime::{DType, Device, DeviceRuntime};
use crate::streaming::{Checkpoint, FeatureMap, GradientSink, LifecycleState, StreamingAdapter};

/// Result of one training step, consumed by [`TrainingModule::custom_backward`].
#[derive(Debug)]
pub struct Loss {
    step: u64,
    value: f32,
    grad_logits: Array2<f32>,
}

impl Loss {
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Forward state kept alive between a step and its backward.
#[derive(Debug)]
struct PendingStep {
    step: u64,
    feature_map: FeatureMap,
    sink: GradientSink,
}

/// Composes the streaming adapter with a head and a loss, and drives the
/// split backward pass: the head is differentiated normally, and the
/// gradient it produces at the feature map is handed back to the adapter
/// for the tile-wise backbone recomputation.
///
/// Every `training_step` must be followed by exactly one `custom_backward`
/// before the next step.
pub struct TrainingModule {
    adapter: StreamingAdapter,
    head: Box<dyn HeadNetwork>,
    loss_fn: Box<dyn LossFunction>,
    runtime: Box<dyn DeviceRuntime>,
    optimizer_config: OptimizerConfig,
    trainable: TrainableParameterSet,
    lifecycle: LifecycleState,
    metrics: Metrics,
    training: bool,
    next_step: u64,
    pending: Option<PendingStep>,
}

impl std::fmt::Debug for TrainingModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingModule")
            .field("adapter", &self.adapter)
            .field("loss", &self.loss_fn.name())
            .field("trainable", &self.trainable.len())
            .field("training", &self.training)
            .field("pending", &self.pending.as_ref().map(|p| p.step))
            .finish()
    }
}

impl TrainingModule {
    pub fn new(
        adapter: StreamingAdapter,
        head: Box<dyn HeadNetwork>,
        loss_fn: Box<dyn LossFunction>,
        runtime: Box<dyn DeviceRuntime>,
        optimizer_config: OptimizerConfig,
    ) -> Result<Self, TrainingError> {
        optimizer_config.validate()?;
        let trainable = Self::assemble_trainable_parameters(&adapter, head.as_ref())?;
        let lifecycle = adapter.engine().lifecycle().clone();
        info!(
            trainable = trainable.len(),
            backbone_trainable = adapter.train_streaming_layers(),
            "training module ready"
        );
        Ok(Self {
            adapter,
            head,
            loss_fn,
            runtime,
            optimizer_config,
            trainable,
            lifecycle,
            metrics: Metrics::default(),
            training: true,
            next_step: 0,
            pending: None,
        })
    }

    /// Backbone parameters (when the backbone trains) followed by the head's.
    pub fn assemble_trainable_parameters(
        adapter: &StreamingAdapter,
        head: &dyn HeadNetwork,
    ) -> Result<TrainableParameterSet, TrainingError> {
        let backbone = if adapter.train_streaming_layers() {
            adapter.parameters()
        } else {
            Vec::new()
        };
        TrainableParameterSet::from_parameters(backbone.into_iter().chain(head.parameters()))
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Runs the backbone and head on `batch` and returns the loss to be
    /// passed to [`custom_backward`](Self::custom_backward).
    pub fn training_step(&mut self, batch: &Batch) -> Result<Loss, TrainingError> {
        if let Some(pending) = &self.pending {
            return Err(TrainingError::Sequencing(format!(
                "step {} has not been backpropagated",
                pending.step
            )));
        }
        let step = self.next_step;
        self.next_step += 1;

        let (mut feature_map, sink) = self.adapter.capture_output(step, Arc::clone(&batch.images))?;
        feature_map.set_requires_grad(self.training);

        let logits = self.head.forward(feature_map.value())?;
        let value = self.loss_fn.forward(&logits, &batch.labels)?;
        let grad_logits = self.loss_fn.backward(&logits, &batch.labels)?;

        debug!(step, loss = value, "training step");
        self.metrics.record(Phase::Train, step, value);

        self.pending = Some(PendingStep { step, feature_map, sink });
        Ok(Loss { step, value, grad_logits })
    }

    /// Backpropagates `loss` through the head, releases cached device memory,
    /// then recomputes the backbone's gradients from the feature-map gradient.
    ///
    /// The feature map and its gradient are released before this returns.
    pub fn custom_backward(&mut self, loss: Loss) -> Result<(), TrainingError> {
        let pending = self.pending.take().ok_or_else(|| {
            TrainingError::Sequencing(format!("no pending step for loss of step {}", loss.step))
        })?;
        if pending.step != loss.step {
            let expected = pending.step;
            self.pending = Some(pending);
            return Err(TrainingError::Sequencing(format!(
                "loss belongs to step {} but step {} is pending",
                loss.step, expected
            )));
        }

        let PendingStep { step, feature_map, mut sink } = pending;
        if !feature_map.requires_grad() {
            return Err(TrainingError::Sequencing(format!(
                "feature map of step {} was produced outside training mode",
                step
            )));
        }

        let feature_map_grad = self.head.backward(feature_map.value(), &loss.grad_logits)?;
        sink.deposit(feature_map_grad)?;
        if let Some(gradient) = sink.gradient() {
            self.adapter.propagate_through_graph(sink.image(), gradient)?;
        }

        self.runtime.empty_cache();

        if self.adapter.train_streaming_layers() {
            self.adapter.apply_gradient(sink)?;
        } else {
            drop(sink);
        }
        drop(feature_map);
        debug!(step, "backward finished");
        Ok(())
    }

    /// Inference through backbone and head.
    pub fn forward(&mut self, image: &Array4<f32>) -> Result<Array2<f32>, TrainingError> {
        let feature_map = self.adapter.forward_streaming(image)?;
        Ok(self.head.forward(&feature_map)?)
    }

    pub fn validation_step(&mut self, batch: &Batch) -> Result<f32, TrainingError> {
        let logits = self.forward(&batch.images)?;
        let value = self.loss_fn.forward(&logits, &batch.labels)?;
        self.metrics.record(Phase::Validation, self.next_step, value);
        Ok(value)
    }

    pub fn configure_optimizer(&self) -> Result<Box<dyn Optimizer>, TrainingError> {
        info!(
            kind = %self.optimizer_config.kind,
            lr = self.optimizer_config.learning_rate,
            params = self.trainable.len(),
            "optimizer configured"
        );
        Ok(build_optimizer(&self.optimizer_config, &self.trainable)?)
    }

    pub fn optimizer_step(&mut self, optimizer: &mut dyn Optimizer) -> Result<(), TrainingError> {
        let mut params = self.parameters_mut();
        optimizer.step(&mut params)?;
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    pub fn on_train_phase_start(&mut self) -> Result<(), TrainingError> {
        info!(device = %self.lifecycle.device, dtype = %self.lifecycle.dtype, "train phase start");
        self.adapter.propagate_lifecycle_state(&self.lifecycle)?;
        self.adapter.freeze_normalization_layers();
        Ok(())
    }

    pub fn on_train_epoch_start(&mut self, epoch: usize) {
        self.metrics.set_epoch(epoch);
        self.adapter.freeze_normalization_layers();
    }

    pub fn on_validation_phase_start(&mut self) -> Result<(), TrainingError> {
        info!("validation phase start");
        self.adapter.propagate_lifecycle_state(&self.lifecycle)?;
        Ok(())
    }

    /// Flips every layer between training and eval mode, normalization
    /// layers included; the epoch hook re-freezes those.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.adapter.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Moves the module; the engine sees the change at the next phase hook.
    pub fn to_device(&mut self, device: Device) {
        self.lifecycle.device = device;
    }

    /// Changes the compute precision; the engine sees the change at the next
    /// phase hook.
    pub fn set_dtype(&mut self, dtype: DType) {
        self.lifecycle.dtype = dtype;
    }

    pub fn lifecycle(&self) -> &LifecycleState {
        &self.lifecycle
    }

    pub fn trainable_parameters(&self) -> &TrainableParameterSet {
        &self.trainable
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.adapter.parameters();
        params.extend(self.head.parameters());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.adapter.parameters_mut();
        params.extend(self.head.parameters_mut());
        params
    }

    /// Weak handle to the feature map of the step awaiting backward.
    pub fn pending_feature_map(&self) -> Option<Weak<Array4<f32>>> {
        self.pending.as_ref().map(|p| p.feature_map.downgrade())
    }

    pub fn adapter(&self) -> &StreamingAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut StreamingAdapter {
        &mut self.adapter
    }

    pub fn head(&self) -> &dyn HeadNetwork {
        self.head.as_ref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut Metrics {
        &mut self.metrics
    }
}
