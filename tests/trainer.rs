use tilestream::model::ModelConfig;
use tilestream::streaming::StreamingConfig;
use tilestream::training::{
    CrossEntropy, ImageDataset, OptimizerConfig, OptimizerType, Trainer, TrainerConfig, TrainingModule,
};
use tilestream::{Config, CpuRuntime, StreamingAdapter};

fn module(config: &Config) -> TrainingModule {
    let (backbone, head) = config.model.build().unwrap();
    let adapter = StreamingAdapter::new(backbone, &config.streaming).unwrap();
    TrainingModule::new(
        adapter,
        Box::new(head),
        Box::new(CrossEntropy),
        Box::new(CpuRuntime),
        config.optimizer.clone(),
    )
    .unwrap()
}

fn small_config(use_streaming: bool) -> Config {
    Config {
        streaming: StreamingConfig {
            tile_size: 16,
            use_streaming,
            ..StreamingConfig::default()
        },
        model: ModelConfig { in_channels: 1, seed: 7, ..ModelConfig::default() },
        optimizer: OptimizerConfig { kind: OptimizerType::Adam, learning_rate: 0.01 },
        trainer: TrainerConfig { epochs: 3, batch_size: 4, log_every_n_steps: 0 },
    }
}

#[test]
fn fit_runs_every_epoch_and_records_losses() {
    let config = small_config(true);
    config.validate().unwrap();
    let mut module = module(&config);
    let train = ImageDataset::synthetic(8, 1, 24, 1).unwrap();
    let validation = ImageDataset::synthetic(4, 1, 24, 2).unwrap();

    let trainer = Trainer::new(config.trainer.clone()).unwrap();
    let summaries = trainer.fit(&mut module, &train, Some(&validation)).unwrap();

    assert_eq!(summaries.len(), 3);
    for summary in &summaries {
        assert_eq!(summary.steps, 2);
        assert!(summary.train_loss.unwrap().is_finite());
        assert!(summary.val_loss.unwrap().is_finite());
    }
    assert!(module.pending_feature_map().is_none());
}

#[test]
fn streamed_and_direct_training_follow_the_same_trajectory() {
    let train = ImageDataset::synthetic(8, 1, 24, 3).unwrap();
    let mut losses = Vec::new();
    for use_streaming in [true, false] {
        let config = small_config(use_streaming);
        let mut module = module(&config);
        let trainer = Trainer::new(config.trainer.clone()).unwrap();
        let summaries = trainer.fit(&mut module, &train, None).unwrap();
        losses.push(summaries.iter().map(|s| s.train_loss.unwrap()).collect::<Vec<_>>());
    }
    for (streamed, direct) in losses[0].iter().zip(losses[1].iter()) {
        assert!((streamed - direct).abs() < 1e-3, "{} vs {}", streamed, direct);
    }
}

#[test]
fn frozen_backbone_is_left_unchanged_by_fit() {
    let mut config = small_config(true);
    config.streaming.train_streaming_layers = false;
    let mut module = module(&config);
    let before: Vec<_> = module.adapter().parameters().iter().map(|p| p.value().clone()).collect();

    let train = ImageDataset::synthetic(4, 1, 24, 4).unwrap();
    Trainer::new(config.trainer.clone()).unwrap().fit(&mut module, &train, None).unwrap();

    let after: Vec<_> = module.adapter().parameters().iter().map(|p| p.value().clone()).collect();
    assert_eq!(before, after);
}

#[test]
fn tile_delta_for_reference_geometry() {
    assert_eq!(tilestream::quantize_tile_delta(512, 32, 32, 16), 448);
}
