use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tilestream::training::{CrossEntropy, ImageDataset, Metrics};
use tilestream::{Config, CpuRuntime, StreamingAdapter, Trainer, TrainingModule};

#[derive(Parser)]
#[command(name = "tilestream")]
#[command(version)]
#[command(about = "Streaming tile-based CNN training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tile delta a data loader should tile images by
    Delta,
    /// Train on a synthetic two-class dataset
    Train {
        /// Run the backbone densely instead of tile by tile
        #[arg(long)]
        no_streaming: bool,
        /// Number of synthetic training images
        #[arg(long, default_value = "16")]
        samples: usize,
        /// Side length of the synthetic images
        #[arg(long, default_value = "96")]
        image_size: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tilestream=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Delta => {
            let (backbone, _) = config.model.build()?;
            let adapter = StreamingAdapter::new(backbone, &config.streaming)?;
            println!("{}", adapter.tile_delta());
        }
        Commands::Train { no_streaming, samples, image_size } => {
            if no_streaming {
                config.streaming.use_streaming = false;
            }
            config.validate()?;

            let (backbone, head) = config.model.build()?;
            let adapter = StreamingAdapter::new(backbone, &config.streaming)?;
            let mut module = TrainingModule::new(
                adapter,
                Box::new(head),
                Box::new(CrossEntropy),
                Box::new(CpuRuntime),
                config.optimizer.clone(),
            )?
            .with_metrics(Metrics::new(config.trainer.log_every_n_steps));

            let seed = config.model.seed;
            let channels = config.model.in_channels;
            let train = ImageDataset::synthetic(samples, channels, image_size, seed)?;
            let validation = ImageDataset::synthetic(samples / 4 + 1, channels, image_size, seed + 1)?;

            let trainer = Trainer::new(config.trainer.clone())?;
            let summaries = trainer.fit(&mut module, &train, Some(&validation))?;
            if let Some(last) = summaries.last() {
                info!(train_loss = ?last.train_loss, val_loss = ?last.val_loss, "done");
            }
            println!("{}", module.metrics().to_json()?);
        }
    }
    Ok(())
}
