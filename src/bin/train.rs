#![recursion_limit = "131"]

//! Train a TabTransformer classifier on a synthetic Titanic-style table.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin train
//! cargo run --release --bin train -- --dim 64 --num-layers 4 --epochs 20
//! cargo run --release --bin train -- --config runs/small.json --snapshot runs/small
//! ```

use std::path::PathBuf;

use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::config::Config;
use clap::{Parser, ValueEnum};
use rand::{SeedableRng, rngs::StdRng};
use tabformer::dataset::synthetic_titanic;
use tabformer::model::ModelConfig;
use tabformer::training::{OptimizerConfig, OptimizerKind, TrainingConfig, fit};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(about = "Train a column-attention classifier on tabular data")]
struct Args {
    /// Training config JSON. When given, the model/optimizer flags below are ignored.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hidden dim shared by every column embedding.
    #[arg(long, default_value_t = 32)]
    dim: usize,

    /// Number of column-attention blocks.
    #[arg(long, default_value_t = 6)]
    num_layers: usize,

    /// Attention heads per block.
    #[arg(long, default_value_t = 8)]
    num_heads: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Learning rate.
    #[arg(long, default_value_t = 1e-4)]
    lr: f64,

    #[arg(long, default_value_t = 5e-4)]
    wd: f64,

    /// `adam` applies weight decay as an L2 penalty without gradient clipping.
    #[arg(long, value_enum, default_value_t = Optim::Adamw)]
    optimizer: Optim,

    #[arg(long, default_value_t = 50)]
    epochs: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Rows of synthetic data to generate.
    #[arg(long, default_value_t = 891)]
    num_rows: usize,

    /// Write the column statistics used to build the model here.
    #[arg(long)]
    stats_out: Option<PathBuf>,

    /// Write the trained model (`.mpk`) and its config (`.json`) with this prefix.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Optim {
    Adam,
    Adamw,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(path) = &self.config {
            info!("Loading training config from {}", path.display());
            return Ok(TrainingConfig::load(path)?);
        }
        Ok(TrainingConfig::new(
            ModelConfig::new(2)
                .with_hidden_dim(self.dim)
                .with_num_layers(self.num_layers)
                .with_num_heads(self.num_heads),
            match self.optimizer {
                Optim::Adam => OptimizerConfig::new()
                    .with_kind(OptimizerKind::Adam)
                    .with_clip_gradients(false),
                Optim::Adamw => OptimizerConfig::new().with_kind(OptimizerKind::AdamW),
            }
            .with_learning_rate(self.lr)
            .with_weight_decay(self.wd),
        )
        .with_num_epochs(self.epochs)
        .with_batch_size(self.batch_size)
        .with_seed(self.seed))
    }
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    type B = Wgpu;
    type AB = Autodiff<B>;

    let config = args.training_config()?;
    let device = WgpuDevice::default();

    let mut rng = StdRng::seed_from_u64(config.seed);
    let (stats, table) = synthetic_titanic(args.num_rows, &mut rng)?;
    if let Some(path) = &args.stats_out {
        stats.save(path)?;
        info!("Wrote column statistics to {}", path.display());
    }

    let splits = table.split(config.train_ratio, config.val_ratio, &mut rng)?;
    info!(
        "Rows: {} train, {} val, {} test",
        splits.train.len(),
        splits.val.len(),
        splits.test.len()
    );

    let (model, summary) = fit::<AB>(&config, &stats, &splits, &device)?;

    if let Some(prefix) = &args.snapshot {
        config.save(prefix.with_extension("json"))?;
        model.save(prefix.clone())?;
        info!("Saved snapshot to {}", prefix.display());
    }

    println!(
        "Best Val Acc: {:.4}, Best Test Acc: {:.4} ({:.2}s/epoch)",
        summary.best.val, summary.best.test, summary.mean_epoch_secs
    );
    Ok(())
}
