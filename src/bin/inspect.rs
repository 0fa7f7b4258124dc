//! Inspect a column statistics file: dump the column layout a model would use,
//! each column's stats, and the parameter count of the resulting model.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --stats runs/titanic.stats.json
//! cargo run --release --bin inspect -- --synthetic --dim 64
//! ```

use std::path::PathBuf;

use burn::backend::NdArray;
use burn::module::Module;
use clap::Parser;
use rand::{SeedableRng, rngs::StdRng};
use tabformer::common::{ColumnStats, ColumnStatsTable};
use tabformer::dataset::synthetic_titanic;
use tabformer::model::{ModelConfig, TabTransformer};

#[derive(Parser, Debug)]
#[command(about = "Inspect column statistics and the model built from them")]
struct Args {
    /// Path to a column statistics JSON file.
    #[arg(long, required_unless_present = "synthetic")]
    stats: Option<PathBuf>,

    /// Use the synthetic Titanic-style table instead of a stats file.
    #[arg(long)]
    synthetic: bool,

    #[arg(long, default_value_t = 32)]
    dim: usize,

    #[arg(long, default_value_t = 6)]
    num_layers: usize,

    #[arg(long, default_value_t = 8)]
    num_heads: usize,

    #[arg(long, default_value_t = 2)]
    num_classes: usize,
}

fn print_stats(stats: &ColumnStats, indent: &str) {
    match stats {
        ColumnStats::Numerical { mean, std, .. } => {
            println!("{indent}mean={mean:.4}  std={std:.4}");
        }
        ColumnStats::Categorical { num_categories, .. } => {
            println!("{indent}categories={num_categories} (+1 missing)");
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let (source, stats) = match &args.stats {
        Some(path) => (path.display().to_string(), ColumnStatsTable::load(path)?),
        None => {
            let mut rng = StdRng::seed_from_u64(42);
            ("synthetic".to_string(), synthetic_titanic(891, &mut rng)?.0)
        }
    };

    // ── Columns ───────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Stats:   {source}");
    println!("║  Columns: {:>6}", stats.num_columns());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut position = 0;
    for (column_type, group) in stats.iter() {
        println!("┌─ {column_type} ({} columns)", group.len());
        for column in group {
            println!("│  [{position}] {}", column.name());
            print_stats(column, "│      ");
            position += 1;
        }
        println!("└─");
        println!();
    }

    // ── Model ─────────────────────────────────────────────────────────────
    let config = ModelConfig::new(args.num_classes)
        .with_hidden_dim(args.dim)
        .with_num_layers(args.num_layers)
        .with_num_heads(args.num_heads);
    let model: TabTransformer<NdArray<f32>> = config.init(&stats, &Default::default())?;

    println!("Model:");
    println!("  hidden dim:  {:>10}", model.encoder().hidden_dim());
    println!("  blocks:      {:>10}", model.num_blocks());
    println!("  parameters:  {:>10}", model.num_params());
    println!("  encoder:     {:>10}", model.encoder().num_params());
    println!("  column order: {}", model.encoder().column_names().join(", "));

    Ok(())
}
