//! Training / evaluation driver: cross-entropy training with Adam or AdamW, accuracy
//! evaluation, and best-validation bookkeeping across epochs.

use std::time::Instant;

use burn::{
    config::Config,
    grad_clipping::GradientClippingConfig,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, decay::WeightDecayConfig},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{self, ColumnStatsTable};
use crate::dataset::{DataSplits, InMemoryTable};
use crate::model::{ModelConfig, TabTransformer};

/// How weight decay is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam with weight decay added to the gradient (L2 penalty).
    Adam,
    /// Adam with decoupled weight decay.
    AdamW,
}

#[derive(Config, Debug)]
pub struct OptimizerConfig {
    #[config(default = "OptimizerKind::AdamW")]
    pub kind: OptimizerKind,

    /// The learning rate to use
    #[config(default = 1e-4)]
    pub learning_rate: f64,

    /// The weight decay to use
    #[config(default = 5e-4)]
    pub weight_decay: f64,

    /// Clip gradients to `max_grad_norm` before each step
    #[config(default = true)]
    pub clip_gradients: bool,

    /// Gradient clipping (max global L2 norm)
    #[config(default = 1.0)]
    pub max_grad_norm: f64,
}

impl OptimizerConfig {
    fn grad_clipping(&self) -> Option<GradientClippingConfig> {
        self.clip_gradients
            .then(|| GradientClippingConfig::Norm(self.max_grad_norm as f32))
    }

    pub fn adam(&self) -> AdamConfig {
        AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay as f32)))
            .with_grad_clipping(self.grad_clipping())
    }

    pub fn adamw(&self) -> AdamWConfig {
        AdamWConfig::new()
            .with_weight_decay(self.weight_decay as f32)
            .with_grad_clipping(self.grad_clipping())
    }
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// The model configuration
    pub model_config: ModelConfig,

    /// The optimizer configuration
    pub optimizer_config: OptimizerConfig,

    /// The number of passes over the training split
    #[config(default = 50)]
    pub num_epochs: usize,

    /// The batch size to use (rows per step)
    #[config(default = 128)]
    pub batch_size: usize,

    /// Seed for splitting and shuffling
    #[config(default = 42)]
    pub seed: u64,

    /// Fraction of rows used for training
    #[config(default = 0.8)]
    pub train_ratio: f64,

    /// Fraction of rows used for validation; the rest is the test split
    #[config(default = 0.1)]
    pub val_ratio: f64,
}

/// Best validation metric seen so far, and the test metric from the same epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BestMetrics {
    pub val: f64,
    pub test: f64,
}

impl BestMetrics {
    /// Fold one epoch's metrics in. Test is only taken from epochs that improve val.
    pub fn observe(self, val: f64, test: f64) -> Self {
        if val > self.val { Self { val, test } } else { self }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub best: BestMetrics,
    pub train_losses: Vec<f64>,
    pub mean_epoch_secs: f64,
}

/// One pass over `table` in shuffled batches. Returns the updated model and the
/// mean loss per row.
pub fn train_epoch<B, O>(
    mut model: TabTransformer<B>,
    optim: &mut O,
    table: &InMemoryTable,
    batch_size: usize,
    learning_rate: f64,
    rng: &mut StdRng,
    device: &B::Device,
) -> common::Result<(TabTransformer<B>, f64)>
where
    B: AutodiffBackend,
    O: Optimizer<TabTransformer<B>, B>,
{
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut loss_sum = 0.0;

    for (batch, labels) in table.batches::<B, _>(batch_size, Some(rng), device) {
        let rows = batch.batch_size();
        let logits = model.forward(&batch)?;
        let loss = loss_fn.forward(logits, labels);
        loss_sum += loss.clone().into_scalar().elem::<f64>() * rows as f64;

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        model = optim.step(learning_rate, model, grads);
    }

    let mean_loss = if table.is_empty() {
        0.0
    } else {
        loss_sum / table.len() as f64
    };
    Ok((model, mean_loss))
}

/// Fraction of rows in `table` whose argmax logit equals the label.
pub fn evaluate<B: Backend>(
    model: &TabTransformer<B>,
    table: &InMemoryTable,
    batch_size: usize,
    device: &B::Device,
) -> common::Result<f64> {
    if table.is_empty() {
        return Ok(0.0);
    }
    let mut correct = 0i64;
    for (batch, labels) in table.batches::<B, StdRng>(batch_size, None, device) {
        let rows = batch.batch_size();
        let predicted = model.forward(&batch)?.argmax(1).reshape([rows]);
        correct += predicted.equal(labels).int().sum().into_scalar().elem::<i64>();
    }
    Ok(correct as f64 / table.len() as f64)
}

/// Build a model for `stats` and train it on `splits.train`, evaluating every split
/// after each epoch.
pub fn fit<B: AutodiffBackend>(
    config: &TrainingConfig,
    stats: &ColumnStatsTable,
    splits: &DataSplits,
    device: &B::Device,
) -> common::Result<(TabTransformer<B>, TrainingSummary)> {
    let model = config.model_config.init::<B>(stats, device)?;
    let optimizer = &config.optimizer_config;
    info!("Optimizer: {:?}, weight decay {}", optimizer.kind, optimizer.weight_decay);
    match optimizer.kind {
        OptimizerKind::Adam => {
            let optim = optimizer.adam().init::<B, TabTransformer<B>>();
            fit_with(config, model, optim, splits, device)
        }
        OptimizerKind::AdamW => {
            let optim = optimizer.adamw().init::<B, TabTransformer<B>>();
            fit_with(config, model, optim, splits, device)
        }
    }
}

fn fit_with<B, O>(
    config: &TrainingConfig,
    mut model: TabTransformer<B>,
    mut optim: O,
    splits: &DataSplits,
    device: &B::Device,
) -> common::Result<(TabTransformer<B>, TrainingSummary)>
where
    B: AutodiffBackend,
    O: Optimizer<TabTransformer<B>, B>,
{
    let mut rng = StdRng::seed_from_u64(config.seed);
    let learning_rate = config.optimizer_config.learning_rate;
    let mut best = BestMetrics::default();
    let mut train_losses = Vec::with_capacity(config.num_epochs);
    let mut epoch_secs = Vec::with_capacity(config.num_epochs);

    for epoch in 1..=config.num_epochs {
        let start = Instant::now();
        let (trained, train_loss) = train_epoch(
            model,
            &mut optim,
            &splits.train,
            config.batch_size,
            learning_rate,
            &mut rng,
            device,
        )?;
        model = trained;

        let eval_model = model.valid();
        let train_acc = evaluate(&eval_model, &splits.train, config.batch_size, device)?;
        let val_acc = evaluate(&eval_model, &splits.val, config.batch_size, device)?;
        let test_acc = evaluate(&eval_model, &splits.test, config.batch_size, device)?;
        best = best.observe(val_acc, test_acc);

        epoch_secs.push(start.elapsed().as_secs_f64());
        train_losses.push(train_loss);
        info!(
            "Epoch {epoch:>3}: Train Loss: {train_loss:.4}, Train Acc: {train_acc:.4}, \
             Val Acc: {val_acc:.4}, Test Acc: {test_acc:.4}"
        );
    }

    let mean_epoch_secs = if epoch_secs.is_empty() {
        0.0
    } else {
        epoch_secs.iter().sum::<f64>() / epoch_secs.len() as f64
    };
    info!("Mean time per epoch: {mean_epoch_secs:.4}s");
    info!(
        "Best Val Acc: {:.4}, Best Test Acc: {:.4}",
        best.val, best.test
    );

    Ok((
        model,
        TrainingSummary {
            best,
            train_losses,
            mean_epoch_secs,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::synthetic_titanic;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn small_config(num_epochs: usize) -> TrainingConfig {
        TrainingConfig::new(
            ModelConfig::new(2)
                .with_hidden_dim(16)
                .with_num_layers(1)
                .with_num_heads(2),
            OptimizerConfig::new().with_learning_rate(1e-2),
        )
        .with_num_epochs(num_epochs)
        .with_batch_size(32)
    }

    #[test]
    fn test_best_metrics_track_val_improvements_only() {
        let best = BestMetrics::default()
            .observe(0.70, 0.60)
            .observe(0.80, 0.75)
            .observe(0.80, 0.90)
            .observe(0.65, 0.99);
        assert_eq!(best, BestMetrics { val: 0.80, test: 0.75 });
    }

    #[test]
    fn test_evaluate_counts_argmax_hits() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(3);
        let (stats, table) = synthetic_titanic(40, &mut rng).unwrap();
        let model: TabTransformer<TestBackend> = ModelConfig::new(2)
            .with_hidden_dim(8)
            .with_num_layers(1)
            .with_num_heads(2)
            .init(&stats, &device)
            .unwrap();
        let acc = evaluate(&model, &table, 16, &device).unwrap();
        assert!((0.0..=1.0).contains(&acc));
    }

    #[test]
    fn test_training_reduces_loss() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(11);
        let (stats, table) = synthetic_titanic(256, &mut rng).unwrap();
        let config = small_config(15);
        let splits = table.split(config.train_ratio, config.val_ratio, &mut rng).unwrap();

        let (_, summary) = fit::<TestAutodiffBackend>(&config, &stats, &splits, &device).unwrap();
        assert_eq!(summary.train_losses.len(), 15);
        let first = summary.train_losses[0];
        let last = *summary.train_losses.last().unwrap();
        assert!(last < first, "loss went from {first} to {last}");
        assert!(summary.best.val > 0.0);
    }

    #[test]
    fn test_training_config_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = small_config(3);
        config.save(&path).unwrap();
        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.num_epochs, 3);
        assert_eq!(loaded.model_config.hidden_dim, 16);
        assert_eq!(loaded.optimizer_config.learning_rate, 1e-2);
    }

    #[test]
    fn test_adam_with_l2_decay_reduces_loss() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(13);
        let (stats, table) = synthetic_titanic(256, &mut rng).unwrap();
        let mut config = small_config(10);
        config.optimizer_config = config
            .optimizer_config
            .with_kind(OptimizerKind::Adam)
            .with_clip_gradients(false);
        let splits = table.split(config.train_ratio, config.val_ratio, &mut rng).unwrap();

        let (_, summary) = fit::<TestAutodiffBackend>(&config, &stats, &splits, &device).unwrap();
        let first = summary.train_losses[0];
        let last = *summary.train_losses.last().unwrap();
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_optimizer_kind_survives_json() {
        let config = OptimizerConfig::new().with_kind(OptimizerKind::Adam);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"adam\""));
        let parsed: OptimizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, OptimizerKind::Adam);
        assert!(parsed.clip_gradients);
    }
}
