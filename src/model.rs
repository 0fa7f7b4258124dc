use std::path::PathBuf;

use burn::{
    nn::{
        Linear, LinearConfig, RmsNorm, RmsNormConfig,
        attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig},
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::activation::silu,
};
use tracing::info;

use crate::common::{self, ColumnStatsTable, Error};
use crate::encoder::EncoderActivation;
use crate::table_encoder::{TableBatch, TableEncoder, TableEncoderConfig};

#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Number of output classes (width of the logits)
    pub num_classes: usize,

    /// The hidden dimension of the model; every column is embedded to this width
    #[config(default = 32)]
    pub hidden_dim: usize,

    /// The dimension of the feedforward network. Defaults to 4x the hidden dimension
    pub dim_ffn: Option<usize>,

    /// The number of attention blocks to stack
    #[config(default = 6)]
    pub num_layers: usize,

    /// The number of attention heads per block; must divide `hidden_dim`
    #[config(default = 8)]
    pub num_heads: usize,

    /// Dropout rate for attention layers
    #[config(default = 0.0)]
    pub dropout: f64,

    /// Activation applied by the numerical column encoder
    pub numerical_activation: Option<EncoderActivation>,
}

#[derive(Module, Debug)]
pub struct SwigluFFN<B: Backend> {
    up: Linear<B>,   // [dim_model, dim_ffn] (no bias)
    gate: Linear<B>, // [dim_model, dim_ffn] (no bias)
    down: Linear<B>, // [dim_ffn, dim_model] (no bias)
}

impl<B: Backend> SwigluFFN<B> {
    pub fn new(device: &B::Device, dim_model: usize, dim_ffn: usize) -> Self {
        let up = LinearConfig::new(dim_model, dim_ffn)
            .with_bias(false)
            .init(device);
        let gate = LinearConfig::new(dim_model, dim_ffn)
            .with_bias(false)
            .init(device);
        let down = LinearConfig::new(dim_ffn, dim_model)
            .with_bias(false)
            .init(device);
        Self { up, gate, down }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let gate = silu(self.gate.forward(x.clone()));
        let up = self.up.forward(x);
        self.down.forward(gate * up)
    }
}

/// One contextual mixing layer: every column attends to every other column, then a
/// position-wise feed-forward. No mask and no positional signal, so the block is
/// equivariant under any reordering of the column axis.
#[derive(Module, Debug)]
pub struct ColumnAttentionBlock<B: Backend> {
    attention_norm: RmsNorm<B>,
    ffn_norm: RmsNorm<B>,

    attention: MultiHeadAttention<B>,
    ffn: SwigluFFN<B>,

    dim_model: usize,
}

impl<B: Backend> ColumnAttentionBlock<B> {
    pub fn new(
        device: &B::Device,
        dim_model: usize,
        dim_ffn: usize,
        num_heads: usize,
        dropout: f64,
    ) -> common::Result<Self> {
        if num_heads == 0 || dim_model % num_heads != 0 {
            return Err(Error::HeadsNotDivisible {
                hidden_dim: dim_model,
                num_heads,
            });
        }
        Ok(Self {
            attention_norm: RmsNormConfig::new(dim_model).init(device),
            ffn_norm: RmsNormConfig::new(dim_model).init(device),
            attention: MultiHeadAttentionConfig::new(dim_model, num_heads)
                .with_dropout(dropout)
                .init(device),
            ffn: SwigluFFN::new(device, dim_model, dim_ffn),
            dim_model,
        })
    }

    /// Pre-norm residual attention over columns, then pre-norm residual SwiGLU FFN.
    ///
    /// Input x: [B, C, D]
    /// Output:  [B, C, D]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let mha_input = MhaInput::self_attn(self.attention_norm.forward(x.clone()));
        let x = x + self.attention.forward(mha_input).context;

        x.clone() + self.ffn.forward(self.ffn_norm.forward(x))
    }

    pub fn dim_model(&self) -> usize {
        self.dim_model
    }
}

/// Mean-pools over columns, so every column contributes symmetrically, then projects
/// to class logits.
#[derive(Module, Debug)]
pub struct ModelHead<B: Backend> {
    fc: Linear<B>,
    hidden_dim: usize,
}

impl<B: Backend> ModelHead<B> {
    pub fn new(device: &B::Device, hidden_dim: usize, num_classes: usize) -> Self {
        Self {
            fc: LinearConfig::new(hidden_dim, num_classes).init(device),
            hidden_dim,
        }
    }

    /// Input x: [B, C, D]
    /// Output:  [B, num_classes] (raw logits)
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 2> {
        let [batch, _, hidden] = x.dims();
        let pooled = x.mean_dim(1).reshape([batch, hidden]);
        self.fc.forward(pooled)
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

#[derive(Module, Debug)]
pub struct TabTransformer<B: Backend> {
    // Raw columns -> [B, C, D]
    encoder: TableEncoder<B>,

    // Column mixing, fixed depth
    blocks: Vec<ColumnAttentionBlock<B>>,

    // [B, C, D] -> [B, num_classes]
    head: ModelHead<B>,
}

impl ModelConfig {
    /// Returns an initialized model for the columns described by `stats`.
    pub fn init<B: Backend>(
        &self,
        stats: &ColumnStatsTable,
        device: &B::Device,
    ) -> common::Result<TabTransformer<B>> {
        if self.hidden_dim == 0 {
            return Err(Error::InvalidConfig("hidden_dim must be at least 1".to_string()));
        }
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be at least 1".to_string()));
        }
        if self.num_heads == 0 || self.hidden_dim % self.num_heads != 0 {
            return Err(Error::HeadsNotDivisible {
                hidden_dim: self.hidden_dim,
                num_heads: self.num_heads,
            });
        }
        let dim_ffn = self.dim_ffn.unwrap_or(4 * self.hidden_dim);

        let encoder = TableEncoderConfig::new(self.hidden_dim)
            .with_numerical_activation(self.numerical_activation)
            .init(stats, device)?;
        let blocks = (0..self.num_layers)
            .map(|_| {
                ColumnAttentionBlock::new(
                    device,
                    self.hidden_dim,
                    dim_ffn,
                    self.num_heads,
                    self.dropout,
                )
            })
            .collect::<common::Result<Vec<_>>>()?;
        let head = ModelHead::new(device, self.hidden_dim, self.num_classes);

        let model = TabTransformer::new(encoder, blocks, head)?;
        info!(
            "Built model: {} columns, {} blocks, hidden dim {}, {} parameters",
            model.encoder.num_columns(),
            self.num_layers,
            self.hidden_dim,
            model.num_params()
        );
        Ok(model)
    }
}

impl<B: Backend> TabTransformer<B> {
    /// Assemble a model from parts, checking that every stage agrees on the hidden width.
    pub fn new(
        encoder: TableEncoder<B>,
        blocks: Vec<ColumnAttentionBlock<B>>,
        head: ModelHead<B>,
    ) -> common::Result<Self> {
        let width = encoder.hidden_dim();
        if let Some(block) = blocks.iter().find(|b| b.dim_model() != width) {
            return Err(Error::HiddenDimMismatch {
                component: "attention block",
                expected: block.dim_model(),
                found: width,
            });
        }
        if head.hidden_dim() != width {
            return Err(Error::HiddenDimMismatch {
                component: "model head",
                expected: head.hidden_dim(),
                found: width,
            });
        }
        Ok(Self {
            encoder,
            blocks,
            head,
        })
    }

    /// Raw batch -> [B, num_classes] logits.
    pub fn forward(&self, batch: &TableBatch<B>) -> common::Result<Tensor<B, 2>> {
        let x = self.encoder.forward(batch)?;
        Ok(self.head.forward(self.contextualize(x)))
    }

    /// Run the attention stack over already-encoded columns.
    ///
    /// Input x: [B, C, D]
    /// Output:  [B, C, D]
    pub fn contextualize(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    pub fn encoder(&self) -> &TableEncoder<B> {
        &self.encoder
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Write every parameter and normalization buffer to `path` (`.mpk` is appended).
    pub fn save(&self, path: impl Into<PathBuf>) -> common::Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.clone().save_file(path, &recorder)?;
        Ok(())
    }

    /// Restore state written by [`TabTransformer::save`] into a model built with the
    /// same config and column layout.
    pub fn load(self, path: impl Into<PathBuf>, device: &B::Device) -> common::Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        Ok(self.load_file(path, &recorder, device)?)
    }
}
