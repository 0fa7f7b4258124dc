//! Column-type encoders.
//!
//! Every encoder turns the raw values of one group of same-typed columns into a
//! `[batch, num_columns, out_dim]` embedding. Encoders never mix information across
//! columns; that is the job of the attention blocks downstream.

use burn::{
    module::{Ignored, Param},
    nn::{Embedding, EmbeddingConfig, Initializer},
    prelude::*,
    tensor::activation::{gelu, relu, sigmoid, silu, tanh},
};
use serde::{Deserialize, Serialize};

use crate::common::{self, ColumnStats, ColumnType, Error, STD_EPSILON, StatType};

// ============================================================================
// Raw Features
// ============================================================================

/// Raw (un-encoded) values for one group of same-typed columns.
#[derive(Debug, Clone)]
pub enum FeatureTensor<B: Backend> {
    /// `[batch, num_columns]` scalar numerical values.
    Numeric(Tensor<B, 2>),
    /// `[batch, num_columns, in_dim]` pre-expanded numerical values.
    NumericExpanded(Tensor<B, 3>),
    /// `[batch, num_columns]` category indices. Negative or out-of-range indices mean "missing".
    Categorical(Tensor<B, 2, Int>),
}

impl<B: Backend> FeatureTensor<B> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FeatureTensor::Numeric(_) => "numeric [batch, cols]",
            FeatureTensor::NumericExpanded(_) => "numeric [batch, cols, in_dim]",
            FeatureTensor::Categorical(_) => "categorical [batch, cols]",
        }
    }

    pub fn dims(&self) -> Vec<usize> {
        match self {
            FeatureTensor::Numeric(x) => x.dims().to_vec(),
            FeatureTensor::NumericExpanded(x) => x.dims().to_vec(),
            FeatureTensor::Categorical(x) => x.dims().to_vec(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.dims()[0]
    }
}

// ============================================================================
// Encoder Contract
// ============================================================================

/// The contract every column-type encoder satisfies: `[batch, cols]` raw values in,
/// `[batch, cols, out_dim]` embeddings out.
pub trait ColTypeEncoder<B: Backend> {
    /// Column types this encoder accepts.
    const SUPPORTED_TYPES: &'static [ColumnType];

    fn num_columns(&self) -> usize;

    fn out_dim(&self) -> usize;

    fn encode(&self, feat: FeatureTensor<B>) -> common::Result<Tensor<B, 3>>;

    fn supported_types() -> &'static [ColumnType] {
        Self::SUPPORTED_TYPES
    }

    fn supports(column_type: ColumnType) -> bool {
        Self::supported_types().contains(&column_type)
    }
}

fn check_stats_len(column_type: ColumnType, declared: usize, stats: &[ColumnStats]) -> common::Result<()> {
    if stats.is_empty() {
        return Err(Error::MissingStats { column_type });
    }
    if stats.len() != declared {
        return Err(Error::ColumnCountMismatch {
            column_type,
            declared,
            found: stats.len(),
        });
    }
    Ok(())
}

fn check_dim(what: &str, value: usize) -> common::Result<()> {
    if value == 0 {
        return Err(Error::InvalidConfig(format!("{what} must be at least 1")));
    }
    Ok(())
}

// ============================================================================
// Numerical: per-column linear encoder
// ============================================================================

/// Optional nonlinearity applied after the per-column projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderActivation {
    Relu,
    Gelu,
    Silu,
    Tanh,
    Sigmoid,
}

impl EncoderActivation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            EncoderActivation::Relu => relu(x),
            EncoderActivation::Gelu => gelu(x),
            EncoderActivation::Silu => silu(x),
            EncoderActivation::Tanh => tanh(x),
            EncoderActivation::Sigmoid => sigmoid(x),
        }
    }
}

#[derive(Config, Debug)]
pub struct LinearEncoderConfig {
    /// How many numerical columns this encoder is declared to handle
    pub num_columns: usize,

    /// Output embedding width (the model's hidden dim)
    pub out_dim: usize,

    /// Width of each raw value; 1 for scalar numerics
    #[config(default = 1)]
    pub in_dim: usize,

    /// Applied after the projection and bias, if set
    pub activation: Option<EncoderActivation>,
}

impl LinearEncoderConfig {
    /// Validates `stats` and builds the encoder. Normalization buffers are computed
    /// here, once; they are never touched by the optimizer afterwards.
    pub fn init<B: Backend>(
        &self,
        stats: &[ColumnStats],
        device: &B::Device,
    ) -> common::Result<LinearEncoder<B>> {
        check_dim("in_dim", self.in_dim)?;
        check_dim("out_dim", self.out_dim)?;
        check_stats_len(ColumnType::Numerical, self.num_columns, stats)?;

        let mut means = Vec::with_capacity(stats.len());
        let mut stds = Vec::with_capacity(stats.len());
        for (index, column) in stats.iter().enumerate() {
            let ColumnStats::Numerical { name, mean, std } = column else {
                return Err(Error::StatsTypeMismatch {
                    expected: ColumnType::Numerical,
                    found: column.column_type(),
                    index,
                });
            };
            if !mean.is_finite() {
                return Err(Error::InvalidStat {
                    index,
                    name: name.clone(),
                    stat: StatType::Mean,
                    value: *mean,
                });
            }
            if !std.is_finite() || *std < 0.0 {
                return Err(Error::InvalidStat {
                    index,
                    name: name.clone(),
                    stat: StatType::Std,
                    value: *std,
                });
            }
            means.push(*mean as f32);
            stds.push(*std as f32 + STD_EPSILON);
        }

        let num_columns = stats.len();
        let mean = Tensor::<B, 1>::from_floats(means.as_slice(), device);
        let std = Tensor::<B, 1>::from_floats(stds.as_slice(), device);

        Ok(LinearEncoder {
            mean: Param::from_tensor(mean).set_require_grad(false),
            std: Param::from_tensor(std).set_require_grad(false),
            weight: Initializer::Normal {
                mean: 0.0,
                std: 0.01,
            }
            .init([num_columns, self.in_dim, self.out_dim], device),
            bias: Initializer::Zeros.init([num_columns, self.out_dim], device),
            in_dim: self.in_dim,
            out_dim: self.out_dim,
            activation: Ignored(self.activation),
        })
    }
}

/// Standardizes every numerical column with its own mean/std, then applies an
/// independent linear projection per column.
#[derive(Module, Debug)]
pub struct LinearEncoder<B: Backend> {
    // Fixed normalization buffers, [num_columns]. Persisted with the model, no gradient.
    pub(crate) mean: Param<Tensor<B, 1>>,
    pub(crate) std: Param<Tensor<B, 1>>,

    // One projection per column; never shared.
    pub(crate) weight: Param<Tensor<B, 3>>, // [num_columns, in_dim, out_dim]
    pub(crate) bias: Param<Tensor<B, 2>>,   // [num_columns, out_dim]

    in_dim: usize,
    out_dim: usize,
    activation: Ignored<Option<EncoderActivation>>,
}

impl<B: Backend> LinearEncoder<B> {
    fn shape_error(&self, found: Vec<usize>) -> Error {
        Error::FeatureShapeMismatch {
            column_type: ColumnType::Numerical,
            expected: format!(
                "[batch > 0, {}] or [batch > 0, {}, {}]",
                self.num_columns(),
                self.num_columns(),
                self.in_dim
            ),
            found,
        }
    }

    /// Z-score every column: `(x - mean) / (std + eps)`.
    ///
    /// Input `[B, C]` (only when `in_dim == 1`) or `[B, C, in_dim]`, with `B > 0`.
    /// Output `[B, C, in_dim]`.
    pub fn standardize(&self, feat: FeatureTensor<B>) -> common::Result<Tensor<B, 3>> {
        let num_columns = self.num_columns();
        match feat {
            FeatureTensor::Numeric(x) => {
                let [batch, cols] = x.dims();
                if batch == 0 || cols != num_columns || self.in_dim != 1 {
                    return Err(self.shape_error(x.dims().to_vec()));
                }
                let mean = self.mean.val().unsqueeze::<2>();
                let std = self.std.val().unsqueeze::<2>();
                Ok(((x - mean) / std).unsqueeze_dim::<3>(2))
            }
            FeatureTensor::NumericExpanded(x) => {
                let [batch, cols, width] = x.dims();
                if batch == 0 || cols != num_columns || width != self.in_dim {
                    return Err(self.shape_error(x.dims().to_vec()));
                }
                let mean = self.mean.val().reshape([1, num_columns, 1]);
                let std = self.std.val().reshape([1, num_columns, 1]);
                Ok((x - mean) / std)
            }
            other => Err(Error::FeatureKindMismatch {
                column_type: ColumnType::Numerical,
                expected: "numeric",
                found: other.kind_name(),
            }),
        }
    }

    /// Per-column projection of already-standardized values.
    ///
    /// `[B, C, in_dim] x [C, in_dim, out_dim] -> [B, C, out_dim]`. The product is
    /// divided by `in_dim`; this scaling is part of the encoder's definition and
    /// trained weights depend on it.
    pub fn project(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        // Batch over columns: [C, B, in_dim] @ [C, in_dim, out_dim] -> [C, B, out_dim]
        let x = x.swap_dims(0, 1).matmul(self.weight.val()).swap_dims(0, 1);
        let x = x.div_scalar(self.in_dim as f32) + self.bias.val().unsqueeze::<3>();

        match self.activation.0 {
            Some(activation) => activation.apply(x),
            None => x,
        }
    }
}

impl<B: Backend> ColTypeEncoder<B> for LinearEncoder<B> {
    const SUPPORTED_TYPES: &'static [ColumnType] = &[ColumnType::Numerical];

    fn num_columns(&self) -> usize {
        self.mean.val().dims()[0]
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn encode(&self, feat: FeatureTensor<B>) -> common::Result<Tensor<B, 3>> {
        let x = self.standardize(feat)?;
        Ok(self.project(x))
    }
}

// ============================================================================
// Categorical: embedding lookup
// ============================================================================

#[derive(Config, Debug)]
pub struct EmbeddingEncoderConfig {
    /// How many categorical columns this encoder is declared to handle
    pub num_columns: usize,

    /// Output embedding width (the model's hidden dim)
    pub out_dim: usize,
}

impl EmbeddingEncoderConfig {
    pub fn init<B: Backend>(
        &self,
        stats: &[ColumnStats],
        device: &B::Device,
    ) -> common::Result<EmbeddingEncoder<B>> {
        check_dim("out_dim", self.out_dim)?;
        check_stats_len(ColumnType::Categorical, self.num_columns, stats)?;

        let mut cardinalities = Vec::with_capacity(stats.len());
        let mut offsets = Vec::with_capacity(stats.len());
        let mut num_rows = 0;
        for (index, column) in stats.iter().enumerate() {
            let ColumnStats::Categorical {
                name,
                num_categories,
            } = column
            else {
                return Err(Error::StatsTypeMismatch {
                    expected: ColumnType::Categorical,
                    found: column.column_type(),
                    index,
                });
            };
            if *num_categories == 0 {
                return Err(Error::InvalidStat {
                    index,
                    name: name.clone(),
                    stat: StatType::NumCategories,
                    value: 0.0,
                });
            }
            cardinalities.push(*num_categories as i64);
            offsets.push(num_rows as i64);
            // +1 for the column's missing-value row
            num_rows += num_categories + 1;
        }

        Ok(EmbeddingEncoder {
            embedding: EmbeddingConfig::new(num_rows, self.out_dim).init(device),
            cardinalities: Ignored(cardinalities),
            offsets: Ignored(offsets),
            out_dim: self.out_dim,
        })
    }
}

/// Looks each category up in a table shared by all columns, where every column owns
/// a contiguous block of `num_categories + 1` rows. The last row of each block is
/// that column's missing / out-of-vocabulary embedding.
#[derive(Module, Debug)]
pub struct EmbeddingEncoder<B: Backend> {
    embedding: Embedding<B>,
    cardinalities: Ignored<Vec<i64>>,
    offsets: Ignored<Vec<i64>>,
    out_dim: usize,
}

impl<B: Backend> EmbeddingEncoder<B> {
    fn column_constants(&self, values: &[i64], batch: usize, device: &B::Device) -> Tensor<B, 2, Int> {
        let cols = values.len();
        Tensor::<B, 1, Int>::from_data(TensorData::new(values.to_vec(), [cols]), device)
            .reshape([1, cols])
            .repeat_dim(0, batch)
    }

    /// Maps raw category indices to rows of the shared embedding table.
    pub fn table_rows(&self, idx: Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
        let [batch, _] = idx.dims();
        let device = idx.device();
        let sentinel = self.column_constants(&self.cardinalities.0, batch, &device);
        let offsets = self.column_constants(&self.offsets.0, batch, &device);

        let idx = idx.clone().mask_where(idx.lower_elem(0), sentinel.clone());
        let idx = idx.clone().mask_where(idx.greater_equal(sentinel.clone()), sentinel);
        idx + offsets
    }
}

impl<B: Backend> ColTypeEncoder<B> for EmbeddingEncoder<B> {
    const SUPPORTED_TYPES: &'static [ColumnType] = &[ColumnType::Categorical];

    fn num_columns(&self) -> usize {
        self.cardinalities.0.len()
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn encode(&self, feat: FeatureTensor<B>) -> common::Result<Tensor<B, 3>> {
        let idx = match feat {
            FeatureTensor::Categorical(idx) => idx,
            other => {
                return Err(Error::FeatureKindMismatch {
                    column_type: ColumnType::Categorical,
                    expected: "categorical",
                    found: other.kind_name(),
                });
            }
        };
        let [_, cols] = idx.dims();
        if cols != self.num_columns() {
            return Err(Error::FeatureShapeMismatch {
                column_type: ColumnType::Categorical,
                expected: format!("[batch, {}]", self.num_columns()),
                found: idx.dims().to_vec(),
            });
        }
        Ok(self.embedding.forward(self.table_rows(idx)))
    }
}

// ============================================================================
// Tests
// ============================================================================
