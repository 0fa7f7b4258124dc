//! The table encoder: runs every column-type group of a batch through its encoder
//! and lays the results side by side as one `[batch, num_columns, hidden_dim]` tensor.

use burn::{module::Ignored, prelude::*};
use indexmap::IndexMap;
use tracing::debug;

use crate::common::{self, ColumnStatsTable, ColumnType, Error};
use crate::encoder::{
    ColTypeEncoder, EmbeddingEncoder, EmbeddingEncoderConfig, EncoderActivation, FeatureTensor,
    LinearEncoder, LinearEncoderConfig,
};

/// One batch of raw features, keyed by column type.
#[derive(Debug, Clone)]
pub struct TableBatch<B: Backend> {
    features: IndexMap<ColumnType, FeatureTensor<B>>,
}

impl<B: Backend> Default for TableBatch<B> {
    fn default() -> Self {
        Self {
            features: IndexMap::new(),
        }
    }
}

impl<B: Backend> TableBatch<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column_type: ColumnType, feat: FeatureTensor<B>) {
        self.features.insert(column_type, feat);
    }

    /// `[batch, num_numerical_columns]` raw values.
    pub fn with_numerical(mut self, x: Tensor<B, 2>) -> Self {
        self.insert(ColumnType::Numerical, FeatureTensor::Numeric(x));
        self
    }

    /// `[batch, num_numerical_columns, in_dim]` raw values.
    pub fn with_numerical_expanded(mut self, x: Tensor<B, 3>) -> Self {
        self.insert(ColumnType::Numerical, FeatureTensor::NumericExpanded(x));
        self
    }

    /// `[batch, num_categorical_columns]` category indices.
    pub fn with_categorical(mut self, idx: Tensor<B, 2, Int>) -> Self {
        self.insert(ColumnType::Categorical, FeatureTensor::Categorical(idx));
        self
    }

    pub fn get(&self, column_type: ColumnType) -> Option<&FeatureTensor<B>> {
        self.features.get(&column_type)
    }

    pub fn column_types(&self) -> impl Iterator<Item = ColumnType> + '_ {
        self.features.keys().copied()
    }

    /// Batch size of the first group, or 0 for an empty batch.
    pub fn batch_size(&self) -> usize {
        self.features
            .values()
            .next()
            .map(FeatureTensor::batch_size)
            .unwrap_or(0)
    }
}

#[derive(Config, Debug)]
pub struct TableEncoderConfig {
    /// Embedding width every column is encoded to
    pub hidden_dim: usize,

    /// Activation for the numerical encoder's projection
    pub numerical_activation: Option<EncoderActivation>,
}

impl TableEncoderConfig {
    /// Build one encoder per column type in `stats`. The table's iteration order
    /// becomes the column order of every forward pass.
    pub fn init<B: Backend>(
        &self,
        stats: &ColumnStatsTable,
        device: &B::Device,
    ) -> common::Result<TableEncoder<B>> {
        if stats.is_empty() {
            return Err(Error::InvalidConfig(
                "statistics table has no columns".to_string(),
            ));
        }

        let mut numerical = None;
        let mut categorical = None;
        let mut column_order = Vec::new();
        let mut column_names = Vec::new();

        for (column_type, group) in stats.iter() {
            if LinearEncoder::<B>::supports(column_type) {
                numerical = Some(
                    LinearEncoderConfig::new(group.len(), self.hidden_dim)
                        .with_activation(self.numerical_activation)
                        .init(group, device)?,
                );
            } else if EmbeddingEncoder::<B>::supports(column_type) {
                categorical = Some(
                    EmbeddingEncoderConfig::new(group.len(), self.hidden_dim)
                        .init(group, device)?,
                );
            }
            debug!("{} {column_type} columns", group.len());
            column_order.push(column_type);
            column_names.extend(group.iter().map(|c| c.name().to_string()));
        }

        Ok(TableEncoder {
            numerical,
            categorical,
            column_order: Ignored(column_order),
            column_names: Ignored(column_names),
            hidden_dim: self.hidden_dim,
        })
    }
}

/// Owns one encoder per column type and the fixed order their outputs are concatenated in.
#[derive(Module, Debug)]
pub struct TableEncoder<B: Backend> {
    pub(crate) numerical: Option<LinearEncoder<B>>,
    categorical: Option<EmbeddingEncoder<B>>,
    column_order: Ignored<Vec<ColumnType>>,
    column_names: Ignored<Vec<String>>,
    hidden_dim: usize,
}

impl<B: Backend> TableEncoder<B> {
    fn encode_group(&self, column_type: ColumnType, feat: FeatureTensor<B>) -> common::Result<Tensor<B, 3>> {
        let missing = || Error::MissingStats { column_type };
        if LinearEncoder::<B>::supports(column_type) {
            self.numerical.as_ref().ok_or_else(missing)?.encode(feat)
        } else if EmbeddingEncoder::<B>::supports(column_type) {
            self.categorical.as_ref().ok_or_else(missing)?.encode(feat)
        } else {
            Err(missing())
        }
    }

    /// Encode a raw batch.
    ///
    /// Every column type this encoder was built with must be present, and no others,
    /// with the same non-zero number of rows.
    /// Output: `[batch, num_columns, hidden_dim]`, columns in construction order.
    pub fn forward(&self, batch: &TableBatch<B>) -> common::Result<Tensor<B, 3>> {
        if let Some(column_type) = batch
            .column_types()
            .find(|ty| !self.column_order.0.contains(ty))
        {
            return Err(Error::UnexpectedFeatures { column_type });
        }

        let batch_size = batch.batch_size();
        let mut embeddings = Vec::with_capacity(self.column_order.0.len());
        for &column_type in &self.column_order.0 {
            let feat = batch
                .get(column_type)
                .cloned()
                .ok_or(Error::MissingFeatures { column_type })?;
            if batch_size == 0 || feat.batch_size() != batch_size {
                return Err(Error::FeatureShapeMismatch {
                    column_type,
                    expected: format!("non-empty batch of {batch_size} rows"),
                    found: feat.dims(),
                });
            }
            embeddings.push(self.encode_group(column_type, feat)?);
        }

        Ok(Tensor::cat(embeddings, 1))
    }

    pub fn num_columns(&self) -> usize {
        self.column_names.0.len()
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Column types in the order their columns appear in the encoded tensor.
    pub fn column_order(&self) -> &[ColumnType] {
        &self.column_order.0
    }

    /// Column names in the order they appear in the encoded tensor.
    pub fn column_names(&self) -> &[String] {
        &self.column_names.0
    }
}
