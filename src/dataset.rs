//! Host-side tables for the training driver.
//!
//! The model itself only ever sees [`TableBatch`]es; this module holds rows in plain
//! vectors, splits them, and cuts them into batches on whatever backend the caller
//! trains or evaluates on.

use burn::prelude::*;
use indexmap::IndexMap;
use rand::Rng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution as _, Normal};

use crate::common::{ColumnStats, ColumnStatsTable, ColumnType, Error, Result};
use crate::encoder::FeatureTensor;
use crate::table_encoder::TableBatch;

/// Row-major values of one column-type group.
#[derive(Debug, Clone, PartialEq)]
pub enum HostColumns {
    Numerical { num_columns: usize, values: Vec<f32> },
    Categorical { num_columns: usize, values: Vec<i64> },
}

impl HostColumns {
    pub fn num_columns(&self) -> usize {
        match self {
            HostColumns::Numerical { num_columns, .. }
            | HostColumns::Categorical { num_columns, .. } => *num_columns,
        }
    }

    fn num_values(&self) -> usize {
        match self {
            HostColumns::Numerical { values, .. } => values.len(),
            HostColumns::Categorical { values, .. } => values.len(),
        }
    }

    fn select_rows(&self, rows: &[usize]) -> Self {
        fn gather<T: Copy>(values: &[T], num_columns: usize, rows: &[usize]) -> Vec<T> {
            rows.iter()
                .flat_map(|&r| values[r * num_columns..(r + 1) * num_columns].iter().copied())
                .collect()
        }
        match self {
            HostColumns::Numerical {
                num_columns,
                values,
            } => HostColumns::Numerical {
                num_columns: *num_columns,
                values: gather(values, *num_columns, rows),
            },
            HostColumns::Categorical {
                num_columns,
                values,
            } => HostColumns::Categorical {
                num_columns: *num_columns,
                values: gather(values, *num_columns, rows),
            },
        }
    }
}

/// A table of rows held in host memory: feature groups keyed by column type plus
/// one integer class label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryTable {
    groups: IndexMap<ColumnType, HostColumns>,
    labels: Vec<i64>,
}

/// Train / validation / test partitions of one table.
#[derive(Debug, Clone)]
pub struct DataSplits {
    pub train: InMemoryTable,
    pub val: InMemoryTable,
    pub test: InMemoryTable,
}

impl InMemoryTable {
    pub fn new(labels: Vec<i64>) -> Self {
        Self {
            groups: IndexMap::new(),
            labels,
        }
    }

    fn with_group(mut self, column_type: ColumnType, columns: HostColumns) -> Result<Self> {
        if columns.num_values() != columns.num_columns() * self.labels.len() {
            return Err(Error::InvalidConfig(format!(
                "{column_type} group has {} values, expected {} rows x {} columns",
                columns.num_values(),
                self.labels.len(),
                columns.num_columns()
            )));
        }
        self.groups.insert(column_type, columns);
        Ok(self)
    }

    /// Add `num_columns` numerical columns, `values` row-major.
    pub fn with_numerical(self, num_columns: usize, values: Vec<f32>) -> Result<Self> {
        self.with_group(
            ColumnType::Numerical,
            HostColumns::Numerical {
                num_columns,
                values,
            },
        )
    }

    /// Add `num_columns` categorical columns, `values` row-major category indices.
    pub fn with_categorical(self, num_columns: usize, values: Vec<i64>) -> Result<Self> {
        self.with_group(
            ColumnType::Categorical,
            HostColumns::Categorical {
                num_columns,
                values,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[i64] {
        &self.labels
    }

    pub fn group(&self, column_type: ColumnType) -> Option<&HostColumns> {
        self.groups.get(&column_type)
    }

    /// Number of distinct classes, assuming labels are `0..n`.
    pub fn num_classes(&self) -> usize {
        self.labels.iter().max().map(|&m| m as usize + 1).unwrap_or(0)
    }

    /// A new table holding `rows` in the given order.
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            groups: self
                .groups
                .iter()
                .map(|(ty, columns)| (*ty, columns.select_rows(rows)))
                .collect(),
            labels: rows.iter().map(|&r| self.labels[r]).collect(),
        }
    }

    /// Shuffle rows and split them into train/val/test by ratio; the test split takes
    /// whatever remains.
    pub fn split<R: Rng>(&self, train_ratio: f64, val_ratio: f64, rng: &mut R) -> Result<DataSplits> {
        if train_ratio < 0.0 || val_ratio < 0.0 || train_ratio + val_ratio > 1.0 {
            return Err(Error::InvalidConfig(format!(
                "split ratios must be non-negative and sum to at most 1 (train {train_ratio}, val {val_ratio})"
            )));
        }
        let mut rows: Vec<usize> = (0..self.len()).collect();
        rows.shuffle(rng);

        let num_train = (self.len() as f64 * train_ratio).round() as usize;
        let num_val = ((self.len() as f64 * val_ratio).round() as usize).min(self.len() - num_train);
        let (train, rest) = rows.split_at(num_train);
        let (val, test) = rest.split_at(num_val);

        Ok(DataSplits {
            train: self.select(train),
            val: self.select(val),
            test: self.select(test),
        })
    }

    /// Row indices chunked into batches of at most `batch_size`, shuffled if `rng` is given.
    pub fn batch_rows<R: Rng>(&self, batch_size: usize, rng: Option<&mut R>) -> Vec<Vec<usize>> {
        let mut rows: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            rows.shuffle(rng);
        }
        rows.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
    }

    /// Every row of the table as `(features, labels)` batches on `device`.
    pub fn batches<'a, B: Backend, R: Rng>(
        &'a self,
        batch_size: usize,
        rng: Option<&mut R>,
        device: &'a B::Device,
    ) -> impl Iterator<Item = (TableBatch<B>, Tensor<B, 1, Int>)> + 'a {
        self.batch_rows(batch_size, rng)
            .into_iter()
            .map(move |rows| self.batch::<B>(&rows, device))
    }

    /// Materialize `rows` as a batch on `device`: features plus `[batch]` labels.
    pub fn batch<B: Backend>(&self, rows: &[usize], device: &B::Device) -> (TableBatch<B>, Tensor<B, 1, Int>) {
        let subset = self.select(rows);
        let batch_size = rows.len();

        let mut batch = TableBatch::new();
        for (column_type, columns) in &subset.groups {
            let feat = match columns {
                HostColumns::Numerical {
                    num_columns,
                    values,
                } => FeatureTensor::Numeric(Tensor::from_data(
                    TensorData::new(values.clone(), [batch_size, *num_columns]),
                    device,
                )),
                HostColumns::Categorical {
                    num_columns,
                    values,
                } => FeatureTensor::Categorical(Tensor::from_data(
                    TensorData::new(values.clone(), [batch_size, *num_columns]),
                    device,
                )),
            };
            batch.insert(*column_type, feat);
        }

        let labels = Tensor::from_data(TensorData::new(subset.labels, [batch_size]), device);
        (batch, labels)
    }
}

// ============================================================================
// Synthetic data
// ============================================================================

const PCLASS_FARE: [f32; 3] = [84.0, 21.0, 13.0];

/// A Titanic-shaped synthetic table: categorical `pclass`, `sex`, `embarked` and
/// numerical `age`, `fare`, `sibsp`, `parch`, with a binary "survived" label that
/// depends on sex, class, age and fare. Returns the table and its column statistics.
pub fn synthetic_titanic<R: Rng>(num_rows: usize, rng: &mut R) -> Result<(ColumnStatsTable, InMemoryTable)> {
    let age_dist = Normal::new(29.7f32, 14.5).map_err(|e| Error::InvalidConfig(e.to_string()))?;
    let noise = Normal::new(0.0f32, 0.5).map_err(|e| Error::InvalidConfig(e.to_string()))?;

    let mut categorical = Vec::with_capacity(num_rows * 3);
    let mut numerical = Vec::with_capacity(num_rows * 4);
    let mut labels = Vec::with_capacity(num_rows);

    for _ in 0..num_rows {
        let pclass = rng.random_range(0..3usize);
        let sex = rng.random_range(0..2i64);
        let embarked = if rng.random_bool(0.02) { -1 } else { rng.random_range(0..3i64) };
        let age = age_dist.sample(rng).clamp(0.5, 80.0);
        let fare = PCLASS_FARE[pclass] * (0.5 + rng.random::<f32>());
        let sibsp = rng.random_range(0..4) as f32;
        let parch = rng.random_range(0..3) as f32;

        let score = 2.5 * sex as f32 - 1.0 * pclass as f32 - 0.03 * (age - 30.0)
            + 0.01 * fare
            - 0.2 * sibsp
            + noise.sample(rng);

        categorical.extend([pclass as i64, sex, embarked]);
        numerical.extend([age, fare, sibsp, parch]);
        labels.push(i64::from(score > 0.0));
    }

    let names = ["age", "fare", "sibsp", "parch"];
    let numerical_stats = names
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let column: Vec<f64> = numerical.iter().skip(c).step_by(4).map(|&v| v as f64).collect();
            let n = column.len().max(1) as f64;
            let mean = column.iter().sum::<f64>() / n;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            ColumnStats::numerical(*name, mean, var.sqrt())
        })
        .collect();

    let stats = ColumnStatsTable::new()
        .with_group(
            ColumnType::Categorical,
            vec![
                ColumnStats::categorical("pclass", 3),
                ColumnStats::categorical("sex", 2),
                ColumnStats::categorical("embarked", 3),
            ],
        )
        .with_group(ColumnType::Numerical, numerical_stats);

    let table = InMemoryTable::new(labels)
        .with_categorical(3, categorical)?
        .with_numerical(4, numerical)?;

    Ok((stats, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::{SeedableRng, rngs::StdRng};
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn small_table() -> InMemoryTable {
        InMemoryTable::new(vec![0, 1, 1, 0, 1])
            .with_numerical(2, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0, 5.0, 50.0])
            .unwrap()
            .with_categorical(1, vec![0, 1, 2, 0, 1])
            .unwrap()
    }

    #[test]
    fn test_group_length_is_checked() {
        let err = InMemoryTable::new(vec![0, 1])
            .with_numerical(2, vec![1.0, 2.0, 3.0])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_select_keeps_rows_together() {
        let table = small_table().select(&[3, 0]);
        assert_eq!(table.labels(), &[0, 0]);
        assert_eq!(
            table.group(ColumnType::Numerical),
            Some(&HostColumns::Numerical {
                num_columns: 2,
                values: vec![4.0, 40.0, 1.0, 10.0]
            })
        );
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let mut rng = StdRng::seed_from_u64(7);
        let (_, table) = synthetic_titanic(100, &mut rng).unwrap();
        let splits = table.split(0.8, 0.1, &mut rng).unwrap();
        assert_eq!(splits.train.len(), 80);
        assert_eq!(splits.val.len(), 10);
        assert_eq!(splits.test.len(), 10);

        let fingerprint = |t: &InMemoryTable| -> HashSet<u32> {
            match t.group(ColumnType::Numerical).unwrap() {
                HostColumns::Numerical { values, .. } => {
                    values.chunks(4).map(|row| (row[0] * 1000.0).to_bits() ^ row[1].to_bits()).collect()
                }
                _ => unreachable!(),
            }
        };
        let train = fingerprint(&splits.train);
        assert!(fingerprint(&splits.val).is_disjoint(&train));
        assert!(fingerprint(&splits.test).is_disjoint(&train));
    }

    #[test]
    fn test_bad_split_ratios_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(small_table().split(0.9, 0.2, &mut rng).is_err());
    }

    #[test]
    fn test_batch_rows_cover_every_row_once() {
        let mut rng = StdRng::seed_from_u64(1);
        let batches = small_table().batch_rows(2, Some(&mut rng));
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_batch_tensors() {
        let device = Default::default();
        let (batch, labels) = small_table().batch::<TestBackend>(&[1, 4], &device);
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.get(ColumnType::Numerical).unwrap().dims(), vec![2, 2]);
        assert_eq!(batch.get(ColumnType::Categorical).unwrap().dims(), vec![2, 1]);
        let labels = labels.into_data().convert::<i64>().to_vec::<i64>().unwrap();
        assert_eq!(labels, vec![1, 1]);
    }

    #[test]
    fn test_batches_yield_every_label() {
        let device = Default::default();
        let mut labels = Vec::new();
        for (batch, batch_labels) in small_table().batches::<TestBackend, StdRng>(2, None, &device) {
            assert_eq!(batch.batch_size(), batch_labels.dims()[0]);
            labels.extend(batch_labels.into_data().convert::<i64>().to_vec::<i64>().unwrap());
        }
        assert_eq!(labels, vec![0, 1, 1, 0, 1]);
    }

    #[test]
    fn test_synthetic_stats_match_table() {
        let mut rng = StdRng::seed_from_u64(42);
        let (stats, table) = synthetic_titanic(500, &mut rng).unwrap();
        assert_eq!(stats.num_columns(), 7);
        assert_eq!(table.len(), 500);
        assert_eq!(table.num_classes(), 2);
        let ColumnStats::Numerical { mean, std, .. } = &stats.get(ColumnType::Numerical).unwrap()[0] else {
            panic!("age should be numerical");
        };
        assert!((mean - 29.7).abs() < 3.0, "age mean {mean}");
        assert!(*std > 5.0);
    }
}
