//! Common types used throughout the crate: column types, per-column statistics,
//! the statistics table that fixes a model's column order, and the error type.

use std::fmt;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Added to every column's standard deviation before dividing, so a column with
/// zero variance standardizes to 0 instead of NaN.
pub const STD_EPSILON: f32 = 1e-6;

// ============================================================================
// Column Types
// ============================================================================

/// Table columns have a "column type": the *meaning* of the data, which decides
/// which encoder handles the column and which statistics it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ColumnType {
    Numerical = 0,
    Categorical = 1,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Numerical => write!(f, "numerical"),
            ColumnType::Categorical => write!(f, "categorical"),
        }
    }
}

/// Names of the individual statistics a column type requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatType {
    Mean,
    Std,
    NumCategories,
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatType::Mean => write!(f, "mean"),
            StatType::Std => write!(f, "std"),
            StatType::NumCategories => write!(f, "num_categories"),
        }
    }
}

// ============================================================================
// Per-Column Statistics
// ============================================================================

/// Per-column statistics, computed upstream before the model is built.
/// Each variant carries only the stats meaningful for that column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnStats {
    /// Numerical columns: z-score normalization parameters.
    Numerical { name: String, mean: f64, std: f64 },

    /// Categorical columns: vocabulary size. Valid category indices are
    /// `0..num_categories`; anything else is treated as missing.
    Categorical { name: String, num_categories: usize },
}

impl ColumnStats {
    pub fn numerical(name: impl Into<String>, mean: f64, std: f64) -> Self {
        ColumnStats::Numerical {
            name: name.into(),
            mean,
            std,
        }
    }

    pub fn categorical(name: impl Into<String>, num_categories: usize) -> Self {
        ColumnStats::Categorical {
            name: name.into(),
            num_categories,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnStats::Numerical { .. } => ColumnType::Numerical,
            ColumnStats::Categorical { .. } => ColumnType::Categorical,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ColumnStats::Numerical { name, .. } | ColumnStats::Categorical { name, .. } => name,
        }
    }
}

/// The column statistics table: an ordered mapping from column type to the stats
/// of every column of that type.
///
/// Iteration order is insertion order, and it is the order a model lays its columns
/// out in. The table is built once before the model and never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnStatsTable {
    groups: IndexMap<ColumnType, Vec<ColumnStats>>,
}

impl ColumnStatsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group of columns. Builder-style; replacing an existing group keeps its
    /// original position.
    pub fn with_group(mut self, column_type: ColumnType, stats: Vec<ColumnStats>) -> Self {
        self.groups.insert(column_type, stats);
        self
    }

    /// Stats for one column type, if present.
    pub fn get(&self, column_type: ColumnType) -> Option<&[ColumnStats]> {
        self.groups.get(&column_type).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ColumnType, &[ColumnStats])> {
        self.groups.iter().map(|(ty, stats)| (*ty, stats.as_slice()))
    }

    pub fn column_types(&self) -> impl Iterator<Item = ColumnType> + '_ {
        self.groups.keys().copied()
    }

    /// Total number of columns across all groups.
    pub fn num_columns(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_columns() == 0
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a table from a JSON file of the form
    /// `{"numerical": [{"type": "numerical", "name": "age", "mean": 30.0, "std": 10.0}], ...}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Whether an error was raised while building a model or while running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Construction-time: the model cannot be built (or restored) from the given
    /// stats, config or snapshot.
    Configuration,
    /// Forward-time: the caller passed a batch that breaks the model's contract.
    Contract,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("No statistics for {column_type} columns")]
    MissingStats { column_type: ColumnType },

    #[error("Column {index} of the {expected} group has {found} statistics")]
    StatsTypeMismatch {
        expected: ColumnType,
        found: ColumnType,
        index: usize,
    },

    #[error("Column {index} ({name}) has an invalid {stat}: {value}")]
    InvalidStat {
        index: usize,
        name: String,
        stat: StatType,
        value: f64,
    },

    #[error("Declared {declared} {column_type} columns but got statistics for {found}")]
    ColumnCountMismatch {
        column_type: ColumnType,
        declared: usize,
        found: usize,
    },

    #[error("Hidden dim {hidden_dim} is not divisible by {num_heads} heads")]
    HeadsNotDivisible { hidden_dim: usize, num_heads: usize },

    #[error("{component} expects width {expected} but the table encoder produces {found}")]
    HiddenDimMismatch {
        component: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read statistics: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse statistics: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to save or load model state: {0}")]
    Recorder(#[from] burn::record::RecorderError),

    #[error("Batch has no features for {column_type} columns")]
    MissingFeatures { column_type: ColumnType },

    #[error("Batch has {column_type} features but the model has no {column_type} columns")]
    UnexpectedFeatures { column_type: ColumnType },

    #[error("{column_type} encoder expects {expected} features, got {found}")]
    FeatureKindMismatch {
        column_type: ColumnType,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{column_type} features have shape {found:?}, expected {expected}")]
    FeatureShapeMismatch {
        column_type: ColumnType,
        expected: String,
        found: Vec<usize>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingFeatures { .. }
            | Error::UnexpectedFeatures { .. }
            | Error::FeatureKindMismatch { .. }
            | Error::FeatureShapeMismatch { .. } => ErrorKind::Contract,
            _ => ErrorKind::Configuration,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn titanic_stats() -> ColumnStatsTable {
        ColumnStatsTable::new()
            .with_group(
                ColumnType::Categorical,
                vec![
                    ColumnStats::categorical("pclass", 3),
                    ColumnStats::categorical("sex", 2),
                    ColumnStats::categorical("embarked", 3),
                ],
            )
            .with_group(
                ColumnType::Numerical,
                vec![
                    ColumnStats::numerical("age", 29.7, 14.5),
                    ColumnStats::numerical("fare", 32.2, 49.7),
                ],
            )
    }

    #[test]
    fn test_table_preserves_insertion_order() {
        let table = titanic_stats();
        let order: Vec<_> = table.column_types().collect();
        assert_eq!(order, vec![ColumnType::Categorical, ColumnType::Numerical]);
        assert_eq!(table.num_columns(), 5);
        assert_eq!(table.get(ColumnType::Numerical).unwrap()[1].name(), "fare");
    }

    #[test]
    fn test_table_json_round_trip_keeps_order() {
        let table = titanic_stats();
        let json = table.to_json_string().unwrap();
        let parsed = ColumnStatsTable::from_json_str(&json).unwrap();
        assert_eq!(parsed, table);
        assert_eq!(
            parsed.column_types().collect::<Vec<_>>(),
            vec![ColumnType::Categorical, ColumnType::Numerical]
        );
    }

    #[test]
    fn test_malformed_stats_fail_to_load() {
        // Numerical record without a std.
        let json = r#"{"numerical": [{"type": "numerical", "name": "age", "mean": 30.0}]}"#;
        let err = ColumnStatsTable::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_error_kinds() {
        let err = Error::MissingFeatures {
            column_type: ColumnType::Numerical,
        };
        assert_eq!(err.kind(), ErrorKind::Contract);
        let err = Error::HeadsNotDivisible {
            hidden_dim: 30,
            num_heads: 8,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
