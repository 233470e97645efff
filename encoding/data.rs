//! # Data Loading and Validation
//!
//! Reads pre-processed observation tables and turns them into validated
//! [`ChordDataset`]s. The analysis driver only talks to the [`DatasetSource`] trait,
//! so in-memory sources can stand in for files.
//!
//! - Fixed layout: one tab-separated file per participant and region at
//!   `<root>/<participant>/<region>.tsv`.
//! - Fixed schema: the first two columns are `run` and `chord`; every further
//!   column is one measurement channel. Channel names are kept but otherwise
//!   unused.
//! - Failures are assumed to be user-input errors and say which file and row are
//!   at fault.

use crate::dataset::ChordDataset;
use crate::error::ConfigurationError;

use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error reading '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed table '{path}': {source}")]
    Csv {
        path: PathBuf,
        source: csv::Error,
    },

    #[error(
        "The required column '{column}' was not found in '{path}'. The first two columns must be 'run' and 'chord'."
    )]
    ColumnNotFound { path: PathBuf, column: &'static str },

    #[error("'{path}' has no measurement channel columns.")]
    NoChannels { path: PathBuf },

    #[error("'{path}' row {row}, column '{column}': cannot parse '{value}' as a number.")]
    NotNumeric {
        path: PathBuf,
        row: usize,
        column: String,
        value: String,
    },

    #[error("'{path}' row {row}, column '{column}': non-finite value.")]
    NonFinite {
        path: PathBuf,
        row: usize,
        column: String,
    },

    #[error("'{path}' row {row} has {found} fields, expected {expected}.")]
    RaggedRow {
        path: PathBuf,
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("'{path}': {source}")]
    Invalid {
        path: PathBuf,
        source: ConfigurationError,
    },
}

/// Anything that can produce the observations of one participant and region.
pub trait DatasetSource: Sync {
    fn load(&self, participant: &str, region: &str) -> Result<ChordDataset, DataError>;
}

/// Observation tables laid out as `<root>/<participant>/<region>.tsv`.
#[derive(Debug, Clone)]
pub struct TsvDirectory {
    root: PathBuf,
}

impl TsvDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, participant: &str, region: &str) -> PathBuf {
        self.root.join(participant).join(format!("{region}.tsv"))
    }
}

impl DatasetSource for TsvDirectory {
    fn load(&self, participant: &str, region: &str) -> Result<ChordDataset, DataError> {
        load_table(&self.path_for(participant, region))
    }
}

/// Reads one observation table.
pub fn load_table(path: &Path) -> Result<ChordDataset, DataError> {
    let file = std::fs::File::open(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let csv_err = |source: csv::Error| DataError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let header: Vec<String> = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    for (position, column) in [(0, "run"), (1, "chord")] {
        if header.get(position).map(String::as_str) != Some(column) {
            return Err(DataError::ColumnNotFound {
                path: path.to_path_buf(),
                column,
            });
        }
    }
    let channels = header.len() - 2;
    if channels == 0 {
        return Err(DataError::NoChannels {
            path: path.to_path_buf(),
        });
    }

    let mut runs = Vec::new();
    let mut chords = Vec::new();
    let mut values = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(csv_err)?;
        // 1-based, counting the header line.
        let row = i + 2;
        if record.len() != header.len() {
            return Err(DataError::RaggedRow {
                path: path.to_path_buf(),
                row,
                found: record.len(),
                expected: header.len(),
            });
        }

        let number = |col: usize| -> Result<f64, DataError> {
            let raw = record.get(col).unwrap_or("").trim();
            let value: f64 = raw.parse().map_err(|_| DataError::NotNumeric {
                path: path.to_path_buf(),
                row,
                column: header[col].clone(),
                value: raw.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFinite {
                    path: path.to_path_buf(),
                    row,
                    column: header[col].clone(),
                });
            }
            Ok(value)
        };

        runs.push(integer(number(0)?, path, row, &header[0])?);
        chords.push(integer(number(1)?, path, row, &header[1])?);
        for col in 2..header.len() {
            values.push(number(col)?);
        }
    }

    let y = Array2::from_shape_vec((runs.len(), channels), values).map_err(|_| {
        DataError::NoChannels {
            path: path.to_path_buf(),
        }
    })?;
    ChordDataset::new(y, runs, chords).map_err(|source| DataError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

fn integer(value: f64, path: &Path, row: usize, column: &str) -> Result<i64, DataError> {
    if value.fract() != 0.0 {
        return Err(DataError::NotNumeric {
            path: path.to_path_buf(),
            row,
            column: column.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value as i64)
}
