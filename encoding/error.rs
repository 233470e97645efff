use thiserror::Error;

/// Errors that make a participant/region unit unusable before any fold is fitted.
///
/// These abort the affected unit only; callers isolate them per unit.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error(
        "Unknown model '{0}'. Expected one of: null, 1finger, 2finger, 3finger, 4finger, 1finger_nonlinear, 2finger_distantPairs, 2finger_adjacentPairs, noise_ceiling."
    )]
    UnknownModel(String),

    #[error("Design matrix for '{model}' has rank {rank} but {columns} columns.")]
    MalformedDesign {
        model: String,
        rank: usize,
        columns: usize,
    },

    #[error(
        "Model '{model}' needs at least {required} measurement channels but only {channels} are available."
    )]
    InsufficientChannels {
        model: String,
        channels: usize,
        required: usize,
    },

    #[error("Chord id {0} is outside the valid range 1..=31.")]
    InvalidChord(i64),

    #[error("Observation matrix has {rows} rows but {name} vector has {len} entries.")]
    LengthMismatch {
        name: &'static str,
        rows: usize,
        len: usize,
    },

    #[error("Cross-validation needs at least two distinct runs, found {0}.")]
    TooFewRuns(usize),

    #[error(
        "Chord {chord} in run {run} has {found} rows, but other chord/run combinations have {expected}."
    )]
    InconsistentRowCounts {
        chord: u8,
        run: i64,
        found: usize,
        expected: usize,
    },

    #[error("Prior covariance must be {expected}x{expected}, got {rows}x{cols}.")]
    PriorShape {
        expected: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Prior covariance contains non-finite entries or is not symmetric.")]
    InvalidPrior,

    #[error("Observation matrix has no channels.")]
    NoChannels,

    #[error("No models were requested.")]
    NoModels,
}
