//! # Region-Level Chord Prior
//!
//! The prior covariance of a region is estimated from the data of all its
//! participants. For one participant with per-run chord mean patterns `A_r`
//! (31 x P), the cross-run second moment
//!
//! ```text
//! G_p = 1 / (R (R - 1)) · Σ_{r ≠ s} A_r A_sᵀ / P
//! ```
//!
//! is unbiased for the signal covariance because measurement noise is independent
//! across runs. The region prior averages `G_p` over participants and is projected
//! onto the positive-semidefinite cone.

use crate::chords::NUM_CHORDS;
use crate::dataset::ChordDataset;
use crate::linalg::nearest_psd;

use ndarray::Array2;
use ndarray_linalg::error::LinalgError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PriorError {
    #[error("Run {run} of participant #{participant} covers {found} of the 31 chords.")]
    IncompleteRun {
        participant: usize,
        run: i64,
        found: usize,
    },

    #[error("No participants left to estimate the prior from.")]
    NoParticipants,

    #[error("Projection onto the PSD cone failed: {0}")]
    Decomposition(#[from] LinalgError),
}

/// Which participants contribute to the prior used for a given participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorMode {
    /// Everyone in the region, including the participant being fitted.
    #[default]
    Pooled,
    /// Everyone except the participant being fitted.
    LeaveOneParticipantOut,
}

/// Cross-run second moment of one participant's chord patterns.
pub fn participant_moment(index: usize, dataset: &ChordDataset) -> Result<Array2<f64>, PriorError> {
    let runs = dataset.runs();
    let channels = dataset.channels() as f64;

    let mut total = Array2::<f64>::zeros((NUM_CHORDS, dataset.channels()));
    let mut within = Array2::<f64>::zeros((NUM_CHORDS, NUM_CHORDS));
    for &run in &runs {
        let means = dataset.subset(|r| r == run).chord_means();
        if means.chords.len() != NUM_CHORDS {
            return Err(PriorError::IncompleteRun {
                participant: index,
                run,
                found: means.chords.len(),
            });
        }
        within += &means.patterns.dot(&means.patterns.t());
        total += &means.patterns;
    }

    let pairs = (runs.len() * (runs.len() - 1)) as f64;
    let cross = total.dot(&total.t()) - within;
    Ok(cross / (pairs * channels))
}

/// Per-participant moments of one region, ready to be pooled.
#[derive(Debug, Clone)]
pub struct RegionPrior {
    moments: Vec<Array2<f64>>,
}

impl RegionPrior {
    pub fn new(datasets: &[&ChordDataset]) -> Result<Self, PriorError> {
        let moments = datasets
            .iter()
            .enumerate()
            .map(|(i, d)| participant_moment(i, d))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_moments(moments))
    }

    /// Pools moments computed separately, e.g. after dropping participants whose
    /// moment could not be formed.
    pub fn from_moments(moments: Vec<Array2<f64>>) -> Self {
        Self { moments }
    }

    /// Prior for the participant at `index` (position in the slice passed to `new`).
    /// `None` is a participant that does not contribute a moment; it is fitted
    /// against every contributing participant in either mode.
    pub fn prior_for(&self, mode: PriorMode, index: Option<usize>) -> Result<Array2<f64>, PriorError> {
        let mut sum = Array2::<f64>::zeros((NUM_CHORDS, NUM_CHORDS));
        let mut count = 0usize;
        for (i, moment) in self.moments.iter().enumerate() {
            if mode == PriorMode::LeaveOneParticipantOut && Some(i) == index {
                continue;
            }
            sum += moment;
            count += 1;
        }
        if count == 0 {
            return Err(PriorError::NoParticipants);
        }
        Ok(nearest_psd((sum / count as f64).view())?)
    }
}

/// Pooled prior over all given participants.
pub fn estimate_prior(datasets: &[&ChordDataset]) -> Result<Array2<f64>, PriorError> {
    RegionPrior::new(datasets)?.prior_for(PriorMode::Pooled, None)
}
