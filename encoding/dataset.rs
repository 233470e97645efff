//! Observation tables for one participant and region.
//!
//! A dataset is a matrix of (chord x run) observations by measurement channels,
//! with parallel run and chord vectors. Cross-validation folds are defined by run
//! id, never by row position.

use crate::chords::{Chord, NUM_CHORDS};
use crate::error::ConfigurationError;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug)]
pub struct ChordDataset {
    y: Array2<f64>,
    runs: Vec<i64>,
    chords: Vec<Chord>,
}

impl ChordDataset {
    /// Validates and wraps an observation matrix.
    ///
    /// Every (chord, run) combination that occurs must occur the same number of
    /// times, and at least two runs are required to form folds.
    pub fn new(
        y: Array2<f64>,
        runs: Vec<i64>,
        chord_ids: Vec<i64>,
    ) -> Result<Self, ConfigurationError> {
        let rows = y.nrows();
        if runs.len() != rows {
            return Err(ConfigurationError::LengthMismatch {
                name: "run",
                rows,
                len: runs.len(),
            });
        }
        if chord_ids.len() != rows {
            return Err(ConfigurationError::LengthMismatch {
                name: "chord",
                rows,
                len: chord_ids.len(),
            });
        }
        if y.ncols() == 0 {
            return Err(ConfigurationError::NoChannels);
        }

        let chords = chord_ids
            .iter()
            .map(|&id| Chord::from_id(id).ok_or(ConfigurationError::InvalidChord(id)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts: BTreeMap<(i64, Chord), usize> = BTreeMap::new();
        for (&run, &chord) in runs.iter().zip(chords.iter()) {
            *counts.entry((run, chord)).or_default() += 1;
        }
        let distinct_runs: BTreeSet<i64> = runs.iter().copied().collect();
        if distinct_runs.len() < 2 {
            return Err(ConfigurationError::TooFewRuns(distinct_runs.len()));
        }
        if let Some((_, &expected)) = counts.iter().next() {
            if let Some((&(run, chord), &found)) = counts.iter().find(|(_, n)| **n != expected) {
                return Err(ConfigurationError::InconsistentRowCounts {
                    chord: chord.id(),
                    run,
                    found,
                    expected,
                });
            }
        }

        Ok(Self { y, runs, chords })
    }

    pub fn observations(&self) -> ArrayView2<'_, f64> {
        self.y.view()
    }

    pub fn channels(&self) -> usize {
        self.y.ncols()
    }

    pub fn rows(&self) -> usize {
        self.y.nrows()
    }

    pub fn chords(&self) -> &[Chord] {
        &self.chords
    }

    /// Distinct run ids, ascending.
    pub fn runs(&self) -> Vec<i64> {
        self.runs
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Rows belonging to runs accepted by `keep`.
    pub fn subset(&self, keep: impl Fn(i64) -> bool) -> Subset {
        let indices: Vec<usize> = (0..self.rows()).filter(|&i| keep(self.runs[i])).collect();
        Subset {
            y: self.y.select(Axis(0), &indices),
            chords: indices.iter().map(|&i| self.chords[i]).collect(),
            runs: indices.iter().map(|&i| self.runs[i]).collect(),
        }
    }

    /// Training rows (every other run) and test rows (`test_run` only).
    pub fn split(&self, test_run: i64) -> (Subset, Subset) {
        (
            self.subset(|run| run != test_run),
            self.subset(|run| run == test_run),
        )
    }
}

/// A row subset of a dataset; owns its copy of the observations.
#[derive(Clone, Debug)]
pub struct Subset {
    pub y: Array2<f64>,
    pub chords: Vec<Chord>,
    pub runs: Vec<i64>,
}

impl Subset {
    /// Average pattern of every chord present in the subset.
    pub fn chord_means(&self) -> ChordMeans {
        let mut sums: BTreeMap<Chord, (Array1<f64>, usize)> = BTreeMap::new();
        for (row, &chord) in self.y.axis_iter(Axis(0)).zip(self.chords.iter()) {
            let entry = sums
                .entry(chord)
                .or_insert_with(|| (Array1::zeros(self.y.ncols()), 0));
            entry.0 += &row;
            entry.1 += 1;
        }

        let chords: Vec<Chord> = sums.keys().copied().collect();
        let mut patterns = Array2::zeros((chords.len(), self.y.ncols()));
        for (mut out, (sum, count)) in patterns.axis_iter_mut(Axis(0)).zip(sums.values()) {
            out.assign(&(sum / *count as f64));
        }
        ChordMeans { chords, patterns }
    }
}

/// Per-chord mean patterns for the chords that were observed, canonical order.
#[derive(Clone, Debug)]
pub struct ChordMeans {
    pub chords: Vec<Chord>,
    pub patterns: Array2<f64>,
}

impl ChordMeans {
    /// Row indices of these chords within a 31-row chord-indexed matrix.
    pub fn chord_rows(&self) -> Vec<usize> {
        self.chords.iter().map(|c| c.index()).collect()
    }

    /// Rows of a full 31-row prediction restricted to the observed chords.
    pub fn align(&self, full: ArrayView2<f64>) -> Array2<f64> {
        debug_assert_eq!(full.nrows(), NUM_CHORDS);
        full.select(Axis(0), &self.chord_rows())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_run_dataset() -> ChordDataset {
        let y = array![
            [1.0, 2.0, 3.0],
            [4.0, 5.0, 6.0],
            [3.0, 2.0, 1.0],
            [6.0, 5.0, 4.0],
        ];
        ChordDataset::new(y, vec![1, 1, 2, 2], vec![1, 7, 1, 7]).unwrap()
    }

    #[test]
    fn split_is_by_run_not_by_row() {
        let data = two_run_dataset();
        assert_eq!(data.runs(), vec![1, 2]);
        let (train, test) = data.split(2);
        assert_eq!(train.runs, vec![1, 1]);
        assert_eq!(test.runs, vec![2, 2]);
        assert_eq!(test.y.row(0).to_vec(), vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn chord_means_average_repeated_rows() {
        let data = two_run_dataset();
        let all = data.subset(|_| true);
        let means = all.chord_means();
        assert_eq!(means.chords.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![1, 7]);
        assert_eq!(means.patterns.row(0).to_vec(), vec![2.0, 2.0, 2.0]);
        assert_eq!(means.patterns.row(1).to_vec(), vec![5.0, 5.0, 5.0]);
        assert_eq!(means.chord_rows(), vec![0, 6]);
    }

    #[test]
    fn rejects_single_run() {
        let y = Array2::zeros((2, 3));
        assert_eq!(
            ChordDataset::new(y, vec![4, 4], vec![1, 2]).unwrap_err(),
            ConfigurationError::TooFewRuns(1)
        );
    }

    #[test]
    fn rejects_out_of_range_chords() {
        let y = Array2::zeros((2, 3));
        assert_eq!(
            ChordDataset::new(y, vec![1, 2], vec![1, 32]).unwrap_err(),
            ConfigurationError::InvalidChord(32)
        );
    }

    #[test]
    fn rejects_unbalanced_chord_run_counts() {
        let y = Array2::zeros((3, 2));
        let err = ChordDataset::new(y, vec![1, 1, 2], vec![3, 3, 3]).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::InconsistentRowCounts {
                chord: 3,
                found: 1,
                expected: 2,
                ..
            }
        ));
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let y = Array2::zeros((3, 2));
        assert!(matches!(
            ChordDataset::new(y, vec![1, 2], vec![1, 2, 3]),
            Err(ConfigurationError::LengthMismatch { name: "run", .. })
        ));
    }
}
