//! Correlation-based goodness of fit between predicted and reference chord patterns.

use crate::chords::{NUM_CHORDS, NUM_FINGERS, digit_groups};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Subtracts each row's mean across channels.
pub fn center_rows(a: ArrayView2<f64>) -> Array2<f64> {
    let mut centered = a.to_owned();
    for mut row in centered.axis_iter_mut(Axis(0)) {
        let mean = row.mean().unwrap_or(0.0);
        row -= mean;
    }
    centered
}

/// The three aggregate sums behind a pooled Pearson correlation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitStatistics {
    pub reference_ss: f64,
    pub prediction_ss: f64,
    pub cross_product: f64,
}

impl FitStatistics {
    /// Sums over all chords and channels jointly, after centering every chord's
    /// pattern on its own channel mean.
    pub fn compute(prediction: ArrayView2<f64>, reference: ArrayView2<f64>) -> Self {
        debug_assert_eq!(prediction.dim(), reference.dim());
        let p = center_rows(prediction);
        let r = center_rows(reference);
        Self {
            reference_ss: r.iter().map(|v| v * v).sum(),
            prediction_ss: p.iter().map(|v| v * v).sum(),
            cross_product: p.iter().zip(r.iter()).map(|(a, b)| a * b).sum(),
        }
    }

    /// Pearson's R, or NaN when either sum of squares is zero.
    pub fn correlation(&self) -> f64 {
        if self.reference_ss == 0.0 || self.prediction_ss == 0.0 {
            return f64::NAN;
        }
        self.cross_product / (self.reference_ss * self.prediction_ss).sqrt()
    }
}

/// Convenience for `FitStatistics::compute(..).correlation()`.
pub fn correlation(prediction: ArrayView2<f64>, reference: ArrayView2<f64>) -> f64 {
    FitStatistics::compute(prediction, reference).correlation()
}

/// Average predicted activity per number of stimulated fingers.
///
/// `raw[k]` is the mean over `k + 1`-finger chords of the across-channel mean
/// activity. `centered[k]` is the same after removing each channel's mean over all
/// 31 chords.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DigitActivity {
    pub raw: [f64; NUM_FINGERS],
    pub centered: [f64; NUM_FINGERS],
}

impl DigitActivity {
    pub fn nan() -> Self {
        Self {
            raw: [f64::NAN; NUM_FINGERS],
            centered: [f64::NAN; NUM_FINGERS],
        }
    }

    /// Profile of a full 31-row prediction.
    pub fn from_prediction(prediction: ArrayView2<f64>) -> Self {
        debug_assert_eq!(prediction.nrows(), NUM_CHORDS);
        let channel_means = prediction.mean_axis(Axis(0));
        let centered_prediction = match channel_means {
            Some(means) => &prediction - &means.insert_axis(Axis(0)),
            None => prediction.to_owned(),
        };

        let profile = |m: ArrayView2<f64>| -> [f64; NUM_FINGERS] {
            let row_means = m.mean_axis(Axis(1));
            let mut out = [f64::NAN; NUM_FINGERS];
            if let Some(row_means) = row_means {
                for (slot, group) in out.iter_mut().zip(digit_groups().iter()) {
                    *slot = group.iter().map(|&i| row_means[i]).sum::<f64>() / group.len() as f64;
                }
            }
            out
        };

        Self {
            raw: profile(prediction),
            centered: profile(centered_prediction.view()),
        }
    }

    /// Element-wise mean over folds; NaN propagates.
    pub fn mean(profiles: &[DigitActivity]) -> Self {
        if profiles.is_empty() {
            return Self::nan();
        }
        let n = profiles.len() as f64;
        let mut out = Self {
            raw: [0.0; NUM_FINGERS],
            centered: [0.0; NUM_FINGERS],
        };
        for p in profiles {
            for k in 0..NUM_FINGERS {
                out.raw[k] += p.raw[k] / n;
                out.centered[k] += p.centered[k] / n;
            }
        }
        out
    }
}
