//! # Pattern Prediction
//!
//! The model family is closed: [`ModelKind`] names its nine members, and each maps
//! to the design whose features are estimated (none for `null`). Predictions are
//! always full 31-row, chord-indexed matrices in canonical order; callers select
//! the rows of the chords they evaluate.
//!
//! The only model with free prediction parameters is `1finger_nonlinear`: the
//! single-finger design with every block of `k`-finger chords (k = 2..=5) scaled by
//! a positive factor. The factors are fitted on log scale through the generic
//! [`Minimizer`] interface.

use crate::chords::{Chord, FeatureDesign, FeatureSet, NUM_CHORDS, NUM_FINGERS, all_chords};
use crate::dataset::ChordMeans;
use crate::error::ConfigurationError;
use crate::evaluate::center_rows;
use crate::optimize::{Minimizer, Objective, SearchStrategy};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of free scale parameters of the nonlinear model (one per digit count 2..=5).
pub const NUM_SCALES: usize = NUM_FINGERS - 1;

/// The encoding-model family, in canonical reporting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelKind {
    Null,
    OneFinger,
    TwoFinger,
    ThreeFinger,
    FourFinger,
    OneFingerNonlinear,
    TwoFingerDistantPairs,
    TwoFingerAdjacentPairs,
    NoiseCeiling,
}

impl ModelKind {
    pub const ALL: [ModelKind; 9] = [
        ModelKind::Null,
        ModelKind::OneFinger,
        ModelKind::TwoFinger,
        ModelKind::ThreeFinger,
        ModelKind::FourFinger,
        ModelKind::OneFingerNonlinear,
        ModelKind::TwoFingerDistantPairs,
        ModelKind::TwoFingerAdjacentPairs,
        ModelKind::NoiseCeiling,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Null => "null",
            ModelKind::OneFinger => "1finger",
            ModelKind::TwoFinger => "2finger",
            ModelKind::ThreeFinger => "3finger",
            ModelKind::FourFinger => "4finger",
            ModelKind::OneFingerNonlinear => "1finger_nonlinear",
            ModelKind::TwoFingerDistantPairs => "2finger_distantPairs",
            ModelKind::TwoFingerAdjacentPairs => "2finger_adjacentPairs",
            ModelKind::NoiseCeiling => "noise_ceiling",
        }
    }

    /// Free prediction parameters beyond the estimated feature patterns.
    pub fn parameter_count(self) -> usize {
        match self {
            ModelKind::OneFingerNonlinear => NUM_SCALES,
            _ => 0,
        }
    }

    /// Design whose feature patterns are estimated for this model.
    ///
    /// `null` averages training patterns and has no design. The nonlinear model's
    /// first stage uses the plain single-finger design; its final design depends on
    /// the fitted scales (see [`nonlinear_design`]).
    pub fn design(self) -> Option<FeatureDesign> {
        let name = self.name();
        match self {
            ModelKind::Null => None,
            ModelKind::OneFinger | ModelKind::OneFingerNonlinear => {
                Some(FeatureDesign::interactions(name, 1))
            }
            ModelKind::TwoFinger => Some(FeatureDesign::interactions(name, 2)),
            ModelKind::ThreeFinger => Some(FeatureDesign::interactions(name, 3)),
            ModelKind::FourFinger => Some(FeatureDesign::interactions(name, 4)),
            ModelKind::TwoFingerDistantPairs => Some(FeatureDesign::from_sets(
                name,
                &[FeatureSet::Singles, FeatureSet::DistantPairs],
            )),
            ModelKind::TwoFingerAdjacentPairs => Some(FeatureDesign::from_sets(
                name,
                &[FeatureSet::Singles, FeatureSet::AdjacentPairs],
            )),
            ModelKind::NoiseCeiling => Some(FeatureDesign::from_sets(name, &[FeatureSet::Conditions])),
        }
    }

    /// Fewest channels with which every estimation stage of the model is defined.
    ///
    /// The nonlinear model fits its scales against the per-condition estimate and
    /// therefore needs as many channels as the noise ceiling.
    pub fn required_channels(self) -> usize {
        match self {
            ModelKind::Null => 0,
            ModelKind::OneFingerNonlinear => NUM_CHORDS,
            other => other.design().map_or(0, |d| d.num_features()),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| ConfigurationError::UnknownModel(s.to_string()))
    }
}

impl TryFrom<String> for ModelKind {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKind> for String {
    fn from(model: ModelKind) -> Self {
        model.name().to_string()
    }
}

/// Log-scale factors of the nonlinear model, entry `k` for chords with `k + 2` fingers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleParameters {
    pub log_scales: [f64; NUM_SCALES],
}

impl ScaleParameters {
    pub fn from_scales(scales: [f64; NUM_SCALES]) -> Self {
        Self {
            log_scales: scales.map(f64::ln),
        }
    }

    /// Positive multipliers `exp(theta)`.
    pub fn scales(&self) -> [f64; NUM_SCALES] {
        self.log_scales.map(f64::exp)
    }

    fn from_point(point: ArrayView1<f64>) -> Self {
        let mut log_scales = [0.0; NUM_SCALES];
        for (dst, &src) in log_scales.iter_mut().zip(point.iter()) {
            *dst = src;
        }
        Self { log_scales }
    }

    /// Multiplier applied to a chord with `digits` stimulated fingers.
    pub fn factor(&self, digits: usize) -> f64 {
        if digits < 2 {
            1.0
        } else {
            self.log_scales[digits - 2].exp()
        }
    }
}

impl Default for ScaleParameters {
    fn default() -> Self {
        Self::from_scales([0.9, 0.8, 0.7, 0.6])
    }
}

/// Settings for the scale search of the nonlinear model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonlinearConfig {
    pub optimizer: SearchStrategy,
    pub max_iterations: usize,
    pub tolerance: f64,
    /// Starting multipliers for 2..=5-finger chords.
    pub initial_scales: [f64; NUM_SCALES],
}

impl Default for NonlinearConfig {
    fn default() -> Self {
        Self {
            optimizer: SearchStrategy::NelderMead,
            max_iterations: 50_000,
            tolerance: 1e-10,
            initial_scales: [0.9, 0.8, 0.7, 0.6],
        }
    }
}

impl NonlinearConfig {
    pub fn minimizer(&self) -> Box<dyn Minimizer> {
        self.optimizer.build(self.max_iterations, self.tolerance)
    }

    pub fn initial(&self) -> ScaleParameters {
        ScaleParameters::from_scales(self.initial_scales)
    }
}

/// Single-finger design with each multi-finger block scaled by its factor.
pub fn nonlinear_design(parameters: &ScaleParameters) -> FeatureDesign {
    let mut design = FeatureDesign::interactions(ModelKind::OneFingerNonlinear.name(), 1);
    for (mut row, chord) in design.matrix.axis_iter_mut(Axis(0)).zip(all_chords()) {
        row *= parameters.factor(chord.digit_count());
    }
    design
}

/// `X U` for a chord-indexed design.
pub fn feature_prediction(design: &FeatureDesign, patterns: ArrayView2<f64>) -> Array2<f64> {
    design.matrix.dot(&patterns)
}

/// Null-model prediction: every chord gets the mean training pattern of the chords
/// with the same number of stimulated fingers.
///
/// Digit counts without any training chord are filled with NaN.
pub fn null_prediction(train: &ChordMeans) -> Array2<f64> {
    let channels = train.patterns.ncols();
    let mut sums = vec![(Array1::<f64>::zeros(channels), 0usize); NUM_FINGERS];
    for (row, chord) in train.patterns.axis_iter(Axis(0)).zip(train.chords.iter()) {
        let slot = &mut sums[chord.digit_count() - 1];
        slot.0 += &row;
        slot.1 += 1;
    }

    let mut prediction = Array2::from_elem((NUM_CHORDS, channels), f64::NAN);
    for (mut out, chord) in prediction.axis_iter_mut(Axis(0)).zip(all_chords()) {
        let (sum, count) = &sums[chord.digit_count() - 1];
        if *count > 0 {
            out.assign(&(sum / *count as f64));
        }
    }
    prediction
}

/// Residual sum of squares between row-centered scaled single-finger predictions
/// and row-centered per-condition estimates, over a fixed set of chords.
///
/// Because row-centering commutes with row scaling, the unscaled predictions are
/// centered once up front.
pub struct ScalingObjective {
    basis: Array2<f64>,
    target: Array2<f64>,
    digit_counts: Vec<usize>,
}

impl ScalingObjective {
    /// `single_finger` is 5 x P, `ceiling` is the 31 x P per-condition estimate.
    pub fn new(single_finger: ArrayView2<f64>, ceiling: ArrayView2<f64>, chords: &[Chord]) -> Self {
        let rows: Vec<usize> = chords.iter().map(|c| c.index()).collect();
        let plain = FeatureDesign::interactions("1finger", 1);
        let predicted = plain.matrix.select(Axis(0), &rows).dot(&single_finger);
        Self {
            basis: center_rows(predicted.view()),
            target: center_rows(ceiling.select(Axis(0), &rows).view()),
            digit_counts: chords.iter().map(|c| c.digit_count()).collect(),
        }
    }
}

impl Objective for ScalingObjective {
    fn value(&self, x: ArrayView1<f64>) -> f64 {
        let parameters = ScaleParameters::from_point(x);
        self.basis
            .axis_iter(Axis(0))
            .zip(self.target.axis_iter(Axis(0)))
            .zip(self.digit_counts.iter())
            .map(|((b, t), &digits)| {
                let factor = parameters.factor(digits);
                b.iter()
                    .zip(t.iter())
                    .map(|(bv, tv)| (factor * bv - tv).powi(2))
                    .sum::<f64>()
            })
            .sum()
    }
}

/// Fitted scales of the nonlinear model.
#[derive(Clone, Debug)]
pub struct ScaleFit {
    pub parameters: ScaleParameters,
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

pub fn fit_scale_parameters(
    objective: &ScalingObjective,
    minimizer: &dyn Minimizer,
    initial: ScaleParameters,
) -> ScaleFit {
    let start = Array1::from_vec(initial.log_scales.to_vec());
    let minimum = minimizer.minimize(objective, start);
    ScaleFit {
        parameters: ScaleParameters::from_point(minimum.point.view()),
        residual: minimum.value,
        iterations: minimum.iterations,
        converged: minimum.converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn names_round_trip_and_unknown_names_fail() {
        for model in ModelKind::ALL {
            assert_eq!(model.name().parse::<ModelKind>().unwrap(), model);
            assert_eq!(model.to_string(), model.name());
        }
        assert_eq!(
            "5finger".parse::<ModelKind>(),
            Err(ConfigurationError::UnknownModel("5finger".to_string()))
        );
        // Names are case-sensitive.
        assert!("2finger_distantpairs".parse::<ModelKind>().is_err());
    }

    #[test]
    fn only_the_nonlinear_model_has_parameters() {
        for model in ModelKind::ALL {
            let expected = if model == ModelKind::OneFingerNonlinear { 4 } else { 0 };
            assert_eq!(model.parameter_count(), expected, "{model}");
        }
    }

    #[test]
    fn design_widths_per_model() {
        let widths: Vec<Option<usize>> = ModelKind::ALL
            .iter()
            .map(|m| m.design().map(|d| d.num_features()))
            .collect();
        assert_eq!(
            widths,
            vec![None, Some(5), Some(15), Some(25), Some(30), Some(5), Some(11), Some(9), Some(31)]
        );
        assert_eq!(ModelKind::OneFingerNonlinear.required_channels(), 31);
        assert_eq!(ModelKind::Null.required_channels(), 0);
    }

    #[test]
    fn nonlinear_design_scales_multi_finger_rows_only() {
        let params = ScaleParameters::from_scales([2.0, 3.0, 4.0, 5.0]);
        let design = nonlinear_design(&params);
        let plain = FeatureDesign::interactions("1finger", 1);
        for (chord, (row, base)) in all_chords()
            .iter()
            .zip(design.matrix.rows().into_iter().zip(plain.matrix.rows()))
        {
            let factor = match chord.digit_count() {
                1 => 1.0,
                k => k as f64,
            };
            for (a, b) in row.iter().zip(base.iter()) {
                assert_abs_diff_eq!(*a, factor * b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn null_prediction_averages_within_digit_count() {
        let chords: Vec<Chord> = [1, 2, 6, 7, 31]
            .iter()
            .map(|&id| Chord::from_id(id).unwrap())
            .collect();
        let train = ChordMeans {
            chords,
            patterns: array![[1.0, 0.0], [3.0, 2.0], [10.0, 10.0], [20.0, 30.0], [7.0, 7.0]],
        };
        let prediction = null_prediction(&train);
        assert_eq!(prediction.dim(), (31, 2));
        // Single-finger chords absent from training still get the group mean.
        for row in 0..5 {
            assert_eq!(prediction.row(row).to_vec(), vec![2.0, 1.0]);
        }
        for row in 5..15 {
            assert_eq!(prediction.row(row).to_vec(), vec![15.0, 20.0]);
        }
        assert!(prediction.row(15).iter().all(|v| v.is_nan()));
        assert_eq!(prediction.row(30).to_vec(), vec![7.0, 7.0]);
    }

    #[test]
    fn scaling_fit_recovers_generating_scales() {
        let mut rng = StdRng::seed_from_u64(21);
        let u1 = Array2::from_shape_fn((5, 20), |_| rng.gen_range(-1.0..1.0));
        let truth = ScaleParameters::from_scales([0.5, 0.4, 0.3, 0.2]);
        let ceiling = feature_prediction(&nonlinear_design(&truth), u1.view());

        let objective = ScalingObjective::new(u1.view(), ceiling.view(), all_chords());
        assert_abs_diff_eq!(
            objective.value(Array1::from_vec(truth.log_scales.to_vec()).view()),
            0.0,
            epsilon = 1e-20
        );

        let config = NonlinearConfig::default();
        let fit = fit_scale_parameters(&objective, config.minimizer().as_ref(), config.initial());
        assert!(fit.converged);
        for (a, b) in fit.parameters.scales().iter().zip(truth.scales().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }
}
