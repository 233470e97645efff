//! # Leave-One-Run-Out Cross-Validation
//!
//! For one participant and region, every distinct run is held out once. Within a
//! fold each requested model estimates its feature patterns on the training runs,
//! predicts all 31 chords, and is scored against the training chord means and the
//! held-out chord means. Fold metrics are then averaged per model.
//!
//! Everything that can make the unit as a whole unusable (design rank, channel
//! count, prior shape) is checked before the first fold runs. Inside a fold,
//! failures are local to one model: the affected metrics become NaN and the record
//! carries a [`FitWarning`].
//!
//! Folds are independent and run in parallel; each owns its split and all of its
//! estimator state. Only the prepared estimators, which are read-only, are shared.

use crate::dataset::{ChordDataset, ChordMeans, Subset};
use crate::error::ConfigurationError;
use crate::estimate::{EstimationError, FeatureEstimator, RemlConfig, RidgeFit};
use crate::evaluate::{DigitActivity, correlation};
use crate::linalg::validate_chord_prior;
use crate::predict::{
    ModelKind, NUM_SCALES, NonlinearConfig, ScaleParameters, ScalingObjective,
    feature_prediction, fit_scale_parameters, nonlinear_design, null_prediction,
};

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which models to fit and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    pub models: Vec<ModelKind>,
    pub reml: RemlConfig,
    pub nonlinear: NonlinearConfig,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            models: ModelKind::ALL.to_vec(),
            reml: RemlConfig::default(),
            nonlinear: NonlinearConfig::default(),
        }
    }
}

/// Identifies one participant/region unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub participant: String,
    pub region: String,
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.participant, self.region)
    }
}

/// Optimization stage that stopped before converging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Hyperparameter search of the feature estimator.
    Reml,
    /// Scale search of the nonlinear model.
    Scaling,
}

/// Non-fatal problems attached to a fit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitWarning {
    /// A fold's metric was undefined (zero variance) and is NaN.
    NumericDegeneracy { run: i64, metric: String },
    /// An optimizer exhausted its budget; its best point was used.
    NonConvergence { run: i64, stage: Stage },
    /// Estimation failed in this fold; all of the fold's metrics are NaN.
    FoldFailed { run: i64, reason: String },
}

impl fmt::Display for FitWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitWarning::NumericDegeneracy { run, metric } => {
                write!(f, "run {run}: {metric} is undefined")
            }
            FitWarning::NonConvergence { run, stage } => {
                write!(f, "run {run}: {stage:?} search did not converge")
            }
            FitWarning::FoldFailed { run, reason } => write!(f, "run {run}: {reason}"),
        }
    }
}

/// Fold-averaged variance-component hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RidgeSummary {
    pub log_signal: f64,
    pub log_noise: f64,
    /// Mean of the per-fold shrinkage ratios `σ² / s`.
    pub lambda: f64,
}

/// Parameters of a fitted model; only the nonlinear model carries scales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParameters {
    /// Null model: group averages, nothing estimated.
    Averaged,
    Ridge(RidgeSummary),
    Nonlinear {
        ridge: RidgeSummary,
        scales: ScaleParameters,
    },
}

impl ModelParameters {
    pub fn ridge(&self) -> Option<&RidgeSummary> {
        match self {
            ModelParameters::Averaged => None,
            ModelParameters::Ridge(ridge) | ModelParameters::Nonlinear { ridge, .. } => Some(ridge),
        }
    }

    pub fn scales(&self) -> Option<&ScaleParameters> {
        match self {
            ModelParameters::Nonlinear { scales, .. } => Some(scales),
            _ => None,
        }
    }
}

/// Cross-validated result of one model for one participant/region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRecord {
    pub participant: String,
    pub region: String,
    pub model: ModelKind,
    pub parameters: ModelParameters,
    pub r_train: f64,
    pub r_test: f64,
    pub folds: usize,
    pub activity: DigitActivity,
    pub warnings: Vec<FitWarning>,
}

/// Estimators shared by all folds of one unit.
struct PreparedModels {
    chord_prior: Array2<f64>,
    estimators: BTreeMap<ModelKind, FeatureEstimator>,
}

impl PreparedModels {
    fn new(
        models: &[ModelKind],
        channels: usize,
        chord_prior: ArrayView2<f64>,
    ) -> Result<Self, EstimationError> {
        if models.is_empty() {
            return Err(ConfigurationError::NoModels.into());
        }
        validate_chord_prior(chord_prior)?;

        let mut estimators = BTreeMap::new();
        for &model in models {
            let required = model.required_channels();
            if channels < required {
                return Err(ConfigurationError::InsufficientChannels {
                    model: model.name().to_string(),
                    channels,
                    required,
                }
                .into());
            }
            let mut needed = vec![model];
            if model == ModelKind::OneFingerNonlinear {
                needed.push(ModelKind::NoiseCeiling);
            }
            for kind in needed {
                if estimators.contains_key(&kind) {
                    continue;
                }
                if let Some(design) = kind.design() {
                    estimators.insert(kind, FeatureEstimator::new(design, chord_prior)?);
                }
            }
        }
        Ok(Self {
            chord_prior: chord_prior.to_owned(),
            estimators,
        })
    }

    fn estimator(&self, model: ModelKind) -> Result<&FeatureEstimator, EstimationError> {
        self.estimators.get(&model).ok_or_else(|| {
            EstimationError::Configuration(ConfigurationError::UnknownModel(model.name().to_string()))
        })
    }
}

/// One model's outcome in one fold.
#[derive(Debug, Clone)]
struct FoldOutcome {
    r_train: f64,
    r_test: f64,
    ridge: Option<RidgeFit>,
    scales: Option<ScaleParameters>,
    activity: DigitActivity,
    warnings: Vec<FitWarning>,
}

impl FoldOutcome {
    fn failed(run: i64, reason: String) -> Self {
        Self {
            r_train: f64::NAN,
            r_test: f64::NAN,
            ridge: None,
            scales: None,
            activity: DigitActivity::nan(),
            warnings: vec![FitWarning::FoldFailed { run, reason }],
        }
    }
}

/// Prediction of one model before scoring.
struct ModelPrediction {
    /// Full 31 x P prediction.
    chords: Array2<f64>,
    /// Scored against its own training-row values instead of the training chord means.
    own_reference: bool,
    ridge: Option<RidgeFit>,
    scales: Option<ScaleParameters>,
    warnings: Vec<FitWarning>,
}

/// Cross-validates every requested model on one dataset.
///
/// Returns one record per model, in the order requested. Fails only for problems
/// that affect the unit as a whole.
pub fn cross_validate(
    unit: &UnitId,
    dataset: &ChordDataset,
    chord_prior: ArrayView2<f64>,
    settings: &FitSettings,
) -> Result<Vec<FitRecord>, EstimationError> {
    let prepared = PreparedModels::new(&settings.models, dataset.channels(), chord_prior)?;
    let runs = dataset.runs();
    log::debug!(
        "{unit}: {} rows x {} channels, {} folds, {} models",
        dataset.rows(),
        dataset.channels(),
        runs.len(),
        settings.models.len()
    );

    let folds: Vec<Vec<FoldOutcome>> = runs
        .par_iter()
        .map(|&run| run_fold(unit, dataset, run, &prepared, settings))
        .collect();

    let records = settings
        .models
        .iter()
        .enumerate()
        .map(|(slot, &model)| {
            let outcomes: Vec<&FoldOutcome> = folds.iter().map(|fold| &fold[slot]).collect();
            aggregate(unit, model, &outcomes)
        })
        .collect();
    Ok(records)
}

fn run_fold(
    unit: &UnitId,
    dataset: &ChordDataset,
    run: i64,
    prepared: &PreparedModels,
    settings: &FitSettings,
) -> Vec<FoldOutcome> {
    let (train, test) = dataset.split(run);
    let train_means = train.chord_means();
    let test_means = test.chord_means();

    settings
        .models
        .iter()
        .map(|&model| {
            let outcome = match predict_model(model, &train, &train_means, run, prepared, settings) {
                Ok(prediction) => score(run, prediction, &train_means, &test_means),
                Err(err) => {
                    log::warn!("{unit} {model} run {run}: estimation failed: {err}");
                    FoldOutcome::failed(run, err.to_string())
                }
            };
            log::debug!(
                "{unit} {model} run {run}: r_train = {:.4}, r_test = {:.4}",
                outcome.r_train,
                outcome.r_test
            );
            outcome
        })
        .collect()
}

fn reml_warning(run: i64, fit: &RidgeFit) -> Option<FitWarning> {
    (!fit.converged).then_some(FitWarning::NonConvergence {
        run,
        stage: Stage::Reml,
    })
}

fn predict_model(
    model: ModelKind,
    train: &Subset,
    train_means: &ChordMeans,
    run: i64,
    prepared: &PreparedModels,
    settings: &FitSettings,
) -> Result<ModelPrediction, EstimationError> {
    let y = train.y.view();
    match model {
        ModelKind::Null => Ok(ModelPrediction {
            chords: null_prediction(train_means),
            own_reference: false,
            ridge: None,
            scales: None,
            warnings: Vec::new(),
        }),
        ModelKind::NoiseCeiling => {
            let fit = prepared.estimator(model)?.fit(y, &train.chords, &settings.reml)?;
            Ok(ModelPrediction {
                chords: fit.patterns.clone(),
                own_reference: true,
                warnings: reml_warning(run, &fit).into_iter().collect(),
                ridge: Some(fit),
                scales: None,
            })
        }
        ModelKind::OneFingerNonlinear => {
            let mut warnings = Vec::new();
            let single = prepared.estimator(model)?.fit(y, &train.chords, &settings.reml)?;
            let ceiling = prepared
                .estimator(ModelKind::NoiseCeiling)?
                .fit(y, &train.chords, &settings.reml)?;
            warnings.extend(reml_warning(run, &single));
            warnings.extend(reml_warning(run, &ceiling));

            let objective = ScalingObjective::new(
                single.patterns.view(),
                ceiling.patterns.view(),
                &train_means.chords,
            );
            let minimizer = settings.nonlinear.minimizer();
            let scale_fit =
                fit_scale_parameters(&objective, minimizer.as_ref(), settings.nonlinear.initial());
            if !scale_fit.converged {
                warnings.push(FitWarning::NonConvergence {
                    run,
                    stage: Stage::Scaling,
                });
            }

            let design = nonlinear_design(&scale_fit.parameters);
            let scaled = FeatureEstimator::new(design, prepared.chord_prior.view())?;
            let fit = scaled.fit(y, &train.chords, &settings.reml)?;
            warnings.extend(reml_warning(run, &fit));
            Ok(ModelPrediction {
                chords: feature_prediction(scaled.design(), fit.patterns.view()),
                own_reference: false,
                ridge: Some(fit),
                scales: Some(scale_fit.parameters),
                warnings,
            })
        }
        _ => {
            let estimator = prepared.estimator(model)?;
            let fit = estimator.fit(y, &train.chords, &settings.reml)?;
            Ok(ModelPrediction {
                chords: feature_prediction(estimator.design(), fit.patterns.view()),
                own_reference: false,
                warnings: reml_warning(run, &fit).into_iter().collect(),
                ridge: Some(fit),
                scales: None,
            })
        }
    }
}

fn score(
    run: i64,
    prediction: ModelPrediction,
    train_means: &ChordMeans,
    test_means: &ChordMeans,
) -> FoldOutcome {
    let train_prediction = train_means.align(prediction.chords.view());
    let r_train = if prediction.own_reference {
        correlation(train_prediction.view(), train_prediction.view())
    } else {
        correlation(train_prediction.view(), train_means.patterns.view())
    };
    let r_test = correlation(
        test_means.align(prediction.chords.view()).view(),
        test_means.patterns.view(),
    );

    let mut warnings = prediction.warnings;
    for (metric, value) in [("r_train", r_train), ("r_test", r_test)] {
        if value.is_nan() {
            warnings.push(FitWarning::NumericDegeneracy {
                run,
                metric: metric.to_string(),
            });
        }
    }

    FoldOutcome {
        r_train,
        r_test,
        ridge: prediction.ridge,
        scales: prediction.scales,
        activity: DigitActivity::from_prediction(prediction.chords.view()),
        warnings,
    }
}

/// Unweighted mean; NaN propagates.
fn fold_mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { f64::NAN } else { sum / n as f64 }
}

fn aggregate(unit: &UnitId, model: ModelKind, outcomes: &[&FoldOutcome]) -> FitRecord {
    let ridge_mean = |f: fn(&RidgeFit) -> f64| {
        fold_mean(outcomes.iter().map(|o| o.ridge.as_ref().map_or(f64::NAN, f)))
    };
    let ridge = RidgeSummary {
        log_signal: ridge_mean(|r| r.log_signal),
        log_noise: ridge_mean(|r| r.log_noise),
        lambda: ridge_mean(RidgeFit::lambda),
    };

    let parameters = match model {
        ModelKind::Null => ModelParameters::Averaged,
        ModelKind::OneFingerNonlinear => {
            let mut log_scales = [0.0; NUM_SCALES];
            for (k, slot) in log_scales.iter_mut().enumerate() {
                *slot = fold_mean(
                    outcomes
                        .iter()
                        .map(|o| o.scales.map_or(f64::NAN, |s| s.log_scales[k])),
                );
            }
            ModelParameters::Nonlinear {
                ridge,
                scales: ScaleParameters { log_scales },
            }
        }
        _ => ModelParameters::Ridge(ridge),
    };

    let warnings: Vec<FitWarning> = outcomes.iter().flat_map(|o| o.warnings.clone()).collect();
    for warning in &warnings {
        log::warn!("{unit} {model}: {warning}");
    }
    let activity: Vec<DigitActivity> = outcomes.iter().map(|o| o.activity).collect();

    FitRecord {
        participant: unit.participant.clone(),
        region: unit.region.clone(),
        model,
        parameters,
        r_train: fold_mean(outcomes.iter().map(|o| o.r_train)),
        r_test: fold_mean(outcomes.iter().map(|o| o.r_test)),
        folds: outcomes.len(),
        activity: DigitActivity::mean(&activity),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chords::{FeatureDesign, all_chords};
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, concatenate};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};

    fn unit() -> UnitId {
        UnitId {
            participant: "s01".to_string(),
            region: "M1".to_string(),
        }
    }

    /// Rows for every chord in every run, with `signal` rows stacked per run plus noise.
    fn dataset_from(signal: &Array2<f64>, runs: usize, noise_sd: f64, seed: u64) -> ChordDataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let blocks: Vec<_> = (0..runs).map(|_| signal.view()).collect();
        let mut y = concatenate(Axis(0), &blocks).unwrap();
        y.mapv_inplace(|v| v + noise_sd * normal.sample(&mut rng));
        let run_ids = (0..runs)
            .flat_map(|r| std::iter::repeat_n(r as i64 + 1, signal.nrows()))
            .collect();
        let chord_ids = (0..runs)
            .flat_map(|_| all_chords().iter().map(|c| c.id() as i64))
            .collect();
        ChordDataset::new(y, run_ids, chord_ids).unwrap()
    }

    fn random_patterns(rows: usize, channels: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, channels), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn every_run_is_held_out_once_and_metrics_are_fold_means() {
        let signal = FeatureDesign::interactions("1finger", 1)
            .matrix
            .dot(&random_patterns(5, 35, 1));
        let dataset = dataset_from(&signal, 4, 0.3, 2);
        let settings = FitSettings {
            models: vec![ModelKind::Null, ModelKind::OneFinger, ModelKind::NoiseCeiling],
            ..FitSettings::default()
        };
        let prior = Array2::eye(31);
        let records = cross_validate(&unit(), &dataset, prior.view(), &settings).unwrap();
        assert_eq!(records.len(), 3);

        // Recompute the per-fold outcomes directly to check the averaging.
        let prepared = PreparedModels::new(&settings.models, 35, prior.view()).unwrap();
        let runs = dataset.runs();
        assert_eq!(runs, vec![1, 2, 3, 4]);
        let folds: Vec<Vec<FoldOutcome>> = runs
            .iter()
            .map(|&run| run_fold(&unit(), &dataset, run, &prepared, &settings))
            .collect();

        for (slot, record) in records.iter().enumerate() {
            assert_eq!(record.folds, 4);
            let expected: f64 = folds.iter().map(|f| f[slot].r_test).sum::<f64>() / 4.0;
            assert_abs_diff_eq!(record.r_test, expected, epsilon = 1e-12);
            assert!(record.r_test.is_finite());
        }
        assert_eq!(records[0].parameters, ModelParameters::Averaged);
        assert!(records[1].parameters.ridge().is_some());
        assert!(records[1].parameters.scales().is_none());
        assert_abs_diff_eq!(records[2].r_train, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn noise_free_single_finger_data_is_predicted_perfectly() {
        // Centered single-finger patterns over two runs of the five single-finger chords.
        let raw = random_patterns(5, 12, 9);
        let mean = raw.mean_axis(Axis(0)).unwrap();
        let truth = &raw - &mean.insert_axis(Axis(0));
        let y = concatenate(Axis(0), &[truth.view(), truth.view()]).unwrap();
        let dataset =
            ChordDataset::new(y, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2], vec![1, 2, 3, 4, 5, 1, 2, 3, 4, 5])
                .unwrap();
        let settings = FitSettings {
            models: vec![ModelKind::OneFinger],
            ..FitSettings::default()
        };
        let records = cross_validate(&unit(), &dataset, Array2::eye(31).view(), &settings).unwrap();
        assert_abs_diff_eq!(records[0].r_test, 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(records[0].r_train, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn insufficient_channels_abort_the_unit() {
        let signal = random_patterns(31, 20, 4);
        let dataset = dataset_from(&signal, 2, 0.1, 5);
        let err = cross_validate(&unit(), &dataset, Array2::eye(31).view(), &FitSettings::default())
            .unwrap_err();
        match err {
            EstimationError::Configuration(ConfigurationError::InsufficientChannels {
                model,
                channels,
                required,
            }) => {
                assert_eq!(model, "3finger");
                assert_eq!(channels, 20);
                assert_eq!(required, 25);
            }
            other => panic!("expected InsufficientChannels, got {other:?}"),
        }
    }

    #[test]
    fn constant_patterns_yield_nan_and_a_warning() {
        let signal = Array2::from_elem((31, 6), 2.0);
        let dataset = dataset_from(&signal, 2, 0.0, 0);
        let settings = FitSettings {
            models: vec![ModelKind::Null],
            ..FitSettings::default()
        };
        let records = cross_validate(&unit(), &dataset, Array2::eye(31).view(), &settings).unwrap();
        assert!(records[0].r_test.is_nan());
        assert!(records[0].warnings.iter().any(|w| matches!(
            w,
            FitWarning::NumericDegeneracy { metric, .. } if metric == "r_test"
        )));
    }

    #[test]
    fn nonlinear_model_reports_scales_only_for_itself() {
        let signal = FeatureDesign::interactions("2finger", 2)
            .matrix
            .dot(&random_patterns(15, 40, 13));
        let dataset = dataset_from(&signal, 3, 0.2, 14);
        let settings = FitSettings {
            models: vec![ModelKind::OneFinger, ModelKind::OneFingerNonlinear],
            ..FitSettings::default()
        };
        let records = cross_validate(&unit(), &dataset, Array2::eye(31).view(), &settings).unwrap();
        assert!(records[0].parameters.scales().is_none());
        let scales = records[1].parameters.scales().unwrap();
        assert!(scales.scales().iter().all(|s| s.is_finite() && *s > 0.0));
        assert!(records[1].r_test.is_finite());
    }
}
