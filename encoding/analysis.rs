//! # Region x Participant Driver
//!
//! Loads every participant of every configured region, builds the region prior,
//! cross-validates each participant/region unit and normalizes its records.
//! Units are independent and run in parallel. A unit that cannot be loaded or
//! fitted is reported as a [`UnitFailure`] and does not affect the others.

use crate::config::{AnalysisConfig, ConfigError};
use crate::crossval::{FitRecord, FitSettings, UnitId, cross_validate};
use crate::data::DatasetSource;
use crate::dataset::ChordDataset;
use crate::normalize::{NormalizationError, NormalizedFit, normalize_unit};
use crate::prior::{RegionPrior, participant_moment};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use ndarray::Array2;
use rayon::prelude::*;
use std::io::IsTerminal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No participant/region unit could be fitted ({failures} failed).")]
    NothingFitted { failures: usize },
}

/// A unit that was skipped, with the reason.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: UnitId,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    /// Units in region order, then natural participant order; models in configured order.
    pub fits: Vec<NormalizedFit>,
    pub failures: Vec<UnitFailure>,
}

/// A loaded unit with the prior it will be fitted against.
struct PreparedUnit {
    unit: UnitId,
    dataset: ChordDataset,
    prior: Array2<f64>,
}

fn create_progress_bar(len: u64, visible: bool) -> ProgressBar {
    let draw_target = if visible && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message("participant/region units");
    pb
}

/// Loads one region and pairs every loadable participant with its prior. Participants
/// whose runs miss chords do not contribute to the prior but are still fitted.
fn prepare_region(
    region: &str,
    participants: &[String],
    config: &AnalysisConfig,
    source: &dyn DatasetSource,
    failures: &mut Vec<UnitFailure>,
) -> Vec<PreparedUnit> {
    let mut loaded: Vec<(UnitId, ChordDataset, Option<usize>)> = Vec::new();
    let mut moments: Vec<Array2<f64>> = Vec::new();
    for participant in participants {
        let unit = UnitId {
            participant: participant.clone(),
            region: region.to_string(),
        };
        let dataset = match source.load(participant, region) {
            Ok(dataset) => dataset,
            Err(err) => {
                log::warn!("{unit}: skipped, {err}");
                failures.push(UnitFailure {
                    unit,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        let slot = match participant_moment(moments.len(), &dataset) {
            Ok(moment) => {
                moments.push(moment);
                Some(moments.len() - 1)
            }
            Err(err) => {
                log::info!("{unit}: excluded from the region prior, {err}");
                None
            }
        };
        loaded.push((unit, dataset, slot));
    }

    log::info!(
        "{region}: {} of {} participants contribute to the prior",
        moments.len(),
        loaded.len()
    );
    let region_prior = RegionPrior::from_moments(moments);

    loaded
        .into_iter()
        .filter_map(|(unit, dataset, slot)| {
            match region_prior.prior_for(config.prior, slot) {
                Ok(prior) => Some(PreparedUnit {
                    unit,
                    dataset,
                    prior,
                }),
                Err(err) => {
                    log::warn!("{unit}: no prior, {err}");
                    failures.push(UnitFailure {
                        unit,
                        reason: err.to_string(),
                    });
                    None
                }
            }
        })
        .collect()
}

fn fit_unit(prepared: &PreparedUnit, settings: &FitSettings) -> Result<Vec<NormalizedFit>, String> {
    let records: Vec<FitRecord> =
        cross_validate(&prepared.unit, &prepared.dataset, prepared.prior.view(), settings)
            .map_err(|err| err.to_string())?;

    match normalize_unit(records.clone()) {
        Ok(fits) => Ok(fits),
        Err(NormalizationError::MissingReference { model, .. }) => {
            log::info!(
                "{}: '{model}' not fitted, normalized correlations left undefined",
                prepared.unit
            );
            Ok(records
                .into_iter()
                .map(|record| NormalizedFit {
                    record,
                    r_norm: f64::NAN,
                })
                .collect())
        }
    }
}

/// Runs the whole analysis described by `config`.
pub fn run_analysis(
    config: &AnalysisConfig,
    source: &dyn DatasetSource,
) -> Result<AnalysisReport, AnalysisError> {
    config.validate()?;
    let participants = config.sorted_participants();
    let settings = config.fit_settings();

    let mut failures = Vec::new();
    let units: Vec<PreparedUnit> = config
        .regions
        .iter()
        .flat_map(|region| prepare_region(region, &participants, config, source, &mut failures))
        .collect();
    log::info!(
        "Fitting {} models for {} participant/region units",
        settings.models.len(),
        units.len()
    );

    let pb = create_progress_bar(units.len() as u64, !config.verbose);
    let outcomes: Vec<Result<Vec<NormalizedFit>, String>> = units
        .par_iter()
        .map(|prepared| {
            let outcome = fit_unit(prepared, &settings);
            pb.inc(1);
            outcome
        })
        .collect();
    pb.finish_and_clear();

    let mut fits = Vec::new();
    for (prepared, outcome) in units.iter().zip(outcomes) {
        match outcome {
            Ok(unit_fits) => {
                log::info!("{}: {} models fitted", prepared.unit, unit_fits.len());
                fits.extend(unit_fits);
            }
            Err(reason) => {
                log::warn!("{}: aborted, {reason}", prepared.unit);
                failures.push(UnitFailure {
                    unit: prepared.unit.clone(),
                    reason,
                });
            }
        }
    }

    if fits.is_empty() {
        return Err(AnalysisError::NothingFitted {
            failures: failures.len(),
        });
    }
    Ok(AnalysisReport { fits, failures })
}
