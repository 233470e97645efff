//! Rescaling of test correlations between the null model (0) and the noise ceiling (1).

use crate::crossval::FitRecord;
use crate::predict::ModelKind;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("No '{model}' record for {participant}/{region}; cannot normalize.")]
    MissingReference {
        participant: String,
        region: String,
        model: ModelKind,
    },
}

/// A fit record together with its normalized test correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedFit {
    pub record: FitRecord,
    pub r_norm: f64,
}

fn reference(records: &[FitRecord], model: ModelKind) -> Result<f64, NormalizationError> {
    records
        .iter()
        .find(|r| r.model == model)
        .map(|r| r.r_test)
        .ok_or_else(|| {
            let (participant, region) = records
                .first()
                .map(|r| (r.participant.clone(), r.region.clone()))
                .unwrap_or_default();
            NormalizationError::MissingReference {
                participant,
                region,
                model,
            }
        })
}

/// `(r − r_null) / (r_ceiling − r_null)` for the records of one participant/region.
///
/// The two reference models are assigned 0 and 1 directly; a NaN reference
/// makes every other model's normalized value NaN.
pub fn normalize_unit(records: Vec<FitRecord>) -> Result<Vec<NormalizedFit>, NormalizationError> {
    let null = reference(&records, ModelKind::Null)?;
    let ceiling = reference(&records, ModelKind::NoiseCeiling)?;
    let span = ceiling - null;

    Ok(records
        .into_iter()
        .map(|record| {
            let r_norm = match record.model {
                ModelKind::Null => 0.0,
                ModelKind::NoiseCeiling => 1.0,
                _ => (record.r_test - null) / span,
            };
            NormalizedFit { record, r_norm }
        })
        .collect())
}

/// Mean and standard error of `r_norm` across participants for one region and model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub region: String,
    pub model: ModelKind,
    pub mean: f64,
    pub sem: f64,
    /// Participants with a finite value.
    pub n: usize,
}

/// Groups by region and model (both in sorted order). Non-finite values are excluded.
pub fn summarize(fits: &[NormalizedFit]) -> Vec<GroupSummary> {
    fits.iter()
        .map(|f| ((f.record.region.clone(), f.record.model), f.r_norm))
        .into_group_map()
        .into_iter()
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|((region, model), values)| {
            let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
            let n = finite.len();
            let mean = if n == 0 {
                f64::NAN
            } else {
                finite.iter().sum::<f64>() / n as f64
            };
            let sem = if n < 2 {
                f64::NAN
            } else {
                let var = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                (var / n as f64).sqrt()
            };
            GroupSummary {
                region,
                model,
                mean,
                sem,
                n,
            }
        })
        .collect()
}
