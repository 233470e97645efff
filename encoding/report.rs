//! Flat tab-separated export of fit records and group summaries.

use crate::crossval::FitRecord;
use crate::normalize::{GroupSummary, NormalizedFit};
use crate::predict::ModelKind;

use serde::Serialize;
use std::io::Write;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error writing report: {0}")]
    Io(#[from] std::io::Error),
}

/// One output row per participant, region and model.
///
/// Fields that do not apply to a model (hyperparameters of `null`, scales of
/// every model but `1finger_nonlinear`) are NaN.
#[derive(Debug, Clone, Serialize)]
pub struct FitRow {
    pub participant: String,
    pub region: String,
    pub model: ModelKind,
    pub folds: usize,
    pub r_train: f64,
    pub r_test: f64,
    pub r_norm: f64,
    pub log_signal: f64,
    pub log_noise: f64,
    pub lambda: f64,
    pub scale_2: f64,
    pub scale_3: f64,
    pub scale_4: f64,
    pub scale_5: f64,
    pub activity_1: f64,
    pub activity_2: f64,
    pub activity_3: f64,
    pub activity_4: f64,
    pub activity_5: f64,
    pub activity_centered_1: f64,
    pub activity_centered_2: f64,
    pub activity_centered_3: f64,
    pub activity_centered_4: f64,
    pub activity_centered_5: f64,
    pub warnings: String,
}

impl FitRow {
    pub fn new(record: &FitRecord, r_norm: f64) -> Self {
        let ridge = record.parameters.ridge();
        let [scale_2, scale_3, scale_4, scale_5] = record
            .parameters
            .scales()
            .map_or([f64::NAN; 4], |s| s.scales());
        let [activity_1, activity_2, activity_3, activity_4, activity_5] = record.activity.raw;
        let [
            activity_centered_1,
            activity_centered_2,
            activity_centered_3,
            activity_centered_4,
            activity_centered_5,
        ] = record.activity.centered;

        Self {
            participant: record.participant.clone(),
            region: record.region.clone(),
            model: record.model,
            folds: record.folds,
            r_train: record.r_train,
            r_test: record.r_test,
            r_norm,
            log_signal: ridge.map_or(f64::NAN, |r| r.log_signal),
            log_noise: ridge.map_or(f64::NAN, |r| r.log_noise),
            lambda: ridge.map_or(f64::NAN, |r| r.lambda),
            scale_2,
            scale_3,
            scale_4,
            scale_5,
            activity_1,
            activity_2,
            activity_3,
            activity_4,
            activity_5,
            activity_centered_1,
            activity_centered_2,
            activity_centered_3,
            activity_centered_4,
            activity_centered_5,
            warnings: record
                .warnings
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

fn tsv_writer<W: Write>(out: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(out)
}

pub fn write_records<W: Write>(out: W, fits: &[NormalizedFit]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(out);
    for fit in fits {
        writer.serialize(FitRow::new(&fit.record, fit.r_norm))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_summary<W: Write>(out: W, summary: &[GroupSummary]) -> Result<(), ReportError> {
    let mut writer = tsv_writer(out);
    for row in summary {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crossval::{FitWarning, ModelParameters, RidgeSummary, Stage};
    use crate::evaluate::DigitActivity;
    use crate::predict::ScaleParameters;

    fn record(model: ModelKind, parameters: ModelParameters) -> FitRecord {
        FitRecord {
            participant: "s01".into(),
            region: "M1".into(),
            model,
            parameters,
            r_train: 0.9,
            r_test: 0.5,
            folds: 4,
            activity: DigitActivity {
                raw: [1.0, 2.0, 3.0, 4.0, 5.0],
                centered: [-2.0, -1.0, 0.0, 1.0, 2.0],
            },
            warnings: vec![FitWarning::NonConvergence {
                run: 2,
                stage: Stage::Scaling,
            }],
        }
    }

    #[test]
    fn inapplicable_fields_are_nan() {
        let row = FitRow::new(&record(ModelKind::Null, ModelParameters::Averaged), 0.0);
        assert!(row.log_signal.is_nan() && row.lambda.is_nan());
        assert!(row.scale_2.is_nan() && row.scale_5.is_nan());
        assert_eq!(row.activity_3, 3.0);
        assert_eq!(row.activity_centered_1, -2.0);

        let ridge = RidgeSummary {
            log_signal: 0.5,
            log_noise: -1.0,
            lambda: 0.2,
        };
        let row = FitRow::new(
            &record(
                ModelKind::OneFingerNonlinear,
                ModelParameters::Nonlinear {
                    ridge,
                    scales: ScaleParameters::from_scales([0.9, 0.8, 0.7, 0.6]),
                },
            ),
            0.3,
        );
        assert_eq!(row.lambda, 0.2);
        assert!((row.scale_4 - 0.7).abs() < 1e-12);
    }

    #[test]
    fn records_are_written_as_tsv_with_header() {
        let fits = vec![NormalizedFit {
            record: record(ModelKind::TwoFingerDistantPairs, ModelParameters::Averaged),
            r_norm: f64::NAN,
        }];
        let mut buffer = Vec::new();
        write_records(&mut buffer, &fits).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(&header[..4], &["participant", "region", "model", "folds"]);
        assert_eq!(header.len(), 25);
        let row: Vec<&str> = lines.next().unwrap().split('\t').collect();
        assert_eq!(row[2], "2finger_distantPairs");
        assert_eq!(row[6], "NaN");
        assert_eq!(row[24], "run 2: Scaling search did not converge");
    }
}
