//! Analysis configuration, read from a TOML file and passed explicitly to the driver.

use crate::crossval::FitSettings;
use crate::estimate::RemlConfig;
use crate::predict::{ModelKind, NonlinearConfig};
use crate::prior::PriorMode;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Configuration lists no {0}.")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub regions: Vec<String>,
    /// Processed in natural order regardless of the order given here.
    pub participants: Vec<String>,
    pub verbose: bool,
    pub models: Vec<ModelKind>,
    pub prior: PriorMode,
    /// Draw count of the selectivity analysis; accepted for compatibility and unused here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monte_carlo_draws: Option<usize>,
    pub reml: RemlConfig,
    pub nonlinear: NonlinearConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            participants: Vec::new(),
            verbose: false,
            models: ModelKind::ALL.to_vec(),
            prior: PriorMode::default(),
            monte_carlo_draws: None,
            reml: RemlConfig::default(),
            nonlinear: NonlinearConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: AnalysisConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::Empty("regions"));
        }
        if self.participants.is_empty() {
            return Err(ConfigError::Empty("participants"));
        }
        if self.models.is_empty() {
            return Err(ConfigError::Empty("models"));
        }
        Ok(())
    }

    /// Participants sorted so that `s2` comes before `s10`.
    pub fn sorted_participants(&self) -> Vec<String> {
        let mut participants = self.participants.clone();
        participants.sort_by(|a, b| natord::compare(a, b));
        participants.dedup();
        participants
    }

    pub fn fit_settings(&self) -> FitSettings {
        FitSettings {
            models: self.models.clone(),
            reml: self.reml.clone(),
            nonlinear: self.nonlinear.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::SearchStrategy;
    use tempfile::tempdir;

    #[test]
    fn parses_full_file() {
        let text = r#"
            regions = ["S1", "M1"]
            participants = ["s10", "s2", "s01"]
            verbose = true
            models = ["null", "2finger_adjacentPairs", "noise_ceiling"]
            prior = "leave-one-participant-out"
            monte_carlo_draws = 1000

            [reml]
            max_iterations = 50

            [nonlinear]
            optimizer = "pattern-search"
            initial_scales = [1.0, 1.0, 1.0, 1.0]
        "#;
        let config: AnalysisConfig = toml::from_str(text).unwrap();
        assert_eq!(config.regions, vec!["S1", "M1"]);
        assert_eq!(config.sorted_participants(), vec!["s01", "s2", "s10"]);
        assert_eq!(
            config.models,
            vec![ModelKind::Null, ModelKind::TwoFingerAdjacentPairs, ModelKind::NoiseCeiling]
        );
        assert_eq!(config.prior, PriorMode::LeaveOneParticipantOut);
        assert_eq!(config.reml.max_iterations, 50);
        assert_eq!(config.reml.tolerance, 1e-8);
        assert_eq!(config.nonlinear.optimizer, SearchStrategy::PatternSearch);
        assert_eq!(config.nonlinear.max_iterations, 50_000);
        assert_eq!(config.monte_carlo_draws, Some(1000));
    }

    #[test]
    fn defaults_cover_all_models() {
        let config: AnalysisConfig = toml::from_str("regions = [\"S1\"]\nparticipants = [\"a\"]").unwrap();
        assert_eq!(config.models, ModelKind::ALL.to_vec());
        assert_eq!(config.prior, PriorMode::Pooled);
        assert_eq!(config.nonlinear.initial_scales, [0.9, 0.8, 0.7, 0.6]);
        assert!(!config.verbose);
    }

    #[test]
    fn unknown_model_names_fail_to_parse() {
        let err = toml::from_str::<AnalysisConfig>("models = [\"6finger\"]").unwrap_err();
        assert!(err.to_string().contains("6finger"), "{err}");
    }

    #[test]
    fn save_and_load_preserve_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("analysis.toml");
        let config = AnalysisConfig {
            regions: vec!["S1".into()],
            participants: vec!["s01".into(), "s02".into()],
            models: vec![ModelKind::OneFingerNonlinear],
            ..AnalysisConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = AnalysisConfig::load(&path).unwrap();
        assert_eq!(loaded.participants, config.participants);
        assert_eq!(loaded.models, config.models);
        assert_eq!(loaded.nonlinear.tolerance, config.nonlinear.tolerance);
    }

    #[test]
    fn empty_lists_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.toml");
        fs::write(&path, "participants = [\"s01\"]").unwrap();
        assert!(matches!(
            AnalysisConfig::load(&path),
            Err(ConfigError::Empty("regions"))
        ));
    }
}
