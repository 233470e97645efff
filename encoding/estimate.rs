// encoding/estimate.rs

//! # Feature-Pattern Estimation via Marginal Likelihood
//!
//! Estimates per-feature activity patterns from noisy chord observations under the
//! variance-component model
//!
//! ```text
//! Y = Z U + E,    U ~ N(0, s · G),    E ~ N(0, σ² · I)
//! ```
//!
//! where every channel (column of `Y`) is an independent draw. Fitting happens in
//! two steps:
//!
//! 1.  **Outer fit (BFGS):** the two log-scale hyperparameters `(log s, log σ²)` are
//!     chosen by maximizing the marginal likelihood of the training rows. With no
//!     fixed effects in the model the restricted and the full likelihood coincide,
//!     so this is the REML fit. Run means are deliberately left in the data.
//!
//! 2.  **Posterior mean:** with the hyperparameters fixed, the feature patterns are
//!     the generalized ridge estimate `Û = s G Zᵀ (s Z G Zᵀ + σ² I)⁻¹ Y`.
//!
//! The kernel `Z G Zᵀ` is eigendecomposed once per fit. In that basis the marginal
//! covariance is diagonal, so each cost/gradient evaluation is linear in the number
//! of training rows.

use wolfe_bfgs::{Bfgs, BfgsError, BfgsSolution};

use crate::chords::{Chord, FeatureDesign};
use crate::error::ConfigurationError;
use crate::linalg::{ProjectionError, project_prior, symmetrize};

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Log-hyperparameters are kept within this distance of their data-driven centre.
pub const RHO_BOUND: f64 = 30.0;

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Eigendecomposition of the marginal covariance failed: {0}")]
    EigendecompositionFailed(#[from] LinalgError),

    #[error("Prior projection failed: {0}")]
    Projection(ProjectionError),

    #[error("Marginal likelihood is not finite at the starting point (cost {0}).")]
    NonFiniteCost(f64),
}

/// Settings for the outer hyperparameter search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemlConfig {
    pub max_iterations: usize,
    /// Gradient-norm tolerance on the per-element cost.
    pub tolerance: f64,
}

impl Default for RemlConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-8,
        }
    }
}

/// Posterior feature patterns and the hyperparameters that produced them.
#[derive(Debug, Clone)]
pub struct RidgeFit {
    /// Features x channels.
    pub patterns: Array2<f64>,
    /// `log s`
    pub log_signal: f64,
    /// `log σ²`
    pub log_noise: f64,
    /// BFGS iterations completed; 0 when the search aborted without reporting a solution.
    pub iterations: usize,
    /// False when BFGS stopped early and the best evaluated point was used instead.
    pub converged: bool,
}

impl RidgeFit {
    /// Shrinkage ratio `σ² / s`.
    pub fn lambda(&self) -> f64 {
        (self.log_noise - self.log_signal).exp()
    }
}

/// A design matrix paired with its chord prior projected into feature space.
///
/// Built once per model and region; read-only afterwards and safe to share across
/// folds and threads.
#[derive(Debug, Clone)]
pub struct FeatureEstimator {
    design: FeatureDesign,
    feature_prior: Array2<f64>,
}

impl FeatureEstimator {
    pub fn new(
        design: FeatureDesign,
        chord_prior: ArrayView2<f64>,
    ) -> Result<Self, EstimationError> {
        let feature_prior = match project_prior(&design, chord_prior) {
            Ok(g) => g,
            Err(ProjectionError::RankDeficient { rank, columns }) => {
                return Err(ConfigurationError::MalformedDesign {
                    model: design.name.clone(),
                    rank,
                    columns,
                }
                .into());
            }
            Err(other) => return Err(EstimationError::Projection(other)),
        };
        Ok(Self {
            design,
            feature_prior,
        })
    }

    pub fn design(&self) -> &FeatureDesign {
        &self.design
    }

    /// A model with `F` features cannot be estimated from fewer than `F` channels.
    pub fn check_channels(&self, channels: usize) -> Result<(), ConfigurationError> {
        let required = self.design.num_features();
        if channels < required {
            return Err(ConfigurationError::InsufficientChannels {
                model: self.design.name.clone(),
                channels,
                required,
            });
        }
        Ok(())
    }

    /// Fits the hyperparameters on `y` (rows labelled by `chords`) and returns the
    /// posterior mean feature patterns.
    pub fn fit(
        &self,
        y: ArrayView2<f64>,
        chords: &[Chord],
        config: &RemlConfig,
    ) -> Result<RidgeFit, EstimationError> {
        self.check_channels(y.ncols())?;
        if chords.len() != y.nrows() {
            return Err(ConfigurationError::LengthMismatch {
                name: "chord",
                rows: y.nrows(),
                len: chords.len(),
            }
            .into());
        }

        let rows: Vec<usize> = chords.iter().map(|c| c.index()).collect();
        let z = self.design.matrix.select(Axis(0), &rows);
        let zg = z.dot(&self.feature_prior);
        let kernel = symmetrize(zg.dot(&z.t()).view());
        let (eigenvalues, eigenvectors) = kernel.eigh(UPLO::Lower)?;
        let eigenvalues = eigenvalues.mapv(|v| v.max(0.0));

        let rotated = eigenvectors.t().dot(&y);
        let energy = rotated.map_axis(Axis(1), |row| row.dot(&row));

        let state = Arc::new(internal::RemlState::new(eigenvalues, energy, y.ncols()));
        let outcome = internal::optimize_hyperparameters(&state, config)?;
        log::debug!(
            "{}: log s = {:.4}, log σ² = {:.4} after {} BFGS iterations (converged: {})",
            self.design.name,
            outcome.log_signal,
            outcome.log_noise,
            outcome.iterations,
            outcome.converged
        );

        let signal = outcome.log_signal.exp();
        let noise = outcome.log_noise.exp();
        let marginal_variances = state.marginal_variances(signal, noise);
        let weighted = &rotated / &marginal_variances.insert_axis(Axis(1));
        let v_inv_y = eigenvectors.dot(&weighted);
        let patterns = zg.t().dot(&v_inv_y) * signal;

        Ok(RidgeFit {
            patterns,
            log_signal: outcome.log_signal,
            log_noise: outcome.log_noise,
            iterations: outcome.iterations,
            converged: outcome.converged,
        })
    }
}

/// Bounded reparameterization: `rho = B · tanh(z / B)` keeps `|rho| < B` for any `z`.
pub(crate) fn to_rho_from_z(z: &Array1<f64>) -> Array1<f64> {
    z.mapv(|v| RHO_BOUND * (v / RHO_BOUND).tanh())
}

pub(crate) fn to_z_from_rho(rho: &Array1<f64>) -> Array1<f64> {
    rho.mapv(|r| {
        let scaled = (r / RHO_BOUND).clamp(-1.0 + 1e-12, 1.0 - 1e-12);
        RHO_BOUND * scaled.atanh()
    })
}

pub(crate) fn jacobian_drho_dz(z: &Array1<f64>) -> Array1<f64> {
    z.mapv(|v| {
        let t = (v / RHO_BOUND).tanh();
        1.0 - t * t
    })
}

/// Internal module for the hyperparameter search.
mod internal {
    use super::*;

    /// Result of the outer search, in absolute log units.
    pub(super) struct HyperparameterFit {
        pub(super) log_signal: f64,
        pub(super) log_noise: f64,
        pub(super) iterations: usize,
        pub(super) converged: bool,
    }

    /// Marginal likelihood of the training rows in the eigenbasis of `Z G Zᵀ`.
    ///
    /// With kernel eigenvalues `λᵢ` and per-direction data energy `wᵢ` (sum of
    /// squares over channels of the rotated observations), the per-element negative
    /// log-likelihood is
    ///
    /// ```text
    /// C = 1 / (2 N P) · Σᵢ [ P · ln dᵢ + wᵢ / dᵢ ],    dᵢ = s λᵢ + σ²
    /// ```
    pub(super) struct RemlState {
        pub(super) eigenvalues: Array1<f64>,
        energy: Array1<f64>,
        channels: f64,
        /// Data-driven origin of the log-hyperparameters.
        pub(super) center: [f64; 2],
    }

    impl RemlState {
        pub(super) fn new(eigenvalues: Array1<f64>, energy: Array1<f64>, channels: usize) -> Self {
            let n = eigenvalues.len().max(1) as f64;
            let p = channels.max(1) as f64;
            let variance = (energy.sum() / (n * p)).max(1e-300);
            let mean_eigenvalue = (eigenvalues.sum() / n).max(1e-300);
            Self {
                eigenvalues,
                energy,
                channels: p,
                center: [(variance / mean_eigenvalue).ln(), variance.ln()],
            }
        }

        fn normalizer(&self) -> f64 {
            0.5 / (self.eigenvalues.len().max(1) as f64 * self.channels)
        }

        pub(super) fn marginal_variances(&self, signal: f64, noise: f64) -> Array1<f64> {
            self.eigenvalues
                .mapv(|lambda| (signal * lambda + noise).max(f64::MIN_POSITIVE))
        }

        /// Cost and gradient with respect to `(log s, log σ²)`.
        pub(super) fn cost_and_gradient(&self, log_signal: f64, log_noise: f64) -> (f64, [f64; 2]) {
            let signal = log_signal.exp();
            let noise = log_noise.exp();
            let mut cost = 0.0;
            let mut grad = [0.0; 2];
            for (&lambda, &w) in self.eigenvalues.iter().zip(self.energy.iter()) {
                let d = (signal * lambda + noise).max(f64::MIN_POSITIVE);
                let fit_term = if w == 0.0 { 0.0 } else { w / d };
                cost += self.channels * d.ln() + fit_term;
                let slope = self.channels / d - fit_term / d;
                grad[0] += signal * lambda * slope;
                grad[1] += noise * slope;
            }
            let scale = self.normalizer();
            (cost * scale, [grad[0] * scale, grad[1] * scale])
        }

        /// Cost and gradient in the unbounded BFGS coordinates.
        pub(super) fn cost_and_gradient_z(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
            let rho = to_rho_from_z(z);
            let (cost, grad_rho) =
                self.cost_and_gradient(self.center[0] + rho[0], self.center[1] + rho[1]);
            let jac = jacobian_drho_dz(z);
            (cost, Array1::from_vec(vec![grad_rho[0] * jac[0], grad_rho[1] * jac[1]]))
        }
    }

    /// Coarse grid of starting offsets. Both axes reach close to the lower bound
    /// so noise-free data can start near a vanishing noise variance.
    fn rho_seeds() -> Vec<Array1<f64>> {
        const AXIS: [f64; 8] = [-29.0, -20.0, -10.0, -3.0, 0.0, 3.0, 10.0, 20.0];
        AXIS.iter()
            .flat_map(|&a| AXIS.iter().map(move |&b| Array1::from_vec(vec![a, b])))
            .collect()
    }

    struct BestPoint {
        value: f64,
        z: Array1<f64>,
    }

    pub(super) fn optimize_hyperparameters(
        state: &Arc<RemlState>,
        config: &RemlConfig,
    ) -> Result<HyperparameterFit, EstimationError> {
        let mut initial_z = Array1::zeros(2);
        let mut initial_cost = f64::INFINITY;
        for rho in rho_seeds() {
            let z = to_z_from_rho(&rho);
            let (cost, _) = state.cost_and_gradient_z(&z);
            if cost < initial_cost {
                initial_cost = cost;
                initial_z = z;
            }
        }
        if !initial_cost.is_finite() {
            return Err(EstimationError::NonFiniteCost(initial_cost));
        }

        let best = Arc::new(Mutex::new(BestPoint {
            value: initial_cost,
            z: initial_z.clone(),
        }));
        let best_for_closure = Arc::clone(&best);
        let state_for_closure = Arc::clone(state);
        let cost_and_grad = move |z: &Array1<f64>| -> (f64, Array1<f64>) {
            let (cost, grad) = state_for_closure.cost_and_gradient_z(z);
            if !cost.is_finite() {
                log::warn!("Non-finite marginal likelihood at z = {z:?}, returning large finite value");
                return (1e10, Array1::zeros(z.len()));
            }
            if let Ok(mut incumbent) = best_for_closure.lock() {
                if cost < incumbent.value {
                    incumbent.value = cost;
                    incumbent.z = z.clone();
                }
            }
            (cost, grad)
        };

        let (final_z, iterations, converged) = match Bfgs::new(initial_z, cost_and_grad)
            .with_tolerance(config.tolerance)
            .with_max_iterations(config.max_iterations)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                iterations,
                ..
            }) => (final_point, iterations as usize, true),
            Err(err) => {
                let completed = match &err {
                    BfgsError::LineSearchFailed { last_solution, .. } => last_solution.iterations,
                    BfgsError::MaxIterationsReached { last_solution, .. } => {
                        last_solution.iterations
                    }
                    _ => 0,
                };
                log::debug!(
                    "BFGS stopped after {completed} iterations ({err:?}); using best evaluated point"
                );
                let z = match best.lock() {
                    Ok(incumbent) => incumbent.z.clone(),
                    Err(poisoned) => poisoned.into_inner().z.clone(),
                };
                (z, completed as usize, false)
            }
        };

        let rho = to_rho_from_z(&final_z);
        Ok(HyperparameterFit {
            log_signal: state.center[0] + rho[0],
            log_noise: state.center[1] + rho[1],
            iterations,
            converged,
        })
    }
}
