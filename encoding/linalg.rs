//! Dense linear-algebra helpers shared by the estimator and the prior builder.
//!
//! Generalized inverses here refuse rank-deficient input instead of silently
//! truncating: a design whose columns are not linearly independent cannot carry a
//! well-defined feature prior, and callers must see that as a configuration error.

use crate::chords::{FeatureDesign, NUM_CHORDS};
use crate::error::ConfigurationError;
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, SVD, UPLO};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Matrix has rank {rank} but {columns} columns.")]
    RankDeficient { rank: usize, columns: usize },

    #[error("Decomposition failed: {0}")]
    Decomposition(#[from] LinalgError),

    #[error("SVD did not return singular vectors.")]
    MissingSingularVectors,
}

/// Numerical rank threshold in the style of LAPACK's `gelss`.
fn rank_tolerance(singular_values: &Array1<f64>, rows: usize, cols: usize) -> f64 {
    let largest = singular_values.iter().cloned().fold(0.0, f64::max);
    largest * rows.max(cols) as f64 * f64::EPSILON
}

/// Moore-Penrose inverse of a matrix with full column rank.
///
/// Returns `RankDeficient` instead of a truncated inverse when any column is
/// linearly dependent on the others.
pub fn full_column_pseudo_inverse(a: ArrayView2<f64>) -> Result<Array2<f64>, ProjectionError> {
    let (rows, cols) = a.dim();
    let (u, sigma, vt) = a.svd(true, true)?;
    let (u, vt) = match (u, vt) {
        (Some(u), Some(vt)) => (u, vt),
        _ => return Err(ProjectionError::MissingSingularVectors),
    };

    let tol = rank_tolerance(&sigma, rows, cols);
    let rank = sigma.iter().filter(|&&v| v > tol).count();
    if rank < cols {
        return Err(ProjectionError::RankDeficient {
            rank,
            columns: cols,
        });
    }

    let k = sigma.len();
    let inv_sigma = sigma.mapv(|v| 1.0 / v);
    let v_scaled = &vt.slice(s![..k, ..]).t() * &inv_sigma.view().insert_axis(Axis(0));
    Ok(v_scaled.dot(&u.slice(s![.., ..k]).t()))
}

/// Projects a chord-level covariance into a design's feature space: `Z⁺ G Z⁺ᵀ`.
pub fn project_prior(
    design: &FeatureDesign,
    chord_prior: ArrayView2<f64>,
) -> Result<Array2<f64>, ProjectionError> {
    let z_plus = full_column_pseudo_inverse(design.matrix.view())?;
    let projected = z_plus.dot(&chord_prior).dot(&z_plus.t());
    Ok(symmetrize(projected.view()))
}

/// `(A + Aᵀ) / 2`.
pub fn symmetrize(a: ArrayView2<f64>) -> Array2<f64> {
    (&a + &a.t()) * 0.5
}

/// Nearest positive-semidefinite matrix in Frobenius norm: clips negative eigenvalues.
pub fn nearest_psd(a: ArrayView2<f64>) -> Result<Array2<f64>, LinalgError> {
    let sym = symmetrize(a);
    let (eigvals, eigvecs) = sym.eigh(UPLO::Lower)?;
    let clipped = eigvals.mapv(|v| v.max(0.0));
    let scaled = &eigvecs * &clipped.view().insert_axis(Axis(0));
    Ok(symmetrize(scaled.dot(&eigvecs.t()).view()))
}

/// Checks that a chord prior is 31x31, finite and symmetric.
pub fn validate_chord_prior(prior: ArrayView2<f64>) -> Result<(), ConfigurationError> {
    let (rows, cols) = prior.dim();
    if rows != NUM_CHORDS || cols != NUM_CHORDS {
        return Err(ConfigurationError::PriorShape {
            expected: NUM_CHORDS,
            rows,
            cols,
        });
    }
    if prior.iter().any(|v| !v.is_finite()) {
        return Err(ConfigurationError::InvalidPrior);
    }
    let scale = prior.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1.0);
    let asymmetry = (&prior - &prior.t())
        .iter()
        .fold(0.0_f64, |m, v| m.max(v.abs()));
    if asymmetry > 1e-8 * scale {
        return Err(ConfigurationError::InvalidPrior);
    }
    Ok(())
}
