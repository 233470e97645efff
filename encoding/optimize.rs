//! # Derivative-Free Minimization
//!
//! Small direct-search optimizers for low-dimensional objectives without usable
//! gradients. Callers describe the problem through [`Objective`] and pick a
//! [`Minimizer`]; the cross-validation driver only ever sees the trait object, so a
//! different search strategy can be substituted through configuration.
//!
//! Exhausting the iteration budget is not an error. The best point found is
//! returned with `converged == false` and it is up to the caller to flag it.

use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// A scalar function to be minimized.
/// Its dimension is that of the starting point handed to [`Minimizer::minimize`].
pub trait Objective {
    /// Non-finite values are treated as `+inf` by the minimizers.
    fn value(&self, x: ArrayView1<f64>) -> f64;
}

/// Outcome of a minimization run.
#[derive(Clone, Debug)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// A local search strategy.
pub trait Minimizer: Send + Sync {
    fn minimize(&self, objective: &dyn Objective, start: Array1<f64>) -> Minimum;
}

/// Selects and configures one of the built-in strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    #[default]
    NelderMead,
    PatternSearch,
}

impl SearchStrategy {
    pub fn build(self, max_iterations: usize, tolerance: f64) -> Box<dyn Minimizer> {
        match self {
            SearchStrategy::NelderMead => Box::new(NelderMead {
                max_iterations,
                tolerance,
            }),
            SearchStrategy::PatternSearch => Box::new(PatternSearch {
                max_iterations,
                tolerance,
                initial_step: 0.5,
            }),
        }
    }
}

fn evaluate(objective: &dyn Objective, x: &Array1<f64>) -> f64 {
    let v = objective.value(x.view());
    if v.is_finite() { v } else { f64::INFINITY }
}

/// Downhill simplex search with the standard reflection/expansion/contraction/shrink
/// coefficients (1, 2, 1/2, 1/2).
#[derive(Clone, Debug)]
pub struct NelderMead {
    pub max_iterations: usize,
    /// Stop once both the spread of simplex values and the largest vertex distance
    /// from the best vertex fall below this.
    pub tolerance: f64,
}

impl NelderMead {
    const REFLECT: f64 = 1.0;
    const EXPAND: f64 = 2.0;
    const CONTRACT: f64 = 0.5;
    const SHRINK: f64 = 0.5;

    fn initial_simplex(objective: &dyn Objective, start: &Array1<f64>) -> Vec<(Array1<f64>, f64)> {
        let mut simplex = Vec::with_capacity(start.len() + 1);
        simplex.push((start.clone(), evaluate(objective, start)));
        for i in 0..start.len() {
            let mut vertex = start.clone();
            vertex[i] = if vertex[i] != 0.0 {
                vertex[i] * 1.05
            } else {
                0.00025
            };
            let value = evaluate(objective, &vertex);
            simplex.push((vertex, value));
        }
        simplex
    }
}

impl Minimizer for NelderMead {
    fn minimize(&self, objective: &dyn Objective, start: Array1<f64>) -> Minimum {
        let n = start.len();
        if n == 0 {
            let value = evaluate(objective, &start);
            return Minimum {
                point: start,
                value,
                iterations: 0,
                converged: true,
            };
        }
        let mut simplex = Self::initial_simplex(objective, &start);
        let mut iterations = 0;
        let mut converged = false;

        loop {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            let best = &simplex[0];
            let value_spread = (simplex[n].1 - best.1).abs();
            let point_spread = simplex[1..]
                .iter()
                .map(|(v, _)| (v - &best.0).fold(0.0_f64, |m, d| m.max(d.abs())))
                .fold(0.0_f64, f64::max);
            let collapsed = point_spread <= self.tolerance;
            if collapsed && (value_spread <= self.tolerance || !value_spread.is_finite()) {
                converged = true;
                break;
            }
            if iterations >= self.max_iterations {
                break;
            }
            iterations += 1;

            let centroid = simplex[..n]
                .iter()
                .fold(Array1::<f64>::zeros(n), |acc, (v, _)| acc + v)
                / n as f64;
            let worst = simplex[n].clone();

            let reflected = &centroid + &((&centroid - &worst.0) * Self::REFLECT);
            let f_reflected = evaluate(objective, &reflected);

            if f_reflected < simplex[0].1 {
                let expanded = &centroid + &((&reflected - &centroid) * Self::EXPAND);
                let f_expanded = evaluate(objective, &expanded);
                simplex[n] = if f_expanded < f_reflected {
                    (expanded, f_expanded)
                } else {
                    (reflected, f_reflected)
                };
                continue;
            }
            if f_reflected < simplex[n - 1].1 {
                simplex[n] = (reflected, f_reflected);
                continue;
            }

            let (contracted, f_contracted) = if f_reflected < worst.1 {
                let c = &centroid + &((&reflected - &centroid) * Self::CONTRACT);
                let f = evaluate(objective, &c);
                (c, f)
            } else {
                let c = &centroid + &((&worst.0 - &centroid) * Self::CONTRACT);
                let f = evaluate(objective, &c);
                (c, f)
            };
            if f_contracted < worst.1.min(f_reflected) {
                simplex[n] = (contracted, f_contracted);
                continue;
            }

            let anchor = simplex[0].0.clone();
            for vertex in simplex.iter_mut().skip(1) {
                let shrunk = &anchor + &((&vertex.0 - &anchor) * Self::SHRINK);
                let f = evaluate(objective, &shrunk);
                *vertex = (shrunk, f);
            }
        }

        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let (point, value) = simplex.swap_remove(0);
        Minimum {
            point,
            value,
            iterations,
            converged,
        }
    }
}

/// Compass search: polls `±step` along each axis, halving the step whenever no poll
/// point improves on the incumbent.
#[derive(Clone, Debug)]
pub struct PatternSearch {
    pub max_iterations: usize,
    /// Stop once the step length drops below this.
    pub tolerance: f64,
    pub initial_step: f64,
}

impl Minimizer for PatternSearch {
    fn minimize(&self, objective: &dyn Objective, start: Array1<f64>) -> Minimum {
        let mut point = start;
        let mut value = evaluate(objective, &point);
        let mut step = self.initial_step;
        let mut iterations = 0;

        while step >= self.tolerance && iterations < self.max_iterations {
            iterations += 1;
            let mut improved = false;
            for axis in 0..point.len() {
                for direction in [1.0, -1.0] {
                    let mut trial = point.clone();
                    trial[axis] += direction * step;
                    let f = evaluate(objective, &trial);
                    if f < value {
                        point = trial;
                        value = f;
                        improved = true;
                        break;
                    }
                }
            }
            if !improved {
                step *= 0.5;
            }
        }

        Minimum {
            point,
            value,
            iterations,
            converged: step < self.tolerance,
        }
    }
}
