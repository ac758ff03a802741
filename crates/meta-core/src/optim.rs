//! Derivative-free optimisation and root finding
//!
//! The three-level REML fit and the step selection model maximise
//! likelihoods without closed-form gradients; both use [`NelderMead`].

use crate::{Error, Result};

/// Result of a minimisation
#[derive(Debug, Clone, PartialEq)]
pub struct Minimum {
    pub point: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
}

/// Nelder-Mead simplex minimiser with the standard coefficients
/// (reflection 1, expansion 2, contraction 1/2, shrink 1/2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMead {
    max_iterations: usize,
    f_tolerance: f64,
    x_tolerance: f64,
    initial_step: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_iterations: 4_000,
            f_tolerance: 1e-10,
            x_tolerance: 1e-7,
            initial_step: 0.1,
        }
    }
}

impl NelderMead {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }

    /// Tolerance on the spread of function values, relative to `1 + |f|`
    pub fn with_f_tolerance(mut self, tolerance: f64) -> Self {
        self.f_tolerance = tolerance;
        self
    }

    /// Absolute tolerance on the simplex diameter
    pub fn with_x_tolerance(mut self, tolerance: f64) -> Self {
        self.x_tolerance = tolerance;
        self
    }

    /// Edge length of the initial simplex
    pub fn with_initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self
    }

    /// Minimise `f` from `start`
    ///
    /// Non-finite objective values are treated as `+inf`, so the objective
    /// can signal infeasible points by returning NaN.
    pub fn minimize<F>(&self, mut f: F, start: &[f64]) -> Result<Minimum>
    where
        F: FnMut(&[f64]) -> f64,
    {
        let n = start.len();
        if n == 0 {
            return Err(Error::InvalidInput(
                "Nelder-Mead needs at least one parameter".to_string(),
            ));
        }
        let mut eval = |p: &[f64]| {
            let v = f(p);
            if v.is_finite() {
                v
            } else {
                f64::INFINITY
            }
        };

        let mut simplex: Vec<(Vec<f64>, f64)> = Vec::with_capacity(n + 1);
        let v0 = eval(start);
        simplex.push((start.to_vec(), v0));
        for i in 0..n {
            let mut p = start.to_vec();
            p[i] += self.initial_step;
            let v = eval(&p);
            simplex.push((p, v));
        }

        for iteration in 1..=self.max_iterations {
            simplex.sort_by(|a, b| a.1.total_cmp(&b.1));

            let best = simplex[0].1;
            let worst = simplex[n].1;
            let diameter = simplex[1..]
                .iter()
                .flat_map(|(p, _)| p.iter().zip(&simplex[0].0).map(|(a, b)| (a - b).abs()))
                .fold(0.0_f64, f64::max);
            if best.is_finite()
                && (worst - best).abs() <= self.f_tolerance * (best.abs() + 1.0)
                && diameter <= self.x_tolerance
            {
                return Ok(Minimum {
                    point: simplex[0].0.clone(),
                    value: best,
                    iterations: iteration,
                });
            }

            let centroid: Vec<f64> = (0..n)
                .map(|j| simplex[..n].iter().map(|(p, _)| p[j]).sum::<f64>() / n as f64)
                .collect();
            let worst_point = simplex[n].0.clone();
            let along = |t: f64| -> Vec<f64> {
                centroid
                    .iter()
                    .zip(&worst_point)
                    .map(|(c, w)| c + t * (w - c))
                    .collect()
            };

            let reflected = along(-1.0);
            let f_reflected = eval(&reflected);

            if f_reflected < best {
                let expanded = along(-2.0);
                let f_expanded = eval(&expanded);
                simplex[n] = if f_expanded < f_reflected {
                    (expanded, f_expanded)
                } else {
                    (reflected, f_reflected)
                };
            } else if f_reflected < simplex[n - 1].1 {
                simplex[n] = (reflected, f_reflected);
            } else {
                let (contracted, f_contracted) = if f_reflected < worst {
                    let p = along(-0.5);
                    let v = eval(&p);
                    (p, v)
                } else {
                    let p = along(0.5);
                    let v = eval(&p);
                    (p, v)
                };

                if f_contracted < f_reflected.min(worst) {
                    simplex[n] = (contracted, f_contracted);
                } else {
                    let anchor = simplex[0].0.clone();
                    for vertex in simplex.iter_mut().skip(1) {
                        let shrunk: Vec<f64> = anchor
                            .iter()
                            .zip(&vertex.0)
                            .map(|(a, x)| a + 0.5 * (x - a))
                            .collect();
                        let v = eval(&shrunk);
                        *vertex = (shrunk, v);
                    }
                }
            }
        }

        Err(Error::no_convergence("Nelder-Mead", self.max_iterations))
    }
}

/// Root of a monotone function on `[lo, hi]` by bisection
///
/// `f(lo)` and `f(hi)` must have opposite signs (or one of them be zero).
pub fn bisect<F>(mut f: F, mut lo: f64, mut hi: f64, tolerance: f64, max_iterations: usize) -> Result<f64>
where
    F: FnMut(f64) -> f64,
{
    let mut f_lo = f(lo);
    let f_hi = f(hi);
    if f_lo == 0.0 {
        return Ok(lo);
    }
    if f_hi == 0.0 {
        return Ok(hi);
    }
    if !(f_lo.is_finite() && f_hi.is_finite()) || f_lo.signum() == f_hi.signum() {
        return Err(Error::Computation(format!(
            "bisection interval [{lo}, {hi}] does not bracket a root"
        )));
    }

    for _ in 0..max_iterations {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if f_mid == 0.0 || (hi - lo) * 0.5 < tolerance {
            return Ok(mid);
        }
        if f_mid.signum() == f_lo.signum() {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
    }

    Err(Error::no_convergence("bisection", max_iterations))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_quadratic_minimum() {
        let nm = NelderMead::new(2_000);
        let min = nm
            .minimize(|p| (p[0] - 1.5).powi(2) + 2.0 * (p[1] + 0.5).powi(2) + 3.0, &[0.0, 0.0])
            .unwrap();
        assert_abs_diff_eq!(min.point[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(min.point[1], -0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(min.value, 3.0, epsilon = 1e-8);
    }

    #[test]
    fn test_rosenbrock() {
        let nm = NelderMead::new(10_000);
        let min = nm
            .minimize(
                |p| 100.0 * (p[1] - p[0] * p[0]).powi(2) + (1.0 - p[0]).powi(2),
                &[-1.2, 1.0],
            )
            .unwrap();
        assert_abs_diff_eq!(min.point[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(min.point[1], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_budget_exhaustion() {
        let nm = NelderMead::new(3);
        let result = nm.minimize(|p| (p[0] - 10.0).powi(2), &[0.0]);
        assert!(matches!(result, Err(Error::Convergence { iterations: 3, .. })));
    }

    #[test]
    fn test_bisect() {
        let root = bisect(|x| x * x - 2.0, 0.0, 2.0, 1e-12, 200).unwrap();
        assert_abs_diff_eq!(root, 2.0_f64.sqrt(), epsilon = 1e-10);
        assert!(bisect(|x| x * x + 1.0, 0.0, 2.0, 1e-12, 200).is_err());
    }
}
