//! Working models that supply RVE weights
//!
//! Both schemes estimate their variance components by the method of moments:
//! for a residual quadratic form `Q = e' W e` with `e = (I - H) y`,
//! `E[Q] = tr(W (I - H) Omega (I - H)')`, which is linear in the components
//! of `Omega`.

use meta_core::linalg::weighted_least_squares;
use meta_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Working-model family
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WeightingScheme {
    /// Effect sizes within a study share a common correlation `rho`
    CorrelatedEffects { rho: f64 },
    /// Independent within- and between-study random effects
    HierarchicalEffects,
}

/// Diagonal RVE weights with the variance components behind them
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingModel {
    pub weights: DVector<f64>,
    /// Between-study variance
    pub tau2: f64,
    /// Within-study variance of the hierarchical model
    pub omega2: Option<f64>,
    /// A moment estimate was negative and has been set to zero
    pub truncated: bool,
}

impl WorkingModel {
    /// Working covariance blocks `W_j^-1`
    pub fn covariance_blocks(&self, clusters: &[Vec<usize>]) -> Vec<DMatrix<f64>> {
        clusters
            .iter()
            .map(|members| {
                DMatrix::from_diagonal(&DVector::from_iterator(
                    members.len(),
                    members.iter().map(|&i| 1.0 / self.weights[i]),
                ))
            })
            .collect()
    }

    /// Weight blocks `W_j`
    pub fn weight_blocks(&self, clusters: &[Vec<usize>]) -> Vec<DMatrix<f64>> {
        clusters
            .iter()
            .map(|members| {
                DMatrix::from_diagonal(&DVector::from_iterator(
                    members.len(),
                    members.iter().map(|&i| self.weights[i]),
                ))
            })
            .collect()
    }
}

/// Expected-value pieces of one residual quadratic form
struct Moments {
    q: f64,
    /// `tr(W R S R')` for the sampling covariance `S`
    sampling: f64,
    /// `tr(W R J R')`, `J` block diagonal of ones
    between: f64,
    /// `tr(W R R')`
    within: f64,
}

fn moments(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: &DVector<f64>,
    sampling: &DMatrix<f64>,
    clusters: &[Vec<usize>],
) -> Result<Moments> {
    let k = y.len();
    let solution = weighted_least_squares(x, y, weights)?;
    let q = solution.weighted_rss(weights);

    // R = I - X B X' W
    let mut xtw = x.transpose();
    for (j, w) in weights.iter().enumerate() {
        xtw.column_mut(j).scale_mut(*w);
    }
    let residual_maker = DMatrix::identity(k, k) - x * &solution.bread * xtw;
    let mut weighted = residual_maker.clone();
    for (i, w) in weights.iter().enumerate() {
        weighted.row_mut(i).scale_mut(*w);
    }

    // tr(A M B') = sum_ij (A M)_ij B_ij
    let trace_with = |middle: &DMatrix<f64>| (&weighted * middle).component_mul(&residual_maker).sum();
    let mut ones = DMatrix::zeros(k, k);
    for members in clusters {
        for &a in members {
            for &b in members {
                ones[(a, b)] = 1.0;
            }
        }
    }

    Ok(Moments {
        q,
        sampling: trace_with(sampling),
        between: trace_with(&ones),
        within: weighted.component_mul(&residual_maker).sum(),
    })
}

/// Study sizes and mean sampling variances, per effect size
fn study_summaries(v: &DVector<f64>, clusters: &[Vec<usize>]) -> (Vec<f64>, Vec<f64>) {
    let mut size = vec![0.0; v.len()];
    let mut mean_variance = vec![0.0; v.len()];
    for members in clusters {
        let mean = members.iter().map(|&i| v[i]).sum::<f64>() / members.len() as f64;
        for &i in members {
            size[i] = members.len() as f64;
            mean_variance[i] = mean;
        }
    }
    (size, mean_variance)
}

/// Correlated-effects weights `1 / (k_j (vbar_j + tau2))`
///
/// τ² comes from `Q_E` under the initial weights `1 / (k_j vbar_j)` with
/// sampling covariance `rho * vbar_j` between effect sizes of a study.
pub fn correlated_effects(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    clusters: &[Vec<usize>],
    rho: f64,
) -> Result<WorkingModel> {
    if !(0.0..=1.0).contains(&rho) {
        return Err(Error::Configuration(format!("rho must be in [0, 1], got {rho}")));
    }
    let k = y.len();
    let (size, mean_variance) = study_summaries(v, clusters);
    let initial = DVector::from_iterator(k, (0..k).map(|i| 1.0 / (size[i] * mean_variance[i])));

    let mut sampling = DMatrix::from_diagonal(v);
    for members in clusters {
        for &a in members {
            for &b in members {
                if a != b {
                    sampling[(a, b)] = rho * mean_variance[a];
                }
            }
        }
    }

    let m = moments(x, y, &initial, &sampling, clusters)?;
    let raw = (m.q - m.sampling) / m.between;
    if !raw.is_finite() {
        return Err(Error::non_finite("correlated-effects tau-squared"));
    }
    let tau2 = raw.max(0.0);
    debug!(rho, tau2, q = m.q, "correlated-effects working model");

    Ok(WorkingModel {
        weights: DVector::from_iterator(k, (0..k).map(|i| 1.0 / (size[i] * (mean_variance[i] + tau2)))),
        tau2,
        omega2: None,
        truncated: raw < 0.0,
    })
}

/// Hierarchical-effects weights `1 / (v_ij + tau2 + omega2)`
///
/// τ² (between studies) and ω² (within studies) solve the moment equations
/// of `Q_E` under inverse-variance weights and of the unweighted residual sum
/// of squares. Without any multi-effect study the two are not separable and
/// all heterogeneity is attributed to τ².
pub fn hierarchical_effects(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    clusters: &[Vec<usize>],
) -> Result<WorkingModel> {
    let k = y.len();
    let sampling = DMatrix::from_diagonal(v);
    let inverse = v.map(|vi| 1.0 / vi);
    let weighted = moments(x, y, &inverse, &sampling, clusters)?;

    let single_component = |m: &Moments| ((m.q - m.sampling) / (m.between)).max(0.0);
    let dependent = clusters.iter().any(|c| c.len() > 1);

    let (tau2, omega2, truncated) = if dependent {
        let unweighted = moments(x, y, &DVector::from_element(k, 1.0), &sampling, clusters)?;
        let det = weighted.between * unweighted.within - weighted.within * unweighted.between;
        let r1 = weighted.q - weighted.sampling;
        let r2 = unweighted.q - unweighted.sampling;
        let tau2 = (r1 * unweighted.within - weighted.within * r2) / det;
        let omega2 = (weighted.between * r2 - r1 * unweighted.between) / det;

        if !(tau2.is_finite() && omega2.is_finite()) {
            (single_component(&weighted), 0.0, true)
        } else if tau2 >= 0.0 && omega2 >= 0.0 {
            (tau2, omega2, false)
        } else if omega2 < 0.0 && tau2 >= 0.0 {
            (single_component(&weighted), 0.0, true)
        } else if tau2 < 0.0 && omega2 >= 0.0 {
            (0.0, (r1 / weighted.within).max(0.0), true)
        } else {
            (0.0, 0.0, true)
        }
    } else {
        let raw = (weighted.q - weighted.sampling) / weighted.between;
        (raw.max(0.0), 0.0, raw < 0.0)
    };
    if !(tau2.is_finite() && omega2.is_finite()) {
        return Err(Error::non_finite("hierarchical-effects variance components"));
    }
    debug!(tau2, omega2, "hierarchical-effects working model");

    Ok(WorkingModel {
        weights: v.map(|vi| 1.0 / (vi + tau2 + omega2)),
        tau2,
        omega2: Some(omega2),
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_singleton_clusters_reduce_to_dersimonian_laird() {
        let y = DVector::from_vec(vec![0.1, 0.6, 0.9, 0.2, 1.1]);
        let v = DVector::from_vec(vec![0.02, 0.03, 0.02, 0.04, 0.03]);
        let x = DMatrix::from_element(5, 1, 1.0);
        let clusters: Vec<Vec<usize>> = (0..5).map(|i| vec![i]).collect();

        let w: Vec<f64> = v.iter().map(|vi| 1.0 / vi).collect();
        let sw: f64 = w.iter().sum();
        let sw2: f64 = w.iter().map(|x| x * x).sum();
        let mean = w.iter().zip(y.iter()).map(|(a, b)| a * b).sum::<f64>() / sw;
        let q: f64 = w.iter().zip(y.iter()).map(|(a, b)| a * (b - mean).powi(2)).sum();
        let dl = (q - 4.0) / (sw - sw2 / sw);

        let ce = correlated_effects(&x, &y, &v, &clusters, 0.8).unwrap();
        assert_abs_diff_eq!(ce.tau2, dl, epsilon = 1e-10);

        let he = hierarchical_effects(&x, &y, &v, &clusters).unwrap();
        assert_abs_diff_eq!(he.tau2, dl, epsilon = 1e-10);
        assert_eq!(he.omega2, Some(0.0));
    }

    #[test]
    fn test_rho_out_of_range() {
        let y = DVector::from_vec(vec![0.1, 0.6]);
        let v = DVector::from_vec(vec![0.02, 0.03]);
        let x = DMatrix::from_element(2, 1, 1.0);
        let clusters = vec![vec![0], vec![1]];
        assert!(matches!(
            correlated_effects(&x, &y, &v, &clusters, 1.2),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_hierarchical_components_non_negative() {
        let y = DVector::from_vec(vec![0.05, 0.10, 0.60, 0.55, 0.30, 0.38, 0.90, 0.82]);
        let v = DVector::from_vec(vec![0.02, 0.025, 0.02, 0.025, 0.02, 0.025, 0.02, 0.025]);
        let x = DMatrix::from_element(8, 1, 1.0);
        let clusters = vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![6, 7]];
        let he = hierarchical_effects(&x, &y, &v, &clusters).unwrap();
        assert!(he.tau2 > 0.0);
        assert!(he.omega2.unwrap() >= 0.0);
        assert!(he.weights.iter().all(|w| *w > 0.0 && w.is_finite()));
    }
}
