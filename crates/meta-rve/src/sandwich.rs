//! Cluster-robust sandwich covariance estimators
//!
//! For a weighted fit `beta = B X' W y` with `B = (X'WX)^-1` and clusters `j`,
//!
//! `V_R = c B [sum_j X_j' L_j e_j e_j' L_j' X_j] B`
//!
//! where CR1 uses `L_j = W_j` and `c = m / (m - p)`, and CR2 (Bell-McCaffrey)
//! uses `L_j = W_j^1/2 (I - W_j^1/2 X_j B X_j' W_j^1/2)^-1/2 W_j^1/2` and
//! `c = 1`. CR2 degrees of freedom follow the Satterthwaite approximation
//! under the working covariance; CR1 uses `m - p`.

use meta_core::linalg::{symmetric_inverse_sqrt, symmetric_sqrt};
use meta_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Smallest admissible eigenvalue of `I - W^1/2 X_j B X_j' W^1/2`
const LEVERAGE_TOLERANCE: f64 = 1e-8;

/// Small-sample adjustment of the sandwich estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmallSampleCorrection {
    /// Degrees-of-freedom scaling `m / (m - p)`
    Cr1,
    /// Bias-reduced linearisation
    Cr2,
}

impl fmt::Display for SmallSampleCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cr1 => write!(f, "CR1"),
            Self::Cr2 => write!(f, "CR2"),
        }
    }
}

/// Everything the sandwich needs from a weighted fit
#[derive(Debug, Clone, Copy)]
pub struct ClusteredFit<'a> {
    pub x: &'a DMatrix<f64>,
    pub residuals: &'a DVector<f64>,
    /// Row indices of every cluster
    pub clusters: &'a [Vec<usize>],
    /// Working weight block `W_j` of every cluster
    pub weights: &'a [DMatrix<f64>],
    /// Working covariance block of every cluster, used for the df approximation
    pub working_covariance: &'a [DMatrix<f64>],
    /// `(X'WX)^-1`
    pub bread: &'a DMatrix<f64>,
}

/// Robust covariance of the coefficients
#[derive(Debug, Clone, PartialEq)]
pub struct SandwichEstimate {
    pub vcov: DMatrix<f64>,
    /// The correction actually applied
    pub correction: SmallSampleCorrection,
    /// Degrees of freedom per coefficient
    pub df: Vec<f64>,
    pub warnings: Vec<String>,
}

/// Robust covariance with the requested correction, falling back from CR2
/// to CR1 when the CR2 adjustment matrices do not exist
pub fn cluster_robust(
    fit: &ClusteredFit<'_>,
    requested: SmallSampleCorrection,
) -> Result<SandwichEstimate> {
    let m = fit.clusters.len();
    let p = fit.x.ncols();
    if fit.weights.len() != m || fit.working_covariance.len() != m {
        return Err(Error::InvalidInput(format!(
            "{m} clusters but {} weight blocks and {} covariance blocks",
            fit.weights.len(),
            fit.working_covariance.len()
        )));
    }
    if m <= p {
        return Err(Error::too_few(p + 1, m, "cluster-robust variance"));
    }

    let mut warnings = Vec::new();
    if requested == SmallSampleCorrection::Cr2 {
        match cr2_adjustments(fit) {
            Some(adjustments) => {
                let vcov = meat_and_bread(fit, &adjustments, 1.0);
                let df = satterthwaite(fit, &adjustments)?;
                let df = df
                    .into_iter()
                    .map(|d| if d.is_finite() && d > 0.0 { d } else { (m - p) as f64 })
                    .collect();
                debug!(clusters = m, "CR2 sandwich estimate");
                return Ok(SandwichEstimate {
                    vcov,
                    correction: SmallSampleCorrection::Cr2,
                    df,
                    warnings,
                });
            }
            None => {
                let message =
                    "CR2 adjustment matrices are singular; fell back to CR1".to_string();
                warn!("{message}");
                warnings.push(message);
            }
        }
    }

    let vcov = meat_and_bread(fit, fit.weights, m as f64 / (m - p) as f64);
    Ok(SandwichEstimate {
        vcov,
        correction: SmallSampleCorrection::Cr1,
        df: vec![(m - p) as f64; p],
        warnings,
    })
}

/// `W_j^1/2 (I - M_j)^-1/2 W_j^1/2` for every cluster, `None` if any fails
fn cr2_adjustments(fit: &ClusteredFit<'_>) -> Option<Vec<DMatrix<f64>>> {
    fit.clusters
        .iter()
        .zip(fit.weights)
        .map(|(members, weights)| {
            let root = symmetric_sqrt(weights)?;
            let xj = fit.x.select_rows(members);
            let leverage = &root * &xj * fit.bread * xj.transpose() * &root;
            let complement = DMatrix::identity(members.len(), members.len()) - leverage;
            // eigenvalues of I - M lie in [0, 1]; zero means a cluster with full leverage
            if complement.clone().symmetric_eigen().eigenvalues.min() < LEVERAGE_TOLERANCE {
                return None;
            }
            let adjustment = symmetric_inverse_sqrt(&complement)?;
            let l = &root * adjustment * &root;
            l.iter().all(|v| v.is_finite()).then_some(l)
        })
        .collect()
}

fn meat_and_bread(fit: &ClusteredFit<'_>, adjustments: &[DMatrix<f64>], scale: f64) -> DMatrix<f64> {
    let p = fit.x.ncols();
    let mut meat = DMatrix::zeros(p, p);
    for (members, l) in fit.clusters.iter().zip(adjustments) {
        let xj = fit.x.select_rows(members);
        let ej = DVector::from_iterator(members.len(), members.iter().map(|&i| fit.residuals[i]));
        let score = xj.transpose() * (l * ej);
        meat += &score * score.transpose();
    }
    fit.bread * meat * fit.bread * scale
}

/// Satterthwaite df for every coefficient under the working covariance
///
/// Writing `c' V_R c = sum_j (t_j' y)^2`, the df is
/// `(tr G)^2 / ||G||_F^2` with `G_ab = t_a' Phi t_b`.
fn satterthwaite(fit: &ClusteredFit<'_>, adjustments: &[DMatrix<f64>]) -> Result<Vec<f64>> {
    let k = fit.x.nrows();
    let p = fit.x.ncols();
    let m = fit.clusters.len();

    // W X B, with W block diagonal
    let mut wx = DMatrix::zeros(k, p);
    for (members, weights) in fit.clusters.iter().zip(fit.weights) {
        let block = weights * fit.x.select_rows(members);
        for (a, &i) in members.iter().enumerate() {
            wx.set_row(i, &block.row(a));
        }
    }
    let wxb = wx * fit.bread;

    (0..p)
        .map(|r| {
            let bc = fit.bread.column(r).into_owned();
            let columns: Vec<DVector<f64>> = fit
                .clusters
                .iter()
                .zip(adjustments)
                .map(|(members, l)| {
                    let u = l * (fit.x.select_rows(members) * &bc);
                    let mut z = DVector::zeros(k);
                    for (a, &i) in members.iter().enumerate() {
                        z[i] = u[a];
                    }
                    let projected = &wxb * (fit.x.transpose() * &z);
                    z - projected
                })
                .collect();

            // Phi t_b, Phi block diagonal
            let phi_t: Vec<DVector<f64>> = columns
                .iter()
                .map(|t| {
                    let mut out = DVector::zeros(k);
                    for (members, phi) in fit.clusters.iter().zip(fit.working_covariance) {
                        let tj = DVector::from_iterator(members.len(), members.iter().map(|&i| t[i]));
                        let block = phi * tj;
                        for (a, &i) in members.iter().enumerate() {
                            out[i] = block[a];
                        }
                    }
                    out
                })
                .collect();

            let mut trace = 0.0;
            let mut frobenius = 0.0;
            for a in 0..m {
                for b in 0..m {
                    let g = columns[a].dot(&phi_t[b]);
                    if a == b {
                        trace += g;
                    }
                    frobenius += g * g;
                }
            }
            if !(frobenius > 0.0) {
                return Err(Error::Computation(
                    "Satterthwaite approximation is degenerate".to_string(),
                ));
            }
            Ok(trace * trace / frobenius)
        })
        .collect()
}
