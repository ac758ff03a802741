//! Dense linear algebra helpers on top of `nalgebra`
//!
//! Weighted least squares, inverses of symmetric positive definite matrices
//! and symmetric matrix square roots. Every model in the workspace solves its
//! normal equations through [`weighted_least_squares`].

use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};

/// Relative eigenvalue floor below which a symmetric matrix is treated as singular
pub const EIGEN_TOLERANCE: f64 = 1e-10;

/// Solution of a weighted least-squares problem
#[derive(Debug, Clone, PartialEq)]
pub struct WlsSolution {
    /// Coefficients
    pub beta: DVector<f64>,
    /// `(X' W X)^-1`
    pub bread: DMatrix<f64>,
    /// Residuals `y - X beta`
    pub residuals: DVector<f64>,
}

impl WlsSolution {
    /// Weighted residual sum of squares `r' W r`
    pub fn weighted_rss(&self, weights: &DVector<f64>) -> f64 {
        self.residuals
            .iter()
            .zip(weights.iter())
            .map(|(r, w)| w * r * r)
            .sum()
    }
}

/// Invert a symmetric positive definite matrix through its Cholesky factor
pub fn spd_inverse(matrix: &DMatrix<f64>, context: &str) -> Result<DMatrix<f64>> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(Error::non_finite(context));
    }
    match matrix.clone().cholesky() {
        Some(chol) => Ok(chol.inverse()),
        None => Err(Error::singular(context)),
    }
}

/// `ln |M|` of a symmetric positive definite matrix
pub fn spd_log_det(matrix: &DMatrix<f64>, context: &str) -> Result<f64> {
    let chol = matrix
        .clone()
        .cholesky()
        .ok_or_else(|| Error::singular(context))?;
    Ok(2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>())
}

/// Solve `min (y - X b)' W (y - X b)` for a diagonal weight vector
///
/// The normal equations are solved by Cholesky; a design whose weighted
/// cross-product is singular (collinear predictors, empty dummy columns) is
/// an error rather than a pseudo-inverse.
pub fn weighted_least_squares(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: &DVector<f64>,
) -> Result<WlsSolution> {
    let (n, p) = x.shape();
    if n != y.len() || n != weights.len() {
        return Err(Error::InvalidInput(format!(
            "design has {n} rows but {} responses and {} weights",
            y.len(),
            weights.len()
        )));
    }
    if n < p {
        return Err(Error::too_few(p, n, "weighted least squares"));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::non_finite("weights"));
    }

    let xtw = weighted_transpose(x, weights);
    let bread = spd_inverse(&(&xtw * x), "X'WX")?;
    let beta = &bread * (&xtw * y);
    let residuals = y - x * &beta;

    Ok(WlsSolution {
        beta,
        bread,
        residuals,
    })
}

/// Generalised least squares with a full weight matrix `W`
pub fn generalized_least_squares(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weight_matrix: &DMatrix<f64>,
) -> Result<WlsSolution> {
    let xtw = x.transpose() * weight_matrix;
    let bread = spd_inverse(&(&xtw * x), "X'WX")?;
    let beta = &bread * (&xtw * y);
    let residuals = y - x * &beta;
    Ok(WlsSolution {
        beta,
        bread,
        residuals,
    })
}

/// `X' diag(w)` without materialising the diagonal matrix
pub fn weighted_transpose(x: &DMatrix<f64>, weights: &DVector<f64>) -> DMatrix<f64> {
    let mut xtw = x.transpose();
    for (j, w) in weights.iter().enumerate() {
        xtw.column_mut(j).scale_mut(*w);
    }
    xtw
}

/// `M^{-1/2}` of a symmetric matrix, or `None` if it is not positive definite
pub fn symmetric_inverse_sqrt(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    symmetric_power(matrix, -0.5)
}

/// `M^{1/2}` of a symmetric positive semi-definite matrix
pub fn symmetric_sqrt(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    symmetric_power(matrix, 0.5)
}

fn symmetric_power(matrix: &DMatrix<f64>, power: f64) -> Option<DMatrix<f64>> {
    if matrix.nrows() != matrix.ncols() || matrix.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let symmetric = (matrix + matrix.transpose()) * 0.5;
    let eigen = symmetric.symmetric_eigen();
    let scale = eigen
        .eigenvalues
        .iter()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()))
        .max(f64::MIN_POSITIVE);

    let mut powered = eigen.eigenvalues.clone();
    for value in powered.iter_mut() {
        if *value <= EIGEN_TOLERANCE * scale {
            if power < 0.0 {
                return None;
            }
            *value = 0.0;
        } else {
            *value = value.powf(power);
        }
    }

    let vectors = &eigen.eigenvectors;
    Some(vectors * DMatrix::from_diagonal(&powered) * vectors.transpose())
}

/// `a' M b`
pub fn bilinear(a: &DVector<f64>, matrix: &DMatrix<f64>, b: &DVector<f64>) -> f64 {
    a.dot(&(matrix * b))
}
