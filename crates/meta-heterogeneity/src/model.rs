//! The interface shared by every fitted random-effects model
//!
//! Robust variance estimation, influence diagnostics and the moderator
//! engine only need the marginal structure of a fit: the design, the
//! response, the coefficients and the per-cluster working covariance.

use crate::design::Design;
use meta_core::math::distributions::{chi_squared_sf, normal_two_sided_p, z_critical};
use meta_core::{
    CoefficientEstimate, ConfidenceInterval, Error, ModelKind, ReferenceDistribution, Result,
    WaldTest,
};
use nalgebra::{DMatrix, DVector};

/// A fitted marginal model `y ~ N(X beta, V)`
pub trait FittedModel {
    fn kind(&self) -> ModelKind;

    fn design(&self) -> &Design;

    fn response(&self) -> &DVector<f64>;

    /// Sampling variances of the effect sizes
    fn sampling_variances(&self) -> &DVector<f64>;

    fn beta(&self) -> &DVector<f64>;

    /// Model-based covariance of `beta`, `(X' V^-1 X)^-1`
    fn vcov(&self) -> &DMatrix<f64>;

    /// Marginal covariance `V_j` of the rows of one complete cluster
    fn covariance_block(&self, members: &[usize]) -> DMatrix<f64>;

    /// Working weights `V_j^-1` of the rows of one complete cluster
    fn weight_block(&self, members: &[usize]) -> DMatrix<f64>;

    /// Total heterogeneity variance added to every sampling variance
    fn total_heterogeneity(&self) -> f64;

    /// Confidence level used for intervals
    fn confidence_level(&self) -> f64;

    fn k(&self) -> usize {
        self.response().len()
    }

    fn n_params(&self) -> usize {
        self.design().n_params()
    }

    /// Residuals `y - X beta`
    fn residuals(&self) -> DVector<f64> {
        self.response() - self.design().matrix() * self.beta()
    }

    /// Wald z tests and intervals for every coefficient
    fn coefficients(&self) -> Result<Vec<CoefficientEstimate>> {
        let z = z_critical(self.confidence_level())?;
        self.design()
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let estimate = self.beta()[i];
                let se = self.vcov()[(i, i)].max(0.0).sqrt();
                if !(se > 0.0) {
                    return Err(Error::Computation(format!(
                        "coefficient `{name}` has a non-positive standard error"
                    )));
                }
                let statistic = estimate / se;
                Ok(CoefficientEstimate {
                    name: name.clone(),
                    estimate,
                    se,
                    statistic,
                    p_value: normal_two_sided_p(statistic)?,
                    ci: ConfidenceInterval::symmetric(estimate, se, z, self.confidence_level()),
                    reference: ReferenceDistribution::Normal,
                })
            })
            .collect()
    }

    /// Omnibus Wald χ² test that the given coefficients are all zero
    fn wald_test(&self, columns: &[usize]) -> Result<WaldTest> {
        wald_chi_squared(self.beta(), self.vcov(), columns)
    }
}

/// `b' V^-1 b` for a subset of coefficients, referred to χ² with `|columns|` df
pub fn wald_chi_squared(
    beta: &DVector<f64>,
    vcov: &DMatrix<f64>,
    columns: &[usize],
) -> Result<WaldTest> {
    if columns.is_empty() {
        return Err(Error::InvalidInput(
            "Wald test needs at least one coefficient".to_string(),
        ));
    }
    if let Some(bad) = columns.iter().find(|&&c| c >= beta.len()) {
        return Err(Error::InvalidInput(format!(
            "coefficient index {bad} out of range for {} coefficients",
            beta.len()
        )));
    }
    let b = DVector::from_iterator(columns.len(), columns.iter().map(|&c| beta[c]));
    let sub = vcov.select_rows(columns).select_columns(columns);
    let inverse = meta_core::linalg::spd_inverse(&sub, "coefficient covariance")?;
    let statistic = b.dot(&(inverse * &b));
    Ok(WaldTest {
        statistic,
        df: columns.len(),
        p_value: chi_squared_sf(statistic, columns.len() as f64)?,
    })
}
