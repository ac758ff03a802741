//! Ordinary weighted regression with t inference
//!
//! Funnel regressions (classical Egger, PET, PEESE) use multiplicative
//! dispersion: the coefficient covariance is `s² (X'WX)^-1` with `s²` the
//! weighted residual mean square on `k - p` degrees of freedom.

use meta_core::linalg::weighted_least_squares;
use meta_core::math::distributions::{t_critical, t_two_sided_p};
use meta_core::{
    CoefficientEstimate, ConfidenceInterval, Error, ReferenceDistribution, Result,
};
use nalgebra::{DMatrix, DVector};

pub(crate) fn weighted_regression(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: &DVector<f64>,
    names: &[&str],
    confidence_level: f64,
) -> Result<Vec<CoefficientEstimate>> {
    let (k, p) = x.shape();
    if k <= p {
        return Err(Error::too_few(p + 1, k, "funnel regression"));
    }
    let solution = weighted_least_squares(x, y, weights)?;
    let df = (k - p) as f64;
    let dispersion = solution.weighted_rss(weights) / df;
    let critical = t_critical(confidence_level, df)?;

    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let estimate = solution.beta[i];
            let se = (dispersion * solution.bread[(i, i)]).max(0.0).sqrt();
            if !(se > 0.0) {
                return Err(Error::Computation(format!(
                    "`{name}` has a zero standard error; the regression fits exactly"
                )));
            }
            let statistic = estimate / se;
            Ok(CoefficientEstimate {
                name: name.to_string(),
                estimate,
                se,
                statistic,
                p_value: t_two_sided_p(statistic, df)?,
                ci: ConfidenceInterval::symmetric(estimate, se, critical, confidence_level),
                reference: ReferenceDistribution::StudentT { df },
            })
        })
        .collect()
}

/// Design `[1, predictor]`
pub(crate) fn with_intercept(predictor: &[f64]) -> DMatrix<f64> {
    DMatrix::from_fn(predictor.len(), 2, |i, j| if j == 0 { 1.0 } else { predictor[i] })
}
