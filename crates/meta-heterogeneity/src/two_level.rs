//! Two-level random-effects (mixed-effects) model
//!
//! `y_i ~ N(x_i' beta, v_i + tau2)` with τ² from any of the six estimators.
//! With an intercept-only design this is the standard random-effects
//! meta-analysis; extra columns make it a meta-regression.

use crate::design::Design;
use crate::estimators::{self, Projection, Settings};
use crate::model::FittedModel;
use meta_core::math::distributions::{normal_two_sided_p, t_critical, z_critical};
use meta_core::{
    AnalysisConfig, ConfidenceInterval, EffectSizeBatch, Error, Heterogeneity, ModelKind,
    PooledEstimate, ReferenceDistribution, Result, Tau2Estimator, VarianceComponents,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, instrument, warn};

/// Likelihood-based fit criteria
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitStatistics {
    /// Full maximum-likelihood log-likelihood at the estimates
    pub log_likelihood: f64,
    /// Restricted log-likelihood at the estimates
    pub restricted_log_likelihood: f64,
    /// Uses the restricted likelihood for REML fits
    pub aic: f64,
    pub bic: f64,
    /// Number of estimated parameters (coefficients plus τ²)
    pub parameters: usize,
}

/// A fitted two-level model
#[derive(Debug, Clone, PartialEq)]
pub struct TwoLevelFit {
    design: Design,
    response: DVector<f64>,
    variances: DVector<f64>,
    kind: ModelKind,
    /// `None` when τ² is not estimable (a single effect size)
    tau2: Option<f64>,
    truncated: bool,
    iterations: usize,
    beta: DVector<f64>,
    vcov: DMatrix<f64>,
    weights: DVector<f64>,
    /// Residual Q under fixed-effect weights
    q_residual: f64,
    n_studies: usize,
    confidence_level: f64,
}

impl TwoLevelFit {
    /// Fit the batch with the given design and τ² estimator
    pub fn fit(
        batch: &EffectSizeBatch,
        design: Design,
        estimator: Tau2Estimator,
        config: &AnalysisConfig,
    ) -> Result<Self> {
        Self::from_parts(
            design,
            DVector::from_vec(batch.effects()),
            DVector::from_vec(batch.variances()),
            batch.n_studies(),
            estimator,
            config,
        )
    }

    /// Intercept-only random-effects model with the configured estimator
    pub fn intercept_only(batch: &EffectSizeBatch, config: &AnalysisConfig) -> Result<Self> {
        Self::fit(batch, Design::intercept(batch.len()), config.estimator, config)
    }

    /// Fit from raw vectors; used where the data are not a record batch
    #[instrument(skip_all, fields(k = response.len(), p = design.n_params(), estimator = %estimator))]
    pub fn from_parts(
        design: Design,
        response: DVector<f64>,
        variances: DVector<f64>,
        n_studies: usize,
        estimator: Tau2Estimator,
        config: &AnalysisConfig,
    ) -> Result<Self> {
        check_shapes(&design, &response, &variances)?;
        let k = response.len();
        let p = design.n_params();

        let (tau2, truncated, iterations) = if k > p {
            let settings = Settings {
                max_iterations: config.max_iterations,
                tolerance: config.tolerance,
            };
            let estimate =
                estimators::estimate(estimator, design.matrix(), &response, &variances, &settings)?;
            if estimate.truncated {
                warn!(estimator = %estimator, "negative tau-squared truncated to zero");
            }
            (Some(estimate.tau2), estimate.truncated, estimate.iterations)
        } else if k == 1 && p == 1 {
            debug!("single effect size, tau-squared not estimable");
            (None, false, 0)
        } else {
            return Err(Error::too_few(p + 1, k, "random-effects model"));
        };

        Self::assemble(
            design,
            response,
            variances,
            n_studies,
            ModelKind::TwoLevel { estimator },
            tau2,
            truncated,
            iterations,
            config.confidence_level,
        )
    }

    /// Inverse-variance fixed-effect model (τ² held at zero)
    pub fn fixed_effect(batch: &EffectSizeBatch, design: Design, config: &AnalysisConfig) -> Result<Self> {
        let response = DVector::from_vec(batch.effects());
        let variances = DVector::from_vec(batch.variances());
        check_shapes(&design, &response, &variances)?;
        Self::assemble(
            design,
            response,
            variances,
            batch.n_studies(),
            ModelKind::FixedEffect,
            Some(0.0),
            false,
            0,
            config.confidence_level,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        design: Design,
        response: DVector<f64>,
        variances: DVector<f64>,
        n_studies: usize,
        kind: ModelKind,
        tau2: Option<f64>,
        truncated: bool,
        iterations: usize,
        confidence_level: f64,
    ) -> Result<Self> {
        let x = design.matrix();
        let projection = Projection::at(x, &response, &variances, tau2.unwrap_or(0.0))?;
        let q_residual = Projection::at(x, &response, &variances, 0.0)?.quadratic();
        let Projection { weights, solution } = projection;

        Ok(Self {
            design,
            response,
            variances,
            kind,
            tau2,
            truncated,
            iterations,
            beta: solution.beta,
            vcov: solution.bread,
            weights,
            q_residual,
            n_studies,
            confidence_level,
        })
    }

    /// Estimated τ², `None` when not estimable
    pub fn tau2(&self) -> Option<f64> {
        self.tau2
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn n_studies(&self) -> usize {
        self.n_studies
    }

    /// The τ² estimator, or `None` for a fixed-effect fit
    pub fn estimator(&self) -> Option<Tau2Estimator> {
        match self.kind {
            ModelKind::TwoLevel { estimator } => Some(estimator),
            _ => None,
        }
    }

    /// Random-effects weights `1 / (v_i + tau2)`
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Residual heterogeneity statistic `Q_E` (Cochran's Q for an intercept-only model)
    pub fn q_residual(&self) -> f64 {
        self.q_residual
    }

    /// Q, I² and τ², or `None` for a single effect size
    pub fn heterogeneity(&self) -> Result<Option<Heterogeneity>> {
        match self.tau2 {
            Some(tau2) if self.k() > self.n_params() => Heterogeneity::from_q(
                self.q_residual,
                self.k() - self.n_params(),
                VarianceComponents::Single { tau2 },
                self.truncated,
            )
            .map(Some),
            _ => Ok(None),
        }
    }

    /// Pooled estimate of an intercept-only fit
    pub fn pooled(&self) -> Result<PooledEstimate> {
        if !self.design.is_intercept_only() {
            return Err(Error::InvalidInput(
                "a pooled estimate needs an intercept-only design".to_string(),
            ));
        }
        let heterogeneity = self.heterogeneity()?;
        pooled_from_parts(
            self.beta[0],
            self.vcov[(0, 0)],
            self.k(),
            self.n_studies,
            heterogeneity,
            self.kind,
            self.confidence_level,
        )
    }

    /// Leverages `h_i = w_i x_i' (X'WX)^-1 x_i`
    pub fn hat_values(&self) -> DVector<f64> {
        let x = self.design.matrix();
        DVector::from_iterator(
            self.k(),
            (0..self.k()).map(|i| {
                let row = x.row(i).transpose();
                self.weights[i] * row.dot(&(&self.vcov * &row))
            }),
        )
    }

    /// Fitted values `X beta`
    pub fn fitted(&self) -> DVector<f64> {
        self.design.matrix() * &self.beta
    }

    /// Log-likelihoods and information criteria
    pub fn fit_statistics(&self) -> Result<FitStatistics> {
        let k = self.k() as f64;
        let p = self.n_params() as f64;
        let tau2 = self.tau2.unwrap_or(0.0);
        let log_likelihood = log_likelihood(&self.variances, tau2, &self.residuals());
        let restricted_log_likelihood = restricted_log_likelihood(
            self.design.matrix(),
            &self.response,
            &self.variances,
            tau2,
        )?;

        let parameters = self.n_params() + usize::from(self.kind != ModelKind::FixedEffect);
        let np = parameters as f64;
        let (aic, bic) = if self.estimator() == Some(Tau2Estimator::Reml) {
            (
                -2.0 * restricted_log_likelihood + 2.0 * np,
                -2.0 * restricted_log_likelihood + np * (k - p).max(1.0).ln(),
            )
        } else {
            (
                -2.0 * log_likelihood + 2.0 * np,
                -2.0 * log_likelihood + np * k.ln(),
            )
        };

        Ok(FitStatistics {
            log_likelihood,
            restricted_log_likelihood,
            aic,
            bic,
            parameters,
        })
    }
}

impl FittedModel for TwoLevelFit {
    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn design(&self) -> &Design {
        &self.design
    }

    fn response(&self) -> &DVector<f64> {
        &self.response
    }

    fn sampling_variances(&self) -> &DVector<f64> {
        &self.variances
    }

    fn beta(&self) -> &DVector<f64> {
        &self.beta
    }

    fn vcov(&self) -> &DMatrix<f64> {
        &self.vcov
    }

    fn covariance_block(&self, members: &[usize]) -> DMatrix<f64> {
        let tau2 = self.total_heterogeneity();
        DMatrix::from_diagonal(&DVector::from_iterator(
            members.len(),
            members.iter().map(|&i| self.variances[i] + tau2),
        ))
    }

    fn weight_block(&self, members: &[usize]) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_iterator(
            members.len(),
            members.iter().map(|&i| self.weights[i]),
        ))
    }

    fn total_heterogeneity(&self) -> f64 {
        self.tau2.unwrap_or(0.0)
    }

    fn confidence_level(&self) -> f64 {
        self.confidence_level
    }
}

/// Assemble a pooled estimate with a Wald interval and, when τ² is known,
/// a prediction interval on `max(k - 2, 1)` degrees of freedom
pub(crate) fn pooled_from_parts(
    estimate: f64,
    variance: f64,
    k: usize,
    n_studies: usize,
    heterogeneity: Option<Heterogeneity>,
    model: ModelKind,
    confidence_level: f64,
) -> Result<PooledEstimate> {
    let se = variance.max(0.0).sqrt();
    if !(se > 0.0) || !estimate.is_finite() {
        return Err(Error::Computation(
            "pooled estimate has a non-positive or non-finite standard error".to_string(),
        ));
    }
    let z = z_critical(confidence_level)?;
    let statistic = estimate / se;

    let prediction_interval = match &heterogeneity {
        Some(h) => {
            let df = k.saturating_sub(2).max(1) as f64;
            let t = t_critical(confidence_level, df)?;
            Some(ConfidenceInterval::symmetric(
                estimate,
                (h.tau2() + se * se).sqrt(),
                t,
                confidence_level,
            ))
        }
        None => None,
    };

    Ok(PooledEstimate {
        point_estimate: estimate,
        se,
        ci: ConfidenceInterval::symmetric(estimate, se, z, confidence_level),
        statistic,
        p_value: normal_two_sided_p(statistic)?,
        reference: ReferenceDistribution::Normal,
        k,
        n_studies,
        heterogeneity,
        prediction_interval,
        model,
    })
}

/// `-1/2 [k ln 2pi + sum ln(v + tau2) + sum r^2 / (v + tau2)]`
pub(crate) fn log_likelihood(variances: &DVector<f64>, tau2: f64, residuals: &DVector<f64>) -> f64 {
    let k = variances.len() as f64;
    let (log_det, quadratic) = variances
        .iter()
        .zip(residuals.iter())
        .fold((0.0, 0.0), |(ld, q), (v, r)| {
            let total = v + tau2;
            (ld + total.ln(), q + r * r / total)
        });
    -0.5 * (k * (2.0 * PI).ln() + log_det + quadratic)
}

/// Restricted log-likelihood of the two-level model at a given τ²
pub(crate) fn restricted_log_likelihood(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    variances: &DVector<f64>,
    tau2: f64,
) -> Result<f64> {
    let k = y.len() as f64;
    let p = x.ncols() as f64;
    let projection = Projection::at(x, y, variances, tau2)?;
    let log_det_v: f64 = variances.iter().map(|v| (v + tau2).ln()).sum();
    let log_det_xtx = meta_core::linalg::spd_log_det(&(x.transpose() * x), "X'X")?;
    // ln|X'WX| = -ln|(X'WX)^-1|
    let log_det_xtwx = -meta_core::linalg::spd_log_det(&projection.solution.bread, "(X'WX)^-1")?;
    Ok(-0.5
        * ((k - p) * (2.0 * PI).ln() - log_det_xtx
            + log_det_v
            + log_det_xtwx
            + projection.quadratic()))
}

fn check_shapes(design: &Design, response: &DVector<f64>, variances: &DVector<f64>) -> Result<()> {
    if response.is_empty() {
        return Err(Error::too_few(1, 0, "random-effects model"));
    }
    if design.n_rows() != response.len() || variances.len() != response.len() {
        return Err(Error::InvalidInput(format!(
            "design has {} rows for {} effects and {} variances",
            design.n_rows(),
            response.len(),
            variances.len()
        )));
    }
    if variances.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
        return Err(Error::InvalidInput(
            "sampling variances must be positive and finite".to_string(),
        ));
    }
    if response.iter().any(|y| !y.is_finite()) {
        return Err(Error::non_finite("effect sizes"));
    }
    Ok(())
}
