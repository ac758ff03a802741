//! Three-level random-effects model
//!
//! Effect sizes nested in studies:
//!
//! `y_ij = x_ij' beta + u_j + e_ij + eps_ij`, `u_j ~ N(0, sigma2_between)`,
//! `e_ij ~ N(0, sigma2_within)`, `eps_ij ~ N(0, v_ij)`.
//!
//! Every study block `V_j = D_j + sigma2_between 11'` is diagonal plus rank
//! one, so inverses and determinants come from the Sherman-Morrison identity
//! and no k x k matrix is ever formed. Variance components are estimated by
//! REML with a Nelder-Mead search on `sigma = sqrt(sigma2)`.

use crate::design::Design;
use crate::estimators::dersimonian_laird;
use crate::model::FittedModel;
use crate::two_level::pooled_from_parts;
use meta_core::linalg::{spd_inverse, spd_log_det, weighted_least_squares};
use meta_core::math::distributions::chi_squared_sf;
use meta_core::optim::NelderMead;
use meta_core::{
    AnalysisConfig, EffectSizeBatch, Error, Heterogeneity, ModelKind, MultilevelI2,
    PooledEstimate, Result, StudyClusters, VarianceComponents,
};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tracing::{debug, instrument, warn};

/// Variance components below this are reported as zero
const BOUNDARY: f64 = 1e-6;

/// Which variance component, if any, is held at zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceConstraint {
    /// Both components estimated
    Unconstrained,
    /// `sigma2_between = 0`: equivalent to the two-level REML model
    NoBetween,
    /// `sigma2_within = 0`: one random effect per study
    NoWithin,
}

/// Likelihood-ratio test of a constrained three-level fit against the full fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodRatioTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
    pub full_log_likelihood: f64,
    pub reduced_log_likelihood: f64,
    pub constraint: VarianceConstraint,
}

impl LikelihoodRatioTest {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }
}

/// GLS quantities at fixed variance components
struct Profile {
    beta: DVector<f64>,
    bread: DMatrix<f64>,
    restricted_log_likelihood: f64,
}

/// A fitted three-level model
#[derive(Debug, Clone, PartialEq)]
pub struct ThreeLevelFit {
    design: Design,
    response: DVector<f64>,
    variances: DVector<f64>,
    clusters: StudyClusters,
    constraint: VarianceConstraint,
    sigma2_within: f64,
    sigma2_between: f64,
    truncated: bool,
    beta: DVector<f64>,
    vcov: DMatrix<f64>,
    restricted_log_likelihood: f64,
    iterations: usize,
    q_residual: f64,
    confidence_level: f64,
}

impl ThreeLevelFit {
    /// Fit both variance components
    pub fn fit(batch: &EffectSizeBatch, design: Design, config: &AnalysisConfig) -> Result<Self> {
        Self::fit_constrained(batch, design, VarianceConstraint::Unconstrained, config)
    }

    /// Fit with one component optionally held at zero
    #[instrument(skip_all, fields(k = batch.len(), studies = batch.n_studies(), constraint = ?constraint))]
    pub fn fit_constrained(
        batch: &EffectSizeBatch,
        design: Design,
        constraint: VarianceConstraint,
        config: &AnalysisConfig,
    ) -> Result<Self> {
        let k = batch.len();
        let p = design.n_params();
        if design.n_rows() != k {
            return Err(Error::InvalidInput(format!(
                "design has {} rows for {k} effect sizes",
                design.n_rows()
            )));
        }
        if k <= p + 1 {
            return Err(Error::too_few(p + 2, k, "three-level model"));
        }
        if constraint != VarianceConstraint::NoBetween && batch.n_studies() < 2 {
            return Err(Error::too_few(2, batch.n_studies(), "three-level model studies"));
        }

        let x = design.matrix();
        let y = DVector::from_vec(batch.effects());
        let v = DVector::from_vec(batch.variances());
        let members = batch.clusters().members();

        let start_tau2 = dersimonian_laird(x, &y, &v)?.tau2.max(0.01);
        let components = |theta: &[f64]| -> (f64, f64) {
            match constraint {
                VarianceConstraint::Unconstrained => (theta[0].powi(2), theta[1].powi(2)),
                VarianceConstraint::NoBetween => (theta[0].powi(2), 0.0),
                VarianceConstraint::NoWithin => (0.0, theta[0].powi(2)),
            }
        };
        let start = match constraint {
            VarianceConstraint::Unconstrained => vec![(start_tau2 / 2.0).sqrt(); 2],
            _ => vec![start_tau2.sqrt()],
        };

        let optimizer = NelderMead::new(config.optimizer_max_iterations)
            .with_initial_step(0.5 * start[0]);
        let minimum = optimizer.minimize(
            |theta| {
                let (within, between) = components(theta);
                match profile(x, &y, &v, members, within, between) {
                    Ok(fit) => -fit.restricted_log_likelihood,
                    Err(_) => f64::NAN,
                }
            },
            &start,
        )?;

        let (mut sigma2_within, mut sigma2_between) = components(&minimum.point);
        let mut truncated = false;
        if constraint != VarianceConstraint::NoWithin && sigma2_within < BOUNDARY {
            sigma2_within = 0.0;
            truncated = true;
        }
        if constraint != VarianceConstraint::NoBetween && sigma2_between < BOUNDARY {
            sigma2_between = 0.0;
            truncated = true;
        }
        if truncated {
            warn!(
                sigma2_within,
                sigma2_between, "three-level variance component on the zero boundary"
            );
        }

        let fit = profile(x, &y, &v, members, sigma2_within, sigma2_between)?;
        let fixed_weights = v.map(|vi| 1.0 / vi);
        let q_residual = weighted_least_squares(x, &y, &fixed_weights)?.weighted_rss(&fixed_weights);

        debug!(
            sigma2_within,
            sigma2_between,
            log_likelihood = fit.restricted_log_likelihood,
            iterations = minimum.iterations,
            "fitted three-level model"
        );

        Ok(Self {
            design,
            response: y,
            variances: v,
            clusters: batch.clusters().clone(),
            constraint,
            sigma2_within,
            sigma2_between,
            truncated,
            beta: fit.beta,
            vcov: fit.bread,
            restricted_log_likelihood: fit.restricted_log_likelihood,
            iterations: minimum.iterations,
            q_residual,
            confidence_level: config.confidence_level,
        })
    }

    pub fn sigma2_within(&self) -> f64 {
        self.sigma2_within
    }

    pub fn sigma2_between(&self) -> f64 {
        self.sigma2_between
    }

    pub fn constraint(&self) -> VarianceConstraint {
        self.constraint
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn restricted_log_likelihood(&self) -> f64 {
        self.restricted_log_likelihood
    }

    pub fn clusters(&self) -> &StudyClusters {
        &self.clusters
    }

    pub fn components(&self) -> VarianceComponents {
        VarianceComponents::Nested {
            sigma2_within: self.sigma2_within,
            sigma2_between: self.sigma2_between,
        }
    }

    /// Share of total variance at each level, using the typical sampling
    /// variance `(k - 1) sum w / ((sum w)^2 - sum w^2)`
    pub fn multilevel_i2(&self) -> MultilevelI2 {
        let k = self.k() as f64;
        let (sw, sw2) = self
            .variances
            .iter()
            .fold((0.0, 0.0), |(a, b), v| (a + 1.0 / v, b + 1.0 / (v * v)));
        let typical = (k - 1.0) * sw / (sw * sw - sw2);
        let total = self.sigma2_within + self.sigma2_between + typical;
        MultilevelI2 {
            within: 100.0 * self.sigma2_within / total,
            between: 100.0 * self.sigma2_between / total,
        }
    }

    pub fn heterogeneity(&self) -> Result<Heterogeneity> {
        Ok(Heterogeneity::from_q(
            self.q_residual,
            self.k() - self.n_params(),
            self.components(),
            self.truncated,
        )?
        .with_multilevel_i2(self.multilevel_i2()))
    }

    /// Pooled estimate of an intercept-only fit
    pub fn pooled(&self) -> Result<PooledEstimate> {
        if !self.design.is_intercept_only() {
            return Err(Error::InvalidInput(
                "a pooled estimate needs an intercept-only design".to_string(),
            ));
        }
        pooled_from_parts(
            self.beta[0],
            self.vcov[(0, 0)],
            self.k(),
            self.clusters.len(),
            Some(self.heterogeneity()?),
            ModelKind::ThreeLevel,
            self.confidence_level,
        )
    }

    /// Likelihood-ratio test of `reduced` against this fit, on one df
    pub fn likelihood_ratio(&self, reduced: &ThreeLevelFit) -> Result<LikelihoodRatioTest> {
        if self.design.names() != reduced.design.names() || self.k() != reduced.k() {
            return Err(Error::InvalidInput(
                "likelihood-ratio test needs fits of the same data and design".to_string(),
            ));
        }
        let statistic =
            (2.0 * (self.restricted_log_likelihood - reduced.restricted_log_likelihood)).max(0.0);
        Ok(LikelihoodRatioTest {
            statistic,
            df: 1,
            p_value: chi_squared_sf(statistic, 1.0)?,
            full_log_likelihood: self.restricted_log_likelihood,
            reduced_log_likelihood: reduced.restricted_log_likelihood,
            constraint: reduced.constraint,
        })
    }
}

impl FittedModel for ThreeLevelFit {
    fn kind(&self) -> ModelKind {
        ModelKind::ThreeLevel
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
        let n = members.len();
        DMatrix::from_fn(n, n, |a, b| {
            let (i, j) = (members[a], members[b]);
            let shared = if self.clusters.cluster_of(i) == self.clusters.cluster_of(j) {
                self.sigma2_between
            } else {
                0.0
            };
            if a == b {
                self.variances[i] + self.sigma2_within + shared
            } else {
                shared
            }
        })
    }

    fn weight_block(&self, members: &[usize]) -> DMatrix<f64> {
        let n = members.len();
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (position, &i) in members.iter().enumerate() {
            groups
                .entry(self.clusters.cluster_of(i))
                .or_default()
                .push(position);
        }

        let mut block = DMatrix::zeros(n, n);
        for positions in groups.values() {
            let inverse: Vec<f64> = positions
                .iter()
                .map(|&a| 1.0 / (self.variances[members[a]] + self.sigma2_within))
                .collect();
            let a_sum: f64 = inverse.iter().sum();
            let c = self.sigma2_between / (1.0 + self.sigma2_between * a_sum);
            for (ia, &pa) in positions.iter().enumerate() {
                for (ib, &pb) in positions.iter().enumerate() {
                    block[(pa, pb)] = -c * inverse[ia] * inverse[ib];
                }
                block[(pa, pa)] += inverse[ia];
            }
        }
        block
    }

    fn total_heterogeneity(&self) -> f64 {
        self.sigma2_within + self.sigma2_between
    }

    fn confidence_level(&self) -> f64 {
        self.confidence_level
    }
}

/// GLS fit and restricted log-likelihood at fixed components
fn profile(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    members: &[Vec<usize>],
    sigma2_within: f64,
    sigma2_between: f64,
) -> Result<Profile> {
    let k = y.len() as f64;
    let p = x.ncols();

    let mut xtvx = DMatrix::zeros(p, p);
    let mut xtvy = DVector::zeros(p);
    let mut log_det_v = 0.0;
    for cluster in members {
        let mut sum_x = DVector::zeros(p);
        let mut sum_y = 0.0;
        let mut a = 0.0;
        for &i in cluster {
            let d = v[i] + sigma2_within;
            let inverse = 1.0 / d;
            let row = x.row(i).transpose();
            log_det_v += d.ln();
            xtvx += &row * row.transpose() * inverse;
            xtvy += &row * (inverse * y[i]);
            sum_x += &row * inverse;
            sum_y += inverse * y[i];
            a += inverse;
        }
        let c = sigma2_between / (1.0 + sigma2_between * a);
        log_det_v += (1.0 + sigma2_between * a).ln();
        xtvx -= &sum_x * sum_x.transpose() * c;
        xtvy -= &sum_x * (c * sum_y);
    }

    let bread = spd_inverse(&xtvx, "X'V^-1 X")?;
    let beta = &bread * &xtvy;
    let residuals = y - x * &beta;

    let mut quadratic = 0.0;
    for cluster in members {
        let (mut srr, mut sr, mut a) = (0.0, 0.0, 0.0);
        for &i in cluster {
            let inverse = 1.0 / (v[i] + sigma2_within);
            srr += inverse * residuals[i] * residuals[i];
            sr += inverse * residuals[i];
            a += inverse;
        }
        let c = sigma2_between / (1.0 + sigma2_between * a);
        quadratic += srr - c * sr * sr;
    }

    let log_det_xtx = spd_log_det(&(x.transpose() * x), "X'X")?;
    let log_det_xtvx = spd_log_det(&xtvx, "X'V^-1 X")?;
    let restricted_log_likelihood = -0.5
        * ((k - p as f64) * (2.0 * PI).ln() - log_det_xtx + log_det_v + log_det_xtvx + quadratic);
    if !restricted_log_likelihood.is_finite() {
        return Err(Error::non_finite("three-level restricted log-likelihood"));
    }

    Ok(Profile {
        beta,
        bread,
        restricted_log_likelihood,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::two_level::{restricted_log_likelihood, TwoLevelFit};
    use approx::assert_abs_diff_eq;
    use meta_core::{EffectSizeRecord, Tau2Estimator};

    /// Six studies with two effect sizes each and clear between-study spread
    fn nested_batch() -> EffectSizeBatch {
        let studies = [
            (0.05, 0.10),
            (0.60, 0.55),
            (0.30, 0.38),
            (0.90, 0.82),
            (0.15, 0.22),
            (0.70, 0.78),
        ];
        EffectSizeBatch::new(studies.iter().enumerate().flat_map(|(s, &(a, b))| {
            vec![
                EffectSizeRecord::new(format!("s{s}"), "1", a, 0.02),
                EffectSizeRecord::new(format!("s{s}"), "2", b, 0.025),
            ]
        }))
    }

    #[test]
    fn test_between_study_variance_dominates() {
        let config = AnalysisConfig::default();
        let batch = nested_batch();
        let fit = ThreeLevelFit::fit(&batch, Design::intercept(batch.len()), &config).unwrap();

        assert!(fit.sigma2_between() > 0.05);
        assert!(fit.sigma2_between() > fit.sigma2_within());
        let split = fit.multilevel_i2();
        assert!(split.between > split.within);
        assert!(split.between + split.within <= 100.0);

        let pooled = fit.pooled().unwrap();
        assert_eq!(pooled.n_studies, 6);
        assert_eq!(pooled.model, ModelKind::ThreeLevel);
        assert!(pooled.heterogeneity.unwrap().multilevel_i2.is_some());
    }

    #[test]
    fn test_lrt_prefers_three_levels() {
        let config = AnalysisConfig::default();
        let batch = nested_batch();
        let design = Design::intercept(batch.len());
        let full = ThreeLevelFit::fit(&batch, design.clone(), &config).unwrap();
        let reduced =
            ThreeLevelFit::fit_constrained(&batch, design, VarianceConstraint::NoBetween, &config)
                .unwrap();

        let lrt = full.likelihood_ratio(&reduced).unwrap();
        assert!(lrt.statistic > 0.0);
        assert!(lrt.is_significant(0.05));
        assert_eq!(lrt.constraint, VarianceConstraint::NoBetween);
    }

    #[test]
    fn test_no_between_matches_two_level_reml() {
        let config = AnalysisConfig::default();
        let batch = nested_batch();
        let design = Design::intercept(batch.len());
        let reduced =
            ThreeLevelFit::fit_constrained(&batch, design.clone(), VarianceConstraint::NoBetween, &config)
                .unwrap();
        let two_level = TwoLevelFit::fit(&batch, design, Tau2Estimator::Reml, &config).unwrap();

        let tau2 = two_level.tau2().unwrap();
        assert_abs_diff_eq!(reduced.sigma2_within(), tau2, epsilon = 1e-4);
        assert_abs_diff_eq!(reduced.beta()[0], two_level.beta()[0], epsilon = 1e-4);

        let ll = restricted_log_likelihood(
            two_level.design().matrix(),
            two_level.response(),
            two_level.sampling_variances(),
            tau2,
        )
        .unwrap();
        assert_abs_diff_eq!(reduced.restricted_log_likelihood(), ll, epsilon = 1e-6);
    }

    #[test]
    fn test_weight_block_inverts_covariance_block() {
        let config = AnalysisConfig::default();
        let batch = nested_batch();
        let fit = ThreeLevelFit::fit(&batch, Design::intercept(batch.len()), &config).unwrap();

        let members = [0, 1, 2, 3];
        let product = fit.covariance_block(&members) * fit.weight_block(&members);
        for a in 0..4 {
            for b in 0..4 {
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[(a, b)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_too_few_studies() {
        let config = AnalysisConfig::default();
        let batch = EffectSizeBatch::new(vec![
            EffectSizeRecord::new("a", "1", 0.2, 0.02),
            EffectSizeRecord::new("a", "2", 0.3, 0.02),
            EffectSizeRecord::new("a", "3", 0.4, 0.02),
        ]);
        let result = ThreeLevelFit::fit(&batch, Design::intercept(3), &config);
        assert!(matches!(result, Err(Error::InsufficientSample { .. })));
    }
}
