//! Robust variance estimation for effect sizes clustered in studies

use crate::sandwich::{cluster_robust, ClusteredFit, SandwichEstimate, SmallSampleCorrection};
use crate::working::{correlated_effects, hierarchical_effects, WeightingScheme, WorkingModel};
use meta_core::linalg::weighted_least_squares;
use meta_core::math::distributions::{t_critical, t_two_sided_p};
use meta_core::{
    AnalysisConfig, ConfidenceInterval, EffectSizeBatch, Error, Heterogeneity, ModelKind,
    PooledEstimate, ReferenceDistribution, Result, StudyClusters, VarianceComponents,
};
use meta_heterogeneity::{Design, FittedModel};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Satterthwaite df below this make t-based inference unreliable
pub const MIN_RELIABLE_DF: f64 = 4.0;

/// A coefficient with robust inference on Satterthwaite degrees of freedom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustCoefficient {
    pub name: String,
    pub estimate: f64,
    pub se: f64,
    pub df: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub ci: ConfidenceInterval,
}

impl RobustCoefficient {
    /// Whether the df are large enough for the t reference to be trusted
    pub fn is_reliable(&self) -> bool {
        self.df >= MIN_RELIABLE_DF
    }
}

/// Result of a robust fit
#[derive(Debug, Clone, PartialEq)]
pub struct RobustFit {
    pub model: ModelKind,
    pub coefficients: Vec<RobustCoefficient>,
    pub vcov: DMatrix<f64>,
    pub correction: SmallSampleCorrection,
    pub components: VarianceComponents,
    /// Cochran's Q under fixed-effect weights and its df, when `k > p`
    pub q: Option<(f64, usize)>,
    pub truncated: bool,
    pub k: usize,
    pub n_studies: usize,
    pub confidence_level: f64,
    pub warnings: Vec<String>,
}

impl RobustFit {
    pub fn coefficient(&self, name: &str) -> Option<&RobustCoefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    /// Pooled estimate of an intercept-only fit, with a t reference
    pub fn pooled(&self) -> Result<PooledEstimate> {
        let [intercept] = self.coefficients.as_slice() else {
            return Err(Error::InvalidInput(
                "a pooled estimate needs an intercept-only design".to_string(),
            ));
        };
        let heterogeneity = match self.q {
            Some((q, df)) => Some(Heterogeneity::from_q(q, df, self.components, self.truncated)?),
            None => None,
        };
        let prediction_interval = match &heterogeneity {
            Some(h) => {
                let t = t_critical(self.confidence_level, intercept.df)?;
                Some(ConfidenceInterval::symmetric(
                    intercept.estimate,
                    (h.tau2() + intercept.se * intercept.se).sqrt(),
                    t,
                    self.confidence_level,
                ))
            }
            None => None,
        };

        Ok(PooledEstimate {
            point_estimate: intercept.estimate,
            se: intercept.se,
            ci: intercept.ci,
            statistic: intercept.statistic,
            p_value: intercept.p_value,
            reference: ReferenceDistribution::StudentT { df: intercept.df },
            k: self.k,
            n_studies: self.n_studies,
            heterogeneity,
            prediction_interval,
            model: self.model,
        })
    }
}

/// One point of a ρ sensitivity sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RhoPoint {
    pub rho: f64,
    pub estimate: f64,
    pub se: f64,
    pub tau2: f64,
}

/// Correlated-effects estimates across assumed within-study correlations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RhoSensitivity {
    pub points: Vec<RhoPoint>,
    /// `max - min` of the point estimates
    pub range: f64,
    pub threshold: f64,
    /// The range is below the threshold
    pub robust: bool,
}

/// Robust variance estimation entry point
#[derive(Debug, Clone)]
pub struct DependenceCorrector {
    config: AnalysisConfig,
    correction: SmallSampleCorrection,
}

impl DependenceCorrector {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            correction: SmallSampleCorrection::Cr2,
        })
    }

    /// Use another small-sample correction (CR2 by default)
    pub fn with_correction(mut self, correction: SmallSampleCorrection) -> Self {
        self.correction = correction;
        self
    }

    /// Correlated-effects pooled fit at the configured ρ
    pub fn correlated_effects(&self, batch: &EffectSizeBatch) -> Result<RobustFit> {
        self.fit(
            batch,
            &Design::intercept(batch.len()),
            WeightingScheme::CorrelatedEffects { rho: self.config.rho },
        )
    }

    /// Hierarchical-effects pooled fit
    pub fn hierarchical_effects(&self, batch: &EffectSizeBatch) -> Result<RobustFit> {
        self.fit(
            batch,
            &Design::intercept(batch.len()),
            WeightingScheme::HierarchicalEffects,
        )
    }

    /// Robust fit of an arbitrary design under a working model
    #[instrument(skip_all, fields(k = batch.len(), studies = batch.n_studies(), scheme = ?scheme))]
    pub fn fit(
        &self,
        batch: &EffectSizeBatch,
        design: &Design,
        scheme: WeightingScheme,
    ) -> Result<RobustFit> {
        if design.n_rows() != batch.len() {
            return Err(Error::InvalidInput(format!(
                "design has {} rows for {} effect sizes",
                design.n_rows(),
                batch.len()
            )));
        }
        let x = design.matrix();
        let y = DVector::from_vec(batch.effects());
        let v = DVector::from_vec(batch.variances());
        let clusters = batch.clusters().members();

        let working: WorkingModel = match scheme {
            WeightingScheme::CorrelatedEffects { rho } => correlated_effects(x, &y, &v, clusters, rho)?,
            WeightingScheme::HierarchicalEffects => hierarchical_effects(x, &y, &v, clusters)?,
        };

        let solution = weighted_least_squares(x, &y, &working.weights)?;
        let weight_blocks = working.weight_blocks(clusters);
        let covariance_blocks = working.covariance_blocks(clusters);
        let sandwich = cluster_robust(
            &ClusteredFit {
                x,
                residuals: &solution.residuals,
                clusters,
                weights: &weight_blocks,
                working_covariance: &covariance_blocks,
                bread: &solution.bread,
            },
            self.correction,
        )?;

        let (model, components) = match scheme {
            WeightingScheme::CorrelatedEffects { rho } => (
                ModelKind::CorrelatedEffects { rho },
                VarianceComponents::Single { tau2: working.tau2 },
            ),
            WeightingScheme::HierarchicalEffects => (
                ModelKind::HierarchicalEffects,
                VarianceComponents::Nested {
                    sigma2_within: working.omega2.unwrap_or(0.0),
                    sigma2_between: working.tau2,
                },
            ),
        };

        self.assemble(
            design,
            &solution.beta,
            sandwich,
            model,
            components,
            fixed_effect_q(x, &y, &v)?,
            working.truncated,
            batch.n_studies(),
        )
    }

    /// Correlated-effects estimates over the configured ρ values
    pub fn rho_sweep(&self, batch: &EffectSizeBatch) -> Result<RhoSensitivity> {
        let design = Design::intercept(batch.len());
        let points = self
            .config
            .rho_sweep
            .iter()
            .map(|&rho| {
                let fit = self.fit(batch, &design, WeightingScheme::CorrelatedEffects { rho })?;
                let pooled = fit.pooled()?;
                Ok(RhoPoint {
                    rho,
                    estimate: pooled.point_estimate,
                    se: pooled.se,
                    tau2: fit.components.total(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let (min, max) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.estimate), hi.max(p.estimate))
        });
        let range = max - min;
        let robust = range < self.config.robustness_threshold;
        debug!(range, robust, "rho sensitivity sweep");

        Ok(RhoSensitivity {
            points,
            range,
            threshold: self.config.robustness_threshold,
            robust,
        })
    }

    /// Cluster-robust correction of a model-based fit, clustered by study
    ///
    /// Uses the model's own `V_j^-1` as working weights. If CR2 fails the
    /// result carries CR1 and a warning.
    pub fn sandwich(&self, model: &dyn FittedModel, clusters: &StudyClusters) -> Result<RobustFit> {
        if clusters.assignment().len() != model.k() {
            return Err(Error::InvalidInput(format!(
                "{} cluster assignments for {} effect sizes",
                clusters.assignment().len(),
                model.k()
            )));
        }
        let members = clusters.members();
        let weight_blocks: Vec<DMatrix<f64>> = members.iter().map(|m| model.weight_block(m)).collect();
        let covariance_blocks: Vec<DMatrix<f64>> =
            members.iter().map(|m| model.covariance_block(m)).collect();
        let residuals = model.residuals();
        let sandwich = cluster_robust(
            &ClusteredFit {
                x: model.design().matrix(),
                residuals: &residuals,
                clusters: members,
                weights: &weight_blocks,
                working_covariance: &covariance_blocks,
                bread: model.vcov(),
            },
            self.correction,
        )?;

        let components = match model.kind() {
            ModelKind::ThreeLevel => nested_components(model, members),
            _ => VarianceComponents::Single {
                tau2: model.total_heterogeneity(),
            },
        };

        self.assemble(
            model.design(),
            model.beta(),
            sandwich,
            model.kind(),
            components,
            fixed_effect_q(model.design().matrix(), model.response(), model.sampling_variances())?,
            false,
            clusters.len(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        design: &Design,
        beta: &DVector<f64>,
        sandwich: SandwichEstimate,
        model: ModelKind,
        components: VarianceComponents,
        q: Option<(f64, usize)>,
        truncated: bool,
        n_studies: usize,
    ) -> Result<RobustFit> {
        let level = self.config.confidence_level;
        let coefficients = design
            .names()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let estimate = beta[i];
                let se = sandwich.vcov[(i, i)].max(0.0).sqrt();
                let df = sandwich.df[i];
                if !(se > 0.0) {
                    return Err(Error::Computation(format!(
                        "robust standard error of `{name}` is not positive"
                    )));
                }
                if df < MIN_RELIABLE_DF {
                    warn!(coefficient = %name, df, "few degrees of freedom for robust inference");
                }
                let statistic = estimate / se;
                Ok(RobustCoefficient {
                    name: name.clone(),
                    estimate,
                    se,
                    df,
                    statistic,
                    p_value: t_two_sided_p(statistic, df)?,
                    ci: ConfidenceInterval::symmetric(estimate, se, t_critical(level, df)?, level),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RobustFit {
            model,
            coefficients,
            vcov: sandwich.vcov,
            correction: sandwich.correction,
            components,
            q,
            truncated,
            k: design.n_rows(),
            n_studies,
            confidence_level: level,
            warnings: sandwich.warnings,
        })
    }
}

/// Recover the nested split of a three-level fit from its covariance blocks
fn nested_components(model: &dyn FittedModel, members: &[Vec<usize>]) -> VarianceComponents {
    let total = model.total_heterogeneity();
    let between = members
        .iter()
        .find(|m| m.len() > 1)
        .map(|m| model.covariance_block(m)[(0, 1)])
        .unwrap_or(0.0);
    VarianceComponents::Nested {
        sigma2_within: (total - between).max(0.0),
        sigma2_between: between,
    }
}

/// Residual Q under inverse-variance weights, `None` when `k <= p`
fn fixed_effect_q(x: &DMatrix<f64>, y: &DVector<f64>, v: &DVector<f64>) -> Result<Option<(f64, usize)>> {
    let (k, p) = x.shape();
    if k <= p {
        return Ok(None);
    }
    let weights = v.map(|vi| 1.0 / vi);
    let solution = weighted_least_squares(x, y, &weights)?;
    Ok(Some((solution.weighted_rss(&weights), k - p)))
}
