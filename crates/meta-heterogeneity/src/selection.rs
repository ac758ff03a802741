//! Choosing between the two-level and three-level structure
//!
//! When some study contributes more than one effect size, the three-level
//! model is fitted alongside a constrained fit without the between-study
//! component (the two-level model) and kept only if the likelihood-ratio
//! test rejects the constraint at `alpha`.

use crate::design::Design;
use crate::model::FittedModel;
use crate::three_level::{LikelihoodRatioTest, ThreeLevelFit, VarianceConstraint};
use crate::two_level::TwoLevelFit;
use meta_core::{
    AnalysisConfig, DependenceModel, EffectSizeBatch, Heterogeneity, ModelKind, PooledEstimate,
    Result,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

/// Variance structure of a fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Structure {
    TwoLevel,
    ThreeLevel,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoLevel => write!(f, "two-level"),
            Self::ThreeLevel => write!(f, "three-level"),
        }
    }
}

/// How the structure was chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionReport {
    /// Some study contributes more than one effect size
    pub dependence_present: bool,
    pub chosen: Structure,
    /// Three-level vs. two-level (between-study component dropped)
    pub between_lrt: Option<LikelihoodRatioTest>,
    /// Three-level vs. within-study component dropped
    pub within_lrt: Option<LikelihoodRatioTest>,
    pub reason: String,
}

/// A fitted model of either structure
#[derive(Debug, Clone, PartialEq)]
pub enum ModelFit {
    TwoLevel(TwoLevelFit),
    ThreeLevel(ThreeLevelFit),
}

impl ModelFit {
    pub fn structure(&self) -> Structure {
        match self {
            Self::TwoLevel(_) => Structure::TwoLevel,
            Self::ThreeLevel(_) => Structure::ThreeLevel,
        }
    }

    /// The fit behind the common model interface
    pub fn as_model(&self) -> &dyn FittedModel {
        match self {
            Self::TwoLevel(fit) => fit as &dyn FittedModel,
            Self::ThreeLevel(fit) => fit as &dyn FittedModel,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.as_model().kind()
    }

    pub fn pooled(&self) -> Result<PooledEstimate> {
        match self {
            Self::TwoLevel(fit) => fit.pooled(),
            Self::ThreeLevel(fit) => fit.pooled(),
        }
    }

    pub fn heterogeneity(&self) -> Result<Option<Heterogeneity>> {
        match self {
            Self::TwoLevel(fit) => fit.heterogeneity(),
            Self::ThreeLevel(fit) => fit.heterogeneity().map(Some),
        }
    }

    /// Total heterogeneity variance, `None` when not estimable
    pub fn tau2(&self) -> Option<f64> {
        match self {
            Self::TwoLevel(fit) => fit.tau2(),
            Self::ThreeLevel(fit) => Some(fit.total_heterogeneity()),
        }
    }
}

/// A pooled analysis with its model-choice record
#[derive(Debug, Clone, PartialEq)]
pub struct HeterogeneityAnalysis {
    pub fit: ModelFit,
    pub pooled: PooledEstimate,
    pub selection: SelectionReport,
}

/// Entry point for pooled random-effects analyses
#[derive(Debug, Clone)]
pub struct HeterogeneityModel {
    config: AnalysisConfig,
}

impl HeterogeneityModel {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Pooled estimate under the decision rule
    #[instrument(skip_all, fields(k = batch.len(), studies = batch.n_studies()))]
    pub fn fit(&self, batch: &EffectSizeBatch) -> Result<HeterogeneityAnalysis> {
        let (fit, selection) = self.fit_with_design(batch, Design::intercept(batch.len()))?;
        let pooled = fit.pooled()?;
        debug!(
            structure = %selection.chosen,
            estimate = pooled.point_estimate,
            "pooled estimate"
        );
        Ok(HeterogeneityAnalysis {
            fit,
            pooled,
            selection,
        })
    }

    /// Apply the decision rule with an arbitrary design
    pub fn fit_with_design(
        &self,
        batch: &EffectSizeBatch,
        design: Design,
    ) -> Result<(ModelFit, SelectionReport)> {
        let dependence_present = batch.has_dependence();
        let two_level = |reason: String| -> Result<(ModelFit, SelectionReport)> {
            let fit = TwoLevelFit::fit(batch, design.clone(), self.config.estimator, &self.config)?;
            Ok((
                ModelFit::TwoLevel(fit),
                SelectionReport {
                    dependence_present,
                    chosen: Structure::TwoLevel,
                    between_lrt: None,
                    within_lrt: None,
                    reason,
                },
            ))
        };

        match (self.config.dependence_model, dependence_present) {
            (DependenceModel::TwoLevel, _) => two_level("two-level model requested".to_string()),
            (_, false) => two_level("no study contributes more than one effect size".to_string()),
            (DependenceModel::ThreeLevel, true) => {
                match ThreeLevelFit::fit(batch, design.clone(), &self.config) {
                    Ok(fit) => Ok((
                        ModelFit::ThreeLevel(fit),
                        SelectionReport {
                            dependence_present,
                            chosen: Structure::ThreeLevel,
                            between_lrt: None,
                            within_lrt: None,
                            reason: "three-level model requested".to_string(),
                        },
                    )),
                    Err(e) => {
                        warn!(error = %e, "three-level fit failed, using two-level model");
                        two_level(format!("three-level fit failed: {e}"))
                    }
                }
            }
            (DependenceModel::Auto, true) => match self.likelihood_ratio_tests(batch, &design) {
                Ok((full, between, within)) => {
                    if between.is_significant(self.config.alpha) {
                        Ok((
                            ModelFit::ThreeLevel(full),
                            SelectionReport {
                                dependence_present,
                                chosen: Structure::ThreeLevel,
                                between_lrt: Some(between),
                                within_lrt: within,
                                reason: format!(
                                    "between-study component significant (LRT p = {:.4})",
                                    between.p_value
                                ),
                            },
                        ))
                    } else {
                        let (fit, mut report) = two_level(format!(
                            "between-study component not significant (LRT p = {:.4})",
                            between.p_value
                        ))?;
                        report.between_lrt = Some(between);
                        report.within_lrt = within;
                        Ok((fit, report))
                    }
                }
                Err(e) => {
                    warn!(error = %e, "three-level comparison failed, using two-level model");
                    two_level(format!("three-level fit failed: {e}"))
                }
            },
        }
    }

    /// Fit a given structure without testing
    pub fn fit_structure(
        &self,
        batch: &EffectSizeBatch,
        design: Design,
        structure: Structure,
    ) -> Result<ModelFit> {
        match structure {
            Structure::TwoLevel => {
                TwoLevelFit::fit(batch, design, self.config.estimator, &self.config)
                    .map(ModelFit::TwoLevel)
            }
            Structure::ThreeLevel => {
                ThreeLevelFit::fit(batch, design, &self.config).map(ModelFit::ThreeLevel)
            }
        }
    }

    fn likelihood_ratio_tests(
        &self,
        batch: &EffectSizeBatch,
        design: &Design,
    ) -> Result<(ThreeLevelFit, LikelihoodRatioTest, Option<LikelihoodRatioTest>)> {
        let full = ThreeLevelFit::fit(batch, design.clone(), &self.config)?;
        let no_between = ThreeLevelFit::fit_constrained(
            batch,
            design.clone(),
            VarianceConstraint::NoBetween,
            &self.config,
        )?;
        let between = full.likelihood_ratio(&no_between)?;

        // Reported only; a failure here does not affect the decision
        let within = ThreeLevelFit::fit_constrained(
            batch,
            design.clone(),
            VarianceConstraint::NoWithin,
            &self.config,
        )
        .and_then(|reduced| full.likelihood_ratio(&reduced))
        .ok();

        debug!(
            statistic = between.statistic,
            p_value = between.p_value,
            "three-level vs two-level likelihood-ratio test"
        );
        Ok((full, between, within))
    }
}
