//! The publication-bias suite
//!
//! Every method is callable on its own; [`PublicationBiasSuite::run`] tries
//! them all and keeps each outcome, successful or not, in a
//! [`BiasAssessment`].

use crate::begg::{begg_test, BeggTest};
use crate::egger::{egger_test, pet_peese, EggerPredictor, EggerTest, PetPeese};
use crate::failsafe::{orwin, rosenthal, OrwinFailSafe, RosenthalFailSafe};
use crate::selection::{selection_model, SelectionModel};
use crate::trim_fill::{trim_and_fill, FunnelSide, TrimAndFill, TrimFillEstimator};
use meta_core::{AnalysisConfig, EffectSizeBatch, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{instrument, warn};

/// Publication-bias method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BiasMethod {
    Egger,
    Begg,
    TrimAndFill,
    PetPeese,
    SelectionModel,
    RosenthalFailSafe,
    OrwinFailSafe,
}

impl BiasMethod {
    pub const ALL: [BiasMethod; 7] = [
        Self::Egger,
        Self::Begg,
        Self::TrimAndFill,
        Self::PetPeese,
        Self::SelectionModel,
        Self::RosenthalFailSafe,
        Self::OrwinFailSafe,
    ];
}

impl fmt::Display for BiasMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Egger => "Egger regression test",
            Self::Begg => "Begg rank correlation test",
            Self::TrimAndFill => "trim-and-fill",
            Self::PetPeese => "PET-PEESE",
            Self::SelectionModel => "selection model",
            Self::RosenthalFailSafe => "Rosenthal fail-safe N",
            Self::OrwinFailSafe => "Orwin fail-safe N",
        };
        write!(f, "{name}")
    }
}

/// Qualitative reading of one method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasVerdict {
    BiasIndicated,
    NoBiasIndicated,
    /// Fail-safe N above its benchmark
    Robust,
    /// Fail-safe N at or below its benchmark
    Fragile,
    CouldNotCompute,
}

/// One row of a [`BiasAssessment`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasSummary {
    pub method: BiasMethod,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    /// Bias-corrected pooled estimate, where the method gives one
    pub corrected_estimate: Option<f64>,
    pub verdict: BiasVerdict,
    pub detail: String,
}

impl BiasSummary {
    fn failed(method: BiasMethod, error: &meta_core::Error) -> Self {
        Self {
            method,
            statistic: None,
            p_value: None,
            corrected_estimate: None,
            verdict: BiasVerdict::CouldNotCompute,
            detail: error.to_string(),
        }
    }
}

fn indicated(flag: bool) -> BiasVerdict {
    if flag {
        BiasVerdict::BiasIndicated
    } else {
        BiasVerdict::NoBiasIndicated
    }
}

/// Outcome of every bias method on one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BiasAssessment {
    pub k: usize,
    /// Significance level behind every verdict
    pub alpha: f64,
    pub egger: Result<EggerTest>,
    pub begg: Result<BeggTest>,
    pub trim_and_fill: Result<TrimAndFill>,
    pub pet_peese: Result<PetPeese>,
    pub selection: Result<SelectionModel>,
    pub rosenthal: Result<RosenthalFailSafe>,
    pub orwin: Result<OrwinFailSafe>,
}

impl BiasAssessment {
    /// Method, statistic, p-value or corrected estimate and verdict, in
    /// [`BiasMethod::ALL`] order
    pub fn summaries(&self) -> Vec<BiasSummary> {
        BiasMethod::ALL.iter().map(|&m| self.summary(m)).collect()
    }

    pub fn summary(&self, method: BiasMethod) -> BiasSummary {
        let row = |statistic, p_value, corrected_estimate, verdict, detail: String| BiasSummary {
            method,
            statistic,
            p_value,
            corrected_estimate,
            verdict,
            detail,
        };
        match method {
            BiasMethod::Egger => match &self.egger {
                Ok(t) => row(
                    Some(t.asymmetry.statistic),
                    Some(t.asymmetry.p_value),
                    Some(t.limit_estimate.estimate),
                    indicated(t.asymmetric),
                    format!("{} predictor, asymmetry {:.4}", t.predictor, t.asymmetry.estimate),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::Begg => match &self.begg {
                Ok(t) => row(
                    Some(t.tau),
                    Some(t.p_value),
                    None,
                    indicated(t.asymmetric),
                    format!("Kendall tau {:.4}", t.tau),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::TrimAndFill => match &self.trim_and_fill {
                Ok(t) => row(
                    Some(t.k0 as f64),
                    Some(t.adjusted.p_value),
                    Some(t.adjusted.point_estimate),
                    indicated(t.k0 > 0),
                    format!("{} estimator, {} imputed on the {} side", t.estimator, t.k0, t.side),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::PetPeese => match &self.pet_peese {
                Ok(p) => row(
                    Some(p.pet.slope.statistic),
                    Some(p.pet.slope.p_value),
                    Some(p.corrected.estimate),
                    indicated(p.pet.slope.p_value < self.alpha),
                    format!("{}: {}", p.selected, p.reason),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::SelectionModel => match &self.selection {
                Ok(s) => row(
                    Some(s.lrt.statistic),
                    Some(s.lrt.p_value),
                    Some(s.adjusted.estimate),
                    indicated(s.significant),
                    format!(
                        "unadjusted {:.4}, adjusted {:.4}",
                        s.unadjusted.estimate, s.adjusted.estimate
                    ),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::RosenthalFailSafe => match &self.rosenthal {
                Ok(r) => row(
                    Some(r.n),
                    Some(r.combined_p),
                    None,
                    if r.robust {
                        BiasVerdict::Robust
                    } else {
                        BiasVerdict::Fragile
                    },
                    format!("N = {:.0} against 5k + 10 = {:.0}", r.n, r.threshold),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
            BiasMethod::OrwinFailSafe => match &self.orwin {
                Ok(o) => row(
                    Some(o.n),
                    None,
                    None,
                    if o.robust {
                        BiasVerdict::Robust
                    } else {
                        BiasVerdict::Fragile
                    },
                    format!("N = {:.0} to reach {:.2}", o.n, o.target),
                ),
                Err(e) => BiasSummary::failed(method, e),
            },
        }
    }
}

/// Runs the publication-bias methods with one configuration
///
/// All methods treat the effect sizes as independent.
#[derive(Debug, Clone)]
pub struct PublicationBiasSuite {
    config: AnalysisConfig,
    egger_predictor: EggerPredictor,
    trim_fill_estimator: TrimFillEstimator,
    side: FunnelSide,
}

impl PublicationBiasSuite {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: config.clone(),
            egger_predictor: EggerPredictor::StandardError,
            trim_fill_estimator: TrimFillEstimator::L0,
            side: FunnelSide::Auto,
        })
    }

    pub fn with_egger_predictor(mut self, predictor: EggerPredictor) -> Self {
        self.egger_predictor = predictor;
        self
    }

    pub fn with_trim_fill_estimator(mut self, estimator: TrimFillEstimator) -> Self {
        self.trim_fill_estimator = estimator;
        self
    }

    pub fn with_side(mut self, side: FunnelSide) -> Self {
        self.side = side;
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn egger(&self, batch: &EffectSizeBatch) -> Result<EggerTest> {
        egger_test(batch, self.egger_predictor, &self.config)
    }

    pub fn begg(&self, batch: &EffectSizeBatch) -> Result<BeggTest> {
        begg_test(batch, self.config.alpha)
    }

    pub fn trim_and_fill(&self, batch: &EffectSizeBatch) -> Result<TrimAndFill> {
        trim_and_fill(batch, self.trim_fill_estimator, self.side, &self.config)
    }

    pub fn pet_peese(&self, batch: &EffectSizeBatch) -> Result<PetPeese> {
        pet_peese(batch, &self.config)
    }

    pub fn selection_model(&self, batch: &EffectSizeBatch) -> Result<SelectionModel> {
        selection_model(batch, &self.config)
    }

    pub fn rosenthal(&self, batch: &EffectSizeBatch) -> Result<RosenthalFailSafe> {
        rosenthal(batch, self.config.alpha)
    }

    pub fn orwin(&self, batch: &EffectSizeBatch) -> Result<OrwinFailSafe> {
        orwin(batch, &self.config)
    }

    /// Try every method; a failing method never stops the others
    #[instrument(skip_all, fields(k = batch.len()))]
    pub fn run(&self, batch: &EffectSizeBatch) -> BiasAssessment {
        fn logged<T>(method: BiasMethod, outcome: Result<T>) -> Result<T> {
            if let Err(e) = &outcome {
                warn!(%method, error = %e, "publication-bias method could not be computed");
            }
            outcome
        }
        BiasAssessment {
            k: batch.len(),
            alpha: self.config.alpha,
            egger: logged(BiasMethod::Egger, self.egger(batch)),
            begg: logged(BiasMethod::Begg, self.begg(batch)),
            trim_and_fill: logged(BiasMethod::TrimAndFill, self.trim_and_fill(batch)),
            pet_peese: logged(BiasMethod::PetPeese, self.pet_peese(batch)),
            selection: logged(BiasMethod::SelectionModel, self.selection_model(batch)),
            rosenthal: logged(BiasMethod::RosenthalFailSafe, self.rosenthal(batch)),
            orwin: logged(BiasMethod::OrwinFailSafe, self.orwin(batch)),
        }
    }
}
