//! Regression tests for funnel-plot asymmetry and PET-PEESE

use crate::regression::{weighted_regression, with_intercept};
use meta_core::{AnalysisConfig, CoefficientEstimate, EffectSizeBatch, Error, Result};
use meta_heterogeneity::{Design, FittedModel, TwoLevelFit};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Predictor of the funnel regression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EggerPredictor {
    /// Mixed-effects regression of `y` on the standard error
    StandardError,
    /// Mixed-effects regression of `y` on the sampling variance
    Variance,
    /// Classical precision regression: OLS of `y / se` on `1 / se`
    Precision,
}

impl fmt::Display for EggerPredictor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StandardError => write!(f, "standard error"),
            Self::Variance => write!(f, "sampling variance"),
            Self::Precision => write!(f, "precision"),
        }
    }
}

/// Egger-type regression test
#[derive(Debug, Clone, PartialEq)]
pub struct EggerTest {
    pub predictor: EggerPredictor,
    /// The asymmetry term: the coefficient of the standard error (or
    /// variance), or the intercept of the precision regression
    pub asymmetry: CoefficientEstimate,
    /// Effect expected for an infinitely precise study
    pub limit_estimate: CoefficientEstimate,
    pub k: usize,
    pub asymmetric: bool,
}

impl EggerTest {
    /// Positive when small studies report larger effects
    pub fn direction(&self) -> f64 {
        self.asymmetry.estimate.signum()
    }
}

/// Run the regression test
pub fn egger_test(
    batch: &EffectSizeBatch,
    predictor: EggerPredictor,
    config: &AnalysisConfig,
) -> Result<EggerTest> {
    batch.require(3, "Egger regression test")?;
    let y = batch.effects();
    let v = batch.variances();
    let se: Vec<f64> = v.iter().map(|v| v.sqrt()).collect();

    let (asymmetry, limit_estimate) = match predictor {
        EggerPredictor::StandardError | EggerPredictor::Variance => {
            let (name, values) = if predictor == EggerPredictor::StandardError {
                ("sei", se)
            } else {
                ("vi", v)
            };
            let design = Design::intercept(batch.len()).with_column(name, &values)?;
            let fit = TwoLevelFit::fit(batch, design, config.estimator, config)?;
            let mut coefficients = fit.coefficients()?.into_iter();
            match (coefficients.next(), coefficients.next()) {
                (Some(intercept), Some(slope)) => (slope, intercept),
                _ => return Err(Error::Computation("funnel regression lost a coefficient".to_string())),
            }
        }
        EggerPredictor::Precision => {
            let precision: Vec<f64> = se.iter().map(|s| 1.0 / s).collect();
            let standardized =
                DVector::from_iterator(y.len(), y.iter().zip(&se).map(|(y, s)| y / s));
            let mut coefficients = weighted_regression(
                &with_intercept(&precision),
                &standardized,
                &DVector::from_element(y.len(), 1.0),
                &["intercept", "precision"],
                config.confidence_level,
            )?
            .into_iter();
            match (coefficients.next(), coefficients.next()) {
                (Some(intercept), Some(slope)) => (intercept, slope),
                _ => return Err(Error::Computation("funnel regression lost a coefficient".to_string())),
            }
        }
    };

    let asymmetric = asymmetry.p_value < config.alpha;
    debug!(
        %predictor,
        asymmetry = asymmetry.estimate,
        p = asymmetry.p_value,
        "Egger regression test"
    );
    Ok(EggerTest {
        predictor,
        asymmetry,
        limit_estimate,
        k: batch.len(),
        asymmetric,
    })
}

/// Which PET-PEESE regression supplies the corrected estimate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PetPeeseMethod {
    Pet,
    Peese,
}

impl fmt::Display for PetPeeseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pet => write!(f, "PET"),
            Self::Peese => write!(f, "PEESE"),
        }
    }
}

/// Intercept and slope of one precision-effect regression
#[derive(Debug, Clone, PartialEq)]
pub struct FunnelRegression {
    pub intercept: CoefficientEstimate,
    pub slope: CoefficientEstimate,
}

/// Conditional PET-PEESE estimate
#[derive(Debug, Clone, PartialEq)]
pub struct PetPeese {
    /// `y ~ se`, weights `1 / v`
    pub pet: FunnelRegression,
    /// `y ~ v`, weights `1 / v`; fitted only when the PET intercept is significant
    pub peese: Option<FunnelRegression>,
    pub selected: PetPeeseMethod,
    pub corrected: CoefficientEstimate,
    pub reason: String,
}

fn funnel_regression(
    predictor: &[f64],
    batch: &EffectSizeBatch,
    name: &str,
    confidence_level: f64,
) -> Result<FunnelRegression> {
    let y = DVector::from_vec(batch.effects());
    let weights = DVector::from_iterator(batch.len(), batch.variances().into_iter().map(|v| 1.0 / v));
    let mut coefficients = weighted_regression(
        &with_intercept(predictor),
        &y,
        &weights,
        &["intercept", name],
        confidence_level,
    )?
    .into_iter();
    match (coefficients.next(), coefficients.next()) {
        (Some(intercept), Some(slope)) => Ok(FunnelRegression { intercept, slope }),
        _ => Err(Error::Computation("funnel regression lost a coefficient".to_string())),
    }
}

/// PET, followed by PEESE when the PET intercept differs from zero
pub fn pet_peese(batch: &EffectSizeBatch, config: &AnalysisConfig) -> Result<PetPeese> {
    batch.require(3, "PET-PEESE")?;
    let v = batch.variances();
    let se: Vec<f64> = v.iter().map(|v| v.sqrt()).collect();

    let pet = funnel_regression(&se, batch, "sei", config.confidence_level)?;
    let pet_p = pet.intercept.p_value;
    if pet_p < config.alpha {
        let peese = funnel_regression(&v, batch, "vi", config.confidence_level)?;
        let corrected = peese.intercept.clone();
        debug!(pet_p, corrected = corrected.estimate, "PET-PEESE selected PEESE");
        Ok(PetPeese {
            pet,
            peese: Some(peese),
            selected: PetPeeseMethod::Peese,
            corrected,
            reason: format!(
                "PET intercept significant (p = {pet_p:.4} < {}), a genuine effect is likely; PEESE used",
                config.alpha
            ),
        })
    } else {
        let corrected = pet.intercept.clone();
        debug!(pet_p, corrected = corrected.estimate, "PET-PEESE selected PET");
        Ok(PetPeese {
            pet,
            peese: None,
            selected: PetPeeseMethod::Pet,
            corrected,
            reason: format!(
                "PET intercept not significant (p = {pet_p:.4} >= {}); PET used",
                config.alpha
            ),
        })
    }
}
