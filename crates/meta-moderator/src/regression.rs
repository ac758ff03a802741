//! Mixed-effects meta-regression

use crate::engine::ModeratorEngine;
use meta_core::{CoefficientEstimate, EffectSizeBatch, Error, Heterogeneity, Result, WaldTest};
use meta_heterogeneity::{Design, Structure, Term};
use tracing::{debug, instrument};

/// A fitted meta-regression on one or more moderators
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionModel {
    pub terms: Vec<Term>,
    pub coefficients: Vec<CoefficientEstimate>,
    /// Omnibus test of every non-intercept coefficient
    pub omnibus: WaldTest,
    pub structure: Structure,
    pub k: usize,
    pub n_studies: usize,
    /// Heterogeneity variance of the intercept-only model
    pub tau2_null: Option<f64>,
    /// Residual heterogeneity variance of the regression model
    pub tau2_residual: Option<f64>,
    /// Proportion of heterogeneity explained, in `[0, 1]`
    pub r_squared: Option<f64>,
    pub residual: Option<Heterogeneity>,
    /// Records without a value for some moderator
    pub excluded_missing: usize,
}

impl RegressionModel {
    pub fn coefficient(&self, name: &str) -> Option<&CoefficientEstimate> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// Meta-regression on a single continuous predictor
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRegression {
    pub predictor: String,
    pub intercept: CoefficientEstimate,
    pub slope: CoefficientEstimate,
    pub model: RegressionModel,
}

impl MetaRegression {
    pub fn r_squared(&self) -> Option<f64> {
        self.model.r_squared
    }

    pub fn is_significant(&self, alpha: f64) -> bool {
        self.slope.p_value < alpha
    }
}

/// `(tau2_0 - tau2_1) / tau2_0`, truncated to `[0, 1]`
pub fn proportion_explained(tau2_null: f64, tau2_residual: f64) -> Option<f64> {
    (tau2_null > 0.0).then(|| ((tau2_null - tau2_residual) / tau2_null).clamp(0.0, 1.0))
}

impl ModeratorEngine {
    /// Regress effect sizes on one continuous predictor
    ///
    /// Needs at least `min_regression_k` records with a value for the
    /// predictor; below that no model is fitted.
    #[instrument(skip(self, batch), fields(k = batch.len()))]
    pub fn run_meta_regression(&self, batch: &EffectSizeBatch, predictor: &str) -> Result<MetaRegression> {
        let model = self.fit_regression(batch, &[Term::Continuous(predictor.to_string())])?;
        let (Some(intercept), Some(slope)) = (model.coefficients.first(), model.coefficients.get(1))
        else {
            return Err(Error::Computation(format!(
                "meta-regression on `{predictor}` returned no slope"
            )));
        };
        debug!(
            predictor,
            slope = slope.estimate,
            p = slope.p_value,
            r_squared = ?model.r_squared,
            "meta-regression"
        );
        Ok(MetaRegression {
            predictor: predictor.to_string(),
            intercept: intercept.clone(),
            slope: slope.clone(),
            model,
        })
    }

    /// Mixed-effects regression on any combination of moderators
    pub fn fit_regression(&self, batch: &EffectSizeBatch, terms: &[Term]) -> Result<RegressionModel> {
        if terms.is_empty() {
            return Err(Error::InvalidInput(
                "meta-regression needs at least one moderator".to_string(),
            ));
        }
        let complete = batch.filter(|r| terms.iter().all(|t| r.moderator(t.name()).is_some()));
        let excluded_missing = batch.len() - complete.len();
        let min_k = self.config.min_regression_k;
        let context = format!(
            "meta-regression on {}",
            terms.iter().map(Term::name).collect::<Vec<_>>().join(", ")
        );
        complete.require(min_k, &context)?;

        let design = Design::from_terms(&complete, terms)?;
        for (column, name) in design.names().iter().enumerate().skip(1) {
            let values = design.matrix().column(column);
            if values.iter().all(|v| *v == values[0]) {
                return Err(Error::InvalidInput(format!(
                    "moderator column `{name}` is constant"
                )));
            }
        }
        let columns = design.moderator_columns();
        let global = self.global_structure(&complete)?;
        let fit = self.fit_design(&complete, design, global)?;
        let structure = fit.structure();

        // R² is reported only when the intercept-only model fits
        let tau2_null = self
            .model
            .fit_structure(&complete, Design::intercept(complete.len()), structure)
            .ok()
            .and_then(|null| null.tau2());
        let tau2_residual = fit.tau2();
        let r_squared = match (tau2_null, tau2_residual) {
            (Some(t0), Some(t1)) => proportion_explained(t0, t1),
            _ => None,
        };

        let model = fit.as_model();
        Ok(RegressionModel {
            terms: terms.to_vec(),
            coefficients: model.coefficients()?,
            omnibus: model.wald_test(&columns)?,
            structure,
            k: complete.len(),
            n_studies: complete.n_studies(),
            tau2_null,
            tau2_residual,
            r_squared,
            residual: fit.heterogeneity()?,
            excluded_missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_proportion_explained() {
        assert_abs_diff_eq!(proportion_explained(0.2, 0.05).unwrap(), 0.75, epsilon = 1e-12);
        assert_eq!(proportion_explained(0.2, 0.3), Some(0.0));
        assert_eq!(proportion_explained(0.0, 0.0), None);
    }
}
