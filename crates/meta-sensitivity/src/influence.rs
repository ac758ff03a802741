//! Case-deletion influence diagnostics for the two-level model
//!
//! Every effect size is deleted once and the model refitted with the same
//! τ² estimator. With `b` and `V` the full-data coefficients and their
//! covariance and `b(-i)`, `V(-i)`, `τ²(-i)` those of the deletion fit:
//!
//! - Cook's distance: `(b - b(-i))' V⁻¹ (b - b(-i))`
//! - studentized deletion residual: `(y_i - x_i'b(-i)) / sqrt(v_i + τ²(-i) + x_i'V(-i)x_i)`
//! - DFFITS: `(x_i'b - x_i'b(-i)) / sqrt(h_i (v_i + τ²(-i)))`
//!
//! Dependent effect sizes are treated as independent here. When the main
//! analysis settles on the three-level model the diagnostics say so and a
//! warning is logged.

use crate::engine::SensitivityEngine;
use crate::execution::map_refits;
use meta_core::{
    ConfidenceInterval, DependenceModel, EffectSizeBatch, Error, PooledEstimate, Result,
};
use meta_heterogeneity::{Design, FittedModel, Structure, TwoLevelFit};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// |studentized residual| above this marks an outlier
pub const OUTLIER_RESIDUAL: f64 = 3.0;

/// Influence of one effect size on the pooled estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluenceRecord {
    pub study_id: String,
    pub effect_size_id: String,
    pub estimate_without: f64,
    pub ci_without: ConfidenceInterval,
    pub cooks_distance: f64,
    pub studentized_residual: f64,
    pub hat_value: f64,
    pub dffits: f64,
    /// Cook's distance above `4 / k`
    pub influential: bool,
    /// |studentized residual| above 3
    pub outlier: bool,
    /// Hat value above `2 (p + 1) / k`
    pub high_leverage: bool,
}

impl InfluenceRecord {
    pub fn is_flagged(&self) -> bool {
        self.influential || self.outlier
    }
}

/// Cut-offs used for the flags
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InfluenceThresholds {
    pub cooks_distance: f64,
    pub studentized_residual: f64,
    pub hat_value: f64,
}

impl InfluenceThresholds {
    /// Conventional cut-offs for `k` effect sizes and `p` coefficients
    pub fn for_model(k: usize, p: usize) -> Self {
        let k = k as f64;
        Self {
            cooks_distance: 4.0 / k,
            studentized_residual: OUTLIER_RESIDUAL,
            hat_value: 2.0 * (p as f64 + 1.0) / k,
        }
    }
}

/// Influence diagnostics of one fit
#[derive(Debug, Clone, PartialEq)]
pub struct InfluenceDiagnostics {
    /// Structure of the main analysis; the diagnostics themselves are always two-level
    pub main_structure: Structure,
    pub baseline: PooledEstimate,
    pub thresholds: InfluenceThresholds,
    pub records: Vec<InfluenceRecord>,
}

impl InfluenceDiagnostics {
    pub fn influential(&self) -> impl Iterator<Item = &InfluenceRecord> {
        self.records.iter().filter(|r| r.influential)
    }

    pub fn outliers(&self) -> impl Iterator<Item = &InfluenceRecord> {
        self.records.iter().filter(|r| r.outlier)
    }

    pub fn high_leverage(&self) -> impl Iterator<Item = &InfluenceRecord> {
        self.records.iter().filter(|r| r.high_leverage)
    }

    /// Indices of outlying or influential records
    pub fn flagged_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_flagged())
            .map(|(i, _)| i)
            .collect()
    }
}

impl SensitivityEngine {
    /// Cook's distance, studentized residuals, hat values and DFFITS
    #[instrument(skip_all, fields(k = batch.len()))]
    pub fn influence(&self, batch: &EffectSizeBatch) -> Result<InfluenceDiagnostics> {
        batch.require(3, "influence diagnostics")?;
        let config = &self.config;
        let full = TwoLevelFit::intercept_only(batch, config)?;
        let baseline = full.pooled()?;
        let k = full.k();
        let thresholds = InfluenceThresholds::for_model(k, full.n_params());
        let main_structure = self.main_structure(batch);
        if main_structure == Structure::ThreeLevel {
            warn!(
                studies = batch.n_studies(),
                "main model is three-level, influence diagnostics ignore the study clustering"
            );
        }

        let precision = full
            .vcov()
            .clone()
            .cholesky()
            .ok_or_else(|| Error::singular("coefficient covariance"))?;
        let hat = full.hat_values();
        let fitted = full.fitted();
        let x = full.design().matrix().clone();

        let indices: Vec<usize> = (0..k).collect();
        let records = map_refits(&indices, |&i| -> Result<InfluenceRecord> {
            let reduced = batch.without(i);
            let deleted = TwoLevelFit::fit(
                &reduced,
                Design::intercept(reduced.len()),
                config.estimator,
                config,
            )?;
            let pooled = deleted.pooled()?;
            let record = &batch.records()[i];
            let tau2 = deleted.tau2().unwrap_or(0.0);
            let row = x.row(i).transpose();

            let shift = full.beta() - deleted.beta();
            let cooks_distance = shift.dot(&precision.solve(&shift));
            let predicted = row.dot(deleted.beta());
            let spread = record.variance_g + tau2 + row.dot(&(deleted.vcov() * &row));
            let studentized_residual = (record.g - predicted) / spread.sqrt();
            let dffits = (fitted[i] - predicted) / (hat[i] * (record.variance_g + tau2)).sqrt();

            Ok(InfluenceRecord {
                study_id: record.study_id.clone(),
                effect_size_id: record.effect_size_id.clone(),
                estimate_without: pooled.point_estimate,
                ci_without: pooled.ci,
                cooks_distance,
                studentized_residual,
                hat_value: hat[i],
                dffits,
                influential: cooks_distance > thresholds.cooks_distance,
                outlier: studentized_residual.abs() > thresholds.studentized_residual,
                high_leverage: hat[i] > thresholds.hat_value,
            })
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        debug!(
            influential = records.iter().filter(|r| r.influential).count(),
            outliers = records.iter().filter(|r| r.outlier).count(),
            "influence diagnostics"
        );
        Ok(InfluenceDiagnostics {
            main_structure,
            baseline,
            thresholds,
            records,
        })
    }

    fn main_structure(&self, batch: &EffectSizeBatch) -> Structure {
        if !batch.has_dependence() || self.config.dependence_model == DependenceModel::TwoLevel {
            return Structure::TwoLevel;
        }
        self.model
            .fit(batch)
            .map(|analysis| analysis.selection.chosen)
            .unwrap_or(Structure::TwoLevel)
    }
}
