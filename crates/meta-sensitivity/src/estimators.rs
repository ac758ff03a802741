//! Sensitivity of the pooled estimate to the τ² estimator

use crate::engine::SensitivityEngine;
use meta_core::{EffectSizeBatch, PooledEstimate, Result, Tau2Estimator};
use meta_heterogeneity::{Design, TwoLevelFit};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorResult {
    pub estimator: Tau2Estimator,
    pub estimate: Result<PooledEstimate>,
}

/// Two-level fits under every τ² estimator
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorComparison {
    pub results: Vec<EstimatorResult>,
    /// Largest minus smallest point estimate over successful fits
    pub range: Option<f64>,
    pub threshold: f64,
    /// `range < threshold`
    pub robust: bool,
}

impl EstimatorComparison {
    pub fn get(&self, estimator: Tau2Estimator) -> Option<&PooledEstimate> {
        self.results
            .iter()
            .find(|r| r.estimator == estimator)
            .and_then(|r| r.estimate.as_ref().ok())
    }
}

impl SensitivityEngine {
    /// Refit the two-level model under REML, DL, PM, EB, SJ and ML
    #[instrument(skip_all, fields(k = batch.len()))]
    pub fn estimator_comparison(&self, batch: &EffectSizeBatch) -> Result<EstimatorComparison> {
        batch.require(2, "estimator comparison")?;
        let results: Vec<EstimatorResult> = Tau2Estimator::ALL
            .iter()
            .map(|&estimator| {
                let estimate =
                    TwoLevelFit::fit(batch, Design::intercept(batch.len()), estimator, &self.config)
                        .and_then(|fit| fit.pooled());
                if let Err(e) = &estimate {
                    warn!(estimator = %estimator, error = %e, "estimator refit failed");
                }
                EstimatorResult {
                    estimator,
                    estimate,
                }
            })
            .collect();

        let estimates: Vec<f64> = results
            .iter()
            .filter_map(|r| r.estimate.as_ref().ok().map(|e| e.point_estimate))
            .collect();
        let range = (!estimates.is_empty()).then(|| {
            let lo = estimates.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = estimates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            hi - lo
        });
        let threshold = self.config.robustness_threshold;
        let robust = range.is_some_and(|r| r < threshold);
        debug!(?range, robust, "estimator comparison");
        Ok(EstimatorComparison {
            results,
            range,
            threshold,
            robust,
        })
    }
}
