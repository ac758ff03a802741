//! The sensitivity engine and its default bundle

use crate::estimators::EstimatorComparison;
use crate::influence::InfluenceDiagnostics;
use crate::leave_one_out::{LeaveOneOut, LooUnit};
use crate::outliers::OutlierRefit;
use meta_core::{AnalysisConfig, EffectSizeBatch, Result};
use meta_heterogeneity::HeterogeneityModel;
use tracing::{instrument, warn};

/// Entry point for sensitivity and influence analyses
///
/// Refits use the same decision rule as the main analysis; the influence
/// diagnostics and the estimator comparison use the two-level model.
#[derive(Debug, Clone)]
pub struct SensitivityEngine {
    pub(crate) config: AnalysisConfig,
    pub(crate) model: HeterogeneityModel,
}

/// Leave-one-out, influence, outlier refit and estimator comparison of one
/// batch
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityReport {
    pub leave_one_out: Result<LeaveOneOut>,
    pub influence: Result<InfluenceDiagnostics>,
    pub outlier_refit: Result<OutlierRefit>,
    pub estimator_comparison: Result<EstimatorComparison>,
}

impl SensitivityEngine {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let model = HeterogeneityModel::new(config)?;
        Ok(Self {
            config: config.clone(),
            model,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run the analyses that need no caller input; failures stay in the report
    #[instrument(skip_all, fields(k = batch.len()))]
    pub fn run(&self, batch: &EffectSizeBatch) -> SensitivityReport {
        let leave_one_out = self.leave_one_out(batch, LooUnit::Auto);
        let influence = self.influence(batch);
        let outlier_refit = match &influence {
            Ok(diagnostics) => self.outlier_refit_with(batch, diagnostics),
            Err(e) => Err(e.clone()),
        };
        let estimator_comparison = self.estimator_comparison(batch);

        for (name, error) in [
            ("leave-one-out", leave_one_out.as_ref().err()),
            ("influence diagnostics", influence.as_ref().err()),
            ("estimator comparison", estimator_comparison.as_ref().err()),
        ] {
            if let Some(e) = error {
                warn!(analysis = name, error = %e, "sensitivity analysis could not be computed");
            }
        }
        SensitivityReport {
            leave_one_out,
            influence,
            outlier_refit,
            estimator_comparison,
        }
    }
}
