//! Refit without flagged outliers and influential cases

use crate::engine::SensitivityEngine;
use crate::influence::InfluenceDiagnostics;
use meta_core::{EffectSizeBatch, PooledEstimate, Result};
use tracing::{debug, instrument};

/// A removed effect size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludedEffect {
    pub study_id: String,
    pub effect_size_id: String,
}

/// Pooled estimate before and after removing flagged cases
#[derive(Debug, Clone, PartialEq)]
pub struct OutlierRefit {
    pub excluded: Vec<ExcludedEffect>,
    pub baseline: PooledEstimate,
    /// Equal to the baseline when nothing is flagged
    pub refit: Result<PooledEstimate>,
}

impl OutlierRefit {
    pub fn n_excluded(&self) -> usize {
        self.excluded.len()
    }

    /// `refit - baseline`
    pub fn shift(&self) -> Option<f64> {
        self.refit
            .as_ref()
            .ok()
            .map(|r| r.point_estimate - self.baseline.point_estimate)
    }
}

impl SensitivityEngine {
    /// Refit the pooled model without cases flagged by [`Self::influence`]
    #[instrument(skip_all, fields(k = batch.len()))]
    pub fn outlier_refit(&self, batch: &EffectSizeBatch) -> Result<OutlierRefit> {
        let diagnostics = self.influence(batch)?;
        self.outlier_refit_with(batch, &diagnostics)
    }

    /// Refit using diagnostics computed earlier on the same batch
    pub fn outlier_refit_with(
        &self,
        batch: &EffectSizeBatch,
        diagnostics: &InfluenceDiagnostics,
    ) -> Result<OutlierRefit> {
        let baseline = self.model.fit(batch)?.pooled;
        let flagged = diagnostics.flagged_indices();
        let excluded: Vec<ExcludedEffect> = flagged
            .iter()
            .map(|&i| {
                let record = &batch.records()[i];
                ExcludedEffect {
                    study_id: record.study_id.clone(),
                    effect_size_id: record.effect_size_id.clone(),
                }
            })
            .collect();

        let refit = if flagged.is_empty() {
            Ok(baseline.clone())
        } else {
            let kept: Vec<usize> = (0..batch.len()).filter(|i| !flagged.contains(i)).collect();
            self.model.fit(&batch.subset(&kept)).map(|analysis| analysis.pooled)
        };
        debug!(excluded = excluded.len(), "outlier refit");
        Ok(OutlierRefit {
            excluded,
            baseline,
            refit,
        })
    }
}
