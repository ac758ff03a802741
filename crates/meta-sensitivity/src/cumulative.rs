//! Cumulative meta-analysis

use crate::engine::SensitivityEngine;
use meta_core::{EffectSizeBatch, Error, PooledEstimate, Result};
use tracing::{debug, instrument, warn};

/// The pooled estimate after adding one more study
#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeStep {
    /// Study added in this step
    pub study_id: String,
    /// Ordering key of the added study
    pub key: f64,
    pub k: usize,
    pub n_studies: usize,
    pub estimate: Result<PooledEstimate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeAnalysis {
    pub order_by: String,
    pub steps: Vec<CumulativeStep>,
    /// Records without a value for the ordering key
    pub excluded_missing: usize,
}

impl CumulativeAnalysis {
    pub fn final_estimate(&self) -> Option<&PooledEstimate> {
        self.steps.last().and_then(|s| s.estimate.as_ref().ok())
    }
}

impl SensitivityEngine {
    /// Add studies in order of the continuous moderator `order_by`, refitting
    /// after each
    ///
    /// A study's key is the smallest key among its effect sizes; ties keep
    /// the batch order.
    #[instrument(skip_all, fields(k = batch.len(), order_by = %order_by))]
    pub fn cumulative(&self, batch: &EffectSizeBatch, order_by: &str) -> Result<CumulativeAnalysis> {
        let keyed = batch.filter(|r| r.moderator(order_by).and_then(|v| v.as_continuous()).is_some());
        let excluded_missing = batch.len() - keyed.len();
        if excluded_missing > 0 {
            warn!(order_by, excluded_missing, "records without an ordering key left out");
        }
        if keyed.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no record has a continuous value for `{order_by}`"
            )));
        }

        let clusters = keyed.clusters();
        let mut order: Vec<(usize, f64)> = clusters
            .members()
            .iter()
            .enumerate()
            .map(|(c, members)| {
                let key = members
                    .iter()
                    .filter_map(|&i| keyed.records()[i].moderator(order_by).and_then(|v| v.as_continuous()))
                    .fold(f64::INFINITY, f64::min);
                (c, key)
            })
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut included: Vec<usize> = Vec::with_capacity(keyed.len());
        let steps = order
            .iter()
            .map(|&(cluster, key)| {
                included.extend(&clusters.members()[cluster]);
                included.sort_unstable();
                let partial = keyed.subset(&included);
                let estimate = self.model.fit(&partial).map(|analysis| analysis.pooled);
                CumulativeStep {
                    study_id: clusters.label(cluster).to_string(),
                    key,
                    k: partial.len(),
                    n_studies: partial.n_studies(),
                    estimate,
                }
            })
            .collect::<Vec<_>>();

        debug!(steps = steps.len(), "cumulative analysis");
        Ok(CumulativeAnalysis {
            order_by: order_by.to_string(),
            steps,
            excluded_missing,
        })
    }
}
