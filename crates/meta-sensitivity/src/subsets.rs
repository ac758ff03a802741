//! Refits restricted to caller-defined subsets

use crate::engine::SensitivityEngine;
use meta_core::{EffectSizeBatch, EffectSizeRecord, PooledEstimate, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{instrument, warn};

type Predicate = Arc<dyn Fn(&EffectSizeRecord) -> bool + Send + Sync>;

/// A named selection of records, e.g. "RCTs only"
#[derive(Clone)]
pub struct Subset {
    label: String,
    keep: Predicate,
}

impl Subset {
    pub fn new<F>(label: impl Into<String>, keep: F) -> Self
    where
        F: Fn(&EffectSizeRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            keep: Arc::new(keep),
        }
    }

    /// Records whose categorical moderator `moderator` equals `level`
    pub fn moderator_level(moderator: impl Into<String>, level: impl Into<String>) -> Self {
        let moderator = moderator.into();
        let level = level.into();
        let label = format!("{moderator} = {level}");
        Self::new(label, move |record| {
            record
                .moderator(&moderator)
                .and_then(|value| value.as_level())
                .is_some_and(|l| l == level)
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn apply(&self, batch: &EffectSizeBatch) -> EffectSizeBatch {
        batch.filter(|r| (self.keep)(r))
    }
}

impl fmt::Debug for Subset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subset").field("label", &self.label).finish()
    }
}

/// One subset refit
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetResult {
    pub label: String,
    pub k: usize,
    pub n_studies: usize,
    pub estimate: Result<PooledEstimate>,
}

impl SubsetResult {
    /// Subset estimate minus the full-sample estimate
    pub fn difference(&self, baseline: &PooledEstimate) -> Option<f64> {
        self.estimate
            .as_ref()
            .ok()
            .map(|e| e.point_estimate - baseline.point_estimate)
    }
}

/// Subset refits next to the full-sample baseline
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetComparison {
    pub baseline: PooledEstimate,
    pub subsets: Vec<SubsetResult>,
}

impl SensitivityEngine {
    /// Refit the pooled model on each subset
    #[instrument(skip_all, fields(k = batch.len(), subsets = subsets.len()))]
    pub fn subsets(&self, batch: &EffectSizeBatch, subsets: &[Subset]) -> Result<SubsetComparison> {
        let baseline = self.model.fit(batch)?.pooled;
        let subsets = subsets
            .iter()
            .map(|subset| {
                let selected = subset.apply(batch);
                let estimate = if selected.is_empty() {
                    Err(meta_core::Error::too_few(1, 0, subset.label()))
                } else {
                    self.model.fit(&selected).map(|analysis| analysis.pooled)
                };
                if let Err(e) = &estimate {
                    warn!(subset = subset.label(), error = %e, "subset refit failed");
                }
                SubsetResult {
                    label: subset.label().to_string(),
                    k: selected.len(),
                    n_studies: selected.n_studies(),
                    estimate,
                }
            })
            .collect();
        Ok(SubsetComparison { baseline, subsets })
    }
}
