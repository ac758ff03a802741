//! Leave-one-out re-estimation

use crate::engine::SensitivityEngine;
use crate::execution::map_refits;
use meta_core::{ConfidenceInterval, EffectSizeBatch, PooledEstimate, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument, warn};

/// What a single leave-one-out step removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LooUnit {
    /// Whole studies when some study has several effect sizes, otherwise
    /// single effect sizes
    Auto,
    EffectSize,
    Study,
}

impl fmt::Display for LooUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::EffectSize => write!(f, "effect size"),
            Self::Study => write!(f, "study"),
        }
    }
}

/// The pooled estimate with one unit removed
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOneOutRow {
    /// Study id, or `study/effect-size` id for effect-size units
    pub label: String,
    /// Effect sizes removed in this step
    pub removed: usize,
    pub estimate: Result<PooledEstimate>,
    /// `estimate - baseline`
    pub change: Option<f64>,
    /// Removing this unit moves the result across the significance threshold
    pub flips_significance: bool,
}

impl LeaveOneOutRow {
    pub fn estimate_without(&self) -> Option<f64> {
        self.estimate.as_ref().ok().map(|e| e.point_estimate)
    }

    pub fn ci_without(&self) -> Option<ConfidenceInterval> {
        self.estimate.as_ref().ok().map(|e| e.ci)
    }

    pub fn p_without(&self) -> Option<f64> {
        self.estimate.as_ref().ok().map(|e| e.p_value)
    }
}

/// Leave-one-out table
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveOneOut {
    /// Resolved unit, never `Auto`
    pub unit: LooUnit,
    pub baseline: PooledEstimate,
    pub rows: Vec<LeaveOneOutRow>,
    /// Some single removal flips significance
    pub fragile: bool,
}

impl LeaveOneOut {
    /// Row with the largest absolute change
    pub fn most_influential(&self) -> Option<&LeaveOneOutRow> {
        self.rows
            .iter()
            .filter_map(|row| row.change.map(|c| (row, c.abs())))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(row, _)| row)
    }

    /// Smallest and largest estimate over all removals
    pub fn range(&self) -> Option<(f64, f64)> {
        let estimates: Vec<f64> = self.rows.iter().filter_map(|r| r.estimate_without()).collect();
        if estimates.is_empty() {
            return None;
        }
        let lo = estimates.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = estimates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some((lo, hi))
    }
}

impl SensitivityEngine {
    /// Refit the pooled model with each unit removed in turn
    #[instrument(skip_all, fields(k = batch.len(), unit = %unit))]
    pub fn leave_one_out(&self, batch: &EffectSizeBatch, unit: LooUnit) -> Result<LeaveOneOut> {
        batch.require(2, "leave-one-out")?;
        let baseline = self.model.fit(batch)?.pooled;
        let unit = match unit {
            LooUnit::Auto if batch.has_dependence() => LooUnit::Study,
            LooUnit::Auto => LooUnit::EffectSize,
            resolved => resolved,
        };
        let reduced: Vec<(String, EffectSizeBatch)> = match unit {
            LooUnit::Study => {
                let clusters = batch.clusters();
                (0..clusters.len())
                    .map(|c| {
                        let label = clusters.label(c).to_string();
                        let without = batch.without_study(&label);
                        (label, without)
                    })
                    .collect()
            }
            _ => batch
                .records()
                .iter()
                .enumerate()
                .map(|(i, r)| (format!("{}/{}", r.study_id, r.effect_size_id), batch.without(i)))
                .collect(),
        };

        let alpha = self.config.alpha;
        let significant = baseline.is_significant(alpha);
        let rows: Vec<LeaveOneOutRow> = map_refits(&reduced, |(label, without)| {
            let estimate = self.model.fit(without).map(|analysis| analysis.pooled);
            if let Err(e) = &estimate {
                warn!(unit = %label, error = %e, "leave-one-out refit failed");
            }
            let change = estimate
                .as_ref()
                .ok()
                .map(|e| e.point_estimate - baseline.point_estimate);
            let flips_significance = estimate
                .as_ref()
                .is_ok_and(|e| e.is_significant(alpha) != significant);
            LeaveOneOutRow {
                label: label.clone(),
                removed: batch.len() - without.len(),
                estimate,
                change,
                flips_significance,
            }
        });

        let fragile = rows.iter().any(|r| r.flips_significance);
        debug!(rows = rows.len(), fragile, "leave-one-out");
        Ok(LeaveOneOut {
            unit,
            baseline,
            rows,
            fragile,
        })
    }
}
