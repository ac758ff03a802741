//! Subgroup analysis of a categorical moderator

use crate::engine::ModeratorEngine;
use meta_core::{EffectSizeBatch, Error, Heterogeneity, PooledEstimate, Result};
use meta_heterogeneity::{Design, Structure, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// How a level entered the analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelStatus {
    /// `k >= min_k`: estimated and part of the omnibus test
    Sufficient,
    /// `2 <= k < min_k`: estimated but flagged, left out of the omnibus test
    BelowMinimum,
    /// `k < 2`: not estimated
    TooFew,
}

/// One row per moderator level
#[derive(Debug, Clone, PartialEq)]
pub struct ModeratorResult {
    pub moderator: String,
    pub level: String,
    pub k: usize,
    pub n_studies: usize,
    pub status: LevelStatus,
    /// The level's own pooled estimate, or why it has none
    pub estimate: Result<PooledEstimate>,
    pub structure: Option<Structure>,
}

impl ModeratorResult {
    /// Reported as "insufficient data" rather than as a regular subgroup
    pub fn is_insufficient(&self) -> bool {
        self.status != LevelStatus::Sufficient
    }
}

/// Test that the level means are equal
#[derive(Debug, Clone, PartialEq)]
pub struct OmnibusTest {
    /// Wald χ² of the level contrasts (`Q_M`)
    pub q: f64,
    /// Number of tested levels minus one
    pub df: usize,
    pub p_value: f64,
    /// Levels that entered the test
    pub levels: Vec<String>,
    pub structure: Structure,
    /// Residual heterogeneity of the moderator model
    pub residual: Option<Heterogeneity>,
}

/// A categorical moderator split into its levels
#[derive(Debug, Clone, PartialEq)]
pub struct SubgroupAnalysis {
    pub moderator: String,
    pub min_k: usize,
    pub levels: Vec<ModeratorResult>,
    pub omnibus: Result<OmnibusTest>,
    /// `omnibus p < alpha`
    pub significant: bool,
    /// Records without a value for the moderator
    pub excluded_missing: usize,
    pub warnings: Vec<String>,
}

impl SubgroupAnalysis {
    pub fn level(&self, label: &str) -> Option<&ModeratorResult> {
        self.levels.iter().find(|l| l.level == label)
    }

    /// Levels reported as insufficient data
    pub fn insufficient_levels(&self) -> impl Iterator<Item = &ModeratorResult> {
        self.levels.iter().filter(|l| l.is_insufficient())
    }
}

impl ModeratorEngine {
    /// Subgroup analysis with the configured minimum level size
    pub fn run_subgroup(&self, batch: &EffectSizeBatch, moderator: &str) -> Result<SubgroupAnalysis> {
        self.run_subgroup_with_min_k(batch, moderator, self.config.min_subgroup_k)
    }

    /// Subgroup analysis of `moderator`
    ///
    /// Records without a value are excluded and counted. Every level with at
    /// least two effect sizes gets its own pooled model; the omnibus test
    /// compares the levels with at least `min_k` effect sizes in one mixed
    /// model with the moderator as a categorical predictor.
    #[instrument(skip(self, batch), fields(k = batch.len()))]
    pub fn run_subgroup_with_min_k(
        &self,
        batch: &EffectSizeBatch,
        moderator: &str,
        min_k: usize,
    ) -> Result<SubgroupAnalysis> {
        if min_k < 2 {
            return Err(Error::Configuration(format!(
                "subgroup minimum k must be at least 2, got {min_k}"
            )));
        }

        let mut partition: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut excluded_missing = 0;
        for (i, record) in batch.records().iter().enumerate() {
            match record.moderator(moderator) {
                None => excluded_missing += 1,
                Some(value) => match value.as_level() {
                    Some(level) => partition.entry(level.to_string()).or_default().push(i),
                    None => {
                        return Err(Error::InvalidInput(format!(
                            "moderator `{moderator}` has the continuous value {value}; \
                             use a meta-regression instead"
                        )))
                    }
                },
            }
        }
        if partition.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no record has a value for moderator `{moderator}`"
            )));
        }

        let mut warnings = Vec::new();
        if excluded_missing > 0 {
            warnings.push(format!(
                "{excluded_missing} record(s) without a value for `{moderator}` excluded"
            ));
        }

        let analysed: Vec<usize> = partition.values().flatten().copied().collect();
        let global = self.global_structure(&batch.subset(&analysed))?;

        let levels: Vec<ModeratorResult> = partition
            .iter()
            .map(|(level, indices)| {
                let subgroup = batch.subset(indices);
                let k = subgroup.len();
                let status = if k < 2 {
                    LevelStatus::TooFew
                } else if k < min_k {
                    LevelStatus::BelowMinimum
                } else {
                    LevelStatus::Sufficient
                };
                if status != LevelStatus::Sufficient {
                    let message = format!(
                        "level `{level}` of `{moderator}` has k = {k} < {min_k}: insufficient data"
                    );
                    warn!("{message}");
                    warnings.push(message);
                }

                let fitted = if status == LevelStatus::TooFew {
                    Err(Error::too_few(2, k, &format!("subgroup `{moderator}` = `{level}`")))
                } else {
                    self.fit_design(&subgroup, Design::intercept(k), global)
                        .and_then(|fit| Ok((fit.pooled()?, fit.structure())))
                };
                let (estimate, structure) = match fitted {
                    Ok((pooled, structure)) => (Ok(pooled), Some(structure)),
                    Err(e) => (Err(e), None),
                };
                ModeratorResult {
                    moderator: moderator.to_string(),
                    level: level.clone(),
                    k,
                    n_studies: subgroup.n_studies(),
                    status,
                    estimate,
                    structure,
                }
            })
            .collect();

        let tested: Vec<&str> = levels
            .iter()
            .filter(|l| l.status == LevelStatus::Sufficient)
            .map(|l| l.level.as_str())
            .collect();
        let omnibus = self.omnibus(batch, moderator, &partition, &tested, global);
        let significant = omnibus
            .as_ref()
            .is_ok_and(|test| test.p_value < self.config.alpha);

        Ok(SubgroupAnalysis {
            moderator: moderator.to_string(),
            min_k,
            levels,
            omnibus,
            significant,
            excluded_missing,
            warnings,
        })
    }

    fn omnibus(
        &self,
        batch: &EffectSizeBatch,
        moderator: &str,
        partition: &BTreeMap<String, Vec<usize>>,
        tested: &[&str],
        global: Option<Structure>,
    ) -> Result<OmnibusTest> {
        if tested.len() < 2 {
            return Err(Error::too_few(
                2,
                tested.len(),
                &format!("omnibus test of `{moderator}` (levels with sufficient k)"),
            ));
        }
        let indices: Vec<usize> = tested
            .iter()
            .filter_map(|level| partition.get(*level))
            .flatten()
            .copied()
            .collect();
        let subset = batch.subset(&indices);
        let design = Design::from_terms(&subset, &[Term::Categorical(moderator.to_string())])?;
        let columns = design.moderator_columns();

        let fit = self.fit_design(&subset, design, global)?;
        let wald = fit.as_model().wald_test(&columns)?;
        debug!(
            moderator,
            q = wald.statistic,
            df = wald.df,
            p = wald.p_value,
            "subgroup omnibus test"
        );
        Ok(OmnibusTest {
            q: wald.statistic,
            df: wald.df,
            p_value: wald.p_value,
            levels: tested.iter().map(|l| l.to_string()).collect(),
            structure: fit.structure(),
            residual: fit.heterogeneity()?,
        })
    }
}
