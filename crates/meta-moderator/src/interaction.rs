//! Two-way moderator interactions
//!
//! An interaction is tested only when every cell of the cross-tabulation
//! holds enough effect sizes. Otherwise the outcome says so; no main-effect
//! test is run in its place.

use crate::engine::ModeratorEngine;
use meta_core::{CoefficientEstimate, EffectSizeBatch, Error, ModeratorValue, Result, WaldTest};
use meta_heterogeneity::{Design, Structure, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, instrument, warn};

/// One cell of the cross-tabulation
///
/// A continuous second moderator contributes no levels; its cells are the
/// levels of the first moderator alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionCell {
    pub first: String,
    pub second: Option<String>,
    pub k: usize,
}

/// A fitted interaction model
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionTest {
    pub first: String,
    pub second: String,
    pub cells: Vec<InteractionCell>,
    /// Product-term coefficients
    pub coefficients: Vec<CoefficientEstimate>,
    /// Joint test of the product terms
    pub wald: WaldTest,
    pub structure: Structure,
    pub k: usize,
}

impl InteractionTest {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.wald.p_value < alpha
    }
}

/// Outcome of an interaction request
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionOutcome {
    Tested(InteractionTest),
    /// Some cell is below the minimum; nothing was fitted
    InsufficientData {
        cells: Vec<InteractionCell>,
        min_cell_k: usize,
    },
}

impl InteractionOutcome {
    pub fn is_tested(&self) -> bool {
        matches!(self, Self::Tested(_))
    }
}

impl ModeratorEngine {
    /// Test the interaction of a categorical moderator with a second
    /// categorical or continuous moderator
    #[instrument(skip(self, batch), fields(k = batch.len()))]
    pub fn run_interaction(
        &self,
        batch: &EffectSizeBatch,
        first: &str,
        second: &str,
    ) -> Result<InteractionOutcome> {
        let complete =
            batch.filter(|r| r.moderator(first).is_some() && r.moderator(second).is_some());
        if complete.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no record has values for both `{first}` and `{second}`"
            )));
        }

        let second_categorical = complete
            .records()
            .iter()
            .any(|r| matches!(r.moderator(second), Some(ModeratorValue::Categorical(_))));

        let mut counts: BTreeMap<(String, Option<String>), usize> = BTreeMap::new();
        for record in complete.records() {
            let Some(a) = record.moderator(first).and_then(ModeratorValue::as_level) else {
                return Err(Error::InvalidInput(format!(
                    "interaction needs a categorical first moderator, `{first}` is not"
                )));
            };
            let b = if second_categorical {
                let level = record
                    .moderator(second)
                    .and_then(ModeratorValue::as_level)
                    .ok_or_else(|| {
                        Error::InvalidInput(format!("moderator `{second}` mixes value types"))
                    })?;
                Some(level.to_string())
            } else {
                None
            };
            *counts.entry((a.to_string(), b)).or_default() += 1;
        }

        // Unobserved combinations are empty cells
        let first_levels: Vec<&String> = {
            let mut levels: Vec<&String> = counts.keys().map(|(a, _)| a).collect();
            levels.dedup();
            levels
        };
        let second_levels: Vec<Option<String>> = {
            let mut levels: Vec<Option<String>> = counts.keys().map(|(_, b)| b.clone()).collect();
            levels.sort();
            levels.dedup();
            levels
        };
        let cells: Vec<InteractionCell> = first_levels
            .iter()
            .flat_map(|a| {
                second_levels.iter().map(|b| InteractionCell {
                    first: (*a).clone(),
                    second: b.clone(),
                    k: counts.get(&((*a).clone(), b.clone())).copied().unwrap_or(0),
                })
            })
            .collect();

        let min_cell_k = self.config.min_interaction_cell_k;
        if first_levels.len() < 2 || (second_categorical && second_levels.len() < 2) {
            return Err(Error::InvalidInput(format!(
                "interaction of `{first}` and `{second}` needs at least two levels of each factor"
            )));
        }
        if cells.iter().any(|c| c.k < min_cell_k) {
            warn!(
                first,
                second,
                min_cell_k,
                "insufficient data for interaction"
            );
            return Ok(InteractionOutcome::InsufficientData { cells, min_cell_k });
        }

        let second_term = if second_categorical {
            Term::Categorical(second.to_string())
        } else {
            Term::Continuous(second.to_string())
        };
        let main = Design::from_terms(&complete, &[Term::Categorical(first.to_string()), second_term])?;
        let first_columns: Vec<usize> = column_indices(&main, first);
        let second_columns: Vec<usize> = column_indices(&main, second);

        let mut design = main.clone();
        for &a in &first_columns {
            for &b in &second_columns {
                let product: Vec<f64> = main
                    .matrix()
                    .column(a)
                    .iter()
                    .zip(main.matrix().column(b).iter())
                    .map(|(x, y)| x * y)
                    .collect();
                let name = format!("{}:{}", main.names()[a], main.names()[b]);
                design = design.with_column(name, &product)?;
            }
        }
        let products: Vec<usize> = (main.n_params()..design.n_params()).collect();

        let global = self.global_structure(&complete)?;
        let fit = self.fit_design(&complete, design, global)?;
        let model = fit.as_model();
        let wald = model.wald_test(&products)?;
        let coefficients = model
            .coefficients()?
            .into_iter()
            .skip(main.n_params())
            .collect();
        debug!(
            first,
            second,
            statistic = wald.statistic,
            p = wald.p_value,
            "interaction test"
        );

        Ok(InteractionOutcome::Tested(InteractionTest {
            first: first.to_string(),
            second: second.to_string(),
            cells,
            coefficients,
            wald,
            structure: fit.structure(),
            k: complete.len(),
        }))
    }
}

/// Design columns belonging to one moderator
fn column_indices(design: &Design, moderator: &str) -> Vec<usize> {
    let dummy_prefix = format!("{moderator}[");
    design
        .names()
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() == moderator || name.starts_with(&dummy_prefix))
        .map(|(i, _)| i)
        .collect()
}
