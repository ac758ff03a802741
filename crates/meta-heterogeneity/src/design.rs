//! Design matrices for mixed-effects meta-regression
//!
//! Column 0 is always the intercept. Categorical moderators are dummy coded
//! against their first level in sorted order.

use meta_core::{EffectSizeBatch, Error, ModeratorValue, Result};
use nalgebra::DMatrix;
use std::collections::BTreeSet;

/// Name of the intercept column
pub const INTERCEPT: &str = "intercept";

/// A moderator term to add to a design
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Continuous(String),
    Categorical(String),
}

impl Term {
    pub fn name(&self) -> &str {
        match self {
            Self::Continuous(name) | Self::Categorical(name) => name,
        }
    }
}

/// Predictor matrix with named columns
#[derive(Debug, Clone, PartialEq)]
pub struct Design {
    matrix: DMatrix<f64>,
    names: Vec<String>,
}

impl Design {
    /// Intercept-only design for `k` effect sizes
    pub fn intercept(k: usize) -> Self {
        Self {
            matrix: DMatrix::from_element(k, 1, 1.0),
            names: vec![INTERCEPT.to_string()],
        }
    }

    /// Intercept plus one column per term, read from the batch's moderators
    ///
    /// Every record must carry a non-missing value for every term; the
    /// moderator engine filters missing values before building designs.
    pub fn from_terms(batch: &EffectSizeBatch, terms: &[Term]) -> Result<Self> {
        let mut design = Self::intercept(batch.len());
        for term in terms {
            design = match term {
                Term::Continuous(name) => {
                    let values = batch
                        .records()
                        .iter()
                        .map(|r| {
                            r.moderator(name)
                                .and_then(ModeratorValue::as_continuous)
                                .ok_or_else(|| missing(name, &r.study_id, &r.effect_size_id))
                        })
                        .collect::<Result<Vec<f64>>>()?;
                    design.with_column(name.clone(), &values)?
                }
                Term::Categorical(name) => {
                    let labels = batch
                        .records()
                        .iter()
                        .map(|r| {
                            r.moderator(name)
                                .and_then(ModeratorValue::as_level)
                                .ok_or_else(|| missing(name, &r.study_id, &r.effect_size_id))
                        })
                        .collect::<Result<Vec<&str>>>()?;
                    design.with_categorical(name, &labels)?
                }
            };
        }
        Ok(design)
    }

    /// Append a numeric column
    pub fn with_column(mut self, name: impl Into<String>, values: &[f64]) -> Result<Self> {
        let k = self.matrix.nrows();
        if values.len() != k {
            return Err(Error::InvalidInput(format!(
                "column has {} values for {k} rows",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::non_finite("design column"));
        }
        let p = self.matrix.ncols();
        self.matrix = self.matrix.insert_column(p, 0.0);
        for (i, v) in values.iter().enumerate() {
            self.matrix[(i, p)] = *v;
        }
        self.names.push(name.into());
        Ok(self)
    }

    /// Append treatment-coded dummies for every non-reference level
    pub fn with_categorical(mut self, name: &str, labels: &[&str]) -> Result<Self> {
        let levels: BTreeSet<&str> = labels.iter().copied().collect();
        for level in levels.iter().skip(1) {
            let column: Vec<f64> = labels
                .iter()
                .map(|l| if l == level { 1.0 } else { 0.0 })
                .collect();
            self = self.with_column(format!("{name}[{level}]"), &column)?;
        }
        Ok(self)
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of rows (effect sizes)
    pub fn n_rows(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of coefficients
    pub fn n_params(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn is_intercept_only(&self) -> bool {
        self.n_params() == 1
    }

    /// Indices of every column except the intercept
    pub fn moderator_columns(&self) -> Vec<usize> {
        (1..self.n_params()).collect()
    }

    /// Design restricted to the given rows
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            matrix: self.matrix.select_rows(rows),
            names: self.names.clone(),
        }
    }

    /// Design with row `i` removed
    pub fn without_row(&self, i: usize) -> Self {
        Self {
            matrix: self.matrix.clone().remove_row(i),
            names: self.names.clone(),
        }
    }
}

fn missing(name: &str, study: &str, effect: &str) -> Error {
    Error::InvalidInput(format!(
        "record {study}/{effect} has no usable value for moderator `{name}`"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meta_core::EffectSizeRecord;

    fn batch() -> EffectSizeBatch {
        EffectSizeBatch::new(vec![
            EffectSizeRecord::new("a", "1", 0.1, 0.04)
                .with_moderator("arch", ModeratorValue::categorical("single"))
                .with_moderator("year", ModeratorValue::Continuous(2021.0)),
            EffectSizeRecord::new("b", "1", 0.3, 0.04)
                .with_moderator("arch", ModeratorValue::categorical("multi"))
                .with_moderator("year", ModeratorValue::Continuous(2023.0)),
            EffectSizeRecord::new("c", "1", 0.2, 0.04)
                .with_moderator("arch", ModeratorValue::categorical("hybrid"))
                .with_moderator("year", ModeratorValue::Continuous(2024.0)),
        ])
    }

    #[test]
    fn test_dummy_coding() {
        let design = Design::from_terms(&batch(), &[Term::Categorical("arch".into())]).unwrap();
        // reference level is "hybrid" (first in sorted order)
        assert_eq!(design.names(), &["intercept", "arch[multi]", "arch[single]"]);
        assert_eq!(design.matrix()[(0, 2)], 1.0);
        assert_eq!(design.matrix()[(1, 1)], 1.0);
        assert_eq!(design.matrix()[(2, 1)], 0.0);
        assert_eq!(design.matrix()[(2, 2)], 0.0);
    }

    #[test]
    fn test_continuous_and_rows() {
        let design = Design::from_terms(&batch(), &[Term::Continuous("year".into())]).unwrap();
        assert_eq!(design.n_params(), 2);
        assert_eq!(design.matrix()[(1, 1)], 2023.0);

        let reduced = design.without_row(1);
        assert_eq!(reduced.n_rows(), 2);
        assert_eq!(reduced.matrix()[(1, 1)], 2024.0);
        assert_eq!(design.select_rows(&[2]).matrix()[(0, 1)], 2024.0);
    }

    #[test]
    fn test_missing_moderator_is_an_error() {
        let design = Design::from_terms(&batch(), &[Term::Continuous("duration".into())]);
        assert!(matches!(design, Err(Error::InvalidInput(_))));
    }
}
