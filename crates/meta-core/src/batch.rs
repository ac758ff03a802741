//! Immutable batch of canonical effect sizes
//!
//! Records that cannot enter a model (missing g, non-positive variance) are
//! dropped here, at the boundary, and kept in an exclusion list. Every
//! derived batch (subset, leave-one-out, subgroup) is a new value.

use crate::types::EffectSizeRecord;
use crate::{Error, Result};
use std::collections::HashMap;

/// A record rejected at the batch boundary
#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedRecord {
    pub study_id: String,
    pub effect_size_id: String,
    pub reason: String,
}

/// Grouping of effect sizes by study
#[derive(Debug, Clone, PartialEq)]
pub struct StudyClusters {
    /// Cluster index of every record
    assignment: Vec<usize>,
    /// Record indices of every cluster, in first-appearance order
    members: Vec<Vec<usize>>,
    labels: Vec<String>,
}

impl StudyClusters {
    fn from_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Self {
        let mut lookup: HashMap<&str, usize> = HashMap::new();
        let mut assignment = Vec::new();
        let mut members: Vec<Vec<usize>> = Vec::new();
        let mut labels = Vec::new();

        for (i, id) in ids.enumerate() {
            let next = members.len();
            let cluster = *lookup.entry(id).or_insert(next);
            if cluster == next {
                members.push(Vec::new());
                labels.push(id.to_string());
            }
            members[cluster].push(i);
            assignment.push(cluster);
        }

        Self {
            assignment,
            members,
            labels,
        }
    }

    /// Number of clusters (studies)
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Cluster index of record `i`
    pub fn cluster_of(&self, i: usize) -> usize {
        self.assignment[i]
    }

    pub fn assignment(&self) -> &[usize] {
        &self.assignment
    }

    pub fn members(&self) -> &[Vec<usize>] {
        &self.members
    }

    pub fn label(&self, cluster: usize) -> &str {
        &self.labels[cluster]
    }

    /// Size of the largest cluster
    pub fn max_size(&self) -> usize {
        self.members.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// The canonical effect-size table handed to every model
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSizeBatch {
    records: Vec<EffectSizeRecord>,
    excluded: Vec<ExcludedRecord>,
    clusters: StudyClusters,
}

impl EffectSizeBatch {
    /// Build a batch, dropping unusable records into the exclusion list
    pub fn new(records: impl IntoIterator<Item = EffectSizeRecord>) -> Self {
        let mut kept = Vec::new();
        let mut excluded = Vec::new();

        for record in records {
            if record.is_usable() {
                kept.push(record);
            } else {
                let reason = if !record.g.is_finite() {
                    "effect size is missing or non-finite".to_string()
                } else {
                    format!("variance {} is not positive and finite", record.variance_g)
                };
                tracing::debug!(
                    study = %record.study_id,
                    effect_size = %record.effect_size_id,
                    "excluding record: {reason}"
                );
                excluded.push(ExcludedRecord {
                    study_id: record.study_id,
                    effect_size_id: record.effect_size_id,
                    reason,
                });
            }
        }

        let clusters = StudyClusters::from_ids(kept.iter().map(|r| r.study_id.as_str()));
        Self {
            records: kept,
            excluded,
            clusters,
        }
    }

    pub fn records(&self) -> &[EffectSizeRecord] {
        &self.records
    }

    pub fn excluded(&self) -> &[ExcludedRecord] {
        &self.excluded
    }

    /// Number of effect sizes
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of distinct studies
    pub fn n_studies(&self) -> usize {
        self.clusters.len()
    }

    pub fn clusters(&self) -> &StudyClusters {
        &self.clusters
    }

    /// Some study contributes more than one effect size
    pub fn has_dependence(&self) -> bool {
        self.clusters.max_size() > 1
    }

    /// Effect sizes (g)
    pub fn effects(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.g).collect()
    }

    /// Sampling variances
    pub fn variances(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.variance_g).collect()
    }

    /// Fail with `InsufficientSample` below `min_k` effect sizes
    pub fn require(&self, min_k: usize, context: &str) -> Result<()> {
        if self.len() < min_k {
            return Err(Error::too_few(min_k, self.len(), context));
        }
        Ok(())
    }

    /// New batch with the records satisfying `keep`
    pub fn filter<F>(&self, mut keep: F) -> Self
    where
        F: FnMut(&EffectSizeRecord) -> bool,
    {
        Self::new(self.records.iter().filter(|r| keep(r)).cloned())
    }

    /// New batch restricted to the given record indices
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self::new(indices.iter().filter_map(|&i| self.records.get(i)).cloned())
    }

    /// New batch without record `index`
    pub fn without(&self, index: usize) -> Self {
        Self::new(
            self.records
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, r)| r.clone()),
        )
    }

    /// New batch without every record of `study_id`
    pub fn without_study(&self, study_id: &str) -> Self {
        self.filter(|r| r.study_id != study_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(study: &str, id: &str, g: f64, v: f64) -> EffectSizeRecord {
        EffectSizeRecord::new(study, id, g, v)
    }

    #[test]
    fn test_boundary_filtering() {
        let batch = EffectSizeBatch::new(vec![
            record("a", "1", 0.2, 0.04),
            record("b", "1", f64::NAN, 0.04),
            record("c", "1", 0.3, 0.0),
            record("d", "1", 0.3, -0.1),
        ]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.excluded().len(), 3);
        assert!(batch.excluded()[0].reason.contains("missing"));
    }

    #[test]
    fn test_clusters() {
        let batch = EffectSizeBatch::new(vec![
            record("a", "1", 0.2, 0.04),
            record("b", "1", 0.3, 0.04),
            record("a", "2", 0.1, 0.04),
        ]);
        assert_eq!(batch.n_studies(), 2);
        assert!(batch.has_dependence());
        assert_eq!(batch.clusters().members()[0], vec![0, 2]);
        assert_eq!(batch.clusters().cluster_of(1), 1);
        assert_eq!(batch.clusters().label(0), "a");

        let reduced = batch.without_study("a");
        assert_eq!(reduced.len(), 1);
        assert!(!reduced.has_dependence());
        // the original is untouched
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_require() {
        let batch = EffectSizeBatch::new(vec![record("a", "1", 0.2, 0.04)]);
        assert!(batch.require(1, "fit").is_ok());
        assert!(matches!(
            batch.require(2, "fit"),
            Err(Error::InsufficientSample { expected: 2, actual: 1, .. })
        ));
    }
}
