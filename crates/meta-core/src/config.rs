//! Analysis configuration
//!
//! A single immutable [`AnalysisConfig`] is handed to every component
//! constructor. There is no ambient state: two runs with equal configs and
//! equal batches produce equal results.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Estimator for the between-study variance τ² of the two-level model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tau2Estimator {
    /// Restricted maximum likelihood (Fisher scoring)
    Reml,
    /// DerSimonian-Laird method of moments
    DerSimonianLaird,
    /// Paule-Mandel generalised Q estimator
    PauleMandel,
    /// Empirical Bayes (Morris)
    EmpiricalBayes,
    /// Sidik-Jonkman two-step estimator
    SidikJonkman,
    /// Maximum likelihood (Fisher scoring)
    MaximumLikelihood,
}

impl Tau2Estimator {
    /// Every supported estimator, in reporting order
    pub const ALL: [Tau2Estimator; 6] = [
        Self::Reml,
        Self::DerSimonianLaird,
        Self::PauleMandel,
        Self::EmpiricalBayes,
        Self::SidikJonkman,
        Self::MaximumLikelihood,
    ];

    /// Short conventional label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reml => "REML",
            Self::DerSimonianLaird => "DL",
            Self::PauleMandel => "PM",
            Self::EmpiricalBayes => "EB",
            Self::SidikJonkman => "SJ",
            Self::MaximumLikelihood => "ML",
        }
    }

    /// Whether the estimator is iterative and can fail to converge
    pub fn is_iterative(&self) -> bool {
        matches!(
            self,
            Self::Reml | Self::PauleMandel | Self::EmpiricalBayes | Self::MaximumLikelihood
        )
    }
}

impl fmt::Display for Tau2Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// How the two-level / three-level decision is made inside subgroups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSelection {
    /// Re-apply the likelihood-ratio decision rule within every subgroup
    PerSubgroup,
    /// Use the structure chosen once for the full batch in every subgroup
    Global,
}

/// Which variance structure the primary model uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependenceModel {
    /// Three-level when dependence is present and the LRT favours it
    Auto,
    /// Always the two-level random-effects model
    TwoLevel,
    /// Three-level whenever dependence is present
    ThreeLevel,
}

/// Configuration shared by every component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Confidence level for intervals (e.g. 0.95)
    pub confidence_level: f64,
    /// Significance threshold
    pub alpha: f64,
    /// τ² estimator for two-level fits
    pub estimator: Tau2Estimator,
    /// Assumed within-study correlation for correlated-effects RVE
    pub rho: f64,
    /// ρ values visited by the RVE sensitivity sweep
    pub rho_sweep: Vec<f64>,
    /// Minimum k per subgroup level before a warning / omnibus exclusion
    pub min_subgroup_k: usize,
    /// Minimum k for a meta-regression
    pub min_regression_k: usize,
    /// Minimum k per cross-tabulated cell for interaction tests
    pub min_interaction_cell_k: usize,
    /// Apply Benjamini-Hochberg across moderator p-values
    pub fdr_correction: bool,
    /// Maximum range of estimates still called "robust"
    pub robustness_threshold: f64,
    /// Two-level / three-level decision inside subgroups
    pub model_selection: ModelSelection,
    /// Variance structure of the primary model
    pub dependence_model: DependenceModel,
    /// Largest number of subsets a GOSH analysis may fit
    pub gosh_subset_cap: usize,
    /// Seed for GOSH subsampling
    pub seed: u64,
    /// Iteration budget of scoring / root-finding algorithms
    pub max_iterations: usize,
    /// Iteration budget of the simplex optimiser (three-level, selection model)
    pub optimizer_max_iterations: usize,
    /// Convergence tolerance
    pub tolerance: f64,
    /// Target effect for Orwin's fail-safe N
    pub orwin_target: f64,
    /// One-sided p-value cut-points of the step selection model
    pub selection_cutpoints: Vec<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            alpha: 0.05,
            estimator: Tau2Estimator::Reml,
            rho: 0.8,
            rho_sweep: vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0],
            min_subgroup_k: 3,
            min_regression_k: 5,
            min_interaction_cell_k: 4,
            fdr_correction: true,
            robustness_threshold: 0.05,
            model_selection: ModelSelection::PerSubgroup,
            dependence_model: DependenceModel::Auto,
            gosh_subset_cap: 10_000,
            seed: 20_240_601,
            max_iterations: 200,
            optimizer_max_iterations: 4_000,
            tolerance: 1e-8,
            orwin_target: 0.10,
            selection_cutpoints: vec![0.025],
        }
    }
}

impl AnalysisConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the confidence level
    pub fn with_confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = level;
        self
    }

    /// Set the significance threshold
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the τ² estimator
    pub fn with_estimator(mut self, estimator: Tau2Estimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Set the assumed within-study correlation
    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    /// Set the ρ sweep
    pub fn with_rho_sweep(mut self, sweep: Vec<f64>) -> Self {
        self.rho_sweep = sweep;
        self
    }

    /// Set the minimum subgroup cell size
    pub fn with_min_subgroup_k(mut self, min_k: usize) -> Self {
        self.min_subgroup_k = min_k;
        self
    }

    /// Set the minimum k for meta-regression
    pub fn with_min_regression_k(mut self, min_k: usize) -> Self {
        self.min_regression_k = min_k;
        self
    }

    /// Switch FDR correction on or off
    pub fn with_fdr_correction(mut self, enabled: bool) -> Self {
        self.fdr_correction = enabled;
        self
    }

    /// Set the subgroup model-selection policy
    pub fn with_model_selection(mut self, selection: ModelSelection) -> Self {
        self.model_selection = selection;
        self
    }

    /// Set the variance structure of the primary model
    pub fn with_dependence_model(mut self, model: DependenceModel) -> Self {
        self.dependence_model = model;
        self
    }

    /// Set the GOSH subset cap
    pub fn with_gosh_subset_cap(mut self, cap: usize) -> Self {
        self.gosh_subset_cap = cap;
        self
    }

    /// Set the subsampling seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the target effect of Orwin's fail-safe N
    pub fn with_orwin_target(mut self, target: f64) -> Self {
        self.orwin_target = target;
        self
    }

    /// Set the selection-model cut-points (one-sided p-values)
    pub fn with_selection_cutpoints(mut self, cutpoints: Vec<f64>) -> Self {
        self.selection_cutpoints = cutpoints;
        self
    }

    /// Check every field, returning the first violation
    pub fn validate(&self) -> Result<()> {
        let open_unit = |x: f64| x > 0.0 && x < 1.0;

        if !open_unit(self.confidence_level) {
            return Err(Error::Configuration(format!(
                "confidence level {} must be in (0, 1)",
                self.confidence_level
            )));
        }
        if !open_unit(self.alpha) {
            return Err(Error::Configuration(format!(
                "alpha {} must be in (0, 1)",
                self.alpha
            )));
        }
        if !(0.0..=1.0).contains(&self.rho) {
            return Err(Error::Configuration(format!(
                "rho {} must be in [0, 1]",
                self.rho
            )));
        }
        if self.rho_sweep.is_empty() {
            return Err(Error::Configuration("rho sweep is empty".to_string()));
        }
        if let Some(bad) = self.rho_sweep.iter().find(|r| !(0.0..=1.0).contains(*r)) {
            return Err(Error::Configuration(format!(
                "rho sweep value {bad} must be in [0, 1]"
            )));
        }
        if self.min_subgroup_k < 2 || self.min_regression_k < 3 || self.min_interaction_cell_k < 1 {
            return Err(Error::Configuration(
                "minimum cell sizes must be at least 2 (subgroup), 3 (regression), 1 (interaction)"
                    .to_string(),
            ));
        }
        if !(self.robustness_threshold > 0.0) {
            return Err(Error::Configuration(
                "robustness threshold must be positive".to_string(),
            ));
        }
        if self.gosh_subset_cap == 0 {
            return Err(Error::Configuration(
                "GOSH subset cap must be positive".to_string(),
            ));
        }
        if self.max_iterations == 0 || self.optimizer_max_iterations == 0 {
            return Err(Error::Configuration(
                "iteration budgets must be positive".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(Error::Configuration("tolerance must be positive".to_string()));
        }
        if !(self.orwin_target.is_finite() && self.orwin_target != 0.0) {
            return Err(Error::Configuration(
                "Orwin target must be finite and non-zero".to_string(),
            ));
        }
        if self.selection_cutpoints.is_empty() {
            return Err(Error::Configuration(
                "selection model needs at least one cut-point".to_string(),
            ));
        }
        let mut previous = 0.0;
        for &c in &self.selection_cutpoints {
            if !(c > previous && c < 1.0) {
                return Err(Error::Configuration(format!(
                    "selection cut-points must be strictly increasing in (0, 1), got {c}"
                )));
            }
            previous = c;
        }
        Ok(())
    }

    /// Two-sided tail probability (1 - confidence level) / 2
    pub fn tail_probability(&self) -> f64 {
        (1.0 - self.confidence_level) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rho, 0.8);
        assert_eq!(config.rho_sweep.len(), 6);
        assert_eq!(config.estimator, Tau2Estimator::Reml);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = vec![
            AnalysisConfig::default().with_alpha(-0.05),
            AnalysisConfig::default().with_alpha(1.0),
            AnalysisConfig::default().with_confidence_level(1.2),
            AnalysisConfig::default().with_rho(1.5),
            AnalysisConfig::default().with_rho_sweep(vec![]),
            AnalysisConfig::default().with_rho_sweep(vec![0.0, -0.1]),
            AnalysisConfig::default().with_min_subgroup_k(1),
            AnalysisConfig::default().with_gosh_subset_cap(0),
            AnalysisConfig::default().with_orwin_target(0.0),
            AnalysisConfig::default().with_selection_cutpoints(vec![0.05, 0.025]),
        ];

        for config in cases {
            match config.validate() {
                Err(Error::Configuration(_)) => {}
                other => panic!("expected configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_tail_probability() {
        let config = AnalysisConfig::default().with_confidence_level(0.90);
        assert!((config.tail_probability() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_estimator_labels() {
        let labels: Vec<_> = Tau2Estimator::ALL.iter().map(|e| e.label()).collect();
        assert_eq!(labels, vec!["REML", "DL", "PM", "EB", "SJ", "ML"]);
        assert!(!Tau2Estimator::DerSimonianLaird.is_iterative());
        assert!(Tau2Estimator::Reml.is_iterative());
    }
}
