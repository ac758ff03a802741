//! One-directional analysis pipeline
//!
//! raw rows → canonical batch → pooled model (with the two- vs three-level
//! decision) → robust variance estimation → publication bias → sensitivity.
//! Moderator analyses run on demand against the same canonical batch.

use meta_bias::{BiasAssessment, PublicationBiasSuite};
use meta_core::{AnalysisConfig, EffectSizeBatch, Result};
use meta_effect::{EffectSizeCalculator, RawRecord, Rejection};
use meta_heterogeneity::{HeterogeneityAnalysis, HeterogeneityModel};
use meta_moderator::{InteractionOutcome, ModeratorBatch, ModeratorEngine, ModeratorRequest};
use meta_rve::{DependenceCorrector, RhoSensitivity, RobustFit};
use meta_sensitivity::{SensitivityEngine, SensitivityReport};
use tracing::{info, instrument, warn};

/// Robust variance estimates of the pooled effect
#[derive(Debug, Clone, PartialEq)]
pub struct DependenceReport {
    pub correlated_effects: Result<RobustFit>,
    pub hierarchical_effects: Result<RobustFit>,
    pub rho_sweep: Result<RhoSensitivity>,
}

/// Everything one pipeline run produces
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub batch: EffectSizeBatch,
    /// Raw rows that could not be converted
    pub rejections: Vec<Rejection>,
    pub overall: HeterogeneityAnalysis,
    pub dependence: DependenceReport,
    pub bias: BiasAssessment,
    pub sensitivity: SensitivityReport,
}

/// The full meta-analysis with one validated configuration
#[derive(Debug, Clone)]
pub struct MetaAnalysis {
    config: AnalysisConfig,
    calculator: EffectSizeCalculator,
    model: HeterogeneityModel,
    corrector: DependenceCorrector,
    bias: PublicationBiasSuite,
    sensitivity: SensitivityEngine,
    moderators: ModeratorEngine,
}

impl MetaAnalysis {
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            calculator: EffectSizeCalculator::new(&config)?,
            model: HeterogeneityModel::new(&config)?,
            corrector: DependenceCorrector::new(&config)?,
            bias: PublicationBiasSuite::new(&config)?,
            sensitivity: SensitivityEngine::new(&config)?,
            moderators: ModeratorEngine::new(&config)?,
            config,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Convert raw rows, dropping and reporting those that fail
    pub fn canonicalize(&self, rows: &[RawRecord]) -> (EffectSizeBatch, Vec<Rejection>) {
        let canonical = self.calculator.canonicalize_batch(rows);
        let rejections = canonical.rejections.clone();
        (canonical.into_batch(), rejections)
    }

    /// Run the pipeline from raw rows
    ///
    /// Fails only when the pooled model itself cannot be fitted; later
    /// stages keep their failures inside the report.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub fn run(&self, rows: &[RawRecord]) -> Result<PipelineReport> {
        let (batch, rejections) = self.canonicalize(rows);
        if !rejections.is_empty() {
            warn!(rejected = rejections.len(), "raw rows could not be converted");
        }
        self.analyze_with(batch, rejections)
    }

    /// Run the pipeline on an already canonical batch
    pub fn analyze(&self, batch: &EffectSizeBatch) -> Result<PipelineReport> {
        self.analyze_with(batch.clone(), Vec::new())
    }

    fn analyze_with(&self, batch: EffectSizeBatch, rejections: Vec<Rejection>) -> Result<PipelineReport> {
        let overall = self.model.fit(&batch)?;
        info!(
            k = batch.len(),
            studies = batch.n_studies(),
            structure = %overall.selection.chosen,
            estimate = overall.pooled.point_estimate,
            "pooled estimate"
        );

        let dependence = DependenceReport {
            correlated_effects: self.corrector.correlated_effects(&batch),
            hierarchical_effects: self.corrector.hierarchical_effects(&batch),
            rho_sweep: self.corrector.rho_sweep(&batch),
        };
        let bias = self.bias.run(&batch);
        let sensitivity = self.sensitivity.run(&batch);

        Ok(PipelineReport {
            batch,
            rejections,
            overall,
            dependence,
            bias,
            sensitivity,
        })
    }

    /// Subgroup and meta-regression analyses with false-discovery-rate control
    pub fn moderators(&self, batch: &EffectSizeBatch, requests: &[ModeratorRequest]) -> ModeratorBatch {
        self.moderators.run_batch(batch, requests)
    }

    /// Two-way moderator interaction
    pub fn interaction(
        &self,
        batch: &EffectSizeBatch,
        first: &str,
        second: &str,
    ) -> Result<InteractionOutcome> {
        self.moderators.run_interaction(batch, first, second)
    }

    pub fn moderator_engine(&self) -> &ModeratorEngine {
        &self.moderators
    }

    pub fn bias_suite(&self) -> &PublicationBiasSuite {
        &self.bias
    }

    pub fn sensitivity_engine(&self) -> &SensitivityEngine {
        &self.sensitivity
    }

    pub fn dependence_corrector(&self) -> &DependenceCorrector {
        &self.corrector
    }
}
