//! The moderator engine and batch-level multiple-comparison control

use crate::regression::MetaRegression;
use crate::subgroup::SubgroupAnalysis;
use meta_core::{benjamini_hochberg, AnalysisConfig, EffectSizeBatch, ModelSelection, Result};
use meta_heterogeneity::{Design, HeterogeneityModel, ModelFit, Structure};
use tracing::{debug, instrument, warn};

/// Entry point for moderator analyses
///
/// Holds one validated configuration and the pooled-model machinery every
/// moderator analysis reuses. Each call is a pure function of its batch.
#[derive(Debug, Clone)]
pub struct ModeratorEngine {
    pub(crate) config: AnalysisConfig,
    pub(crate) model: HeterogeneityModel,
}

impl ModeratorEngine {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let model = HeterogeneityModel::new(config)?;
        Ok(Self {
            config: config.clone(),
            model,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run several moderators and control the false-discovery rate across them
    ///
    /// The p-value of a subgroup analysis is its omnibus test, that of a
    /// meta-regression the slope test. Failed analyses keep their error and
    /// take no part in the correction.
    #[instrument(skip_all, fields(k = batch.len(), moderators = requests.len()))]
    pub fn run_batch(&self, batch: &EffectSizeBatch, requests: &[ModeratorRequest]) -> ModeratorBatch {
        let outcomes: Vec<Result<ModeratorAnalysis>> = requests
            .iter()
            .map(|request| match request {
                ModeratorRequest::Subgroup(name) => {
                    self.run_subgroup(batch, name).map(ModeratorAnalysis::Subgroup)
                }
                ModeratorRequest::Regression(name) => self
                    .run_meta_regression(batch, name)
                    .map(ModeratorAnalysis::Regression),
            })
            .collect();

        let raw: Vec<f64> = outcomes
            .iter()
            .map(|outcome| {
                outcome
                    .as_ref()
                    .ok()
                    .and_then(ModeratorAnalysis::p_value)
                    .unwrap_or(f64::NAN)
            })
            .collect();
        let adjusted = if self.config.fdr_correction {
            benjamini_hochberg(&raw)
        } else {
            raw.clone()
        };

        let entries = requests
            .iter()
            .cloned()
            .zip(outcomes)
            .zip(raw.iter().zip(&adjusted))
            .map(|((request, outcome), (&raw_p, &adjusted_p))| {
                if let Err(e) = &outcome {
                    warn!(moderator = request.name(), error = %e, "moderator analysis failed");
                }
                let raw_p = (!raw_p.is_nan()).then_some(raw_p);
                let adjusted_p = (!adjusted_p.is_nan()).then_some(adjusted_p);
                ModeratorEntry {
                    significant: adjusted_p.is_some_and(|p| p < self.config.alpha),
                    request,
                    outcome,
                    raw_p,
                    adjusted_p,
                }
            })
            .collect::<Vec<_>>();

        debug!(
            tested = entries.iter().filter(|e| e.raw_p.is_some()).count(),
            significant = entries.iter().filter(|e| e.significant).count(),
            fdr = self.config.fdr_correction,
            "moderator batch"
        );
        ModeratorBatch {
            entries,
            fdr_corrected: self.config.fdr_correction,
        }
    }

    /// Fit a design with the configured structure policy
    ///
    /// Per-subgroup selection applies the likelihood-ratio rule to this
    /// batch; global selection forces `global` and falls back to two levels
    /// when the batch has no dependence or the three-level fit fails.
    pub(crate) fn fit_design(
        &self,
        batch: &EffectSizeBatch,
        design: Design,
        global: Option<Structure>,
    ) -> Result<ModelFit> {
        match global {
            None => self.model.fit_with_design(batch, design).map(|(fit, _)| fit),
            Some(Structure::ThreeLevel) if batch.has_dependence() => {
                match self
                    .model
                    .fit_structure(batch, design.clone(), Structure::ThreeLevel)
                {
                    Ok(fit) => Ok(fit),
                    Err(e) => {
                        warn!(error = %e, "three-level fit failed, using two-level model");
                        self.model.fit_structure(batch, design, Structure::TwoLevel)
                    }
                }
            }
            Some(_) => self.model.fit_structure(batch, design, Structure::TwoLevel),
        }
    }

    /// Structure chosen once for the whole batch, or `None` per subgroup
    pub(crate) fn global_structure(&self, batch: &EffectSizeBatch) -> Result<Option<Structure>> {
        match self.config.model_selection {
            ModelSelection::PerSubgroup => Ok(None),
            ModelSelection::Global => {
                let analysis = self.model.fit(batch)?;
                Ok(Some(analysis.selection.chosen))
            }
        }
    }
}

/// One moderator to analyse in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeratorRequest {
    /// Categorical moderator, analysed by subgroups
    Subgroup(String),
    /// Continuous moderator, analysed by meta-regression
    Regression(String),
}

impl ModeratorRequest {
    pub fn name(&self) -> &str {
        match self {
            Self::Subgroup(name) | Self::Regression(name) => name,
        }
    }
}

/// Result of one moderator analysis
#[derive(Debug, Clone, PartialEq)]
pub enum ModeratorAnalysis {
    Subgroup(SubgroupAnalysis),
    Regression(MetaRegression),
}

impl ModeratorAnalysis {
    /// The p-value that enters the false-discovery-rate correction
    pub fn p_value(&self) -> Option<f64> {
        match self {
            Self::Subgroup(analysis) => analysis.omnibus.as_ref().ok().map(|o| o.p_value),
            Self::Regression(regression) => Some(regression.slope.p_value),
        }
    }
}

/// A moderator with its raw and adjusted p-values
#[derive(Debug, Clone, PartialEq)]
pub struct ModeratorEntry {
    pub request: ModeratorRequest,
    pub outcome: Result<ModeratorAnalysis>,
    pub raw_p: Option<f64>,
    /// Benjamini-Hochberg q-value, or the raw p-value when correction is off
    pub adjusted_p: Option<f64>,
    /// `adjusted_p < alpha`
    pub significant: bool,
}

/// Every moderator of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct ModeratorBatch {
    pub entries: Vec<ModeratorEntry>,
    pub fdr_corrected: bool,
}

impl ModeratorBatch {
    pub fn entry(&self, name: &str) -> Option<&ModeratorEntry> {
        self.entries.iter().find(|e| e.request.name() == name)
    }

    pub fn significant(&self) -> impl Iterator<Item = &ModeratorEntry> {
        self.entries.iter().filter(|e| e.significant)
    }
}
