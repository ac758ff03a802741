//! Canonical value types shared by every component
//!
//! All of these are plain values: created once by a fit, never mutated,
//! freely cloned and compared.

use crate::config::Tau2Estimator;
use crate::math::distributions::chi_squared_sf;
use crate::moderator::ModeratorValue;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// z_(0.975), used for records built without an explicit confidence level
pub const Z_95: f64 = 1.959_963_984_540_054;

/// A confidence interval with lower and upper bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    /// Lower bound of the interval
    pub lower: f64,
    /// Upper bound of the interval
    pub upper: f64,
    /// The point estimate the interval is built around
    pub estimate: f64,
    /// Confidence level (e.g., 0.95 for 95% CI)
    pub confidence_level: f64,
}

impl ConfidenceInterval {
    /// Create a new confidence interval
    pub fn new(lower: f64, upper: f64, estimate: f64, confidence_level: f64) -> Self {
        Self {
            lower,
            upper,
            estimate,
            confidence_level,
        }
    }

    /// Symmetric interval `estimate ± critical * se`
    pub fn symmetric(estimate: f64, se: f64, critical: f64, confidence_level: f64) -> Self {
        let margin = critical * se;
        Self::new(estimate - margin, estimate + margin, estimate, confidence_level)
    }

    /// Width of the confidence interval
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Check if a value is contained in the interval
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// Check if intervals overlap
    pub fn overlaps(&self, other: &ConfidenceInterval) -> bool {
        self.lower <= other.upper && other.lower <= self.upper
    }

    /// Whether the interval excludes zero
    pub fn excludes_zero(&self) -> bool {
        !self.contains(0.0)
    }
}

impl fmt::Display for ConfidenceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% CI: [{:.4}, {:.4}], estimate: {:.4}",
            self.confidence_level * 100.0,
            self.lower,
            self.upper,
            self.estimate
        )
    }
}

/// Which raw-input path produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    MeansSds,
    TStatistic,
    FStatistic,
    Correlation,
    ChiSquare,
    OddsRatio,
    ReportedG,
    ReportedD,
    PrePost,
    /// Supplied as an already computed (g, variance) pair
    Tabulated,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MeansSds => "means_sds",
            Self::TStatistic => "t_statistic",
            Self::FStatistic => "f_statistic",
            Self::Correlation => "correlation",
            Self::ChiSquare => "chi_square",
            Self::OddsRatio => "odds_ratio",
            Self::ReportedG => "reported_g",
            Self::ReportedD => "reported_d",
            Self::PrePost => "pre_post",
            Self::Tabulated => "tabulated",
        }
    }
}

/// One canonical effect size (Hedges' g) with its sampling variance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectSizeRecord {
    /// Groups dependent effect sizes
    pub study_id: String,
    /// Unique within a study
    pub effect_size_id: String,
    pub source_kind: SourceKind,
    pub g: f64,
    pub variance_g: f64,
    pub se_g: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Moderator name to coded value
    pub moderators: BTreeMap<String, ModeratorValue>,
}

impl EffectSizeRecord {
    /// Create a tabulated record with a 95% interval
    ///
    /// No validation happens here; unusable records are filtered when the
    /// batch is built.
    pub fn new(
        study_id: impl Into<String>,
        effect_size_id: impl Into<String>,
        g: f64,
        variance_g: f64,
    ) -> Self {
        let se_g = variance_g.sqrt();
        Self {
            study_id: study_id.into(),
            effect_size_id: effect_size_id.into(),
            source_kind: SourceKind::Tabulated,
            g,
            variance_g,
            se_g,
            ci_lower: g - Z_95 * se_g,
            ci_upper: g + Z_95 * se_g,
            moderators: BTreeMap::new(),
        }
    }

    /// Recompute the interval at another confidence level
    pub fn with_confidence_level(mut self, confidence_level: f64) -> Result<Self> {
        let z = crate::math::distributions::z_critical(confidence_level)?;
        self.ci_lower = self.g - z * self.se_g;
        self.ci_upper = self.g + z * self.se_g;
        Ok(self)
    }

    /// Tag the record with its source kind
    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = kind;
        self
    }

    /// Attach a moderator value
    pub fn with_moderator(mut self, name: impl Into<String>, value: ModeratorValue) -> Self {
        self.moderators.insert(name.into(), value);
        self
    }

    /// Look up a moderator value; `Missing` and absent are both `None`
    pub fn moderator(&self, name: &str) -> Option<&ModeratorValue> {
        self.moderators.get(name).filter(|v| !v.is_missing())
    }

    /// A record enters model fits only with finite g and positive finite variance
    pub fn is_usable(&self) -> bool {
        self.g.is_finite() && self.variance_g.is_finite() && self.variance_g > 0.0
    }
}

/// Which model produced an estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Inverse-variance fixed-effect model
    FixedEffect,
    /// Two-level random-effects model
    TwoLevel { estimator: Tau2Estimator },
    /// Effect sizes nested in studies, REML
    ThreeLevel,
    /// Correlated-effects robust variance estimation
    CorrelatedEffects { rho: f64 },
    /// Hierarchical-effects robust variance estimation
    HierarchicalEffects,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedEffect => write!(f, "fixed-effect"),
            Self::TwoLevel { estimator } => write!(f, "two-level random-effects ({estimator})"),
            Self::ThreeLevel => write!(f, "three-level random-effects (REML)"),
            Self::CorrelatedEffects { rho } => write!(f, "RVE correlated effects (rho = {rho:.2})"),
            Self::HierarchicalEffects => write!(f, "RVE hierarchical effects"),
        }
    }
}

/// Reference distribution used for a test statistic
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReferenceDistribution {
    Normal,
    StudentT { df: f64 },
}

/// Between-study variance components
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum VarianceComponents {
    /// Two-level model
    Single { tau2: f64 },
    /// Effect sizes within studies and studies within the corpus
    Nested {
        sigma2_within: f64,
        sigma2_between: f64,
    },
}

impl VarianceComponents {
    /// Total heterogeneity variance
    pub fn total(&self) -> f64 {
        match *self {
            Self::Single { tau2 } => tau2,
            Self::Nested {
                sigma2_within,
                sigma2_between,
            } => sigma2_within + sigma2_between,
        }
    }
}

/// Share of total variance at each level of a three-level model, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MultilevelI2 {
    pub within: f64,
    pub between: f64,
}

/// Conventional reading of I²
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeterogeneityLevel {
    Low,
    Moderate,
    Substantial,
    Considerable,
}

impl HeterogeneityLevel {
    /// Bands at 25 / 50 / 75 percent
    pub fn from_i2(i2: f64) -> Self {
        if i2 < 25.0 {
            Self::Low
        } else if i2 < 50.0 {
            Self::Moderate
        } else if i2 < 75.0 {
            Self::Substantial
        } else {
            Self::Considerable
        }
    }
}

impl fmt::Display for HeterogeneityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low heterogeneity",
            Self::Moderate => "moderate heterogeneity",
            Self::Substantial => "substantial heterogeneity",
            Self::Considerable => "considerable heterogeneity",
        };
        write!(f, "{s}")
    }
}

/// Heterogeneity block of a pooled estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heterogeneity {
    /// Cochran's Q under fixed-effect weights
    pub q: f64,
    pub q_df: usize,
    pub q_pvalue: f64,
    /// Percentage in [0, 100]
    pub i2: f64,
    pub components: VarianceComponents,
    /// Present for three-level fits
    pub multilevel_i2: Option<MultilevelI2>,
    /// A negative variance-component estimate was truncated to zero
    pub truncated: bool,
}

impl Heterogeneity {
    /// Build from Q and its degrees of freedom; `I² = max(0, (Q - df) / Q) * 100`
    pub fn from_q(
        q: f64,
        q_df: usize,
        components: VarianceComponents,
        truncated: bool,
    ) -> Result<Self> {
        let q_pvalue = chi_squared_sf(q, q_df as f64)?;
        let i2 = if q > 0.0 {
            ((q - q_df as f64) / q).max(0.0) * 100.0
        } else {
            0.0
        };
        Ok(Self {
            q,
            q_df,
            q_pvalue,
            i2: i2.clamp(0.0, 100.0),
            components,
            multilevel_i2: None,
            truncated,
        })
    }

    pub fn with_multilevel_i2(mut self, split: MultilevelI2) -> Self {
        self.multilevel_i2 = Some(split);
        self
    }

    /// Total between-study variance
    pub fn tau2(&self) -> f64 {
        self.components.total()
    }

    pub fn level(&self) -> HeterogeneityLevel {
        HeterogeneityLevel::from_i2(self.i2)
    }
}

/// Result of fitting a model to a batch of effect sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PooledEstimate {
    pub point_estimate: f64,
    pub se: f64,
    pub ci: ConfidenceInterval,
    /// z or t statistic against zero
    pub statistic: f64,
    pub p_value: f64,
    pub reference: ReferenceDistribution,
    /// Number of effect sizes
    pub k: usize,
    /// Number of distinct studies
    pub n_studies: usize,
    /// `None` when heterogeneity is not estimable (k = 1)
    pub heterogeneity: Option<Heterogeneity>,
    /// `None` when k = 1
    pub prediction_interval: Option<ConfidenceInterval>,
    pub model: ModelKind,
}

impl PooledEstimate {
    pub fn ci_lower(&self) -> f64 {
        self.ci.lower
    }

    pub fn ci_upper(&self) -> f64 {
        self.ci.upper
    }

    /// Whether the estimate differs from zero at `alpha`
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }

    /// τ² (total for nested structures), if estimable
    pub fn tau2(&self) -> Option<f64> {
        self.heterogeneity.as_ref().map(|h| h.tau2())
    }

    pub fn i2(&self) -> Option<f64> {
        self.heterogeneity.as_ref().map(|h| h.i2)
    }
}

impl fmt::Display for PooledEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "g = {:.3} [{:.3}, {:.3}], p = {:.4}, k = {} ({} studies), {}",
            self.point_estimate,
            self.ci.lower,
            self.ci.upper,
            self.p_value,
            self.k,
            self.n_studies,
            self.model
        )
    }
}

/// A single regression coefficient with its test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientEstimate {
    pub name: String,
    pub estimate: f64,
    pub se: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub ci: ConfidenceInterval,
    pub reference: ReferenceDistribution,
}

/// A Wald-type omnibus test of several coefficients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaldTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}
