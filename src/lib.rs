//! Meta-analysis toolkit
//!
//! Synthesises standardized mean differences across primary studies:
//!
//! - [`effect`]: raw statistics (means and SDs, t, F, r, χ², odds ratios,
//!   reported d or g, pre/post designs) to Hedges' g with variance
//! - [`heterogeneity`]: two-level random-effects models with six τ²
//!   estimators and a three-level REML model, chosen by likelihood ratio
//! - [`rve`]: robust variance estimation for dependent effect sizes
//! - [`moderator`]: subgroups, meta-regression and interactions with
//!   false-discovery-rate control
//! - [`bias`]: funnel asymmetry, trim-and-fill, PET-PEESE, selection models
//!   and fail-safe N
//! - [`sensitivity`]: leave-one-out, influence diagnostics, subset and
//!   estimator refits, cumulative analysis and GOSH
//!
//! [`MetaAnalysis`] strings them together.
//!
//! # Example
//!
//! ```rust
//! use meta_stats::prelude::*;
//!
//! let rows = vec![
//!     RawRecord::new(
//!         "study-a",
//!         "1",
//!         RawInput::MeansSds { mean1: 82.4, sd1: 12.1, n1: 45, mean2: 74.6, sd2: 13.8, n2: 43 },
//!     ),
//!     RawRecord::new("study-b", "1", RawInput::TStatistic { t: 2.1, n1: 30, n2: 32 }),
//!     RawRecord::new("study-c", "1", RawInput::Correlation { r: 0.18, n: 120 }),
//! ];
//!
//! let analysis = MetaAnalysis::new(AnalysisConfig::default()).unwrap();
//! let report = analysis.run(&rows).unwrap();
//! assert_eq!(report.batch.len(), 3);
//! assert!(report.overall.pooled.point_estimate > 0.0);
//! ```

mod pipeline;

pub use meta_bias as bias;
pub use meta_effect as effect;
pub use meta_heterogeneity as heterogeneity;
pub use meta_moderator as moderator;
pub use meta_rve as rve;
pub use meta_sensitivity as sensitivity;

pub use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord, Error, Result};
pub use pipeline::{DependenceReport, MetaAnalysis, PipelineReport};

/// Commonly used types
pub mod prelude {
    pub use crate::pipeline::{DependenceReport, MetaAnalysis, PipelineReport};
    pub use meta_bias::{BiasMethod, BiasVerdict, PublicationBiasSuite};
    pub use meta_core::{
        AnalysisConfig, DependenceModel, EffectSizeBatch, EffectSizeRecord, Error,
        ModelSelection, ModeratorValue, PooledEstimate, Result, Tau2Estimator,
    };
    pub use meta_effect::{Direction, EffectSizeCalculator, RawInput, RawRecord};
    pub use meta_heterogeneity::{HeterogeneityModel, Structure};
    pub use meta_moderator::{ModeratorEngine, ModeratorRequest};
    pub use meta_rve::DependenceCorrector;
    pub use meta_sensitivity::{LooUnit, SensitivityEngine, Subset};
}
