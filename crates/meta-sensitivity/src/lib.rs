//! Sensitivity and influence diagnostics for meta-analysis
//!
//! - **Leave-one-out**: the pooled estimate with each effect size (or each
//!   study, when studies contribute several effect sizes) removed, flagging
//!   removals that flip significance
//! - **Influence**: Cook's distance, studentized deletion residuals, hat
//!   values and DFFITS, with the conventional cut-offs
//! - **Outlier refit**: the pooled estimate without flagged cases
//! - **Subsets**: refits on caller-defined selections such as "RCTs only"
//! - **Estimator comparison**: the two-level model under all six τ²
//!   estimators
//! - **Cumulative analysis**: studies added one at a time in key order
//! - **GOSH**: fits over all subsets, or a seeded sample of them above a cap
//!
//! Enable the `parallel` feature to run independent refits on the rayon
//! pool. Results are identical either way.
//!
//! # Example
//!
//! ```rust
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord};
//! use meta_sensitivity::SensitivityEngine;
//!
//! let batch = EffectSizeBatch::new(vec![
//!     EffectSizeRecord::new("a", "1", 0.20, 0.04),
//!     EffectSizeRecord::new("b", "1", 0.25, 0.05),
//!     EffectSizeRecord::new("c", "1", 0.15, 0.04),
//!     EffectSizeRecord::new("d", "1", 0.18, 0.05),
//!     EffectSizeRecord::new("e", "1", 3.00, 0.04),
//! ]);
//!
//! let engine = SensitivityEngine::new(&AnalysisConfig::default()).unwrap();
//! let influence = engine.influence(&batch).unwrap();
//! let flagged: Vec<_> = influence.influential().map(|r| r.study_id.as_str()).collect();
//! assert_eq!(flagged, vec!["e"]);
//! ```

mod cumulative;
mod engine;
mod estimators;
mod execution;
mod gosh;
mod influence;
mod leave_one_out;
mod outliers;
mod subsets;

pub use cumulative::{CumulativeAnalysis, CumulativeStep};
pub use engine::{SensitivityEngine, SensitivityReport};
pub use estimators::{EstimatorComparison, EstimatorResult};
pub use gosh::{GoshAnalysis, GoshFit};
pub use influence::{InfluenceDiagnostics, InfluenceRecord, InfluenceThresholds, OUTLIER_RESIDUAL};
pub use leave_one_out::{LeaveOneOut, LeaveOneOutRow, LooUnit};
pub use outliers::{ExcludedEffect, OutlierRefit};
pub use subsets::{Subset, SubsetComparison, SubsetResult};
