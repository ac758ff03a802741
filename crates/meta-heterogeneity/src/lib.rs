//! Random-effects models for meta-analysis
//!
//! This crate fits the two models every other component builds on:
//!
//! - **Two-level** random-effects / mixed-effects models with six τ²
//!   estimators (REML, DL, PM, EB, SJ, ML)
//! - **Three-level** models for effect sizes nested in studies, fitted by
//!   REML, with likelihood-ratio tests of each variance component
//!
//! [`HeterogeneityModel`] applies the decision rule: the three-level model is
//! used only when some study contributes several effect sizes and the
//! between-study component significantly improves the fit.
//!
//! Both fits implement [`FittedModel`], the interface robust variance
//! estimation and influence diagnostics work against.
//!
//! # Example
//!
//! ```rust
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord};
//! use meta_heterogeneity::HeterogeneityModel;
//!
//! let batch = EffectSizeBatch::new(vec![
//!     EffectSizeRecord::new("a", "1", 0.50, 0.04),
//!     EffectSizeRecord::new("b", "1", 0.30, 0.05),
//! ]);
//! let model = HeterogeneityModel::new(&AnalysisConfig::default()).unwrap();
//! let analysis = model.fit(&batch).unwrap();
//!
//! assert!(analysis.pooled.point_estimate > 0.30 && analysis.pooled.point_estimate < 0.50);
//! assert!(analysis.pooled.tau2().unwrap() >= 0.0);
//! ```

pub mod design;
pub mod estimators;
mod model;
mod selection;
mod three_level;
mod two_level;

pub use design::{Design, Term, INTERCEPT};
pub use model::{wald_chi_squared, FittedModel};
pub use selection::{HeterogeneityAnalysis, HeterogeneityModel, ModelFit, SelectionReport, Structure};
pub use three_level::{LikelihoodRatioTest, ThreeLevelFit, VarianceConstraint};
pub use two_level::{FitStatistics, TwoLevelFit};
