//! Robust variance estimation for dependent effect sizes
//!
//! When a study contributes several effect sizes, their sampling errors are
//! correlated in ways primary studies rarely report. Robust variance
//! estimation (RVE) weights effect sizes under a working model and then
//! replaces the model-based covariance by a cluster-robust sandwich, so
//! inference stays valid when the working model is wrong.
//!
//! - **Correlated effects**: all effect sizes of a study share an assumed
//!   correlation `rho`; [`DependenceCorrector::rho_sweep`] reports how much
//!   the estimate moves across `rho`
//! - **Hierarchical effects**: independent within- and between-study
//!   random effects
//! - **Sandwich correction** of any [`meta_heterogeneity::FittedModel`], e.g. a
//!   three-level fit, clustered by study
//!
//! CR2 is the default small-sample correction, with Satterthwaite degrees of
//! freedom; when its adjustment matrices do not exist the estimator falls
//! back to CR1 and records a warning in the result.
//!
//! # Example
//!
//! ```rust
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord};
//! use meta_rve::DependenceCorrector;
//!
//! let batch = EffectSizeBatch::new(vec![
//!     EffectSizeRecord::new("a", "1", 0.30, 0.04),
//!     EffectSizeRecord::new("a", "2", 0.35, 0.04),
//!     EffectSizeRecord::new("b", "1", 0.10, 0.05),
//!     EffectSizeRecord::new("c", "1", 0.45, 0.03),
//!     EffectSizeRecord::new("d", "1", 0.20, 0.05),
//! ]);
//! let corrector = DependenceCorrector::new(&AnalysisConfig::default()).unwrap();
//! let pooled = corrector.correlated_effects(&batch).unwrap().pooled().unwrap();
//! assert_eq!(pooled.n_studies, 4);
//! ```

mod corrector;
pub mod sandwich;
pub mod working;

pub use corrector::{
    DependenceCorrector, RhoPoint, RhoSensitivity, RobustCoefficient, RobustFit, MIN_RELIABLE_DF,
};
pub use sandwich::{cluster_robust, ClusteredFit, SandwichEstimate, SmallSampleCorrection};
pub use working::{WeightingScheme, WorkingModel};
