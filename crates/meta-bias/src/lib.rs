//! Publication-bias diagnostics for meta-analysis
//!
//! - **Funnel asymmetry**: Egger-type regression (standard error, variance
//!   or classical precision predictor) and the Begg-Mazumdar rank test
//! - **Trim-and-fill**: L0 and R0 estimators on either side of the funnel
//! - **PET-PEESE**: conditional regression-corrected estimate
//! - **Selection model**: Vevea-Hedges step weights with a likelihood-ratio
//!   test against the unweighted model
//! - **Fail-safe N**: Rosenthal and Orwin
//!
//! Each method is a standalone function. [`PublicationBiasSuite`] runs them
//! together and keeps a method's failure next to the other results instead
//! of aborting.
//!
//! # Example
//!
//! ```rust
//! use meta_bias::PublicationBiasSuite;
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord};
//!
//! let batch = EffectSizeBatch::new((0..10).map(|i| {
//!     let v = 0.01 + 0.01 * i as f64;
//!     EffectSizeRecord::new(format!("study-{i}"), "1", 0.2 + 0.05 * i as f64, v)
//! }));
//!
//! let suite = PublicationBiasSuite::new(&AnalysisConfig::default()).unwrap();
//! let assessment = suite.run(&batch);
//! assert_eq!(assessment.summaries().len(), 7);
//! let egger = assessment.egger.as_ref().unwrap();
//! assert!(egger.asymmetry.estimate > 0.0);
//! ```

mod begg;
mod egger;
mod failsafe;
mod regression;
mod selection;
mod suite;
mod trim_fill;

pub use begg::{begg_test, BeggTest};
pub use egger::{
    egger_test, pet_peese, EggerPredictor, EggerTest, FunnelRegression, PetPeese, PetPeeseMethod,
};
pub use failsafe::{orwin, rosenthal, OrwinFailSafe, RosenthalFailSafe};
pub use selection::{selection_model, LikelihoodRatioTest, SelectionFit, SelectionModel};
pub use suite::{BiasAssessment, BiasMethod, BiasSummary, BiasVerdict, PublicationBiasSuite};
pub use trim_fill::{trim_and_fill, FunnelSide, ImputedEffect, TrimAndFill, TrimFillEstimator};
