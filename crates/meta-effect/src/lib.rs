//! Effect-size computation for meta-analysis
//!
//! This crate converts the statistics primary studies actually report into a
//! common metric, the bias-corrected standardized mean difference (Hedges' g),
//! together with its sampling variance and confidence interval.
//!
//! # Supported inputs
//!
//! - **Means and SDs** per arm (pooled SD, Cohen's d, small-sample correction)
//! - **t** and one-numerator-df **F** statistics
//! - **Point-biserial r** and 2x2 **χ²** (via φ)
//! - **Odds ratios** (logit method)
//! - Author-reported **g** or **d**
//! - Single-group **pre/post** designs
//!
//! Every conversion is a pure function. Malformed inputs fail with
//! `Error::InsufficientData` naming the offending field; batch conversion
//! drops such rows and reports them instead of aborting.
//!
//! # Example
//!
//! ```rust
//! use meta_core::AnalysisConfig;
//! use meta_effect::{EffectSizeCalculator, RawInput};
//!
//! let calculator = EffectSizeCalculator::new(&AnalysisConfig::default()).unwrap();
//! let g = calculator
//!     .compute(&RawInput::MeansSds {
//!         mean1: 82.4,
//!         sd1: 12.1,
//!         n1: 45,
//!         mean2: 74.6,
//!         sd2: 13.8,
//!         n2: 43,
//!     })
//!     .unwrap();
//! assert!((g.g - 0.597).abs() < 1e-3);
//! ```

mod calculator;
pub mod conversions;
mod input;
mod types;
mod validation;

pub use calculator::{CanonicalBatch, EffectSizeCalculator, Rejection};
pub use input::{Direction, RawInput, RawRecord};
pub use types::{EffectSizeInterpretation, HedgesG};
pub use validation::{validate_record, ValidationCheck, ValidationReport, ValidationThresholds};
