//! Moderator analyses for meta-analysis
//!
//! - **Subgroups**: pooled estimate per level of a categorical moderator,
//!   plus an omnibus test of equal level means from one mixed model
//! - **Meta-regression**: slope, interval and the proportion of
//!   heterogeneity explained for a continuous moderator
//! - **Batches**: Benjamini-Hochberg control of the false-discovery rate
//!   across many moderators, reporting raw and adjusted p-values
//! - **Interactions**: two-way tests, run only when every cell of the
//!   cross-tabulation is large enough
//!
//! Levels and regressions below their minimum sample size are reported
//! as insufficient data, never silently dropped.
//!
//! # Example
//!
//! ```rust
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord, ModeratorValue};
//! use meta_moderator::ModeratorEngine;
//!
//! let batch = EffectSizeBatch::new((0..8).map(|i| {
//!     let level = if i < 4 { "human-in-loop" } else { "autonomous" };
//!     let g = (if i < 4 { 0.2 } else { 0.6 }) + 0.02 * (i % 4) as f64;
//!     EffectSizeRecord::new(format!("study-{i}"), "1", g, 0.04)
//!         .with_moderator("oversight", ModeratorValue::categorical(level))
//! }));
//!
//! let engine = ModeratorEngine::new(&AnalysisConfig::default()).unwrap();
//! let analysis = engine.run_subgroup(&batch, "oversight").unwrap();
//! assert_eq!(analysis.levels.len(), 2);
//! assert_eq!(analysis.omnibus.unwrap().df, 1);
//! ```

mod engine;
mod interaction;
mod regression;
mod subgroup;

pub use engine::{ModeratorAnalysis, ModeratorBatch, ModeratorEngine, ModeratorEntry, ModeratorRequest};
pub use interaction::{InteractionCell, InteractionOutcome, InteractionTest};
pub use regression::{proportion_explained, MetaRegression, RegressionModel};
pub use subgroup::{LevelStatus, ModeratorResult, OmnibusTest, SubgroupAnalysis};

pub use meta_heterogeneity::Term;
