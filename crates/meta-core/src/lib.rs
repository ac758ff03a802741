//! Core types and numerical building blocks for meta-analysis
//!
//! This crate holds everything the component crates share:
//!
//! - the error taxonomy ([`Error`], [`Result`])
//! - the immutable [`AnalysisConfig`] handed to every component
//! - the canonical data model: [`EffectSizeRecord`], [`EffectSizeBatch`],
//!   [`PooledEstimate`] and the heterogeneity block
//! - distribution helpers, dense linear algebra, a Nelder-Mead optimiser,
//!   Benjamini-Hochberg correction and Kendall's tau
//!
//! Nothing here holds global state. Every fit downstream is a pure function
//! of a batch and a configuration.
//!
//! # Example
//!
//! ```rust
//! use meta_core::{AnalysisConfig, EffectSizeBatch, EffectSizeRecord};
//!
//! let config = AnalysisConfig::default().with_rho(0.6);
//! assert!(config.validate().is_ok());
//!
//! let batch = EffectSizeBatch::new(vec![
//!     EffectSizeRecord::new("smith-2021", "1", 0.42, 0.031),
//!     EffectSizeRecord::new("smith-2021", "2", 0.35, 0.028),
//!     EffectSizeRecord::new("lee-2023", "1", 0.18, 0.044),
//! ]);
//! assert_eq!(batch.n_studies(), 2);
//! assert!(batch.has_dependence());
//! ```

pub mod batch;
pub mod config;
pub mod correction;
pub mod error;
pub mod linalg;
pub mod math;
pub mod moderator;
pub mod optim;
pub mod rank;
pub mod types;

pub use batch::{EffectSizeBatch, ExcludedRecord, StudyClusters};
pub use config::{AnalysisConfig, DependenceModel, ModelSelection, Tau2Estimator};
pub use correction::benjamini_hochberg;
pub use error::{Error, Result};
pub use moderator::{LevelCode, ModeratorCodebook, ModeratorKind, ModeratorValue};
pub use types::{
    CoefficientEstimate, ConfidenceInterval, EffectSizeRecord, Heterogeneity,
    HeterogeneityLevel, ModelKind, MultilevelI2, PooledEstimate, ReferenceDistribution,
    SourceKind, VarianceComponents, WaldTest,
};

/// Re-export of the types most callers need
pub mod prelude {
    pub use crate::{
        AnalysisConfig, ConfidenceInterval, EffectSizeBatch, EffectSizeRecord, Error,
        ModeratorValue, PooledEstimate, Result, Tau2Estimator,
    };
}
