//! Error types for meta-analysis
//!
//! Provides a unified error type for all meta-stats crates. Boundary errors
//! (`InsufficientData`, `Configuration`) are fatal to a single record or call;
//! numerical failures (`Convergence`, `Computation`) are meant to be captured
//! inside result values so a batch can report them next to successful results.

use thiserror::Error;

/// Core error type for meta-analytic operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A raw input lacks a field required by its source kind, or the field
    /// holds a non-positive or non-finite value
    #[error("Insufficient data in field `{field}`: {reason}")]
    InsufficientData { field: String, reason: String },

    /// Too few effect sizes (or studies) for the requested analysis
    #[error("Insufficient sample for {context}: expected at least {expected}, got {actual}")]
    InsufficientSample {
        expected: usize,
        actual: usize,
        context: String,
    },

    /// An iterative fit exhausted its iteration budget
    #[error("{method} failed to converge within {iterations} iterations")]
    Convergence { method: String, iterations: usize },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input data
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Numerical computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

// Helper functions for common error patterns

impl Error {
    /// A raw-input field is missing, non-positive or otherwise unusable
    pub fn insufficient_field(field: &str, reason: impl Into<String>) -> Self {
        Self::InsufficientData {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Fewer observations than an analysis requires
    pub fn too_few(expected: usize, actual: usize, context: &str) -> Self {
        Self::InsufficientSample {
            expected,
            actual,
            context: context.to_string(),
        }
    }

    /// An iterative method ran out of iterations
    pub fn no_convergence(method: &str, iterations: usize) -> Self {
        Self::Convergence {
            method: method.to_string(),
            iterations,
        }
    }

    /// Create an error for NaN/Inf values
    pub fn non_finite(context: &str) -> Self {
        Self::Computation(format!("{context} contains NaN or infinite values"))
    }

    /// Create an error for a singular or indefinite matrix
    pub fn singular(context: &str) -> Self {
        Self::Computation(format!("{context} is singular or not positive definite"))
    }

    /// Whether the error reflects too little data rather than a failure
    pub fn is_insufficient(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. } | Self::InsufficientSample { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::insufficient_field("n1", "must be greater than 1");
        assert_eq!(
            err.to_string(),
            "Insufficient data in field `n1`: must be greater than 1"
        );

        let err = Error::too_few(5, 3, "meta-regression");
        assert_eq!(
            err.to_string(),
            "Insufficient sample for meta-regression: expected at least 5, got 3"
        );

        let err = Error::no_convergence("REML", 200);
        assert_eq!(err.to_string(), "REML failed to converge within 200 iterations");

        let err = Error::Configuration("alpha must be in (0, 1)".to_string());
        assert_eq!(err.to_string(), "Configuration error: alpha must be in (0, 1)");

        let err = Error::non_finite("weights");
        assert_eq!(
            err.to_string(),
            "Computation error: weights contains NaN or infinite values"
        );
    }

    #[test]
    fn test_is_insufficient() {
        assert!(Error::too_few(2, 1, "subgroup").is_insufficient());
        assert!(Error::insufficient_field("sd1", "non-positive").is_insufficient());
        assert!(!Error::no_convergence("PM", 10).is_insufficient());
        assert!(!Error::singular("X'WX").is_insufficient());
    }

    #[test]
    fn test_errors_are_comparable_values() {
        let a = Error::no_convergence("selection model", 500);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Error::no_convergence("selection model", 501));
    }
}
