//! Types for converted effect sizes

use meta_core::{ConfidenceInterval, SourceKind};
use std::fmt;

/// A converted Hedges' g with its sampling distribution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HedgesG {
    pub g: f64,
    pub variance: f64,
    pub se: f64,
    pub ci: ConfidenceInterval,
    pub source_kind: SourceKind,
}

impl HedgesG {
    /// Interpretation of the magnitude
    pub fn interpretation(&self) -> EffectSizeInterpretation {
        EffectSizeInterpretation::from_magnitude(self.g)
    }

    /// Check if the effect favours the treatment arm
    pub fn favors_treatment(&self) -> bool {
        self.g > 0.0
    }
}

impl fmt::Display for HedgesG {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "g = {:.3} (SE {:.3}, {}) [{}]",
            self.g,
            self.se,
            self.interpretation(),
            self.source_kind.name()
        )
    }
}

/// Interpretation of effect size magnitude following Cohen's conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectSizeInterpretation {
    /// Negligible effect (|g| < 0.2)
    Negligible,
    /// Small effect
    Small,
    /// Medium effect
    Medium,
    /// Large effect (|g| >= 0.8)
    Large,
}

impl EffectSizeInterpretation {
    /// Cohen's conventions for standardized mean differences
    pub fn from_magnitude(magnitude: f64) -> Self {
        let abs_magnitude = magnitude.abs();
        if abs_magnitude < 0.2 {
            Self::Negligible
        } else if abs_magnitude < 0.5 {
            Self::Small
        } else if abs_magnitude < 0.8 {
            Self::Medium
        } else {
            Self::Large
        }
    }
}

impl fmt::Display for EffectSizeInterpretation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Negligible => "negligible",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpretation_bands() {
        assert_eq!(
            EffectSizeInterpretation::from_magnitude(0.1),
            EffectSizeInterpretation::Negligible
        );
        assert_eq!(
            EffectSizeInterpretation::from_magnitude(-0.3),
            EffectSizeInterpretation::Small
        );
        assert_eq!(
            EffectSizeInterpretation::from_magnitude(0.6),
            EffectSizeInterpretation::Medium
        );
        assert_eq!(
            EffectSizeInterpretation::from_magnitude(-1.2),
            EffectSizeInterpretation::Large
        );
    }
}
