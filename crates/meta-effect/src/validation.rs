//! Quality-control checks on converted effect sizes
//!
//! Checks flag rows for human review; they never modify or drop a record.

use crate::input::RawRecord;
use meta_core::math::distributions::z_critical;
use meta_core::{EffectSizeRecord, Result};

/// Limits used by [`validate_record`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationThresholds {
    /// Largest plausible |g|
    pub max_abs_g: f64,
    /// Smallest acceptable per-arm sample size
    pub min_n: f64,
    /// |g| below which a sign disagreement with the raw means is ignored
    pub sign_tolerance: f64,
    /// Significance level the CI is compared against
    pub alpha: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            max_abs_g: 5.0,
            min_n: 10.0,
            sign_tolerance: 0.01,
            alpha: 0.05,
        }
    }
}

/// Outcome of one named check
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationCheck {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
}

impl ValidationCheck {
    fn pass(name: &'static str) -> Self {
        Self {
            name,
            passed: true,
            message: "OK".to_string(),
        }
    }

    fn fail(name: &'static str, message: String) -> Self {
        Self {
            name,
            passed: false,
            message,
        }
    }
}

/// All checks run on one record
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub study_id: String,
    pub effect_size_id: String,
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn check(&self, name: &str) -> Option<&ValidationCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Run the quality-control checks for a converted record against its raw row
pub fn validate_record(
    raw: &RawRecord,
    record: &EffectSizeRecord,
    thresholds: &ValidationThresholds,
) -> Result<ValidationReport> {
    let mut checks = Vec::with_capacity(5);
    let g = record.g;
    let se = record.se_g;

    checks.push(if g.abs() > thresholds.max_abs_g {
        ValidationCheck::fail(
            "effect_size_range",
            format!("|g| = {:.3} exceeds maximum {}", g.abs(), thresholds.max_abs_g),
        )
    } else {
        ValidationCheck::pass("effect_size_range")
    });

    let arms = raw.input.arm_sizes();

    // SE should be near sqrt(4/n) for balanced arms; flag gross departures
    checks.push(match arms {
        Some((n1, n2)) => {
            let expected_max = (8.0 / n1.max(n2)).sqrt();
            if se > expected_max * 2.0 {
                ValidationCheck::fail(
                    "standard_error",
                    format!(
                        "SE = {se:.4} seems too large for n1 = {n1}, n2 = {n2} (expected max ~{expected_max:.4})"
                    ),
                )
            } else {
                ValidationCheck::pass("standard_error")
            }
        }
        None => ValidationCheck::pass("standard_error"),
    });

    checks.push(match arms {
        Some((n1, n2)) if n1 < thresholds.min_n || n2 < thresholds.min_n => {
            ValidationCheck::fail(
                "sample_sizes",
                format!("arm sizes ({n1}, {n2}) below minimum {}", thresholds.min_n),
            )
        }
        _ => ValidationCheck::pass("sample_sizes"),
    });

    checks.push(match raw.input.means() {
        Some((treatment, control))
            if (treatment > control) != (g > 0.0) && g.abs() > thresholds.sign_tolerance =>
        {
            ValidationCheck::fail(
                "sign_consistency",
                format!(
                    "g = {g:.3} but treatment mean {treatment} vs control mean {control}"
                ),
            )
        }
        _ => ValidationCheck::pass("sign_consistency"),
    });

    let z = z_critical(1.0 - thresholds.alpha)?;
    let lower = g - z * se;
    let upper = g + z * se;
    let crosses_zero = lower < 0.0 && 0.0 < upper;
    checks.push(match raw.reported_p {
        Some(p) if crosses_zero && p < thresholds.alpha => ValidationCheck::fail(
            "ci_plausibility",
            format!("CI [{lower:.3}, {upper:.3}] crosses zero but p = {p:.3}"),
        ),
        Some(p) if !crosses_zero && p >= thresholds.alpha => ValidationCheck::fail(
            "ci_plausibility",
            format!("CI [{lower:.3}, {upper:.3}] excludes zero but p = {p:.3}"),
        ),
        _ => ValidationCheck::pass("ci_plausibility"),
    });

    Ok(ValidationReport {
        study_id: record.study_id.clone(),
        effect_size_id: record.effect_size_id.clone(),
        checks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RawInput;
    use crate::EffectSizeCalculator;
    use meta_core::AnalysisConfig;

    fn convert(raw: &RawRecord) -> EffectSizeRecord {
        EffectSizeCalculator::new(&AnalysisConfig::default())
            .unwrap()
            .canonicalize(raw)
            .unwrap()
    }

    #[test]
    fn test_clean_record_passes() {
        let raw = RawRecord::new(
            "s1",
            "e1",
            RawInput::MeansSds {
                mean1: 82.4,
                sd1: 12.1,
                n1: 45,
                mean2: 74.6,
                sd2: 13.8,
                n2: 43,
            },
        )
        .with_reported_p(0.008);
        let report = validate_record(&raw, &convert(&raw), &ValidationThresholds::default()).unwrap();
        assert!(report.is_valid(), "{:?}", report.checks);
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn test_flags_small_arms_and_p_mismatch() {
        let raw = RawRecord::new("s2", "e1", RawInput::TStatistic { t: 1.0, n1: 8, n2: 30 })
            .with_reported_p(0.01);
        let record = convert(&raw);
        let report = validate_record(&raw, &record, &ValidationThresholds::default()).unwrap();

        assert!(!report.is_valid());
        assert!(!report.check("sample_sizes").unwrap().passed);
        assert!(!report.check("ci_plausibility").unwrap().passed);
        assert!(report.check("effect_size_range").unwrap().passed);
    }

    #[test]
    fn test_flags_sign_inconsistency_and_range() {
        let raw = RawRecord::new(
            "s3",
            "e1",
            RawInput::MeansSds {
                mean1: 10.0,
                sd1: 1.0,
                n1: 20,
                mean2: 20.0,
                sd2: 1.0,
                n2: 20,
            },
        );
        // a hand-entered record whose sign disagrees with the raw means
        let mut record = convert(&raw);
        record.g = -record.g;
        let report = validate_record(&raw, &record, &ValidationThresholds::default()).unwrap();
        assert!(!report.check("sign_consistency").unwrap().passed);
        assert!(!report.check("effect_size_range").unwrap().passed);
    }
}
