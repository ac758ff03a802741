//! Per-path conversions to Hedges' g
//!
//! Every function here is pure: the same inputs always give the same
//! `(g, variance)`. Input validation names the offending field so callers
//! can report exactly what was wrong with a row.

use crate::input::Direction;
use meta_core::{Error, Result};
use std::f64::consts::PI;

/// Bias-corrected standardized mean difference and its sampling variance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GEstimate {
    pub g: f64,
    pub variance: f64,
}

fn finite(field: &str, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(Error::insufficient_field(field, format!("{value} is not finite")))
    }
}

fn positive(field: &str, value: f64) -> Result<f64> {
    finite(field, value)?;
    if value > 0.0 {
        Ok(value)
    } else {
        Err(Error::insufficient_field(field, format!("{value} must be positive")))
    }
}

fn arm_size(field: &str, n: f64) -> Result<f64> {
    if n > 1.0 {
        Ok(n)
    } else {
        Err(Error::insufficient_field(
            field,
            format!("sample size {n} must be greater than 1"),
        ))
    }
}

/// Small-sample correction `J = 1 - 3 / (4 df - 1)`
pub fn small_sample_correction(df: f64) -> f64 {
    1.0 - 3.0 / (4.0 * df - 1.0)
}

/// `var(g) = (n1 + n2) / (n1 n2) + g² / (2 (n1 + n2))`
pub fn hedges_variance(g: f64, n1: f64, n2: f64) -> f64 {
    let total = n1 + n2;
    total / (n1 * n2) + g * g / (2.0 * total)
}

/// Pooled standard deviation of two arms
pub fn pooled_sd(sd1: f64, n1: f64, sd2: f64, n2: f64) -> f64 {
    (((n1 - 1.0) * sd1 * sd1 + (n2 - 1.0) * sd2 * sd2) / (n1 + n2 - 2.0)).sqrt()
}

/// Apply J with `df = n1 + n2 - 2` and the two-group variance to a Cohen's d
pub fn from_d(d: f64, n1: f64, n2: f64) -> Result<GEstimate> {
    finite("d", d)?;
    let n1 = arm_size("n1", n1)?;
    let n2 = arm_size("n2", n2)?;
    let g = small_sample_correction(n1 + n2 - 2.0) * d;
    Ok(GEstimate {
        g,
        variance: hedges_variance(g, n1, n2),
    })
}

/// Group means and standard deviations
pub fn from_means(mean1: f64, sd1: f64, n1: f64, mean2: f64, sd2: f64, n2: f64) -> Result<GEstimate> {
    finite("mean1", mean1)?;
    finite("mean2", mean2)?;
    positive("sd1", sd1)?;
    positive("sd2", sd2)?;
    let n1 = arm_size("n1", n1)?;
    let n2 = arm_size("n2", n2)?;

    let sp = pooled_sd(sd1, n1, sd2, n2);
    if !(sp > 0.0) {
        return Err(Error::insufficient_field("sd", "pooled SD is not positive"));
    }
    from_d((mean1 - mean2) / sp, n1, n2)
}

/// Independent-samples t statistic: `d = t sqrt((n1 + n2) / (n1 n2))`
pub fn from_t(t: f64, n1: f64, n2: f64) -> Result<GEstimate> {
    finite("t", t)?;
    let n1 = arm_size("n1", n1)?;
    let n2 = arm_size("n2", n2)?;
    from_d(t * ((n1 + n2) / (n1 * n2)).sqrt(), n1, n2)
}

/// One-numerator-df F statistic: `t = sqrt(F)`, signed by `direction`
pub fn from_f(f: f64, df_numerator: u32, n1: f64, n2: f64, direction: Direction) -> Result<GEstimate> {
    if df_numerator != 1 {
        return Err(Error::Configuration(format!(
            "F statistic with {df_numerator} numerator degrees of freedom cannot be converted to g"
        )));
    }
    finite("f", f)?;
    if f < 0.0 {
        return Err(Error::insufficient_field("f", format!("{f} must be non-negative")));
    }
    from_t(direction.sign() * f.sqrt(), n1, n2)
}

/// Point-biserial r: `d = 2r / sqrt(1 - r²)` with the total split evenly
pub fn from_correlation(r: f64, n: f64) -> Result<GEstimate> {
    finite("r", r)?;
    if r.abs() >= 1.0 {
        return Err(Error::insufficient_field("r", format!("{r} must lie in (-1, 1)")));
    }
    let half = n / 2.0;
    if !(half > 1.0) {
        return Err(Error::insufficient_field(
            "n",
            format!("total sample size {n} must exceed 2"),
        ));
    }
    from_d(2.0 * r / (1.0 - r * r).sqrt(), half, half)
}

/// 2x2 χ²: `φ = sqrt(χ² / n)`, then the correlation path
pub fn from_chi_square(chi2: f64, df: u32, n: f64, direction: Direction) -> Result<GEstimate> {
    if df != 1 {
        return Err(Error::Configuration(format!(
            "chi-square with {df} degrees of freedom cannot be converted to g"
        )));
    }
    finite("chi2", chi2)?;
    if chi2 < 0.0 {
        return Err(Error::insufficient_field("chi2", format!("{chi2} must be non-negative")));
    }
    positive("n", n)?;
    let phi = (chi2 / n).sqrt();
    from_correlation(direction.sign() * phi, n)
}

/// Odds ratio by the logit method: `d = ln(OR) sqrt(3) / π`
pub fn from_odds_ratio(odds_ratio: f64, n1: f64, n2: f64) -> Result<GEstimate> {
    positive("odds_ratio", odds_ratio)?;
    from_d(odds_ratio.ln() * 3.0_f64.sqrt() / PI, n1, n2)
}

/// Author-reported g, variance from SE when given, otherwise from the arm sizes
pub fn from_reported_g(g: f64, se: Option<f64>, arms: Option<(f64, f64)>) -> Result<GEstimate> {
    finite("g", g)?;
    match (se, arms) {
        (Some(se), _) => {
            let se = positive("se", se)?;
            Ok(GEstimate {
                g,
                variance: se * se,
            })
        }
        (None, Some((n1, n2))) => {
            let n1 = arm_size("n1", n1)?;
            let n2 = arm_size("n2", n2)?;
            Ok(GEstimate {
                g,
                variance: hedges_variance(g, n1, n2),
            })
        }
        (None, None) => Err(Error::insufficient_field(
            "se",
            "reported g needs a standard error or both arm sizes",
        )),
    }
}

/// Pre/post single-group design
///
/// `d = (post - pre) / ((sd_pre + sd_post) / 2)`, `J` with `df = n - 1`,
/// `var = 2 (1 - r) / n + g² / (2n)`.
pub fn from_pre_post(
    mean_pre: f64,
    sd_pre: f64,
    mean_post: f64,
    sd_post: f64,
    n: f64,
    r: f64,
) -> Result<GEstimate> {
    finite("mean_pre", mean_pre)?;
    finite("mean_post", mean_post)?;
    positive("sd_pre", sd_pre)?;
    positive("sd_post", sd_post)?;
    finite("r", r)?;
    if r <= -1.0 || r >= 1.0 {
        return Err(Error::insufficient_field("r", format!("{r} must lie in (-1, 1)")));
    }
    if !(n > 2.0) {
        return Err(Error::insufficient_field(
            "n",
            format!("pre/post design needs at least 3 participants, got {n}"),
        ));
    }

    let sd_avg = (sd_pre + sd_post) / 2.0;
    let g = small_sample_correction(n - 1.0) * (mean_post - mean_pre) / sd_avg;
    Ok(GEstimate {
        g,
        variance: 2.0 * (1.0 - r) / n + g * g / (2.0 * n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_worked_example() {
        let est = from_means(82.4, 12.1, 45.0, 74.6, 13.8, 43.0).unwrap();
        assert_abs_diff_eq!(est.g, 0.5967, epsilon = 1e-4);
        assert_abs_diff_eq!(est.variance.sqrt(), 0.2179, epsilon = 1e-4);
    }

    #[test]
    fn test_correction_factor() {
        // df = 10 -> J = 1 - 3/39
        assert_abs_diff_eq!(small_sample_correction(10.0), 36.0 / 39.0, epsilon = 1e-12);
        assert!(small_sample_correction(1000.0) > 0.999);
    }

    #[test]
    fn test_correlation_path() {
        let est = from_correlation(0.3, 100.0).unwrap();
        assert_abs_diff_eq!(est.g, 0.624_145, epsilon = 1e-5);
        assert_abs_diff_eq!(est.variance, 0.041_948, epsilon = 1e-5);

        // χ² = 9 with n = 100 is φ = 0.3
        let chi = from_chi_square(9.0, 1, 100.0, Direction::FavorsTreatment).unwrap();
        assert_abs_diff_eq!(chi.g, est.g, epsilon = 1e-12);
        let neg = from_chi_square(9.0, 1, 100.0, Direction::FavorsControl).unwrap();
        assert_abs_diff_eq!(neg.g, -est.g, epsilon = 1e-12);
    }

    #[test]
    fn test_pre_post_and_odds_ratio() {
        let est = from_pre_post(72.5, 11.2, 81.3, 10.8, 45.0, 0.6).unwrap();
        assert_abs_diff_eq!(est.g, 0.786_286, epsilon = 1e-5);
        assert_abs_diff_eq!(est.variance, 0.024_647, epsilon = 1e-5);

        let or = from_odds_ratio(2.5, 50.0, 50.0).unwrap();
        assert_abs_diff_eq!(or.g, 0.501_302, epsilon = 1e-5);
        let null = from_odds_ratio(1.0, 50.0, 50.0).unwrap();
        assert_abs_diff_eq!(null.g, 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_f_requires_one_numerator_df() {
        let ok = from_f(4.0, 1, 20.0, 20.0, Direction::FavorsControl).unwrap();
        let t = from_t(-2.0, 20.0, 20.0).unwrap();
        assert_abs_diff_eq!(ok.g, t.g, epsilon = 1e-12);

        assert!(matches!(
            from_f(4.0, 2, 20.0, 20.0, Direction::FavorsTreatment),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_field_errors_name_the_field() {
        match from_means(1.0, 1.0, 1.0, 0.0, 1.0, 20.0) {
            Err(Error::InsufficientData { field, .. }) => assert_eq!(field, "n1"),
            other => panic!("unexpected {other:?}"),
        }
        match from_means(1.0, 0.0, 20.0, 0.0, 1.0, 20.0) {
            Err(Error::InsufficientData { field, .. }) => assert_eq!(field, "sd1"),
            other => panic!("unexpected {other:?}"),
        }
        match from_t(f64::NAN, 20.0, 20.0) {
            Err(Error::InsufficientData { field, .. }) => assert_eq!(field, "t"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(from_correlation(1.0, 50.0).is_err());
        assert!(from_odds_ratio(0.0, 50.0, 50.0).is_err());
        assert!(from_reported_g(0.4, None, None).is_err());
    }

    #[test]
    fn test_reported_g_variance_sources() {
        let with_se = from_reported_g(0.4, Some(0.2), None).unwrap();
        assert_abs_diff_eq!(with_se.variance, 0.04, epsilon = 1e-15);

        let with_n = from_reported_g(0.4, None, Some((30.0, 30.0))).unwrap();
        assert_abs_diff_eq!(with_n.variance, hedges_variance(0.4, 30.0, 30.0), epsilon = 1e-15);
    }
}
