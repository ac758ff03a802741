//! Mathematical utilities for meta-analytic inference
//!
//! Thin wrappers over `statrs` distributions returning this crate's
//! [`Result`](crate::Result) so callers never unwrap a distribution
//! constructor.

/// Distribution-related functions
pub mod distributions {
    use crate::{Error, Result};
    use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

    fn standard_normal() -> Result<Normal> {
        Normal::new(0.0, 1.0).map_err(|e| {
            Error::Computation(format!("Failed to create normal distribution: {e}"))
        })
    }

    fn students_t(df: f64) -> Result<StudentsT> {
        if !(df > 0.0) || !df.is_finite() {
            return Err(Error::InvalidInput(format!(
                "t-distribution needs positive finite degrees of freedom, got {df}"
            )));
        }
        StudentsT::new(0.0, 1.0, df)
            .map_err(|e| Error::Computation(format!("Failed to create t-distribution: {e}")))
    }

    /// Standard normal CDF
    pub fn normal_cdf(x: f64) -> Result<f64> {
        Ok(standard_normal()?.cdf(x))
    }

    /// Standard normal quantile function
    pub fn normal_quantile(p: f64) -> Result<f64> {
        if !(p > 0.0 && p < 1.0) {
            return Err(Error::InvalidInput(format!(
                "probability {p} must be in (0, 1)"
            )));
        }
        Ok(standard_normal()?.inverse_cdf(p))
    }

    /// Two-sided critical value z_(1-α/2) for a confidence level
    pub fn z_critical(confidence_level: f64) -> Result<f64> {
        normal_quantile(1.0 - (1.0 - confidence_level) / 2.0)
    }

    /// Two-sided p-value of a standard normal statistic
    pub fn normal_two_sided_p(z: f64) -> Result<f64> {
        if z.is_nan() {
            return Err(Error::non_finite("z statistic"));
        }
        Ok((2.0 * standard_normal()?.cdf(-z.abs())).min(1.0))
    }

    /// Two-sided critical value of Student's t
    pub fn t_critical(confidence_level: f64, df: f64) -> Result<f64> {
        let t = students_t(df)?;
        Ok(t.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0))
    }

    /// Two-sided p-value of a t statistic
    pub fn t_two_sided_p(t: f64, df: f64) -> Result<f64> {
        if t.is_nan() {
            return Err(Error::non_finite("t statistic"));
        }
        Ok((2.0 * students_t(df)?.cdf(-t.abs())).min(1.0))
    }

    /// Upper-tail probability of a χ² statistic
    pub fn chi_squared_sf(x: f64, df: f64) -> Result<f64> {
        if !(df > 0.0) {
            return Err(Error::InvalidInput(format!(
                "chi-squared needs positive degrees of freedom, got {df}"
            )));
        }
        if x.is_nan() {
            return Err(Error::non_finite("chi-squared statistic"));
        }
        if x <= 0.0 {
            return Ok(1.0);
        }
        let dist = ChiSquared::new(df).map_err(|e| {
            Error::Computation(format!("Failed to create chi-squared distribution: {e}"))
        })?;
        Ok((1.0 - dist.cdf(x)).clamp(0.0, 1.0))
    }
}

/// Compare floats treating values closer than `tol` (relative) as equal
pub fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

#[cfg(test)]
mod tests {
    use super::distributions::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_z_critical() {
        assert_abs_diff_eq!(z_critical(0.95).unwrap(), 1.959964, epsilon = 1e-6);
        assert_abs_diff_eq!(z_critical(0.90).unwrap(), 1.644854, epsilon = 1e-6);
    }

    #[test]
    fn test_normal_p_values() {
        assert_abs_diff_eq!(normal_two_sided_p(1.959964).unwrap(), 0.05, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_two_sided_p(0.0).unwrap(), 1.0, epsilon = 1e-12);
        assert!(normal_two_sided_p(f64::NAN).is_err());
    }

    #[test]
    fn test_t_distribution() {
        // t_(0.975, 10) = 2.228139
        assert_abs_diff_eq!(t_critical(0.95, 10.0).unwrap(), 2.228139, epsilon = 1e-4);
        assert_abs_diff_eq!(t_two_sided_p(2.228139, 10.0).unwrap(), 0.05, epsilon = 1e-4);
        assert!(t_critical(0.95, 0.0).is_err());
    }

    #[test]
    fn test_chi_squared() {
        // χ²(0.95, 1) = 3.841459
        assert_abs_diff_eq!(chi_squared_sf(3.841459, 1.0).unwrap(), 0.05, epsilon = 1e-5);
        assert_eq!(chi_squared_sf(-1.0, 2.0).unwrap(), 1.0);
        assert!(chi_squared_sf(1.0, 0.0).is_err());
    }
}
