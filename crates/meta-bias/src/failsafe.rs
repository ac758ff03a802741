//! Fail-safe N: how many null studies would overturn the pooled result

use meta_core::math::distributions::{normal_cdf, normal_quantile};
use meta_core::{AnalysisConfig, EffectSizeBatch, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rosenthal's fail-safe N from Stouffer's combined z
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RosenthalFailSafe {
    /// Null studies needed to lift the combined one-sided p above alpha,
    /// measured in the direction of the combined effect
    pub n: f64,
    /// `5k + 10`
    pub threshold: f64,
    pub robust: bool,
    /// Signed Stouffer z
    pub combined_z: f64,
    /// One-sided p of `|combined_z|`
    pub combined_p: f64,
    pub k: usize,
}

/// Orwin's fail-safe N for a target effect size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrwinFailSafe {
    /// Studies with zero effect needed to pull the mean down to `target`
    pub n: f64,
    pub target: f64,
    /// Inverse-variance weighted mean effect
    pub mean_effect: f64,
    pub k: usize,
    /// At least as many hidden null studies as observed ones
    pub robust: bool,
}

/// Rosenthal's fail-safe N
pub fn rosenthal(batch: &EffectSizeBatch, alpha: f64) -> Result<RosenthalFailSafe> {
    batch.require(2, "Rosenthal fail-safe N")?;
    let k = batch.len() as f64;
    let z_sum: f64 = batch
        .effects()
        .iter()
        .zip(batch.variances())
        .map(|(y, v)| y / v.sqrt())
        .sum();
    let combined_z = z_sum / k.sqrt();
    let combined_p = 1.0 - normal_cdf(combined_z.abs())?;
    let z_alpha = normal_quantile(1.0 - alpha)?;

    let n = (k * (combined_z / z_alpha).powi(2) - k).max(0.0);
    let threshold = 5.0 * k + 10.0;
    debug!(n, threshold, combined_z, "Rosenthal fail-safe N");
    Ok(RosenthalFailSafe {
        n,
        threshold,
        robust: n > threshold,
        combined_z,
        combined_p,
        k: batch.len(),
    })
}

/// Orwin's fail-safe N
pub fn orwin(batch: &EffectSizeBatch, config: &AnalysisConfig) -> Result<OrwinFailSafe> {
    batch.require(2, "Orwin fail-safe N")?;
    let target = config.orwin_target;
    if !(target.is_finite() && target != 0.0) {
        return Err(Error::Configuration(
            "Orwin target must be finite and non-zero".to_string(),
        ));
    }
    let weights: Vec<f64> = batch.variances().iter().map(|v| 1.0 / v).collect();
    let mean_effect = weights
        .iter()
        .zip(batch.effects())
        .map(|(w, y)| w * y)
        .sum::<f64>()
        / weights.iter().sum::<f64>();

    let k = batch.len() as f64;
    let target = target.abs();
    let n = (k * (mean_effect.abs() - target) / target).max(0.0);
    debug!(n, target, mean_effect, "Orwin fail-safe N");
    Ok(OrwinFailSafe {
        n,
        target,
        mean_effect,
        k: batch.len(),
        robust: n >= k,
    })
}
