//! Begg-Mazumdar rank correlation test

use meta_core::rank::kendall_tau_b;
use meta_core::{EffectSizeBatch, Error, Result};
use tracing::debug;

/// Kendall's tau between standardized effects and sampling variances
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeggTest {
    pub tau: f64,
    /// Normal approximation of the tau statistic
    pub z: f64,
    pub p_value: f64,
    pub k: usize,
    pub asymmetric: bool,
}

/// Rank correlation test
///
/// Effects are standardized against the fixed-effect estimate,
/// `(y_i - theta) / sqrt(v_i - 1 / sum w)`, which makes them exchangeable
/// under no bias.
pub fn begg_test(batch: &EffectSizeBatch, alpha: f64) -> Result<BeggTest> {
    batch.require(3, "Begg rank correlation test")?;
    let y = batch.effects();
    let v = batch.variances();

    let weights: Vec<f64> = v.iter().map(|v| 1.0 / v).collect();
    let total: f64 = weights.iter().sum();
    let theta = weights.iter().zip(&y).map(|(w, y)| w * y).sum::<f64>() / total;
    let pooled_variance = 1.0 / total;

    let standardized = y
        .iter()
        .zip(&v)
        .map(|(y, v)| {
            let spread = v - pooled_variance;
            if spread > 0.0 {
                Ok((y - theta) / spread.sqrt())
            } else {
                Err(Error::Computation(
                    "one study dominates the fixed-effect estimate".to_string(),
                ))
            }
        })
        .collect::<Result<Vec<f64>>>()?;

    let kendall = kendall_tau_b(&standardized, &v)?;
    debug!(tau = kendall.tau, p = kendall.p_value, "Begg rank correlation test");
    Ok(BeggTest {
        tau: kendall.tau,
        z: kendall.z,
        p_value: kendall.p_value,
        k: batch.len(),
        asymmetric: kendall.p_value < alpha,
    })
}
