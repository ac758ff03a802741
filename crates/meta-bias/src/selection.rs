//! Vevea-Hedges step-function selection model
//!
//! One-sided p-values are cut into intervals at the configured cut-points.
//! Each interval after the first carries a relative publication probability
//! `ω_j`, and the random-effects likelihood is reweighted by the probability
//! that a study lands in its interval. Comparing the fit with free weights
//! against the fit with all weights at one gives a likelihood-ratio test for
//! selection.

use meta_core::math::distributions::chi_squared_sf;
use meta_core::optim::NelderMead;
use meta_core::{AnalysisConfig, EffectSizeBatch, Error, Result};
use meta_heterogeneity::TwoLevelFit;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::f64::consts::PI;
use tracing::debug;

/// Maximum-likelihood fit of the selection model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionFit {
    pub estimate: f64,
    pub tau2: f64,
    pub log_likelihood: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodRatioTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// Selection-model result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionModel {
    /// One-sided p-value cut-points
    pub cutpoints: Vec<f64>,
    /// Fit with every weight fixed at one
    pub unadjusted: SelectionFit,
    /// Fit with free interval weights
    pub adjusted: SelectionFit,
    /// Relative publication probability per interval, the first fixed at one
    pub weights: Vec<f64>,
    /// Number of effects in each p-value interval
    pub interval_counts: Vec<usize>,
    pub lrt: LikelihoodRatioTest,
    pub significant: bool,
}

/// One effect with its interval and cut-points on the effect scale
struct Observation {
    y: f64,
    v: f64,
    interval: usize,
    /// `c_j = sqrt(v) Φ⁻¹(1 - a_j)`, decreasing
    bounds: Vec<f64>,
}

fn observations(batch: &EffectSizeBatch, cutpoints: &[f64], normal: &Normal) -> Vec<Observation> {
    batch
        .effects()
        .into_iter()
        .zip(batch.variances())
        .map(|(y, v)| {
            let sd = v.sqrt();
            let p = 1.0 - normal.cdf(y / sd);
            let interval = cutpoints
                .iter()
                .position(|&a| p <= a)
                .unwrap_or(cutpoints.len());
            let bounds = cutpoints
                .iter()
                .map(|&a| sd * normal.inverse_cdf(1.0 - a))
                .collect();
            Observation { y, v, interval, bounds }
        })
        .collect()
}

/// Negative log-likelihood at `mu`, `tau2` and log weights of intervals 2..J
fn negative_log_likelihood(
    data: &[Observation],
    normal: &Normal,
    mu: f64,
    tau2: f64,
    log_weights: &[f64],
) -> f64 {
    let log_weight = |j: usize| if j == 0 { 0.0 } else { log_weights[j - 1] };
    let mut total = 0.0;
    for obs in data {
        let s = (obs.v + tau2).sqrt();
        let mut upper = 1.0;
        let mut normaliser = 0.0;
        for j in 0..=obs.bounds.len() {
            let lower = obs
                .bounds
                .get(j)
                .map_or(0.0, |c| normal.cdf((c - mu) / s));
            normaliser += log_weight(j).exp() * (upper - lower);
            upper = lower;
        }
        let z = (obs.y - mu) / s;
        total += log_weight(obs.interval)
            - 0.5 * (2.0 * PI).ln()
            - s.ln()
            - 0.5 * z * z
            - normaliser.ln();
    }
    -total
}

/// Fit the step-function selection model with the configured cut-points
pub fn selection_model(batch: &EffectSizeBatch, config: &AnalysisConfig) -> Result<SelectionModel> {
    let cutpoints = config.selection_cutpoints.clone();
    let intervals = cutpoints.len() + 1;
    batch.require(intervals + 2, "selection model")?;

    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| Error::Computation(format!("Failed to create normal distribution: {e}")))?;
    let data = observations(batch, &cutpoints, &normal);

    let mut interval_counts = vec![0usize; intervals];
    for obs in &data {
        interval_counts[obs.interval] += 1;
    }
    if let Some(empty) = interval_counts.iter().position(|&n| n == 0) {
        return Err(Error::InsufficientSample {
            expected: 1,
            actual: 0,
            context: format!("p-value interval {} of the selection model", empty + 1),
        });
    }

    let pooled = TwoLevelFit::intercept_only(batch, config)?.pooled()?;
    let start_tau = pooled.tau2().unwrap_or(0.0).max(0.01).sqrt();
    let optimizer = NelderMead::new(config.optimizer_max_iterations).with_initial_step(0.2);

    // τ² = θ² keeps the variance non-negative without bounds
    let unadjusted = optimizer.minimize(
        |p| negative_log_likelihood(&data, &normal, p[0], p[1] * p[1], &[]),
        &[pooled.point_estimate, start_tau],
    )?;
    let mut start = unadjusted.point.clone();
    start.extend(std::iter::repeat(0.0).take(intervals - 1));
    let adjusted = optimizer.minimize(
        |p| negative_log_likelihood(&data, &normal, p[0], p[1] * p[1], &p[2..]),
        &start,
    )?;

    let fit = |point: &[f64], value: f64| SelectionFit {
        estimate: point[0],
        tau2: point[1] * point[1],
        log_likelihood: -value,
    };
    let unadjusted = fit(&unadjusted.point, unadjusted.value);
    let weights: Vec<f64> = std::iter::once(1.0)
        .chain(adjusted.point[2..].iter().map(|w| w.exp()))
        .collect();
    let adjusted = fit(&adjusted.point, adjusted.value);

    let statistic = (2.0 * (adjusted.log_likelihood - unadjusted.log_likelihood)).max(0.0);
    let df = intervals - 1;
    let p_value = chi_squared_sf(statistic, df as f64)?;
    debug!(
        unadjusted = unadjusted.estimate,
        adjusted = adjusted.estimate,
        lrt = statistic,
        p = p_value,
        "selection model"
    );
    Ok(SelectionModel {
        cutpoints,
        unadjusted,
        adjusted,
        weights,
        interval_counts,
        lrt: LikelihoodRatioTest {
            statistic,
            df,
            p_value,
        },
        significant: p_value < config.alpha,
    })
}
