//! Duval-Tweedie trim-and-fill
//!
//! Works on the side where studies are presumed missing, mirrored so that
//! this is always the left: the `k0` most extreme effects on the right are
//! trimmed, the centre re-estimated, and the loop repeated until `k0` is
//! stable. The trimmed effects are then mirrored about the final centre
//! and the model refitted on the filled funnel.

use meta_core::rank::average_ranks;
use meta_core::{AnalysisConfig, EffectSizeBatch, Error, PooledEstimate, Result};
use meta_heterogeneity::{Design, FittedModel, TwoLevelFit};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Estimator of the number of missing studies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimFillEstimator {
    /// From the Wilcoxon rank sum of the positive centred effects
    L0,
    /// From the rightmost run of positive ranks
    R0,
}

impl fmt::Display for TrimFillEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L0 => write!(f, "L0"),
            Self::R0 => write!(f, "R0"),
        }
    }
}

/// Side of the funnel on which studies are missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunnelSide {
    Left,
    Right,
    /// Chosen from the sign of the standard-error slope of the funnel regression
    Auto,
}

impl fmt::Display for FunnelSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// A filled-in effect size
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImputedEffect {
    pub g: f64,
    pub variance: f64,
}

/// Trim-and-fill result
#[derive(Debug, Clone, PartialEq)]
pub struct TrimAndFill {
    pub estimator: TrimFillEstimator,
    /// Resolved side, never `Auto`
    pub side: FunnelSide,
    /// Number of imputed studies
    pub k0: usize,
    pub imputed: Vec<ImputedEffect>,
    pub original: PooledEstimate,
    /// Pooled estimate of the filled funnel
    pub adjusted: PooledEstimate,
    pub iterations: usize,
}

impl TrimAndFill {
    pub fn shift(&self) -> f64 {
        self.adjusted.point_estimate - self.original.point_estimate
    }
}

fn centre(y: &[f64], v: &[f64], config: &AnalysisConfig) -> Result<f64> {
    let n = y.len();
    let fit = TwoLevelFit::from_parts(
        Design::intercept(n),
        DVector::from_column_slice(y),
        DVector::from_column_slice(v),
        n,
        config.estimator,
        config,
    )?;
    Ok(fit.beta()[0])
}

/// Side with missing studies from the sign of the `sqrt(v)` slope
fn detect_side(batch: &EffectSizeBatch, config: &AnalysisConfig) -> Result<FunnelSide> {
    let se: Vec<f64> = batch.variances().iter().map(|v| v.sqrt()).collect();
    let design = Design::intercept(batch.len()).with_column("sei", &se)?;
    let fit = TwoLevelFit::fit(batch, design, config.estimator, config)?;
    Ok(if fit.beta()[1] < 0.0 {
        FunnelSide::Right
    } else {
        FunnelSide::Left
    })
}

/// Number of missing studies for centred effects `centred`
fn missing_count(centred: &[f64], estimator: TrimFillEstimator) -> usize {
    let k = centred.len();
    let magnitudes: Vec<f64> = centred.iter().map(|c| c.abs()).collect();
    let ranks = average_ranks(&magnitudes);
    let raw = match estimator {
        TrimFillEstimator::L0 => {
            let positive: f64 = ranks
                .iter()
                .zip(centred)
                .filter(|(_, c)| **c > 0.0)
                .map(|(r, _)| r)
                .sum();
            let k = k as f64;
            (4.0 * positive - k * (k + 1.0)) / (2.0 * k - 1.0)
        }
        TrimFillEstimator::R0 => {
            let largest_negative = ranks
                .iter()
                .zip(centred)
                .filter(|(_, c)| **c < 0.0)
                .map(|(r, _)| *r)
                .fold(0.0_f64, f64::max);
            k as f64 - largest_negative - 1.0
        }
    };
    // k0 <= k - 1 keeps at least one study in the trimmed fit
    (raw.round().max(0.0) as usize).min(k.saturating_sub(1))
}

/// Run trim-and-fill on a batch with the configured τ² estimator
pub fn trim_and_fill(
    batch: &EffectSizeBatch,
    estimator: TrimFillEstimator,
    side: FunnelSide,
    config: &AnalysisConfig,
) -> Result<TrimAndFill> {
    batch.require(3, "trim-and-fill")?;
    let side = match side {
        FunnelSide::Auto => detect_side(batch, config)?,
        resolved => resolved,
    };
    let sign = if side == FunnelSide::Left { 1.0 } else { -1.0 };

    // mirrored and sorted ascending
    let mut pairs: Vec<(f64, f64)> = batch
        .effects()
        .iter()
        .zip(batch.variances())
        .map(|(y, v)| (sign * y, v))
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let y: Vec<f64> = pairs.iter().map(|p| p.0).collect();
    let v: Vec<f64> = pairs.iter().map(|p| p.1).collect();
    let k = y.len();

    let mut k0 = 0usize;
    let mut converged = None;
    for iteration in 1..=config.max_iterations {
        let mu = centre(&y[..k - k0], &v[..k - k0], config)?;
        let centred: Vec<f64> = y.iter().map(|y| y - mu).collect();
        let next = missing_count(&centred, estimator);
        debug!(iteration, k0 = next, centre = mu, "trim-and-fill iteration");
        if next == k0 {
            converged = Some((mu, iteration));
            break;
        }
        k0 = next;
    }
    let Some((mu, iterations)) = converged else {
        warn!(max = config.max_iterations, "trim-and-fill did not stabilise");
        return Err(Error::no_convergence("trim-and-fill", config.max_iterations));
    };

    let imputed: Vec<ImputedEffect> = y[k - k0..]
        .iter()
        .zip(&v[k - k0..])
        .map(|(y, v)| ImputedEffect {
            g: sign * (2.0 * mu - y),
            variance: *v,
        })
        .collect();

    let original = TwoLevelFit::intercept_only(batch, config)?.pooled()?;
    let mut filled_y = batch.effects();
    let mut filled_v = batch.variances();
    filled_y.extend(imputed.iter().map(|e| e.g));
    filled_v.extend(imputed.iter().map(|e| e.variance));
    let n = filled_y.len();
    let adjusted = TwoLevelFit::from_parts(
        Design::intercept(n),
        DVector::from_vec(filled_y),
        DVector::from_vec(filled_v),
        batch.n_studies() + k0,
        config.estimator,
        config,
    )?
    .pooled()?;

    debug!(
        %estimator,
        %side,
        k0,
        original = original.point_estimate,
        adjusted = adjusted.point_estimate,
        "trim-and-fill"
    );
    Ok(TrimAndFill {
        estimator,
        side,
        k0,
        imputed,
        original,
        adjusted,
        iterations,
    })
}
