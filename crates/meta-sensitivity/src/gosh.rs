//! GOSH: the pooled model fitted to subsets of the effect sizes
//!
//! All subsets of size two or more are fitted when there are at most
//! `gosh_subset_cap` of them. Otherwise `gosh_subset_cap` subsets are drawn
//! with a `ChaCha8Rng` seeded from the configuration, each effect size
//! entering a draw with probability one half.

use crate::engine::SensitivityEngine;
use crate::execution::map_refits;
use meta_core::{EffectSizeBatch, Result};
use meta_heterogeneity::{Design, TwoLevelFit};
use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// One subset fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoshFit {
    /// Record indices in the subset
    pub members: Vec<usize>,
    pub estimate: f64,
    pub tau2: f64,
    pub i2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoshAnalysis {
    pub k: usize,
    /// Subsets of size two or more, `2^k - k - 1`
    pub possible_subsets: f64,
    /// Every subset was fitted
    pub exhaustive: bool,
    pub seed: Option<u64>,
    pub fits: Vec<GoshFit>,
    /// Subsets whose fit failed
    pub failures: usize,
}

fn possible_subsets(k: usize) -> f64 {
    2f64.powi(k as i32) - k as f64 - 1.0
}

fn enumerate_subsets(k: usize) -> Vec<Vec<usize>> {
    (1u64..(1u64 << k))
        .filter(|mask| mask.count_ones() >= 2)
        .map(|mask| (0..k).filter(|&i| mask & (1 << i) != 0).collect())
        .collect()
}

fn sample_subsets(k: usize, count: usize, seed: u64) -> Vec<Vec<usize>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|_| loop {
            let members: Vec<usize> = (0..k).filter(|_| rng.gen_bool(0.5)).collect();
            if members.len() >= 2 {
                break members;
            }
        })
        .collect()
}

impl SensitivityEngine {
    /// Fit the two-level model to subsets of the batch
    #[instrument(skip_all, fields(k = batch.len(), cap = self.config.gosh_subset_cap))]
    pub fn gosh(&self, batch: &EffectSizeBatch) -> Result<GoshAnalysis> {
        batch.require(3, "GOSH analysis")?;
        let k = batch.len();
        let cap = self.config.gosh_subset_cap;
        let possible = possible_subsets(k);

        let exhaustive = k < 64 && possible <= cap as f64;
        let (subsets, seed) = if exhaustive {
            (enumerate_subsets(k), None)
        } else {
            warn!(possible, cap, "too many subsets, sampling");
            (sample_subsets(k, cap, self.config.seed), Some(self.config.seed))
        };

        let effects = batch.effects();
        let variances = batch.variances();
        let outcomes = map_refits(&subsets, |members| -> Result<GoshFit> {
            let n = members.len();
            let fit = TwoLevelFit::from_parts(
                Design::intercept(n),
                DVector::from_iterator(n, members.iter().map(|&i| effects[i])),
                DVector::from_iterator(n, members.iter().map(|&i| variances[i])),
                n,
                self.config.estimator,
                &self.config,
            )?;
            let pooled = fit.pooled()?;
            Ok(GoshFit {
                members: members.clone(),
                estimate: pooled.point_estimate,
                tau2: pooled.tau2().unwrap_or(0.0),
                i2: pooled.i2().unwrap_or(0.0),
            })
        });

        let mut fits = Vec::with_capacity(outcomes.len());
        let mut failures = 0;
        for outcome in outcomes {
            match outcome {
                Ok(fit) => fits.push(fit),
                Err(e) => {
                    debug!(error = %e, "GOSH subset fit failed");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!(failures, "GOSH subset fits failed");
        }
        Ok(GoshAnalysis {
            k,
            possible_subsets: possible,
            exhaustive,
            seed,
            fits,
            failures,
        })
    }
}
