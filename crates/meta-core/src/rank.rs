//! Tie-aware ranks and Kendall's rank correlation
//!
//! Values closer than [`TIE_TOLERANCE`] (relative) are ties. This matters for
//! funnel methods: the mirrored halves of a symmetric funnel differ only by
//! rounding error and must rank as exact ties.

use crate::math::approx_eq;
use crate::math::distributions::normal_two_sided_p;
use crate::{Error, Result};
use ordered_float::OrderedFloat;

/// Relative tolerance under which two values are ties
pub const TIE_TOLERANCE: f64 = 1e-10;

/// Sign of `a - b`, zero for ties
pub fn tie_sign(a: f64, b: f64) -> i32 {
    if approx_eq(a, b, TIE_TOLERANCE) {
        0
    } else if a > b {
        1
    } else {
        -1
    }
}

fn sorted_order(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| OrderedFloat(values[i]));
    order
}

/// Runs of tied values in sorted order, as index groups
fn tie_runs(values: &[f64]) -> Vec<Vec<usize>> {
    let order = sorted_order(values);
    let mut runs: Vec<Vec<usize>> = Vec::new();
    for idx in order {
        match runs.last_mut() {
            Some(run) if tie_sign(values[run[0]], values[idx]) == 0 => run.push(idx),
            _ => runs.push(vec![idx]),
        }
    }
    runs
}

/// 1-based ranks, ties receiving their average rank
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut ranks = vec![0.0; values.len()];
    let mut position = 0usize;
    for run in tie_runs(values) {
        let first = position + 1;
        let last = position + run.len();
        let average = (first + last) as f64 / 2.0;
        for idx in &run {
            ranks[*idx] = average;
        }
        position = last;
    }
    ranks
}

/// Kendall's tau-b with its large-sample test
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KendallTau {
    pub tau: f64,
    /// Concordant minus discordant pairs
    pub s: f64,
    pub z: f64,
    pub p_value: f64,
    pub n: usize,
}

/// Kendall's tau-b between `x` and `y` with the tie-corrected normal approximation
pub fn kendall_tau_b(x: &[f64], y: &[f64]) -> Result<KendallTau> {
    let n = x.len();
    if n != y.len() {
        return Err(Error::InvalidInput(format!(
            "Kendall's tau needs paired samples, got {} and {}",
            n,
            y.len()
        )));
    }
    if n < 3 {
        return Err(Error::too_few(3, n, "Kendall's tau"));
    }

    let mut s = 0i64;
    for i in 0..n {
        for j in (i + 1)..n {
            s += i64::from(tie_sign(x[i], x[j]) * tie_sign(y[i], y[j]));
        }
    }

    let nf = n as f64;
    let n0 = nf * (nf - 1.0) / 2.0;
    let sizes = |v: &[f64]| -> Vec<f64> {
        tie_runs(v)
            .into_iter()
            .map(|r| r.len() as f64)
            .filter(|&t| t > 1.0)
            .collect()
    };
    let tx = sizes(x);
    let ty = sizes(y);
    let pairs = |t: &[f64]| t.iter().map(|t| t * (t - 1.0) / 2.0).sum::<f64>();
    let n1 = pairs(&tx);
    let n2 = pairs(&ty);

    let denominator = ((n0 - n1) * (n0 - n2)).sqrt();
    if !(denominator > 0.0) {
        return Err(Error::Computation(
            "Kendall's tau is undefined when one variable is constant".to_string(),
        ));
    }
    let s = s as f64;
    let tau = s / denominator;

    let v0 = nf * (nf - 1.0) * (2.0 * nf + 5.0);
    let vt = |t: &[f64]| t.iter().map(|t| t * (t - 1.0) * (2.0 * t + 5.0)).sum::<f64>();
    let t3 = |t: &[f64]| t.iter().map(|t| t * (t - 1.0) * (t - 2.0)).sum::<f64>();
    let t2 = |t: &[f64]| t.iter().map(|t| t * (t - 1.0)).sum::<f64>();
    let var_s = (v0 - vt(&tx) - vt(&ty)) / 18.0
        + t3(&tx) * t3(&ty) / (9.0 * nf * (nf - 1.0) * (nf - 2.0))
        + t2(&tx) * t2(&ty) / (2.0 * nf * (nf - 1.0));
    let z = if var_s > 0.0 { s / var_s.sqrt() } else { 0.0 };

    Ok(KendallTau {
        tau,
        s,
        z,
        p_value: normal_two_sided_p(z)?,
        n,
    })
}
