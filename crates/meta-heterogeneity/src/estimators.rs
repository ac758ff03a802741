//! Between-study variance estimators of the two-level model
//!
//! All estimators work with a general design `X` (p columns), so the same
//! code serves the intercept-only model and meta-regression.
//!
//! Notation: `W = diag(1 / (v + tau2))`, `P = W - W X (X'WX)^-1 X'W`,
//! `P0` is `P` at `tau2 = 0`. For any `tau2`, `P y = W r` with `r` the GLS
//! residuals, so `y'Py = sum(w r^2)` and `y'PPy = sum(w^2 r^2)`.

use meta_core::linalg::{weighted_least_squares, weighted_transpose, WlsSolution};
use meta_core::optim::bisect;
use meta_core::{Error, Result, Tau2Estimator};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Estimates below this are treated as sitting on the zero boundary
const BOUNDARY: f64 = 1e-6;

/// Fitting budget shared by the iterative estimators
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

/// An estimated τ²
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tau2Estimate {
    pub tau2: f64,
    /// The unconstrained estimate was negative and has been set to zero
    pub truncated: bool,
    pub iterations: usize,
}

/// GLS pieces at a given τ²
pub(crate) struct Projection {
    pub weights: DVector<f64>,
    pub solution: WlsSolution,
}

impl Projection {
    pub fn at(x: &DMatrix<f64>, y: &DVector<f64>, v: &DVector<f64>, tau2: f64) -> Result<Self> {
        let weights = v.map(|vi| 1.0 / (vi + tau2));
        let solution = weighted_least_squares(x, y, &weights)?;
        Ok(Self { weights, solution })
    }

    /// `P = W - W X (X'WX)^-1 X' W`
    pub fn p_matrix(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let wx = weighted_transpose(x, &self.weights).transpose();
        let mut p = -(&wx * &self.solution.bread * wx.transpose());
        for (i, w) in self.weights.iter().enumerate() {
            p[(i, i)] += w;
        }
        p
    }

    /// `y'Py`
    pub fn quadratic(&self) -> f64 {
        self.solution.weighted_rss(&self.weights)
    }

    /// `y'PPy`
    pub fn quadratic_squared(&self) -> f64 {
        self.solution
            .residuals
            .iter()
            .zip(self.weights.iter())
            .map(|(r, w)| (w * r).powi(2))
            .sum()
    }
}

/// Estimate τ² with the requested estimator
pub fn estimate(
    estimator: Tau2Estimator,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    settings: &Settings,
) -> Result<Tau2Estimate> {
    let k = y.len();
    let p = x.ncols();
    if k <= p {
        return Err(Error::too_few(p + 1, k, "tau-squared estimation"));
    }

    let result = match estimator {
        Tau2Estimator::DerSimonianLaird => dersimonian_laird(x, y, v),
        Tau2Estimator::PauleMandel => paule_mandel(x, y, v, settings),
        Tau2Estimator::SidikJonkman => sidik_jonkman(x, y, v),
        Tau2Estimator::EmpiricalBayes | Tau2Estimator::Reml | Tau2Estimator::MaximumLikelihood => {
            let start = dersimonian_laird(x, y, v)?.tau2;
            fisher_scoring(estimator, x, y, v, start, settings)
        }
    }?;

    debug!(
        estimator = %estimator,
        tau2 = result.tau2,
        truncated = result.truncated,
        iterations = result.iterations,
        "estimated tau-squared"
    );
    Ok(result)
}

/// Method of moments: `(Q_E - (k - p)) / tr(P0)`
pub fn dersimonian_laird(x: &DMatrix<f64>, y: &DVector<f64>, v: &DVector<f64>) -> Result<Tau2Estimate> {
    let k = y.len() as f64;
    let p = x.ncols() as f64;
    let fixed = Projection::at(x, y, v, 0.0)?;
    let q = fixed.quadratic();
    let trace = fixed.p_matrix(x).trace();
    if !(trace > 0.0) {
        return Err(Error::Computation(
            "trace of the fixed-effect projection is not positive".to_string(),
        ));
    }
    let raw = (q - (k - p)) / trace;
    Ok(Tau2Estimate {
        tau2: raw.max(0.0),
        truncated: raw < 0.0,
        iterations: 0,
    })
}

/// Generalised Q estimator: solve `Q(tau2) = k - p`
pub fn paule_mandel(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    settings: &Settings,
) -> Result<Tau2Estimate> {
    let target = (y.len() - x.ncols()) as f64;
    let q_at = |tau2: f64| Projection::at(x, y, v, tau2).map(|proj| proj.quadratic());

    let q0 = q_at(0.0)?;
    if q0 <= target {
        return Ok(Tau2Estimate {
            tau2: 0.0,
            truncated: q0 < target,
            iterations: 0,
        });
    }

    // Q(tau2) decreases monotonically; double until the root is bracketed
    let mut upper = dersimonian_laird(x, y, v)?.tau2.max(0.01);
    let mut doublings = 0;
    while q_at(upper)? > target {
        upper *= 2.0;
        doublings += 1;
        if doublings > 100 {
            return Err(Error::no_convergence("Paule-Mandel bracketing", doublings));
        }
    }

    let mut failure = None;
    let tau2 = bisect(
        |tau2| match q_at(tau2) {
            Ok(q) => q - target,
            Err(e) => {
                failure = Some(e);
                f64::NAN
            }
        },
        0.0,
        upper,
        settings.tolerance,
        settings.max_iterations,
    )
    .map_err(|e| match e {
        Error::Convergence { iterations, .. } => Error::no_convergence("Paule-Mandel", iterations),
        other => other,
    })?;
    if let Some(e) = failure {
        return Err(e);
    }

    Ok(Tau2Estimate {
        tau2,
        truncated: false,
        iterations: doublings,
    })
}

/// Two-step estimator from an OLS-residual starting value
pub fn sidik_jonkman(x: &DMatrix<f64>, y: &DVector<f64>, v: &DVector<f64>) -> Result<Tau2Estimate> {
    let k = y.len() as f64;
    let p = x.ncols() as f64;
    let ols = weighted_least_squares(x, y, &DVector::from_element(y.len(), 1.0))?;
    let tau0 = ols.residuals.norm_squared() / k;
    if !(tau0 > 0.0) {
        return Ok(Tau2Estimate {
            tau2: 0.0,
            truncated: false,
            iterations: 0,
        });
    }
    let projection = Projection::at(x, y, v, tau0)?;
    Ok(Tau2Estimate {
        tau2: tau0 * projection.quadratic() / (k - p),
        truncated: false,
        iterations: 1,
    })
}

/// Fisher scoring for REML, ML and empirical Bayes with step halving at zero
fn fisher_scoring(
    estimator: Tau2Estimator,
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    v: &DVector<f64>,
    start: f64,
    settings: &Settings,
) -> Result<Tau2Estimate> {
    let k = y.len() as f64;
    let p = x.ncols() as f64;

    let step = |tau2: f64| -> Result<f64> {
        let projection = Projection::at(x, y, v, tau2)?;
        let w = &projection.weights;
        let adj = match estimator {
            Tau2Estimator::Reml => {
                let pm = projection.p_matrix(x);
                let trace_pp = pm.norm_squared();
                (projection.quadratic_squared() - pm.trace()) / trace_pp
            }
            Tau2Estimator::MaximumLikelihood => {
                (projection.quadratic_squared() - w.sum()) / w.norm_squared()
            }
            _ => (k / (k - p) * projection.quadratic() - k) / w.sum(),
        };
        if adj.is_finite() {
            Ok(adj)
        } else {
            Err(Error::non_finite("Fisher scoring step"))
        }
    };

    let mut tau2 = start.max(0.0);
    for iteration in 1..=settings.max_iterations {
        let adj = step(tau2)?;
        let mut delta = adj;
        let mut next = tau2 + delta;
        let mut halvings = 0;
        while next < 0.0 && halvings < 60 {
            delta /= 2.0;
            next = tau2 + delta;
            halvings += 1;
        }
        let next = next.max(0.0);
        let change = (next - tau2).abs();
        tau2 = next;

        if change < settings.tolerance {
            let on_boundary = adj < 0.0 && tau2 < BOUNDARY;
            return Ok(Tau2Estimate {
                tau2: if on_boundary { 0.0 } else { tau2 },
                truncated: on_boundary,
                iterations: iteration,
            });
        }
    }

    Err(Error::no_convergence(estimator.label(), settings.max_iterations))
}
