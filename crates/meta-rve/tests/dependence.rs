//! Robust variance estimation on dependent effect sizes

use approx::assert_abs_diff_eq;
use meta_core::{AnalysisConfig, DependenceModel, EffectSizeBatch, EffectSizeRecord, ModelKind};
use meta_heterogeneity::{Design, HeterogeneityModel, ThreeLevelFit, TwoLevelFit};
use meta_rve::{DependenceCorrector, SmallSampleCorrection, WeightingScheme};
use proptest::prelude::*;

/// Ten single-effect studies plus one study contributing three effect sizes
fn clustered_batch() -> EffectSizeBatch {
    let singles = [
        (0.32, 0.04),
        (0.18, 0.05),
        (0.41, 0.03),
        (0.25, 0.06),
        (0.36, 0.04),
        (0.22, 0.05),
        (0.30, 0.045),
        (0.44, 0.05),
        (0.28, 0.035),
        (0.20, 0.04),
    ];
    let mut records: Vec<EffectSizeRecord> = singles
        .iter()
        .enumerate()
        .map(|(i, &(g, v))| EffectSizeRecord::new(format!("single-{i}"), "1", g, v))
        .collect();
    for (j, g) in [0.74, 0.78, 0.70].iter().enumerate() {
        records.push(EffectSizeRecord::new("multi", format!("{}", j + 1), *g, 0.02));
    }
    EffectSizeBatch::new(records)
}

#[test]
fn test_correlated_effects_se_exceeds_naive_se() {
    let config = AnalysisConfig::default();
    let batch = clustered_batch();

    let naive = TwoLevelFit::intercept_only(&batch, &config).unwrap().pooled().unwrap();
    let robust = DependenceCorrector::new(&config)
        .unwrap()
        .correlated_effects(&batch)
        .unwrap();
    let pooled = robust.pooled().unwrap();

    assert_eq!(robust.correction, SmallSampleCorrection::Cr2);
    assert!(robust.warnings.is_empty());
    assert_eq!(pooled.model, ModelKind::CorrelatedEffects { rho: 0.8 });
    assert_eq!(pooled.n_studies, 11);
    assert!(pooled.se > naive.se, "robust {} vs naive {}", pooled.se, naive.se);

    assert_abs_diff_eq!(pooled.point_estimate, 0.37894, epsilon = 1e-4);
    assert_abs_diff_eq!(pooled.se, 0.07565, epsilon = 1e-4);
    assert_abs_diff_eq!(robust.coefficients[0].df, 8.8987, epsilon = 1e-3);
}

#[test]
fn test_rho_sweep_is_bounded() {
    let config = AnalysisConfig::default();
    let sweep = DependenceCorrector::new(&config)
        .unwrap()
        .rho_sweep(&clustered_batch())
        .unwrap();

    assert_eq!(sweep.points.len(), config.rho_sweep.len());
    assert!(sweep.points.iter().all(|p| p.estimate.is_finite() && p.se > 0.0));
    let lo = sweep.points.iter().map(|p| p.estimate).fold(f64::INFINITY, f64::min);
    let hi = sweep.points.iter().map(|p| p.estimate).fold(f64::NEG_INFINITY, f64::max);
    assert!(lo >= 0.18 && hi <= 0.78);
    assert!(sweep.range >= 0.0);
    assert!(sweep.robust);
}

#[test]
fn test_hierarchical_effects() {
    let config = AnalysisConfig::default();
    let fit = DependenceCorrector::new(&config)
        .unwrap()
        .hierarchical_effects(&clustered_batch())
        .unwrap();
    let pooled = fit.pooled().unwrap();
    assert_eq!(pooled.model, ModelKind::HierarchicalEffects);
    assert!(pooled.ci.contains(pooled.point_estimate));
    assert!(pooled.heterogeneity.unwrap().tau2() >= 0.0);
}

#[test]
fn test_sandwich_on_three_level_fit() {
    let config = AnalysisConfig::default().with_dependence_model(DependenceModel::ThreeLevel);
    let batch = clustered_batch();
    let analysis = HeterogeneityModel::new(&config).unwrap().fit(&batch).unwrap();

    let corrector = DependenceCorrector::new(&config).unwrap();
    let robust = corrector
        .sandwich(analysis.fit.as_model(), batch.clusters())
        .unwrap();
    assert_eq!(robust.model, ModelKind::ThreeLevel);
    let pooled = robust.pooled().unwrap();
    assert_abs_diff_eq!(pooled.point_estimate, analysis.pooled.point_estimate, epsilon = 1e-12);
    assert!(pooled.se > 0.0);
}

#[test]
fn test_cr2_falls_back_to_cr1() {
    // A dummy that singles out one single-effect study has leverage one
    let config = AnalysisConfig::default();
    let batch = clustered_batch();
    let flag: Vec<f64> = (0..batch.len()).map(|i| if i == 0 { 1.0 } else { 0.0 }).collect();
    let design = Design::intercept(batch.len()).with_column("first", &flag).unwrap();

    let fit = DependenceCorrector::new(&config)
        .unwrap()
        .fit(&batch, &design, WeightingScheme::CorrelatedEffects { rho: 0.8 })
        .unwrap();
    assert_eq!(fit.correction, SmallSampleCorrection::Cr1);
    assert_eq!(fit.warnings.len(), 1);
    assert_eq!(fit.coefficients[0].df, 9.0);
}

#[test]
fn test_three_level_sandwich_for_all_structures() {
    let config = AnalysisConfig::default();
    let batch = clustered_batch();
    let fit = ThreeLevelFit::fit(&batch, Design::intercept(batch.len()), &config).unwrap();
    let robust = DependenceCorrector::new(&config)
        .unwrap()
        .with_correction(SmallSampleCorrection::Cr1)
        .sandwich(&fit, batch.clusters())
        .unwrap();
    assert_eq!(robust.correction, SmallSampleCorrection::Cr1);
    assert_eq!(robust.coefficients[0].df, 10.0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_rho_sweep_stays_within_observed_effects(
        studies in prop::collection::vec(
            prop::collection::vec((-1.0f64..1.0, 0.01f64..0.1), 1..4),
            4..9,
        )
    ) {
        let batch = EffectSizeBatch::new(studies.iter().enumerate().flat_map(|(s, effects)| {
            effects
                .iter()
                .enumerate()
                .map(move |(e, &(g, v))| EffectSizeRecord::new(format!("s{s}"), format!("{e}"), g, v))
        }));
        let lo = batch.effects().iter().copied().fold(f64::INFINITY, f64::min);
        let hi = batch.effects().iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let corrector = DependenceCorrector::new(&AnalysisConfig::default()).unwrap();
        if let Ok(sweep) = corrector.rho_sweep(&batch) {
            for point in &sweep.points {
                prop_assert!(point.estimate.is_finite());
                prop_assert!(point.estimate >= lo - 1e-9 && point.estimate <= hi + 1e-9);
            }
            prop_assert!(sweep.range <= hi - lo + 1e-9);
        }
    }
}
