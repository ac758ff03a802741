//! Leave-one-out, influence, refits and GOSH

use approx::assert_abs_diff_eq;
use meta_core::{
    AnalysisConfig, DependenceModel, EffectSizeBatch, EffectSizeRecord, ModeratorValue,
};
use meta_heterogeneity::Structure;
use meta_sensitivity::{LooUnit, SensitivityEngine, Subset};
use proptest::prelude::*;

fn engine() -> SensitivityEngine {
    SensitivityEngine::new(&AnalysisConfig::default()).unwrap()
}

/// Four effects near 0.2 and one at 3.0
fn outlier_batch() -> EffectSizeBatch {
    let data = [(0.20, 0.04), (0.25, 0.05), (0.15, 0.04), (0.18, 0.05), (3.0, 0.04)];
    EffectSizeBatch::new(
        data.iter()
            .enumerate()
            .map(|(i, &(g, v))| EffectSizeRecord::new(format!("study-{i}"), "1", g, v)),
    )
}

#[test]
fn test_outlier_dominates_influence() {
    let diagnostics = engine().influence(&outlier_batch()).unwrap();
    assert_abs_diff_eq!(diagnostics.baseline.point_estimate, 0.7574, epsilon = 1e-3);
    assert_abs_diff_eq!(diagnostics.thresholds.cooks_distance, 0.8, epsilon = 1e-12);

    let influential: Vec<&str> = diagnostics.influential().map(|r| r.study_id.as_str()).collect();
    assert_eq!(influential, vec!["study-4"]);

    let outlier = &diagnostics.records[4];
    assert_abs_diff_eq!(outlier.cooks_distance, 1.008, epsilon = 5e-3);
    assert!(outlier.outlier);
    assert!(outlier.studentized_residual > 3.0);
    assert!(outlier.dffits > 0.0);
    assert_abs_diff_eq!(outlier.estimate_without, 0.1928, epsilon = 1e-3);
    assert!(outlier.ci_without.contains(outlier.estimate_without));

    for record in &diagnostics.records[..4] {
        assert!(!record.is_flagged(), "{}", record.study_id);
        assert!(!record.high_leverage);
    }
    assert_eq!(diagnostics.main_structure, Structure::TwoLevel);
}

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
fn test_influence_reports_three_level_main_model() {
    let batch = clustered_batch();
    let config = AnalysisConfig::default().with_dependence_model(DependenceModel::ThreeLevel);
    let three_level = SensitivityEngine::new(&config).unwrap().influence(&batch).unwrap();
    assert_eq!(three_level.main_structure, Structure::ThreeLevel);

    // the diagnostics themselves stay two-level whatever the main model
    let config = AnalysisConfig::default().with_dependence_model(DependenceModel::TwoLevel);
    let two_level = SensitivityEngine::new(&config).unwrap().influence(&batch).unwrap();
    assert_eq!(two_level.main_structure, Structure::TwoLevel);
    assert_eq!(three_level.records, two_level.records);
    assert_eq!(three_level.baseline, two_level.baseline);
}

#[test]
fn test_outlier_has_largest_leave_one_out_change() {
    let loo = engine().leave_one_out(&outlier_batch(), LooUnit::Auto).unwrap();
    assert_eq!(loo.unit, LooUnit::EffectSize);
    assert_eq!(loo.rows.len(), 5);
    assert!(loo.rows.iter().all(|r| r.removed == 1));

    let largest = loo.most_influential().unwrap();
    assert_eq!(largest.label, "study-4/1");
    assert_abs_diff_eq!(largest.change.unwrap(), -0.5646, epsilon = 1e-3);
    // neither estimate differs from zero at 0.05
    assert!(!loo.fragile);
}

#[test]
fn test_outlier_refit_removes_flagged_case() {
    let refit = engine().outlier_refit(&outlier_batch()).unwrap();
    assert_eq!(refit.n_excluded(), 1);
    assert_eq!(refit.excluded[0].study_id, "study-4");
    assert_abs_diff_eq!(refit.shift().unwrap(), -0.5646, epsilon = 1e-3);
    assert_eq!(refit.refit.as_ref().unwrap().k, 4);
}

#[test]
fn test_equal_variances_are_robust_to_estimator_choice() {
    let batch = EffectSizeBatch::new(
        [0.30, 0.32, 0.28, 0.31, 0.29]
            .iter()
            .enumerate()
            .map(|(i, &g)| EffectSizeRecord::new(format!("s{i}"), "1", g, 0.04)),
    );
    let comparison = engine().estimator_comparison(&batch).unwrap();
    assert_eq!(comparison.results.len(), 6);
    assert!(comparison.results.iter().all(|r| r.estimate.is_ok()));
    assert!(comparison.range.unwrap() < 1e-10);
    assert!(comparison.robust);
}

fn nested_batch() -> EffectSizeBatch {
    EffectSizeBatch::new((0..6).flat_map(|s| {
        let design = if s < 4 { "rct" } else { "quasi" };
        (0..2).map(move |e| {
            EffectSizeRecord::new(format!("s{s}"), format!("{e}"), 0.2 + 0.05 * s as f64 + 0.02 * e as f64, 0.03)
                .with_moderator("design", ModeratorValue::categorical(design))
                .with_moderator("year", ModeratorValue::Continuous(2020.0 - s as f64))
        })
    }))
}

#[test]
fn test_leave_one_study_out() {
    let loo = engine().leave_one_out(&nested_batch(), LooUnit::Auto).unwrap();
    assert_eq!(loo.unit, LooUnit::Study);
    assert_eq!(loo.rows.len(), 6);
    assert!(loo.rows.iter().all(|r| r.removed == 2));
    assert_eq!(loo.rows[0].label, "s0");
}

#[test]
fn test_subset_refits() {
    let subsets = vec![
        Subset::moderator_level("design", "rct"),
        Subset::new("late studies", |r| r.study_id.as_str() >= "s4"),
        Subset::moderator_level("design", "cohort"),
    ];
    let comparison = engine().subsets(&nested_batch(), &subsets).unwrap();
    assert_eq!(comparison.baseline.k, 12);

    let rct = &comparison.subsets[0];
    assert_eq!(rct.label, "design = rct");
    assert_eq!((rct.k, rct.n_studies), (8, 4));
    assert!(rct.difference(&comparison.baseline).unwrap() < 0.0);

    assert_eq!(comparison.subsets[1].k, 4);
    let empty = &comparison.subsets[2];
    assert_eq!(empty.k, 0);
    assert!(empty.estimate.is_err());
}

#[test]
fn test_cumulative_adds_studies_in_key_order() {
    let mut records: Vec<EffectSizeRecord> = nested_batch().records().to_vec();
    records.push(EffectSizeRecord::new("undated", "1", 0.4, 0.03));
    let batch = EffectSizeBatch::new(records);

    let cumulative = engine().cumulative(&batch, "year").unwrap();
    assert_eq!(cumulative.excluded_missing, 1);
    assert_eq!(cumulative.steps.len(), 6);
    // year decreases with the study index
    assert_eq!(cumulative.steps[0].study_id, "s5");
    assert_eq!(cumulative.steps[0].k, 2);
    assert!(cumulative.steps.windows(2).all(|w| w[0].key <= w[1].key));
    assert!(cumulative.steps.windows(2).all(|w| w[1].k == w[0].k + 2));

    let full = engine().leave_one_out(&nested_batch(), LooUnit::Study).unwrap().baseline;
    let last = cumulative.final_estimate().unwrap();
    assert_eq!(last.k, 12);
    assert_abs_diff_eq!(last.point_estimate, full.point_estimate, epsilon = 1e-10);
}

#[test]
fn test_gosh_is_exhaustive_below_cap() {
    let gosh = engine().gosh(&outlier_batch()).unwrap();
    assert!(gosh.exhaustive);
    assert_eq!(gosh.seed, None);
    assert_eq!(gosh.possible_subsets, 26.0);
    assert_eq!(gosh.fits.len() + gosh.failures, 26);
}

#[test]
fn test_gosh_samples_above_cap() {
    let config = AnalysisConfig::default().with_gosh_subset_cap(10).with_seed(11);
    let engine = SensitivityEngine::new(&config).unwrap();
    let first = engine.gosh(&outlier_batch()).unwrap();
    assert!(!first.exhaustive);
    assert_eq!(first.seed, Some(11));
    assert_eq!(first.fits.len() + first.failures, 10);
    assert_eq!(first, engine.gosh(&outlier_batch()).unwrap());
}

#[test]
fn test_report_bundles_every_analysis() {
    let report = engine().run(&outlier_batch());
    assert!(report.leave_one_out.is_ok());
    assert_eq!(report.outlier_refit.unwrap().n_excluded(), 1);
    assert_eq!(report.estimator_comparison.unwrap().results.len(), 6);
    assert!(report.influence.is_ok());

    let tiny = EffectSizeBatch::new(vec![EffectSizeRecord::new("a", "1", 0.3, 0.02)]);
    let report = engine().run(&tiny);
    assert!(report.leave_one_out.is_err());
    assert!(report.influence.is_err());
    assert!(report.outlier_refit.is_err());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_hat_values_sum_to_parameter_count(
        effects in prop::collection::vec((-1.0f64..1.0, 0.01f64..0.2), 3..10)
    ) {
        let batch = EffectSizeBatch::new(
            effects.iter().enumerate().map(|(i, &(g, v))| EffectSizeRecord::new(format!("s{i}"), "1", g, v)),
        );
        if let Ok(diagnostics) = engine().influence(&batch) {
            let total: f64 = diagnostics.records.iter().map(|r| r.hat_value).sum();
            prop_assert!((total - 1.0).abs() < 1e-8);
            prop_assert_eq!(diagnostics.records.len(), batch.len());
        }
    }
}
