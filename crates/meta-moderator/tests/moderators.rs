//! Subgroups, meta-regression, interactions and moderator batches

use approx::assert_abs_diff_eq;
use meta_core::{
    AnalysisConfig, EffectSizeBatch, EffectSizeRecord, Error, ModelSelection, ModeratorValue,
};
use meta_heterogeneity::Structure;
use meta_moderator::{
    InteractionOutcome, LevelStatus, ModeratorAnalysis, ModeratorEngine, ModeratorRequest,
};
use proptest::prelude::*;

fn level_records(level: &str, k: usize, centre: f64, offset: usize) -> Vec<EffectSizeRecord> {
    (0..k)
        .map(|i| {
            let g = centre + 0.04 * ((i % 5) as f64 - 2.0);
            let v = 0.03 + 0.01 * (i % 3) as f64;
            EffectSizeRecord::new(format!("study-{}", offset + i), "1", g, v)
                .with_moderator("oversight", ModeratorValue::categorical(level))
        })
        .collect()
}

fn engine() -> ModeratorEngine {
    ModeratorEngine::new(&AnalysisConfig::default()).unwrap()
}

#[test]
fn test_small_level_is_reported_as_insufficient() {
    // A: k = 15, B: k = 2, min_k = 3
    let mut records = level_records("A", 15, 0.30, 0);
    records.extend(level_records("B", 2, 0.80, 100));
    let analysis = engine()
        .run_subgroup(&EffectSizeBatch::new(records), "oversight")
        .unwrap();

    assert_eq!(analysis.levels.len(), 2);
    let b = analysis.level("B").unwrap();
    assert_eq!(b.k, 2);
    assert_eq!(b.status, LevelStatus::BelowMinimum);
    assert!(b.is_insufficient());
    assert!(b.estimate.is_ok());
    assert_eq!(analysis.insufficient_levels().count(), 1);
    assert!(analysis.warnings.iter().any(|w| w.contains("insufficient data")));

    let a = analysis.level("A").unwrap();
    assert_eq!(a.status, LevelStatus::Sufficient);
    assert_eq!(a.estimate.as_ref().unwrap().k, 15);

    // a single tested level leaves no contrast to test
    match &analysis.omnibus {
        Err(e) => assert!(e.is_insufficient()),
        Ok(test) => panic!("omnibus test with df = {}", test.df),
    }
    assert!(!analysis.significant);
}

#[test]
fn test_omnibus_df_counts_only_sufficient_levels() {
    let mut records = level_records("A", 15, 0.30, 0);
    records.extend(level_records("B", 2, 0.80, 100));
    records.extend(level_records("C", 6, 0.90, 200));
    let analysis = engine()
        .run_subgroup(&EffectSizeBatch::new(records), "oversight")
        .unwrap();

    let omnibus = analysis.omnibus.as_ref().unwrap();
    assert_eq!(omnibus.df, 1);
    assert_eq!(omnibus.levels, vec!["A", "C"]);
    assert!(omnibus.p_value < 0.05);
    assert!(analysis.significant);
}

fn nested_batch() -> EffectSizeBatch {
    let studies = [
        (0.05, 0.10),
        (0.60, 0.55),
        (0.30, 0.38),
        (0.90, 0.82),
        (0.15, 0.22),
        (0.70, 0.78),
    ];
    EffectSizeBatch::new(studies.iter().enumerate().flat_map(|(s, &(a, b))| {
        let level = if s % 2 == 0 { "low" } else { "high" };
        vec![
            EffectSizeRecord::new(format!("s{s}"), "1", a, 0.02)
                .with_moderator("oversight", ModeratorValue::categorical(level)),
            EffectSizeRecord::new(format!("s{s}"), "2", b, 0.025)
                .with_moderator("oversight", ModeratorValue::categorical(level)),
        ]
    }))
}

#[test]
fn test_global_model_selection_is_used_in_every_level() {
    let config = AnalysisConfig::default().with_model_selection(ModelSelection::Global);
    let analysis = ModeratorEngine::new(&config)
        .unwrap()
        .run_subgroup(&nested_batch(), "oversight")
        .unwrap();

    for level in &analysis.levels {
        assert_eq!(level.structure, Some(Structure::ThreeLevel), "level {}", level.level);
        assert_eq!(level.n_studies, 3);
    }
    assert_eq!(analysis.omnibus.as_ref().unwrap().structure, Structure::ThreeLevel);
}

fn regression_batch(k: usize) -> EffectSizeBatch {
    EffectSizeBatch::new((0..k).map(|i| {
        let x = i as f64;
        let noise = if i % 2 == 0 { 0.02 } else { -0.02 };
        EffectSizeRecord::new(format!("study-{i}"), "1", 0.1 + 0.1 * x + noise, 0.01)
            .with_moderator("duration", ModeratorValue::Continuous(x))
    }))
}

#[test]
fn test_meta_regression_recovers_slope() {
    let regression = engine()
        .run_meta_regression(&regression_batch(9), "duration")
        .unwrap();

    assert_eq!(regression.slope.name, "duration");
    assert_abs_diff_eq!(regression.slope.estimate, 0.1, epsilon = 1e-6);
    assert!(regression.slope.p_value < 0.001);
    assert!(regression.slope.ci.contains(0.1));
    assert!(regression.r_squared().unwrap() > 0.9);
    assert_eq!(regression.model.k, 9);
    assert_eq!(regression.model.omnibus.df, 1);
}

#[test]
fn test_meta_regression_needs_minimum_k() {
    let result = engine().run_meta_regression(&regression_batch(4), "duration");
    assert!(matches!(
        result,
        Err(Error::InsufficientSample { expected: 5, actual: 4, .. })
    ));
}

fn interaction_batch(drop_last: bool) -> EffectSizeBatch {
    let deviations = [-0.03, -0.01, 0.01, 0.03];
    let mut records = Vec::new();
    for arch in ["x", "y"] {
        for context in ["p", "q"] {
            let cell = if arch == "y" && context == "q" { 0.5 } else { 0.2 };
            for (i, d) in deviations.iter().enumerate() {
                records.push(
                    EffectSizeRecord::new(format!("{arch}{context}-{i}"), "1", cell + d, 0.01)
                        .with_moderator("arch", ModeratorValue::categorical(arch))
                        .with_moderator("context", ModeratorValue::categorical(context)),
                );
            }
        }
    }
    if drop_last {
        records.pop();
    }
    EffectSizeBatch::new(records)
}

#[test]
fn test_interaction_with_full_cells() {
    let outcome = engine()
        .run_interaction(&interaction_batch(false), "arch", "context")
        .unwrap();
    let InteractionOutcome::Tested(test) = outcome else {
        panic!("interaction was not tested");
    };
    assert_eq!(test.cells.len(), 4);
    assert!(test.cells.iter().all(|c| c.k == 4));
    assert_eq!(test.wald.df, 1);
    assert_eq!(test.coefficients[0].name, "arch[y]:context[q]");
    assert_abs_diff_eq!(test.coefficients[0].estimate, 0.3, epsilon = 1e-6);
}

#[test]
fn test_interaction_with_small_cell_is_not_tested() {
    let outcome = engine()
        .run_interaction(&interaction_batch(true), "arch", "context")
        .unwrap();
    match outcome {
        InteractionOutcome::InsufficientData { cells, min_cell_k } => {
            assert_eq!(min_cell_k, 4);
            assert_eq!(cells.iter().filter(|c| c.k < 4).count(), 1);
        }
        InteractionOutcome::Tested(_) => panic!("interaction tested despite a cell with k = 3"),
    }
}

fn batch_with_two_moderators() -> EffectSizeBatch {
    EffectSizeBatch::new((0..12).map(|i| {
        let high = i % 2 == 1;
        let g = (if high { 0.75 } else { 0.25 }) + 0.02 * (i % 3) as f64;
        EffectSizeRecord::new(format!("study-{i}"), "1", g, 0.03)
            .with_moderator(
                "oversight",
                ModeratorValue::categorical(if high { "autonomous" } else { "supervised" }),
            )
            .with_moderator("year", ModeratorValue::Continuous(2015.0 + (i / 2) as f64))
    }))
}

#[test]
fn test_batch_reports_raw_and_adjusted_p_values() {
    let requests = vec![
        ModeratorRequest::Subgroup("oversight".to_string()),
        ModeratorRequest::Regression("year".to_string()),
        ModeratorRequest::Subgroup("context".to_string()),
    ];
    let batch = engine().run_batch(&batch_with_two_moderators(), &requests);

    assert!(batch.fdr_corrected);
    assert_eq!(batch.entries.len(), 3);

    let oversight = batch.entry("oversight").unwrap();
    assert!(matches!(oversight.outcome, Ok(ModeratorAnalysis::Subgroup(_))));
    let (raw, adjusted) = (oversight.raw_p.unwrap(), oversight.adjusted_p.unwrap());
    assert!(adjusted >= raw);
    assert!(oversight.significant);

    let year = batch.entry("year").unwrap();
    assert!(year.adjusted_p.unwrap() >= year.raw_p.unwrap());

    let context = batch.entry("context").unwrap();
    assert!(context.outcome.is_err());
    assert!(context.raw_p.is_none());
    assert!(!context.significant);
}

#[test]
fn test_batch_without_correction_keeps_raw_p_values() {
    let config = AnalysisConfig::default().with_fdr_correction(false);
    let requests = vec![
        ModeratorRequest::Subgroup("oversight".to_string()),
        ModeratorRequest::Regression("year".to_string()),
    ];
    let batch = ModeratorEngine::new(&config)
        .unwrap()
        .run_batch(&batch_with_two_moderators(), &requests);
    for entry in &batch.entries {
        assert_eq!(entry.raw_p, entry.adjusted_p);
    }
}

#[test]
fn test_subgroup_analysis_is_idempotent() {
    let mut records = level_records("A", 8, 0.30, 0);
    records.extend(level_records("B", 5, 0.60, 100));
    let batch = EffectSizeBatch::new(records);
    let first = engine().run_subgroup(&batch, "oversight").unwrap();
    let second = engine().run_subgroup(&batch, "oversight").unwrap();
    assert_eq!(first, second);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_omnibus_df_counts_sufficient_levels(sizes in prop::collection::vec(2usize..8, 2..5)) {
        let records: Vec<EffectSizeRecord> = sizes
            .iter()
            .enumerate()
            .flat_map(|(l, &k)| level_records(&format!("L{l}"), k, 0.2 * l as f64, 100 * l))
            .collect();
        let analysis = engine()
            .run_subgroup(&EffectSizeBatch::new(records), "oversight")
            .unwrap();
        let sufficient = sizes.iter().filter(|&&k| k >= 3).count();

        prop_assert_eq!(analysis.insufficient_levels().count(), sizes.len() - sufficient);
        match &analysis.omnibus {
            Ok(test) => prop_assert_eq!(test.df + 1, sufficient),
            Err(_) => prop_assert!(sufficient < 2),
        }
    }
}
