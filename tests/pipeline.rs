//! End-to-end runs of the full pipeline

use approx::assert_abs_diff_eq;
use meta_stats::heterogeneity::{Structure, TwoLevelFit};
use meta_stats::moderator::{LevelStatus, ModeratorAnalysis};
use meta_stats::prelude::*;
use meta_stats::{EffectSizeBatch, EffectSizeRecord};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pipeline() -> MetaAnalysis {
    init_tracing();
    MetaAnalysis::new(AnalysisConfig::default()).unwrap()
}

fn singles(data: &[(f64, f64)]) -> EffectSizeBatch {
    EffectSizeBatch::new(
        data.iter()
            .enumerate()
            .map(|(i, &(g, v))| EffectSizeRecord::new(format!("study-{i}"), "1", g, v)),
    )
}

#[test]
fn test_two_study_pooling() {
    let report = pipeline().analyze(&singles(&[(0.50, 0.04), (0.30, 0.05)])).unwrap();
    let pooled = &report.overall.pooled;

    assert_eq!(report.overall.selection.chosen, Structure::TwoLevel);
    assert_eq!(pooled.k, 2);
    assert!(pooled.point_estimate > 0.30 && pooled.point_estimate < 0.50);
    assert!(pooled.tau2().unwrap() >= 0.0);
    let i2 = pooled.i2().unwrap();
    assert!((0.0..=100.0).contains(&i2));

    // too few effect sizes for the bias methods, reported rather than fatal
    assert!(report.bias.egger.is_err());
    assert!(report.sensitivity.influence.is_err());
}

#[test]
fn test_means_and_sds_conversion() {
    let rows = vec![RawRecord::new(
        "worked",
        "1",
        RawInput::MeansSds {
            mean1: 82.4,
            sd1: 12.1,
            n1: 45,
            mean2: 74.6,
            sd2: 13.8,
            n2: 43,
        },
    )];
    let report = pipeline().run(&rows).unwrap();
    let record = &report.batch.records()[0];

    assert_abs_diff_eq!(record.g, 0.597, epsilon = 1e-3);
    assert_abs_diff_eq!(record.se_g, 0.218, epsilon = 1e-3);
    assert_abs_diff_eq!(record.ci_lower, 0.170, epsilon = 1e-3);
    assert_abs_diff_eq!(record.ci_upper, 1.024, epsilon = 1e-3);
    assert_eq!(report.overall.pooled.k, 1);
    assert!(report.overall.pooled.heterogeneity.is_none());
}

fn clustered_batch() -> EffectSizeBatch {
    let mut records: Vec<EffectSizeRecord> = [
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
    ]
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
fn test_dependence_correction_widens_uncertainty() {
    let analysis = pipeline();
    let batch = clustered_batch();
    let report = analysis.analyze(&batch).unwrap();

    assert!(report.overall.selection.dependence_present);
    let robust = report.dependence.correlated_effects.as_ref().unwrap().pooled().unwrap();
    let naive = TwoLevelFit::intercept_only(&batch, analysis.config())
        .unwrap()
        .pooled()
        .unwrap();
    assert_eq!(robust.n_studies, 11);
    assert!(robust.se > naive.se, "robust {} vs naive {}", robust.se, naive.se);
    assert!(report.dependence.rho_sweep.is_ok());
}

fn oversight_batch(levels: &[(&str, usize, f64)]) -> EffectSizeBatch {
    let mut offset = 0;
    let mut records = Vec::new();
    for &(level, k, centre) in levels {
        records.extend((0..k).map(|i| {
            let g = centre + 0.04 * ((i % 5) as f64 - 2.0);
            let v = 0.03 + 0.01 * (i % 3) as f64;
            EffectSizeRecord::new(format!("study-{}", offset + i), "1", g, v)
                .with_moderator("oversight", ModeratorValue::categorical(level))
        }));
        offset += k;
    }
    EffectSizeBatch::new(records)
}

#[test]
fn test_small_moderator_level_is_flagged() {
    let batch = oversight_batch(&[("A", 15, 0.30), ("B", 2, 0.80)]);
    let moderators = pipeline().moderators(&batch, &[ModeratorRequest::Subgroup("oversight".into())]);

    let entry = moderators.entry("oversight").unwrap();
    let analysis = match entry.outcome.as_ref().unwrap() {
        ModeratorAnalysis::Subgroup(analysis) => analysis,
        other => panic!("unexpected analysis {other:?}"),
    };
    let b = analysis.level("B").unwrap();
    assert_eq!(b.status, LevelStatus::BelowMinimum);
    assert!(b.is_insufficient());
    assert!(analysis.omnibus.is_err());
    assert_eq!(entry.raw_p, None);
    assert!(!entry.significant);
}

#[test]
fn test_omnibus_ignores_insufficient_levels() {
    let batch = oversight_batch(&[("A", 15, 0.30), ("B", 2, 0.80), ("C", 6, 0.90)]);
    let moderators = pipeline().moderators(&batch, &[ModeratorRequest::Subgroup("oversight".into())]);

    let entry = moderators.entry("oversight").unwrap();
    let Ok(ModeratorAnalysis::Subgroup(analysis)) = &entry.outcome else {
        panic!("subgroup analysis failed: {:?}", entry.outcome);
    };
    assert_eq!(analysis.omnibus.as_ref().unwrap().df, 1);
    assert!(entry.significant);
}

#[test]
fn test_outlier_is_flagged_by_sensitivity() {
    let batch = singles(&[(0.20, 0.04), (0.25, 0.05), (0.15, 0.04), (0.18, 0.05), (3.0, 0.04)]);
    let report = pipeline().analyze(&batch).unwrap();

    let influence = report.sensitivity.influence.as_ref().unwrap();
    assert_abs_diff_eq!(influence.thresholds.cooks_distance, 4.0 / 5.0, epsilon = 1e-12);
    let flagged: Vec<&str> = influence.influential().map(|r| r.study_id.as_str()).collect();
    assert_eq!(flagged, vec!["study-4"]);

    let loo = report.sensitivity.leave_one_out.as_ref().unwrap();
    assert_eq!(loo.most_influential().unwrap().label, "study-4/1");
    assert_eq!(report.sensitivity.outlier_refit.as_ref().unwrap().n_excluded(), 1);
}

#[test]
fn test_unconvertible_rows_are_reported() {
    let rows = vec![
        RawRecord::new("a", "1", RawInput::Correlation { r: 0.25, n: 120 }),
        RawRecord::new("b", "1", RawInput::TStatistic { t: 2.2, n1: 30, n2: 32 }),
        RawRecord::new(
            "c",
            "1",
            RawInput::FStatistic {
                f: 5.1,
                df_numerator: 2,
                n1: 40,
                n2: 40,
                direction: Direction::FavorsTreatment,
            },
        ),
        RawRecord::new("d", "1", RawInput::Correlation { r: 0.12, n: 80 }),
    ];
    let report = pipeline().run(&rows).unwrap();
    assert_eq!(report.batch.len(), 3);
    assert_eq!(report.rejections.len(), 1);
    assert_eq!(report.rejections[0].study_id, "c");
}

#[test]
fn test_empty_input_is_fatal() {
    let rows = vec![RawRecord::new("a", "1", RawInput::TStatistic { t: 1.0, n1: 1, n2: 1 })];
    assert!(pipeline().run(&rows).is_err());
}

#[test]
fn test_rerun_is_identical() {
    let analysis = pipeline();
    let batch = clustered_batch();
    let first = analysis.analyze(&batch).unwrap();
    let second = analysis.analyze(&batch).unwrap();
    assert_eq!(first, second);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        // Property: analysing the same batch twice gives the same pooled result and bias verdicts
        #[test]
        fn prop_analyze_is_repeatable(effects in prop::collection::vec((-1.0f64..1.0, 0.01f64..0.2), 3..10)) {
            let analysis = pipeline();
            let batch = singles(&effects);
            let (Ok(first), Ok(second)) = (analysis.analyze(&batch), analysis.analyze(&batch)) else {
                return Ok(());
            };

            let (a, b) = (&first.overall.pooled, &second.overall.pooled);
            prop_assert_eq!(a.k, effects.len());
            prop_assert_eq!(a.point_estimate.to_bits(), b.point_estimate.to_bits());
            prop_assert_eq!(a.se.to_bits(), b.se.to_bits());
            for method in [BiasMethod::TrimAndFill, BiasMethod::RosenthalFailSafe, BiasMethod::OrwinFailSafe] {
                prop_assert_eq!(first.bias.summary(method).verdict, second.bias.summary(method).verdict);
            }
        }
    }
}
