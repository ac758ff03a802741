use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meta_stats::prelude::*;
use meta_stats::{EffectSizeBatch, EffectSizeRecord};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

/// `studies` studies with one to three effect sizes each
fn generate_batch(studies: usize, seed: u64) -> EffectSizeBatch {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut records = Vec::new();
    for s in 0..studies {
        let study_effect = 0.3 + rng.gen_range(-0.25..0.25);
        let design = if s % 3 == 0 { "quasi" } else { "rct" };
        for e in 0..rng.gen_range(1..=3) {
            let variance = rng.gen_range(0.01..0.08);
            let g = study_effect + rng.gen_range(-0.1..0.1);
            records.push(
                EffectSizeRecord::new(format!("s{s}"), format!("{e}"), g, variance)
                    .with_moderator("design", ModeratorValue::categorical(design))
                    .with_moderator("year", ModeratorValue::Continuous(2000.0 + (s % 20) as f64)),
            );
        }
    }
    EffectSizeBatch::new(records)
}

fn generate_rows(n: usize, seed: u64) -> Vec<RawRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let input = match i % 3 {
                0 => RawInput::MeansSds {
                    mean1: 50.0 + rng.gen_range(0.0..8.0),
                    sd1: rng.gen_range(8.0..12.0),
                    n1: rng.gen_range(20..80),
                    mean2: 50.0,
                    sd2: rng.gen_range(8.0..12.0),
                    n2: rng.gen_range(20..80),
                },
                1 => RawInput::TStatistic {
                    t: rng.gen_range(0.0..3.0),
                    n1: rng.gen_range(20..80),
                    n2: rng.gen_range(20..80),
                },
                _ => RawInput::Correlation {
                    r: rng.gen_range(0.0..0.4),
                    n: rng.gen_range(40..200),
                },
            };
            RawRecord::new(format!("s{i}"), "1", input)
        })
        .collect()
}

fn bench_analyze(c: &mut Criterion) {
    let analysis = MetaAnalysis::new(AnalysisConfig::default()).unwrap();
    let mut group = c.benchmark_group("analyze");
    group.sample_size(10);
    for studies in [10, 25, 50] {
        let batch = generate_batch(studies, 42);
        group.bench_with_input(BenchmarkId::new("studies", studies), &batch, |b, batch| {
            b.iter(|| analysis.analyze(black_box(batch)))
        });
    }
    group.finish();
}

fn bench_run(c: &mut Criterion) {
    let analysis = MetaAnalysis::new(AnalysisConfig::default()).unwrap();
    let rows = generate_rows(30, 7);
    c.bench_function("run/30 rows", |b| b.iter(|| analysis.run(black_box(&rows))));
}

fn bench_gosh(c: &mut Criterion) {
    let analysis = MetaAnalysis::new(AnalysisConfig::default().with_gosh_subset_cap(2_000)).unwrap();
    let batch = generate_batch(12, 3);
    c.bench_function("gosh/12 studies", |b| {
        b.iter(|| analysis.sensitivity_engine().gosh(black_box(&batch)))
    });
}

criterion_group!(benches, bench_analyze, bench_run, bench_gosh);
criterion_main!(benches);
