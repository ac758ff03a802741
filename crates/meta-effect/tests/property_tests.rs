//! Property-based tests for effect-size conversion
//!
//! These tests pin down the algebraic invariants of the conversion layer:
//! equivalent inputs agree, larger samples are more precise, swapping arms
//! negates g, and intervals always contain their estimate.

#[cfg(test)]
mod property_tests {
    use meta_core::AnalysisConfig;
    use meta_effect::conversions::{from_d, from_means, from_t};
    use meta_effect::{EffectSizeCalculator, RawInput};
    use proptest::prelude::*;

    fn arm() -> impl Strategy<Value = (f64, f64, u32)> {
        (-50.0..50.0f64, 0.5..20.0f64, 2u32..500)
    }

    proptest! {
        // Property: the means/SDs path and the equivalent t statistic give the same g
        #[test]
        fn prop_means_and_t_agree((m1, sd1, n1) in arm(), (m2, sd2, n2) in arm()) {
            let (n1f, n2f) = (f64::from(n1), f64::from(n2));
            let via_means = from_means(m1, sd1, n1f, m2, sd2, n2f).unwrap();

            let sp = (((n1f - 1.0) * sd1 * sd1 + (n2f - 1.0) * sd2 * sd2) / (n1f + n2f - 2.0)).sqrt();
            let t = (m1 - m2) / (sp * ((n1f + n2f) / (n1f * n2f)).sqrt());
            let via_t = from_t(t, n1f, n2f).unwrap();

            prop_assert!((via_means.g - via_t.g).abs() < 1e-9 * (1.0 + via_means.g.abs()));
            prop_assert!((via_means.variance - via_t.variance).abs() < 1e-9 * via_means.variance);
        }

        // Property: growing both arms at fixed g strictly shrinks the variance
        #[test]
        fn prop_variance_decreases_with_n(g in -3.0..3.0f64, n1 in 2.0..200.0f64, n2 in 2.0..200.0f64, extra in 1.0..100.0f64) {
            let small = meta_effect::conversions::hedges_variance(g, n1, n2);
            let large = meta_effect::conversions::hedges_variance(g, n1 + extra, n2 + extra);
            prop_assert!(large < small);
        }

        // Property: swapping treatment and control negates g and keeps the variance
        #[test]
        fn prop_swap_arms_negates((m1, sd1, n1) in arm(), (m2, sd2, n2) in arm()) {
            let forward = from_means(m1, sd1, f64::from(n1), m2, sd2, f64::from(n2)).unwrap();
            let swapped = from_means(m2, sd2, f64::from(n2), m1, sd1, f64::from(n1)).unwrap();
            prop_assert!((forward.g + swapped.g).abs() < 1e-12 * (1.0 + forward.g.abs()));
            prop_assert!((forward.variance - swapped.variance).abs() < 1e-12 * forward.variance);
        }

        // Property: CI contains g and widens with the confidence level
        #[test]
        fn prop_ci_containment(d in -4.0..4.0f64, n1 in 2u32..300, n2 in 2u32..300, level in 0.5..0.99f64) {
            let input = RawInput::ReportedD { d, n1, n2 };
            let narrow = EffectSizeCalculator::new(&AnalysisConfig::default().with_confidence_level(level))
                .unwrap()
                .compute(&input)
                .unwrap();
            let wide = EffectSizeCalculator::new(&AnalysisConfig::default().with_confidence_level(0.995))
                .unwrap()
                .compute(&input)
                .unwrap();

            prop_assert!(narrow.ci.lower <= narrow.g && narrow.g <= narrow.ci.upper);
            prop_assert!(wide.ci.width() > narrow.ci.width());
            prop_assert!((narrow.se * narrow.se - narrow.variance).abs() < 1e-12);
            prop_assert_eq!(narrow.g, from_d(d, f64::from(n1), f64::from(n2)).unwrap().g);
        }
    }
}
