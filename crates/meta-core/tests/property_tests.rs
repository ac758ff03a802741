//! Property-based tests for the shared numerical helpers
//!
//! These tests check the invariants every downstream component relies on:
//! adjusted p-values stay ordered and bounded, ranks are a permutation of
//! 1..=n up to ties, and Kendall's tau stays in [-1, 1].

#[cfg(test)]
mod property_tests {
    use meta_core::benjamini_hochberg;
    use meta_core::linalg::weighted_least_squares;
    use meta_core::rank::{average_ranks, kendall_tau_b};
    use nalgebra::{DMatrix, DVector};
    use proptest::prelude::*;

    proptest! {
        // Property: q-values are bounded by [p, 1] and preserve the order of p
        #[test]
        fn prop_bh_bounded_and_monotone(p in prop::collection::vec(0.0..1.0f64, 1..40)) {
            let q = benjamini_hochberg(&p);
            prop_assert_eq!(q.len(), p.len());

            for (raw, adj) in p.iter().zip(&q) {
                prop_assert!(*adj >= *raw - 1e-15);
                prop_assert!(*adj <= 1.0);
            }
            for i in 0..p.len() {
                for j in 0..p.len() {
                    if p[i] < p[j] {
                        prop_assert!(q[i] <= q[j] + 1e-15);
                    }
                }
            }
        }

        // Property: average ranks always sum to n(n+1)/2
        #[test]
        fn prop_rank_sum(values in prop::collection::vec(-5.0..5.0f64, 1..60)) {
            let ranks = average_ranks(&values);
            let n = values.len() as f64;
            let total: f64 = ranks.iter().sum();
            prop_assert!((total - n * (n + 1.0) / 2.0).abs() < 1e-9);
        }

        // Property: tau-b lies in [-1, 1] and flips sign when one variable is negated
        #[test]
        fn prop_kendall_bounds(
            pairs in prop::collection::vec((-10.0..10.0f64, -10.0..10.0f64), 5..40)
        ) {
            let x: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let y: Vec<f64> = pairs.iter().map(|p| p.1).collect();
            if let Ok(k) = kendall_tau_b(&x, &y) {
                prop_assert!(k.tau >= -1.0 - 1e-12 && k.tau <= 1.0 + 1e-12);
                prop_assert!((0.0..=1.0).contains(&k.p_value));

                let neg: Vec<f64> = y.iter().map(|v| -v).collect();
                let flipped = kendall_tau_b(&x, &neg).unwrap();
                prop_assert!((flipped.tau + k.tau).abs() < 1e-12);
            }
        }

        // Property: the intercept-only WLS estimate is the weighted mean
        #[test]
        fn prop_wls_weighted_mean(
            rows in prop::collection::vec((-3.0..3.0f64, 0.01..10.0f64), 1..30)
        ) {
            let n = rows.len();
            let y = DVector::from_iterator(n, rows.iter().map(|r| r.0));
            let w = DVector::from_iterator(n, rows.iter().map(|r| r.1));
            let x = DMatrix::from_element(n, 1, 1.0);

            let fit = weighted_least_squares(&x, &y, &w).unwrap();
            let expected = y.dot(&w) / w.sum();
            prop_assert!((fit.beta[0] - expected).abs() < 1e-9);
            prop_assert!((fit.bread[(0, 0)] - 1.0 / w.sum()).abs() < 1e-9);
        }
    }
}
