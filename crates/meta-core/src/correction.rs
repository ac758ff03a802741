//! Multiple-comparison correction

use ordered_float::OrderedFloat;

/// Benjamini-Hochberg adjusted p-values (q-values), in input order
///
/// Step-up procedure: sort ascending, scale each p by `m / rank`, then take
/// the running minimum from the largest rank down and cap at one. NaN
/// entries stay NaN and do not count towards `m`.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let mut adjusted = vec![f64::NAN; p_values.len()];
    let mut order: Vec<usize> = (0..p_values.len())
        .filter(|&i| !p_values[i].is_nan())
        .collect();
    if order.is_empty() {
        return adjusted;
    }
    order.sort_by_key(|&i| (OrderedFloat(p_values[i]), i));

    let m = order.len() as f64;
    let mut running = 1.0_f64;
    for (rank0, &idx) in order.iter().enumerate().rev() {
        let rank = (rank0 + 1) as f64;
        running = running.min((p_values[idx] * m / rank).min(1.0));
        adjusted[idx] = running;
    }
    adjusted
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_known_values() {
        // p.adjust(c(0.01, 0.04, 0.03, 0.20), "BH")
        let q = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.20]);
        assert_abs_diff_eq!(q[0], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(q[1], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[2], 0.04 * 4.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(q[3], 0.20, epsilon = 1e-12);
    }

    #[test]
    fn test_never_below_raw_and_capped() {
        let p = [0.5, 0.9, 0.001, 0.7];
        let q = benjamini_hochberg(&p);
        for (raw, adj) in p.iter().zip(&q) {
            assert!(adj >= raw);
            assert!(*adj <= 1.0);
        }
    }

    #[test]
    fn test_nan_passthrough() {
        let q = benjamini_hochberg(&[0.02, f64::NAN, 0.04]);
        assert!(q[1].is_nan());
        assert_abs_diff_eq!(q[0], 0.04, epsilon = 1e-12);
        assert_abs_diff_eq!(q[2], 0.04, epsilon = 1e-12);
        assert!(benjamini_hochberg(&[]).is_empty());
    }
}
