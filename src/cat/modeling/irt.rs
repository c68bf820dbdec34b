//! Three-parameter logistic response model.
//!
//! `P(theta) = c + (1 - c) / (1 + exp(-a * (theta - b)))`

use crate::cat::types::ItemParams;

/// Lower clamp applied before any logarithm.
pub const PROBABILITY_FLOOR: f64 = 1e-4;
/// Upper clamp applied before any logarithm.
pub const PROBABILITY_CEIL: f64 = 0.9999;

/// Raw 3PL probability of a correct response.
pub fn probability(theta: f64, params: &ItemParams) -> f64 {
    let z = -params.a * (theta - params.b);
    params.c + (1.0 - params.c) / (1.0 + z.exp())
}

/// 3PL probability clamped to `[PROBABILITY_FLOOR, PROBABILITY_CEIL]`.
pub fn clamped_probability(theta: f64, params: &ItemParams) -> f64 {
    let p = probability(theta, params);
    if p.is_nan() {
        return PROBABILITY_FLOOR;
    }
    p.clamp(PROBABILITY_FLOOR, PROBABILITY_CEIL)
}

/// Log-likelihood contribution of one graded response.
pub fn log_likelihood(theta: f64, params: &ItemParams, correct: bool) -> f64 {
    let p = clamped_probability(theta, params);
    if correct {
        p.ln()
    } else {
        (1.0 - p).ln()
    }
}

/// Derivative of the log-likelihood of one response with respect to theta.
pub fn score(theta: f64, params: &ItemParams, correct: bool) -> f64 {
    let p = clamped_probability(theta, params);
    let u = if correct { 1.0 } else { 0.0 };
    params.a * (u - p) * (p - params.c) / (p * (1.0 - params.c))
}

/// Fisher information of one item at theta.
pub fn item_information(theta: f64, params: &ItemParams) -> f64 {
    let p = clamped_probability(theta, params);
    let num = params.a * params.a * (p - params.c).powi(2) * (1.0 - p);
    let den = p * (1.0 - params.c).powi(2);
    if den <= 0.0 {
        0.0
    } else {
        (num / den).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_probability_at_difficulty() {
        let params = ItemParams::new(1.0, 0.0, 0.25);
        assert!((probability(0.0, &params) - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_probability_tends_to_guessing_floor() {
        let params = ItemParams::new(2.0, 0.0, 0.2);
        assert!((probability(-50.0, &params) - 0.2).abs() < 1e-9);
        assert!((probability(50.0, &params) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamped_probability_bounds() {
        let params = ItemParams::new(5.0, 0.0, 0.0);
        assert_eq!(clamped_probability(-100.0, &params), PROBABILITY_FLOOR);
        assert_eq!(clamped_probability(100.0, &params), PROBABILITY_CEIL);
    }

    #[test]
    fn test_score_matches_finite_difference() {
        let params = ItemParams::new(1.3, 0.4, 0.2);
        let theta = 0.7;
        let h = 1e-6;
        for correct in [true, false] {
            let numeric = (log_likelihood(theta + h, &params, correct)
                - log_likelihood(theta - h, &params, correct))
                / (2.0 * h);
            assert!((numeric - score(theta, &params, correct)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_information_peaks_near_difficulty() {
        let params = ItemParams::new(1.5, 1.0, 0.0);
        let near = item_information(1.0, &params);
        let far = item_information(-2.0, &params);
        assert!(near > far);
    }

    proptest! {
        #[test]
        fn prop_probability_non_decreasing(
            a in 0.05f64..4.0,
            b in -3.0f64..3.0,
            c in 0.0f64..0.95,
            t1 in -6.0f64..6.0,
            dt in 0.0f64..6.0,
        ) {
            let params = ItemParams::new(a, b, c);
            prop_assert!(probability(t1 + dt, &params) >= probability(t1, &params) - 1e-12);
        }

        #[test]
        fn prop_clamped_in_range(
            a in 0.05f64..10.0,
            b in -5.0f64..5.0,
            c in 0.0f64..0.999,
            theta in -50.0f64..50.0,
        ) {
            let p = clamped_probability(theta, &ItemParams::new(a, b, c));
            prop_assert!((PROBABILITY_FLOOR..=PROBABILITY_CEIL).contains(&p));
        }
    }
}
