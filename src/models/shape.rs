/// Single-parameter shape model.
///
/// y(z) = (1 + x^z)^(1/z) - 1
///
/// f(z; x, y) = y(z) - y
///
/// Everything is evaluated in the log domain:
///
///   a = z ln x,  s = ln(1 + e^a),  y(z) = expm1(s / z)
///
/// with a numerically stable softplus for s. `expm1` keeps the relative
/// precision of y(z) when s / z is tiny (x < 1, large z). Overflow, NaN, or z <= 0 maps
/// to the sentinel `f64::INFINITY`, so bracketing code can still read a sign
/// from the value and the global search can treat it as an infinite cost.

/// Sentinel for "function value at infinity".
pub const OVERFLOW: f64 = f64::INFINITY;

/// y(z) > 0 for every finite z; a value that underflows to zero is
/// reported as this instead, so f keeps its sign for y = 0.
pub const UNDERFLOW_FLOOR: f64 = f64::MIN_POSITIVE;

/// ln(1 + e^a) without overflowing for large `a`.
#[inline]
fn softplus(a: f64) -> f64 {
    if a > 0.0 {
        a + (-a).exp().ln_1p()
    } else {
        a.exp().ln_1p()
    }
}

/// 1 / (1 + e^-a), stable on both tails.
#[inline]
fn logistic(a: f64) -> f64 {
    if a >= 0.0 {
        1.0 / (1.0 + (-a).exp())
    } else {
        let e = a.exp();
        e / (1.0 + e)
    }
}

/// y(z) for the given x. Returns `OVERFLOW` when any step is non-finite.
#[inline]
pub fn model_value(z: f64, x: f64) -> f64 {
    if !(z > 0.0) || !(x > 0.0) {
        return OVERFLOW;
    }
    let a = z * x.ln();
    if a.is_nan() {
        return OVERFLOW;
    }
    let v = (softplus(a) / z).exp_m1();
    if !v.is_finite() {
        return OVERFLOW;
    }
    v.max(UNDERFLOW_FLOOR)
}

/// f(z; x, y) = y(z) - y, or `OVERFLOW`.
#[inline]
pub fn shape_residual(z: f64, x: f64, y: f64) -> f64 {
    let v = model_value(z, x);
    if v == OVERFLOW {
        return OVERFLOW;
    }
    let r = v - y;
    if r.is_nan() {
        OVERFLOW
    } else {
        r
    }
}

/// ln y(z) - ln y. Monotone in z like f but well scaled when y is tiny,
/// so far-off points still differ. `OVERFLOW` for y <= 0 (no root) or a
/// non-finite value.
pub fn log_shape_residual(z: f64, x: f64, y: f64) -> f64 {
    if !(y > 0.0) {
        return OVERFLOW;
    }
    let v = model_value(z, x);
    if v == OVERFLOW {
        return OVERFLOW;
    }
    let r = v.ln() - y.ln();
    if r.is_finite() {
        r
    } else {
        OVERFLOW
    }
}

/// df/dz, analytic. `None` when the derivative is not finite.
///
/// With h(z) = s(z)/z and g = e^h:  h' = (z ln x sigma(a) - s) / z^2,  f' = g h'.
pub fn shape_derivative(z: f64, x: f64) -> Option<f64> {
    if !(z > 0.0) || !(x > 0.0) {
        return None;
    }
    let ln_x = x.ln();
    let a = z * ln_x;
    let s = softplus(a);
    let g = (s / z).exp();
    let h_prime = (z * ln_x * logistic(a) - s) / (z * z);
    let d = g * h_prime;
    d.is_finite().then_some(d)
}

/// True when f changes sign (or vanishes) between two evaluations.
/// Works on signs only, so infinite values never produce NaN.
#[inline]
pub fn brackets_root(fa: f64, fb: f64) -> bool {
    if fa == 0.0 || fb == 0.0 {
        return true;
    }
    (fa > 0.0) != (fb > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_one_is_sum() {
        // (1 + x)^(1) - 1 = x
        for &x in &[0.2, 0.95, 1.0, 1.5, 7.0] {
            let v = model_value(1.0, x);
            assert!((v - x).abs() < 1e-12, "y(1) for x={x} was {v}");
        }
    }

    #[test]
    fn test_x_one_closed_form() {
        for &z in &[1.0, 2.0, 5.0, 40.0] {
            let expected = 2f64.powf(1.0 / z) - 1.0;
            assert!((model_value(z, 1.0) - expected).abs() < 1e-13);
        }
    }

    #[test]
    fn test_matches_direct_evaluation_in_safe_range() {
        let (z, x, y) = (3.5_f64, 1.3_f64, 0.2_f64);
        let direct = (1.0 + x.powf(z)).powf(1.0 / z) - 1.0 - y;
        assert!((shape_residual(z, x, y) - direct).abs() < 1e-12);
    }

    #[test]
    fn test_log_domain_survives_where_direct_overflows() {
        let (z, x) = (900.0_f64, 3.0_f64);
        let direct = (1.0 + x.powf(z)).powf(1.0 / z) - 1.0;
        assert!(!direct.is_finite(), "direct path should overflow");
        let v = model_value(z, x);
        assert!((v - 2.0).abs() < 1e-9, "large-z limit is x - 1, got {v}");
    }

    #[test]
    fn test_overflow_sentinel() {
        assert_eq!(shape_residual(0.0, 0.9, 0.1), OVERFLOW);
        assert_eq!(shape_residual(-2.0, 0.9, 0.1), OVERFLOW);
        // inf * ln(1) is NaN
        assert_eq!(shape_residual(f64::INFINITY, 1.0, 0.1), OVERFLOW);
        // inf / inf in the final exponent
        assert_eq!(shape_residual(f64::INFINITY, 4.0, 0.1), OVERFLOW);
        // huge but finite inputs stay finite in the log domain
        assert!(shape_residual(1e10, 1e300, 0.0).is_finite());
    }

    #[test]
    fn test_small_values_keep_precision() {
        // x^z / z dominates for x < 1 and large z: 0.5^60 / 60 ~ 1.447e-20.
        let v = model_value(60.0, 0.5);
        let expected = 0.5f64.powi(60).ln_1p() / 60.0;
        assert!(v > 0.0);
        assert!((v - expected).abs() / expected < 1e-12, "got {v}, expected {expected}");
    }

    #[test]
    fn test_model_value_never_reaches_zero() {
        for &z in &[100.0, 1_000.0, 5_000.0, 1e6] {
            let v = model_value(z, 0.5);
            assert!(v > 0.0, "y({z}) = {v}");
            assert!(shape_residual(z, 0.5, 0.0) > 0.0);
        }
    }

    #[test]
    fn test_log_residual() {
        let (z, x) = (150.0, 0.9);
        let y = model_value(z, x);
        assert!(log_shape_residual(z, x, y).abs() < 1e-12);
        assert!(log_shape_residual(z - 10.0, x, y) > 1.0);
        assert!(log_shape_residual(z + 10.0, x, y) < -1.0);
        assert_eq!(log_shape_residual(z, x, 0.0), OVERFLOW);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let (z, x) = (2.5, 0.8);
        let h = 1e-6;
        let fd = (model_value(z + h, x) - model_value(z - h, x)) / (2.0 * h);
        let d = shape_derivative(z, x).unwrap();
        assert!((d - fd).abs() < 1e-7, "analytic {d} vs finite difference {fd}");
        assert!(d < 0.0, "y(z) decreases in z");
    }

    #[test]
    fn test_brackets_root_with_infinities() {
        assert!(brackets_root(OVERFLOW, -0.1));
        assert!(!brackets_root(OVERFLOW, 0.3));
        assert!(brackets_root(0.0, 5.0));
        assert!(!brackets_root(-1.0, -2.0));
    }
}
