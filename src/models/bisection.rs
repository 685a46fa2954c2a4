use crate::models::shape::{brackets_root, shape_residual};
use crate::models::ZSolver;
use crate::state::{Method, PricingQuery};

/// Domain floor of the shape parameter.
pub const Z_FLOOR: f64 = 1.0;

/// Step by which the lower end is walked down when the initial bracket
/// shows no sign change.
const EXPANSION_STEP: f64 = 10.0;

const MAX_HALVINGS: usize = 200;

/// Bracketing bisection on [lower, upper].
///
/// Always returns a point inside the final bracket, and only bisects a
/// bracket whose endpoints satisfy f(lo) * f(hi) <= 0.
#[derive(Debug, Clone, Copy)]
pub struct BisectionSolver {
    pub lower: f64,
    pub upper: f64,
    pub tolerance: f64,
}

impl Default for BisectionSolver {
    fn default() -> Self {
        Self { lower: 1.0, upper: 1000.0, tolerance: 1e-10 }
    }
}

/// A bracket with a verified sign change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bracket {
    pub lo: f64,
    pub hi: f64,
}

impl BisectionSolver {
    pub fn new(lower: f64, upper: f64, tolerance: f64) -> Self {
        Self { lower, upper, tolerance }
    }

    /// Find a sign-changing bracket, walking the lower end down toward the
    /// domain floor in steps of 10. Never goes below 1.
    pub fn find_bracket(&self, query: &PricingQuery) -> Option<Bracket> {
        let f = |z: f64| shape_residual(z, query.x, query.y);
        let hi = self.upper;
        let f_hi = f(hi);
        let mut lo = self.lower.max(Z_FLOOR);

        loop {
            if brackets_root(f(lo), f_hi) {
                return Some(Bracket { lo, hi });
            }
            if lo <= Z_FLOOR {
                return None;
            }
            lo = (lo - EXPANSION_STEP).max(Z_FLOOR);
        }
    }

    /// Bisect a verified bracket down to the z tolerance.
    pub fn refine(&self, query: &PricingQuery, bracket: Bracket) -> f64 {
        let f = |z: f64| shape_residual(z, query.x, query.y);
        let Bracket { mut lo, mut hi } = bracket;
        let mut f_lo = f(lo);
        if f_lo == 0.0 {
            return lo;
        }
        if f(hi) == 0.0 {
            return hi;
        }

        for _ in 0..MAX_HALVINGS {
            if (hi - lo).abs() <= self.tolerance {
                break;
            }
            let mid = lo + 0.5 * (hi - lo);
            let f_mid = f(mid);
            if f_mid == 0.0 {
                return mid;
            }
            if brackets_root(f_lo, f_mid) {
                hi = mid;
            } else {
                lo = mid;
                f_lo = f_mid;
            }
        }

        lo + 0.5 * (hi - lo)
    }
}

impl ZSolver for BisectionSolver {
    fn method(&self) -> Method {
        Method::Bisection
    }

    fn solve(&self, query: &PricingQuery) -> Option<f64> {
        if !(self.upper > self.lower.max(Z_FLOOR)) {
            return None;
        }
        match self.find_bracket(query) {
            Some(bracket) => Some(self.refine(query, bracket)),
            None => {
                tracing::debug!(x = query.x, y = query.y, "bisection: no sign change in bounds");
                None
            }
        }
    }
}
