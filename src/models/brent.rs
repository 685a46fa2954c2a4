use crate::models::shape::shape_residual;
use crate::models::ZSolver;
use crate::state::{Method, PricingQuery};

/// Relative x-tolerance floor, as in the usual brentq formulation.
const RTOL: f64 = 4.0 * f64::EPSILON;

/// Derivative-free bracketed search (Brent-Dekker).
///
/// The bracket is located by stepping `[z, z + step]` outward from `start`
/// until f changes sign or `z + step` passes `ceiling`, then refined with
/// inverse quadratic / secant steps guarded by bisection.
#[derive(Debug, Clone, Copy)]
pub struct BrentSolver {
    pub start: f64,
    pub step: f64,
    pub ceiling: f64,
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for BrentSolver {
    fn default() -> Self {
        Self {
            start: 1.0,
            step: 1.0,
            ceiling: 1e6,
            tolerance: 1e-10,
            max_iterations: 10_000,
        }
    }
}

/// Result of the outward scan.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Scan {
    Bracket(f64, f64),
    ExactRoot(f64),
}

impl BrentSolver {
    fn scan(&self, query: &PricingQuery) -> Option<Scan> {
        if !(self.step > 0.0) || !self.start.is_finite() {
            return None;
        }
        let f = |z: f64| shape_residual(z, query.x, query.y);

        let mut z1 = self.start;
        let mut f1 = f(z1);
        let mut z2 = z1 + self.step;

        while z2 <= self.ceiling {
            if f1 == 0.0 {
                return Some(Scan::ExactRoot(z1));
            }
            let f2 = f(z2);
            if f2 == 0.0 {
                return Some(Scan::ExactRoot(z2));
            }
            if (f1 > 0.0) != (f2 > 0.0) {
                return Some(Scan::Bracket(z1, z2));
            }
            z1 = z2;
            f1 = f2;
            z2 += self.step;
        }
        None
    }

    /// Brent-Dekker refinement on a bracket with a strict sign change.
    /// `None` when the iteration budget runs out.
    pub fn refine(&self, query: &PricingQuery, a: f64, b: f64) -> Option<f64> {
        let f = |z: f64| shape_residual(z, query.x, query.y);

        let (mut xpre, mut xcur) = (a, b);
        let (mut fpre, mut fcur) = (f(xpre), f(xcur));
        let (mut xblk, mut fblk) = (0.0_f64, 0.0_f64);
        let (mut spre, mut scur) = (0.0_f64, 0.0_f64);

        if fpre == 0.0 {
            return Some(xpre);
        }
        if fcur == 0.0 {
            return Some(xcur);
        }
        if (fpre > 0.0) == (fcur > 0.0) {
            return None;
        }

        for _ in 0..self.max_iterations {
            if fpre != 0.0 && fcur != 0.0 && (fpre > 0.0) != (fcur > 0.0) {
                xblk = xpre;
                fblk = fpre;
                spre = xcur - xpre;
                scur = spre;
            }
            if fblk.abs() < fcur.abs() {
                xpre = xcur;
                xcur = xblk;
                xblk = xpre;
                fpre = fcur;
                fcur = fblk;
                fblk = fpre;
            }

            let delta = 0.5 * (self.tolerance + RTOL * xcur.abs());
            let sbis = 0.5 * (xblk - xcur);
            if fcur == 0.0 || sbis.abs() < delta {
                return Some(xcur);
            }

            let interpolate = spre.abs() > delta
                && fcur.abs() < fpre.abs()
                && fcur.is_finite()
                && fpre.is_finite()
                && fblk.is_finite();

            if interpolate {
                let stry = if xpre == xblk {
                    // secant
                    -fcur * (xcur - xpre) / (fcur - fpre)
                } else {
                    // inverse quadratic
                    let dpre = (fpre - fcur) / (xpre - xcur);
                    let dblk = (fblk - fcur) / (xblk - xcur);
                    -fcur * (fblk * dblk - fpre * dpre) / (dblk * dpre * (fblk - fpre))
                };
                if stry.is_finite() && 2.0 * stry.abs() < spre.abs().min(3.0 * sbis.abs() - delta) {
                    spre = scur;
                    scur = stry;
                } else {
                    spre = sbis;
                    scur = sbis;
                }
            } else {
                spre = sbis;
                scur = sbis;
            }

            xpre = xcur;
            fpre = fcur;
            if scur.abs() > delta {
                xcur += scur;
            } else {
                xcur += if sbis > 0.0 { delta } else { -delta };
            }
            fcur = f(xcur);
        }

        None
    }
}

impl ZSolver for BrentSolver {
    fn method(&self) -> Method {
        Method::Brent
    }

    fn solve(&self, query: &PricingQuery) -> Option<f64> {
        match self.scan(query) {
            Some(Scan::ExactRoot(z)) => Some(z),
            Some(Scan::Bracket(a, b)) => {
                let root = self.refine(query, a, b);
                if root.is_none() {
                    tracing::debug!(x = query.x, y = query.y, a, b, "brent: iteration budget exhausted");
                }
                root
            }
            None => {
                tracing::debug!(x = query.x, y = query.y, ceiling = self.ceiling, "brent: no bracket found");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shape::model_value;

    #[test]
    fn test_recovers_known_z() {
        for &(x, z) in &[(0.8, 2.0), (1.0, 4.0), (1.3, 6.5), (2.0, 1.5)] {
            let q = PricingQuery::new(x, model_value(z, x)).unwrap();
            let found = BrentSolver::default().solve(&q).expect("bracket exists");
            assert!((found - z).abs() < 1e-6, "x={x}: expected z={z}, got {found}");
        }
    }

    #[test]
    fn test_scan_finds_unit_bracket() {
        let x = 0.9;
        let q = PricingQuery::new(x, model_value(3.4, x)).unwrap();
        let scan = BrentSolver::default().scan(&q);
        assert_eq!(scan, Some(Scan::Bracket(3.0, 4.0)));
    }

    #[test]
    fn test_scan_returns_exact_root_at_ceiling() {
        // At x = 1, y(2) = sqrt(2) - 1 exactly as evaluated, so f(2) == 0.
        let q = PricingQuery::new(1.0, model_value(2.0, 1.0)).unwrap();
        let solver = BrentSolver { ceiling: 2.0, ..BrentSolver::default() };
        assert_eq!(solver.scan(&q), Some(Scan::ExactRoot(2.0)));
    }

    #[test]
    fn test_no_root_for_zero_target_below_one() {
        let q = PricingQuery::new(0.5, 0.0).unwrap();
        let solver = BrentSolver { ceiling: 5_000.0, ..BrentSolver::default() };
        assert_eq!(solver.scan(&q), None);
    }

    #[test]
    fn test_scan_respects_ceiling() {
        let x = 0.9;
        let q = PricingQuery::new(x, model_value(30.5, x)).unwrap();
        let solver = BrentSolver { ceiling: 20.0, ..BrentSolver::default() };
        assert!(solver.solve(&q).is_none());
    }

    #[test]
    fn test_budget_exhaustion_is_no_solution() {
        let x = 0.9;
        let q = PricingQuery::new(x, model_value(3.4, x)).unwrap();
        let solver = BrentSolver { max_iterations: 1, tolerance: 1e-14, ..BrentSolver::default() };
        assert!(solver.solve(&q).is_none());
    }

    #[test]
    fn test_no_root_case() {
        let q = PricingQuery::new(1.5, 0.0).unwrap();
        let solver = BrentSolver { ceiling: 2_000.0, ..BrentSolver::default() };
        assert!(solver.solve(&q).is_none());
    }
}
