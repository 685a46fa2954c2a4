//! Iterative local solve: Newton steps with Levenberg-Marquardt damping.

use crate::models::shape::{shape_derivative, shape_residual};
use crate::models::ZSolver;
use crate::state::{Method, PricingQuery};

/// Configuration for the damped Newton solver.
#[derive(Debug, Clone, Copy)]
pub struct NewtonConfig {
    /// Convergence tolerance on |f(z)| and on the Newton step relative to z
    pub tolerance: f64,
    /// Maximum iterations
    pub max_iterations: usize,
    /// Initial damping parameter (λ)
    pub initial_lambda: f64,
    /// Damping increase factor on a rejected step
    pub lambda_increase: f64,
    /// Damping decrease factor on an accepted step
    pub lambda_decrease: f64,
    /// Damping beyond which the solve is abandoned
    pub max_lambda: f64,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 500,
            initial_lambda: 1e-3,
            lambda_increase: 10.0,
            lambda_decrease: 0.1,
            max_lambda: 1e16,
        }
    }
}

/// Outcome of a local solve, before domain verification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonOutcome {
    pub z: f64,
    pub residual: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Damped Newton solver seeded at `seed`.
///
/// The step is δ = -f f' / (f'^2 (1 + λ)); λ → 0 is a pure Newton step and
/// large λ shortens it. A step is accepted only if it reduces |f|.
#[derive(Debug, Clone, Copy)]
pub struct NewtonSolver {
    pub seed: f64,
    pub config: NewtonConfig,
}

impl NewtonSolver {
    pub fn new(seed: f64, tolerance: f64) -> Self {
        Self {
            seed,
            config: NewtonConfig { tolerance, ..NewtonConfig::default() },
        }
    }

    pub fn with_config(seed: f64, config: NewtonConfig) -> Self {
        Self { seed, config }
    }

    /// Run the iteration and report whether it met both the residual and
    /// the relative step tolerance.
    pub fn iterate(&self, query: &PricingQuery) -> NewtonOutcome {
        let (x, y) = (query.x, query.y);
        let mut z = self.seed;
        let mut fz = shape_residual(z, x, y);
        let mut lambda = self.config.initial_lambda;

        let not_converged = |z: f64, fz: f64, iterations: usize| NewtonOutcome {
            z,
            residual: fz,
            iterations,
            converged: false,
        };

        if !fz.is_finite() {
            return not_converged(z, fz, 0);
        }

        for iteration in 0..self.config.max_iterations {
            if fz == 0.0 {
                return NewtonOutcome { z, residual: fz, iterations: iteration, converged: true };
            }

            let d = match shape_derivative(z, x) {
                Some(d) if d != 0.0 => d,
                _ => return not_converged(z, fz, iteration),
            };

            // |f| alone is meaningless when y itself is below the tolerance,
            // so the undamped step must also be small relative to z.
            if self.is_converged(z, fz, -fz / d) {
                return NewtonOutcome { z, residual: fz, iterations: iteration, converged: true };
            }

            // Inner loop: raise damping until the step reduces |f|.
            loop {
                let step = -fz * d / (d * d * (1.0 + lambda));
                let z_new = z + step;
                let f_new = if z_new > 0.0 { shape_residual(z_new, x, y) } else { f64::INFINITY };

                if f_new.is_finite() && f_new.abs() < fz.abs() {
                    z = z_new;
                    fz = f_new;
                    lambda = (lambda * self.config.lambda_decrease).max(f64::MIN_POSITIVE);
                    break;
                }

                lambda *= self.config.lambda_increase;
                if lambda > self.config.max_lambda || step.abs() <= f64::EPSILON * z.abs() {
                    return not_converged(z, fz, iteration);
                }
            }
        }

        let converged = match shape_derivative(z, x) {
            Some(d) if d != 0.0 => self.is_converged(z, fz, -fz / d),
            _ => fz == 0.0,
        };
        if converged {
            NewtonOutcome { z, residual: fz, iterations: self.config.max_iterations, converged: true }
        } else {
            not_converged(z, fz, self.config.max_iterations)
        }
    }

    #[inline]
    fn is_converged(&self, z: f64, fz: f64, newton_step: f64) -> bool {
        let tol = self.config.tolerance;
        fz.abs() < tol && newton_step.abs() <= tol * z.abs().max(1.0)
    }
}

impl Default for NewtonSolver {
    fn default() -> Self {
        Self { seed: 1.0, config: NewtonConfig::default() }
    }
}

impl ZSolver for NewtonSolver {
    fn method(&self) -> Method {
        Method::Newton
    }

    fn solve(&self, query: &PricingQuery) -> Option<f64> {
        let outcome = self.iterate(query);
        if outcome.converged {
            Some(outcome.z)
        } else {
            tracing::debug!(
                x = query.x,
                y = query.y,
                seed = self.seed,
                z = outcome.z,
                residual = outcome.residual,
                iterations = outcome.iterations,
                "newton: did not converge"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::shape::model_value;

    #[test]
    fn test_converges_from_unit_seed() {
        for &(x, z) in &[(0.8, 2.0), (0.95, 1.7), (1.0, 3.0), (1.2, 5.0), (2.0, 1.5)] {
            let q = PricingQuery::new(x, model_value(z, x)).unwrap();
            let outcome = NewtonSolver::default().iterate(&q);
            assert!(outcome.converged, "x={x} z={z}: {outcome:?}");
            assert!((outcome.z - z).abs() < 1e-5, "x={x}: expected {z}, got {}", outcome.z);
        }
    }

    #[test]
    fn test_small_residual_far_from_root_is_not_converged() {
        // y(150) ~ 9e-10 for x = 0.9: |f| < 1e-10 already holds near z = 149.
        for &(x, z) in &[(0.9, 150.0), (0.5, 20.0), (0.8, 60.0)] {
            let q = PricingQuery::new(x, model_value(z, x)).unwrap();
            let outcome = NewtonSolver::default().iterate(&q);
            assert!(outcome.converged, "x={x} z={z}: {outcome:?}");
            assert!(
                (outcome.z - z).abs() <= 1e-8 * z,
                "x={x}: expected {z}, got {}",
                outcome.z
            );
        }
    }

    #[test]
    fn test_zero_target_below_one_never_converges() {
        let q = PricingQuery::new(0.5, 0.0).unwrap();
        assert!(NewtonSolver::default().solve(&q).is_none());
    }

    #[test]
    fn test_seed_at_root_converges_immediately() {
        let x = 0.9;
        let q = PricingQuery::new(x, model_value(4.0, x)).unwrap();
        let outcome = NewtonSolver::new(4.0, 1e-10).iterate(&q);
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
    }

    #[test]
    fn test_no_root_does_not_converge() {
        let q = PricingQuery::new(1.5, 0.0).unwrap();
        assert!(NewtonSolver::default().solve(&q).is_none());
    }

    #[test]
    fn test_non_positive_seed_fails_cleanly() {
        let q = PricingQuery::new(0.9, 0.2).unwrap();
        assert!(NewtonSolver::new(0.0, 1e-10).solve(&q).is_none());
        assert!(NewtonSolver::new(-3.0, 1e-10).solve(&q).is_none());
    }
}
