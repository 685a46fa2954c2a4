pub mod shape;
pub mod bisection;
pub mod brent;
pub mod newton;
pub mod annealing;
pub mod calibration;

use crate::state::{Method, PricingQuery};

/// All z-solving strategies implement this trait.
/// solve() must be a pure function: deterministic output from the query and
/// the solver's own parameters. It never panics; any numerical failure is
/// reported as `None`.
pub trait ZSolver: Send + Sync {
    fn method(&self) -> Method;

    /// Find z with f(z; x, y) = 0. The candidate is not domain-checked here;
    /// the calibration layer verifies z >= 1 and recomputes the residual.
    fn solve(&self, query: &PricingQuery) -> Option<f64>;
}
