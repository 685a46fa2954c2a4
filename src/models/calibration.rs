//! Calibration orchestration.
//!
//! Two call modes over the same four strategies:
//! - `calibrate_z`: one answer per query (a single strategy, or the `Auto`
//!   fallback chain: warm-started Newton, Newton from 1.0, bisection).
//! - `compare_strategies`: every strategy runs independently and keeps its
//!   own verified result for offline comparison.
//!
//! Every candidate goes through `verify`: it must be finite, satisfy z >= 1,
//! its residual is recomputed and must be within `RESIDUAL_ACCEPTANCE`, and
//! f must change sign within a relative `ROOT_CHECK_WIDTH` of it. The last
//! check rejects points where |f| is small only because y is small.

use crate::errors::{CalibError, CalibResult};
use crate::models::annealing::{AnnealingConfig, AnnealingSolver};
use crate::models::bisection::{BisectionSolver, Z_FLOOR};
use crate::models::brent::BrentSolver;
use crate::models::newton::{NewtonConfig, NewtonSolver};
use crate::models::shape::{brackets_root, shape_residual};
use crate::models::ZSolver;
use crate::state::{CalibrationResult, Method, PricingQuery, Strategy};
use smallvec::SmallVec;

/// Largest |f(z)| accepted from any strategy.
pub const RESIDUAL_ACCEPTANCE: f64 = 1e-8;

/// Half-width, relative to z, of the interval on which an accepted root
/// must show a sign change of f.
pub const ROOT_CHECK_WIDTH: f64 = 1e-7;

/// Canonical Newton seed, used for the single retry.
pub const CANONICAL_SEED: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CalibrationOptions {
    pub strategy: Strategy,
    /// Newton seed (warm start)
    pub seed: f64,
    pub tolerance: f64,
    pub lower: f64,
    pub upper: f64,
    /// Brent bracket search: step and ceiling
    pub brent_step: f64,
    pub brent_ceiling: f64,
    /// Brent refinement budget
    pub max_iterations: usize,
    pub annealing_iterations: usize,
    pub annealing_rng_seed: u64,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::Auto,
            seed: CANONICAL_SEED,
            tolerance: 1e-10,
            lower: 1.0,
            upper: 1000.0,
            brent_step: 1.0,
            brent_ceiling: 1e6,
            max_iterations: 10_000,
            annealing_iterations: 1000,
            annealing_rng_seed: 42,
        }
    }
}

impl CalibrationOptions {
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self { strategy, ..Self::default() }
    }

    /// Check the options and clamp the lower bound to the domain floor.
    pub fn validated(&self) -> CalibResult<Self> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(CalibError::InvalidOptions(format!(
                "tolerance must be finite and > 0, got {}",
                self.tolerance
            )));
        }
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return Err(CalibError::InvalidOptions("bounds must be finite".into()));
        }
        let lower = self.lower.max(Z_FLOOR);
        if self.upper <= lower {
            return Err(CalibError::InvalidOptions(format!(
                "upper bound {} must exceed lower bound {lower}",
                self.upper
            )));
        }
        if !self.seed.is_finite() {
            return Err(CalibError::InvalidOptions(format!("seed must be finite, got {}", self.seed)));
        }
        if !(self.brent_step > 0.0) || !(self.brent_ceiling > 0.0) {
            return Err(CalibError::InvalidOptions("brent step and ceiling must be > 0".into()));
        }
        Ok(Self { lower, ..*self })
    }

    fn bisection(&self) -> BisectionSolver {
        BisectionSolver::new(self.lower, self.upper, self.tolerance)
    }

    fn brent(&self) -> BrentSolver {
        BrentSolver {
            start: Z_FLOOR,
            step: self.brent_step,
            ceiling: self.brent_ceiling,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }
    }

    fn newton(&self, seed: f64) -> NewtonSolver {
        NewtonSolver::with_config(seed, NewtonConfig { tolerance: self.tolerance, ..NewtonConfig::default() })
    }

    fn annealing(&self) -> AnnealingSolver {
        AnnealingSolver::new(
            self.lower,
            self.upper,
            AnnealingConfig {
                max_iterations: self.annealing_iterations,
                rng_seed: self.annealing_rng_seed,
                ..AnnealingConfig::default()
            },
        )
    }
}

/// Results of all four strategies for one query, in run order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StrategyComparison {
    pub results: SmallVec<[CalibrationResult; 4]>,
}

impl StrategyComparison {
    pub fn get(&self, method: Method) -> Option<&CalibrationResult> {
        self.results.iter().find(|r| r.method == method)
    }
}

/// Domain and residual check on a strategy's candidate.
pub fn verify(method: Method, query: &PricingQuery, candidate: Option<f64>) -> CalibrationResult {
    let Some(z) = candidate else {
        return CalibrationResult::no_solution(method);
    };
    if !z.is_finite() || z < Z_FLOOR {
        tracing::debug!(%method, z, "candidate outside z >= 1, rejected");
        return CalibrationResult::no_solution(method);
    }
    let residual = shape_residual(z, query.x, query.y);
    if !residual.is_finite() || residual.abs() > RESIDUAL_ACCEPTANCE {
        tracing::debug!(%method, z, residual, "candidate residual above acceptance, rejected");
        return CalibrationResult::no_solution(method);
    }
    if residual != 0.0 {
        let lo = shape_residual(z * (1.0 - ROOT_CHECK_WIDTH), query.x, query.y);
        let hi = shape_residual(z * (1.0 + ROOT_CHECK_WIDTH), query.x, query.y);
        if !brackets_root(lo, hi) {
            tracing::debug!(%method, z, residual, "no sign change around candidate, rejected");
            return CalibrationResult::no_solution(method);
        }
    }
    CalibrationResult { z: Some(z), residual: Some(residual), method }
}

#[inline]
fn run(solver: &dyn ZSolver, query: &PricingQuery) -> CalibrationResult {
    verify(solver.method(), query, solver.solve(query))
}

/// Newton from `seed`; on failure with a non-canonical seed, one retry from 1.0.
fn newton_with_retry(options: &CalibrationOptions, query: &PricingQuery) -> CalibrationResult {
    let first = run(&options.newton(options.seed), query);
    if first.is_solved() || options.seed == CANONICAL_SEED {
        return first;
    }
    tracing::debug!(seed = options.seed, "newton failed from warm seed, retrying from 1.0");
    run(&options.newton(CANONICAL_SEED), query)
}

/// Calibrate one query on the configured strategy.
pub fn calibrate_z(query: &PricingQuery, options: &CalibrationOptions) -> CalibResult<CalibrationResult> {
    let options = options.validated()?;

    let result = match options.strategy {
        Strategy::Bisection => run(&options.bisection(), query),
        Strategy::Brent => run(&options.brent(), query),
        Strategy::Newton => newton_with_retry(&options, query),
        Strategy::Annealing => run(&options.annealing(), query),
        Strategy::Auto => {
            let newton = newton_with_retry(&options, query);
            if newton.is_solved() {
                newton
            } else {
                tracing::debug!(x = query.x, y = query.y, "newton exhausted, falling back to bisection");
                run(&options.bisection(), query)
            }
        }
    };

    Ok(result)
}

/// Run all four strategies independently on one query.
pub fn compare_strategies(query: &PricingQuery, options: &CalibrationOptions) -> CalibResult<StrategyComparison> {
    let options = options.validated()?;

    let results = Method::ALL
        .iter()
        .map(|method| match method {
            Method::Newton => newton_with_retry(&options, query),
            Method::Brent => run(&options.brent(), query),
            Method::Bisection => run(&options.bisection(), query),
            Method::Annealing => run(&options.annealing(), query),
        })
        .collect();

    Ok(StrategyComparison { results })
}

/// Seed for the next query after `result`: the accepted z, or the canonical
/// seed once a query failed.
#[inline]
pub fn next_seed(result: &CalibrationResult) -> f64 {
    result.z.unwrap_or(CANONICAL_SEED)
}

/// Calibrate a sequence of queries, threading the warm-start seed from each
/// result into the next call. Results are in input order.
pub fn calibrate_series(queries: &[PricingQuery], options: &CalibrationOptions) -> CalibResult<Vec<CalibrationResult>> {
    let mut opts = options.validated()?;
    let mut out = Vec::with_capacity(queries.len());
    for query in queries {
        let result = calibrate_z(query, &opts)?;
        opts.seed = next_seed(&result);
        out.push(result);
    }
    Ok(out)
}
