//! Global stochastic search: generalized simulated annealing over the bounds,
//! minimizing the squared log residual (ln y(z) - ln y)^2, followed by a
//! golden-section polish of the best point.
//!
//! The log residual has the same root as f but stays well scaled when y is
//! tiny, where f itself is flat at about -y for every z past the root.

use crate::models::shape::log_shape_residual;
use crate::models::ZSolver;
use crate::state::{Method, PricingQuery};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;
use statrs::function::gamma::ln_gamma;

/// Cap on a single visiting jump before it is replaced by a random one.
const TAIL_LIMIT: f64 = 1e8;
/// Minimum distance kept from the lower bound after wrapping.
const MIN_VISIT_BOUND: f64 = 1e-10;
/// Attempts at drawing a start point with finite fitness.
const MAX_REINIT: usize = 1000;
const POLISH_ROUNDS: usize = 16;
const GOLDEN_MAX_ITERATIONS: usize = 200;
const INV_PHI: f64 = 0.618_033_988_749_894_8;

#[derive(Debug, Clone, Copy)]
pub struct AnnealingConfig {
    pub max_iterations: usize,
    pub initial_temp: f64,
    pub restart_temp_ratio: f64,
    /// Visiting distribution parameter (qv), in (1, 3)
    pub visit: f64,
    /// Acceptance distribution parameter (qa)
    pub accept: f64,
    pub rng_seed: u64,
    pub polish_tolerance: f64,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            initial_temp: 5230.0,
            restart_temp_ratio: 2e-5,
            visit: 2.62,
            accept: -5.0,
            rng_seed: 42,
            polish_tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealingOutcome {
    pub z: f64,
    pub fitness: f64,
    pub evaluations: usize,
    /// The optimizer's own success flag: a finite best fitness was reached.
    pub success: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AnnealingSolver {
    pub lower: f64,
    pub upper: f64,
    pub config: AnnealingConfig,
}

impl Default for AnnealingSolver {
    fn default() -> Self {
        Self { lower: 1.0, upper: 1000.0, config: AnnealingConfig::default() }
    }
}

/// Squared log residual; any overflow (or y = 0) is an infinite cost.
#[inline]
fn fitness(z: f64, query: &PricingQuery) -> f64 {
    let r = log_shape_residual(z, query.x, query.y);
    let sq = r * r;
    if sq.is_finite() {
        sq
    } else {
        f64::INFINITY
    }
}

/// Tsallis visiting distribution, one dimension.
struct Visiting {
    qv: f64,
    factor2: f64,
    factor3: f64,
    factor6: f64,
    normal: Normal,
}

impl Visiting {
    fn new(qv: f64) -> Self {
        let factor2 = ((4.0 - qv) * (qv - 1.0).ln()).exp();
        let factor3 = ((2.0 - qv) * 2f64.ln() / (qv - 1.0)).exp();
        let factor5 = 1.0 / (qv - 1.0) - 0.5;
        let d1 = 2.0 - factor5;
        let factor6 = std::f64::consts::PI * (1.0 - factor5)
            / (std::f64::consts::PI * (1.0 - factor5)).sin()
            / ln_gamma(d1).exp();
        Self { qv, factor2, factor3, factor6, normal: Normal::standard() }
    }

    fn jump<R: Rng>(&self, temperature: f64, rng: &mut R) -> f64 {
        use rand::distributions::Distribution;

        let qv = self.qv;
        let factor1 = (temperature.ln() / (qv - 1.0)).exp();
        let factor4 = std::f64::consts::PI.sqrt() * factor1 * self.factor2 / (self.factor3 * (3.0 - qv));
        let sigmax = (-(qv - 1.0) * (self.factor6 / factor4).ln() / (3.0 - qv)).exp();

        let x = sigmax * self.normal.sample(rng);
        let y: f64 = self.normal.sample(rng);
        let den = ((qv - 1.0) * y.abs().ln() / (3.0 - qv)).exp();
        let step = x / den;

        if step.is_finite() && step.abs() <= TAIL_LIMIT {
            step
        } else {
            let sign = if step.is_sign_negative() { -1.0 } else { 1.0 };
            TAIL_LIMIT * rng.gen::<f64>() * sign
        }
    }
}

impl AnnealingSolver {
    pub fn new(lower: f64, upper: f64, config: AnnealingConfig) -> Self {
        Self { lower, upper, config }
    }

    /// Wrap a visited point back into [lower, upper).
    fn wrap(&self, z: f64) -> f64 {
        let span = self.upper - self.lower;
        let a = z - self.lower;
        let b = a % span + span;
        let mut w = b % span + self.lower;
        if (w - self.lower).abs() < MIN_VISIT_BOUND {
            w += MIN_VISIT_BOUND;
        }
        w
    }

    fn random_point<R: Rng>(&self, rng: &mut R) -> f64 {
        self.lower + rng.gen::<f64>() * (self.upper - self.lower)
    }

    /// Uniform start point with finite fitness.
    fn draw_start<R: Rng>(
        &self,
        query: &PricingQuery,
        rng: &mut R,
        evaluations: &mut usize,
    ) -> Option<(f64, f64)> {
        for _ in 0..MAX_REINIT {
            let z = self.random_point(rng);
            let e = fitness(z, query);
            *evaluations += 1;
            if e.is_finite() {
                return Some((z, e));
            }
        }
        None
    }

    /// Run the annealing schedule and polish the best point found.
    pub fn minimise(&self, query: &PricingQuery) -> AnnealingOutcome {
        let cfg = &self.config;
        let failed = |evaluations| AnnealingOutcome {
            z: f64::NAN,
            fitness: f64::INFINITY,
            evaluations,
            success: false,
        };

        if !(self.upper > self.lower) || !self.lower.is_finite() || !self.upper.is_finite() {
            return failed(0);
        }

        let mut rng = StdRng::seed_from_u64(cfg.rng_seed);
        let visiting = Visiting::new(cfg.visit);
        let mut evaluations = 0usize;

        let Some((mut current, mut current_e)) = self.draw_start(query, &mut rng, &mut evaluations) else {
            tracing::debug!(x = query.x, y = query.y, "annealing: no finite start point");
            return failed(evaluations);
        };
        let (mut best, mut best_e) = (current, current_e);

        let t1 = ((cfg.visit - 1.0) * 2f64.ln()).exp() - 1.0;
        let restart_temp = cfg.initial_temp * cfg.restart_temp_ratio;
        let mut step_index = 0usize;

        for _ in 0..cfg.max_iterations {
            let s = step_index as f64 + 2.0;
            let t2 = ((cfg.visit - 1.0) * s.ln()).exp() - 1.0;
            let temperature = cfg.initial_temp * t1 / t2;

            if temperature < restart_temp {
                match self.draw_start(query, &mut rng, &mut evaluations) {
                    Some((z, e)) => {
                        current = z;
                        current_e = e;
                    }
                    None => break,
                }
                step_index = 0;
                continue;
            }

            let temperature_step = temperature / (step_index as f64 + 1.0);

            // Two proposals per step: a full move and a single-coordinate
            // move, which coincide in one dimension.
            for _ in 0..2 {
                let candidate = self.wrap(current + visiting.jump(temperature, &mut rng));
                let e = fitness(candidate, query);
                evaluations += 1;
                if !e.is_finite() {
                    continue;
                }

                if e < current_e {
                    current = candidate;
                    current_e = e;
                    if e < best_e {
                        best = candidate;
                        best_e = e;
                    }
                } else {
                    let r: f64 = rng.gen();
                    let pqv_temp = 1.0 - (1.0 - cfg.accept) * (e - current_e) / temperature_step;
                    let pqv = if pqv_temp <= 0.0 {
                        0.0
                    } else {
                        (pqv_temp.ln() / (1.0 - cfg.accept)).exp()
                    };
                    if r <= pqv {
                        current = candidate;
                        current_e = e;
                    }
                }
            }

            step_index += 1;
        }

        let (polished, polished_e, polish_evals) = self.polish(query, best);
        evaluations += polish_evals;
        if polished_e < best_e {
            best = polished;
            best_e = polished_e;
        }

        AnnealingOutcome {
            z: best,
            fitness: best_e,
            evaluations,
            success: best_e.is_finite(),
        }
    }

    /// Golden-section search on |f| in a window around `start`, re-centred
    /// while the minimum lands on an interior window edge.
    fn polish(&self, query: &PricingQuery, start: f64) -> (f64, f64, usize) {
        let objective = |z: f64| {
            let r = log_shape_residual(z, query.x, query.y);
            if r.is_finite() { r.abs() } else { f64::INFINITY }
        };
        let tol = self.config.polish_tolerance;
        let width = 0.05 * (self.upper - self.lower);
        let mut center = start;
        let mut evaluations = 0usize;

        for _ in 0..POLISH_ROUNDS {
            let lo = (center - width).max(self.lower);
            let hi = (center + width).min(self.upper);
            let (z, evals) = golden_section(&objective, lo, hi, tol);
            evaluations += evals;
            let interior_edge = (z - lo <= 2.0 * tol && lo > self.lower)
                || (hi - z <= 2.0 * tol && hi < self.upper);
            center = z;
            if !interior_edge {
                break;
            }
        }

        (center, fitness(center, query), evaluations + 1)
    }
}

fn golden_section<F: Fn(f64) -> f64>(f: &F, mut a: f64, mut b: f64, tol: f64) -> (f64, usize) {
    let mut c = b - INV_PHI * (b - a);
    let mut d = a + INV_PHI * (b - a);
    let (mut fc, mut fd) = (f(c), f(d));
    let mut evaluations = 2;

    for _ in 0..GOLDEN_MAX_ITERATIONS {
        if (b - a).abs() <= tol {
            break;
        }
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - INV_PHI * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + INV_PHI * (b - a);
            fd = f(d);
        }
        evaluations += 1;
    }

    (0.5 * (a + b), evaluations)
}

impl ZSolver for AnnealingSolver {
    fn method(&self) -> Method {
        Method::Annealing
    }

    fn solve(&self, query: &PricingQuery) -> Option<f64> {
        let outcome = self.minimise(query);
        if outcome.success {
            Some(outcome.z)
        } else {
            None
        }
    }
}
