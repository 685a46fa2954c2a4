use crate::errors::{CalibError, CalibResult};
use portable_atomic::{AtomicU64, Ordering};
use std::str::FromStr;
use tokio::sync::oneshot;

// ── Price series ──

/// One period-average price sample. `seq` is the position in the series,
/// not wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PriceObservation {
    pub seq: i64,
    pub price: f64,
}

/// Trend (E1) and dispersion (E2) of ln(price) over the trailing window
/// ending at `index` (0-based position in the input series).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct TrendWindowResult {
    pub index: usize,
    pub slope: f64,
    pub dispersion: f64,
}

// ── Calibration inputs ──

/// Normalized calibration input: `x` = underlying / strike, `y` = option value / strike.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct PricingQuery {
    pub x: f64,
    pub y: f64,
}

impl PricingQuery {
    pub fn new(x: f64, y: f64) -> CalibResult<Self> {
        if !x.is_finite() || x <= 0.0 {
            return Err(CalibError::InvalidQuery(format!("x must be finite and > 0, got {x}")));
        }
        if !y.is_finite() || y < 0.0 {
            return Err(CalibError::InvalidQuery(format!("y must be finite and >= 0, got {y}")));
        }
        Ok(Self { x, y })
    }

    /// Build a query from a raw trade. Option prices are quoted in the base
    /// coin, so the traded price is converted to quote currency through the
    /// index price before normalizing by the strike.
    pub fn from_trade(option_price: f64, index_price: f64, strike: f64) -> CalibResult<Self> {
        if !strike.is_finite() || strike <= 0.0 {
            return Err(CalibError::InvalidQuery(format!("strike must be > 0, got {strike}")));
        }
        if !index_price.is_finite() || index_price <= 0.0 {
            return Err(CalibError::InvalidQuery(format!(
                "index price must be > 0, got {index_price}"
            )));
        }
        Self::new(index_price / strike, option_price * index_price / strike)
    }
}

// ── Calibration outputs ──

/// The strategy that produced a calibration result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Bisection,
    Brent,
    Newton,
    Annealing,
}

impl Method {
    pub const ALL: [Method; 4] = [Method::Newton, Method::Brent, Method::Bisection, Method::Annealing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bisection => "bisection",
            Self::Brent => "brent",
            Self::Newton => "newton",
            Self::Annealing => "annealing",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which solving path `calibrate_z` takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Bisection,
    Brent,
    Newton,
    Annealing,
    /// Warm-started Newton, Newton from 1.0, then bisection.
    Auto,
}

impl FromStr for Strategy {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bisection" | "bisect" => Ok(Self::Bisection),
            "brent" | "brentq" => Ok(Self::Brent),
            "newton" | "fsolve" => Ok(Self::Newton),
            "annealing" | "dual_annealing" => Ok(Self::Annealing),
            "auto" => Ok(Self::Auto),
            other => Err(CalibError::Parse(format!("unknown strategy: {other}"))),
        }
    }
}

/// Outcome of one calibration. `z` is absent when no strategy produced an
/// in-domain root; `residual` is always recomputed from the returned `z`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CalibrationResult {
    pub z: Option<f64>,
    pub residual: Option<f64>,
    pub method: Method,
}

impl CalibrationResult {
    pub fn no_solution(method: Method) -> Self {
        Self { z: None, residual: None, method }
    }

    #[inline]
    pub fn is_solved(&self) -> bool {
        self.z.is_some()
    }
}

// ── Trades ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementPeriod {
    Day,
    Week,
    Month,
}

impl SettlementPeriod {
    /// Feature series and the short/long window lengths whose E1/E2 are
    /// attached to trades of this settlement period.
    pub fn covariate_source(&self) -> (&'static str, [usize; 2]) {
        match self {
            Self::Day => ("hourly", [24, 72]),
            Self::Week | Self::Month => ("daily", [30, 90]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

impl FromStr for SettlementPeriod {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(CalibError::Parse(format!("unknown settlement period: {other}"))),
        }
    }
}

/// A historical option trade as supplied by the store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub instrument_name: String,
    /// Traded price, in the base coin.
    pub price: f64,
    pub index_price: f64,
    pub timestamp_ms: i64,
    pub creation_timestamp_ms: Option<i64>,
    pub settlement_period: Option<SettlementPeriod>,
}

// ── DB Commands (sent to writer task via bounded channel) ──

#[derive(Debug)]
pub enum DbCommand {
    UpsertTrend {
        series: String,
        window: usize,
        seq: i64,
        slope: f64,
        dispersion: f64,
    },
    UpsertMovingAverage {
        series: String,
        window: usize,
        seq: i64,
        value: Option<f64>,
    },
    UpsertCovariate {
        trade_id: String,
        series: String,
        window: usize,
        slope: f64,
        dispersion: f64,
    },
    /// Acknowledged once every command queued before it has been executed.
    Flush {
        reply: oneshot::Sender<()>,
    },
    UpsertCalibration {
        trade_id: String,
        strike: f64,
        x: f64,
        y: f64,
        inv_t: Option<f64>,
        method: Method,
        z: Option<f64>,
        residual: Option<f64>,
    },
}

// ── Run counters (lock-free) ──

pub struct RunCounters {
    pub windows_computed: AtomicU64,
    pub trades_calibrated: AtomicU64,
    pub no_solutions: AtomicU64,
    pub trades_skipped: AtomicU64,
    pub covariates_attached: AtomicU64,
    pub jobs_failed: AtomicU64,
}

impl RunCounters {
    pub fn new() -> Self {
        Self {
            windows_computed: AtomicU64::new(0),
            trades_calibrated: AtomicU64::new(0),
            no_solutions: AtomicU64::new(0),
            trades_skipped: AtomicU64::new(0),
            covariates_attached: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            windows_computed: self.windows_computed.load(Ordering::Relaxed),
            trades_calibrated: self.trades_calibrated.load(Ordering::Relaxed),
            no_solutions: self.no_solutions.load(Ordering::Relaxed),
            trades_skipped: self.trades_skipped.load(Ordering::Relaxed),
            covariates_attached: self.covariates_attached.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for RunCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RunSummary {
    pub windows_computed: u64,
    pub trades_calibrated: u64,
    pub no_solutions: u64,
    pub trades_skipped: u64,
    pub covariates_attached: u64,
    pub jobs_failed: u64,
}
