//! Calibration of the shape parameter `z` of the option-pricing model
//! `y = (1 + x^z)^(1/z) - 1`, plus rolling trend/dispersion features over
//! price series.
//!
//! The `models` and `features` modules are pure and synchronous. `db` and
//! `config` serve the batch runner binary.

pub mod config;
pub mod db;
pub mod errors;
pub mod features;
pub mod instrument;
pub mod models;
pub mod state;

pub use errors::{CalibError, CalibResult};
pub use features::{moving_average, rolling_features, TrendEngine};
pub use instrument::{extract_strike, Instrument};
pub use models::calibration::{
    calibrate_series, calibrate_z, compare_strategies, CalibrationOptions, StrategyComparison,
    RESIDUAL_ACCEPTANCE,
};
pub use state::{CalibrationResult, Method, PricingQuery, Strategy, TrendWindowResult};
