pub mod moving_average;
pub mod trend;

pub use moving_average::{moving_average, MovingAverage};
pub use trend::{fit_log_trend, rolling_features, TrendEngine, TrendWindows};
