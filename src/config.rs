use crate::errors::{CalibError, CalibResult};
use crate::features::trend::MIN_WINDOW as MIN_TREND_WINDOW;
use crate::models::calibration::CalibrationOptions;
use crate::state::Strategy;
use smallvec::SmallVec;
use std::path::PathBuf;
use std::str::FromStr;

pub type WindowList = SmallVec<[usize; 8]>;

/// How trades are calibrated by the batch runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Every strategy runs and is persisted separately.
    Compare,
    Single(Strategy),
}

impl FromStr for RunMode {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compare" | "all" => Ok(Self::Compare),
            other => other.parse::<Strategy>().map(Self::Single),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub mode: RunMode,
    pub tolerance: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub seed: f64,
    pub annealing_iterations: usize,
    pub annealing_rng_seed: u64,
    pub hourly_windows: WindowList,
    pub daily_windows: WindowList,
    pub hourly_moving_average_windows: WindowList,
    pub daily_moving_average_windows: WindowList,
}

impl AppConfig {
    pub fn from_env() -> CalibResult<Self> {
        dotenvy::dotenv().ok();

        let mode = env_var_or("ZCAL_STRATEGY", "compare")
            .parse::<RunMode>()
            .map_err(|e| CalibError::Config(format!("ZCAL_STRATEGY: {e}")))?;

        let tolerance = env_var_or("ZCAL_TOLERANCE", "1e-10")
            .parse::<f64>()
            .map_err(|e| CalibError::Config(format!("ZCAL_TOLERANCE: {e}")))?;

        let lower_bound = env_var_or("ZCAL_LOWER_BOUND", "1")
            .parse::<f64>()
            .map_err(|e| CalibError::Config(format!("ZCAL_LOWER_BOUND: {e}")))?;

        let upper_bound = env_var_or("ZCAL_UPPER_BOUND", "1000")
            .parse::<f64>()
            .map_err(|e| CalibError::Config(format!("ZCAL_UPPER_BOUND: {e}")))?;

        let seed = env_var_or("ZCAL_SEED", "1.0")
            .parse::<f64>()
            .map_err(|e| CalibError::Config(format!("ZCAL_SEED: {e}")))?;

        let annealing_iterations = env_var_or("ZCAL_ANNEALING_ITERATIONS", "1000")
            .parse::<usize>()
            .map_err(|e| CalibError::Config(format!("ZCAL_ANNEALING_ITERATIONS: {e}")))?;

        let annealing_rng_seed = env_var_or("ZCAL_ANNEALING_RNG_SEED", "42")
            .parse::<u64>()
            .map_err(|e| CalibError::Config(format!("ZCAL_ANNEALING_RNG_SEED: {e}")))?;

        let config = Self {
            data_dir: PathBuf::from(env_var_or("ZCAL_DATA_DIR", "data")),
            mode,
            tolerance,
            lower_bound,
            upper_bound,
            seed,
            annealing_iterations,
            annealing_rng_seed,
            hourly_windows: window_list("ZCAL_HOURLY_WINDOWS", "24,72", MIN_TREND_WINDOW)?,
            daily_windows: window_list("ZCAL_DAILY_WINDOWS", "30,90", MIN_TREND_WINDOW)?,
            hourly_moving_average_windows: window_list("ZCAL_HOURLY_MOVING_AVERAGE_WINDOWS", "8,24,72,144", 1)?,
            daily_moving_average_windows: window_list(
                "ZCAL_DAILY_MOVING_AVERAGE_WINDOWS",
                "30,60,90,120,180,200,365",
                1,
            )?,
        };

        // Surface bad bounds or tolerance at startup rather than per trade.
        config
            .calibration_options()
            .validated()
            .map_err(|e| CalibError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Solver options for the configured mode. In compare mode the strategy
    /// field is unused and left at `Auto`.
    pub fn calibration_options(&self) -> CalibrationOptions {
        let strategy = match self.mode {
            RunMode::Compare => Strategy::Auto,
            RunMode::Single(strategy) => strategy,
        };
        CalibrationOptions {
            strategy,
            seed: self.seed,
            tolerance: self.tolerance,
            lower: self.lower_bound,
            upper: self.upper_bound,
            annealing_iterations: self.annealing_iterations,
            annealing_rng_seed: self.annealing_rng_seed,
            ..CalibrationOptions::default()
        }
    }
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn window_list(key: &str, default: &str, min: usize) -> CalibResult<WindowList> {
    parse_windows(&env_var_or(key, default), min).map_err(|e| CalibError::Config(format!("{key}: {e}")))
}

/// Comma-separated window lengths, each at least `min`. Empty entries are ignored.
pub fn parse_windows(raw: &str, min: usize) -> Result<WindowList, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<usize>() {
            Ok(n) if n < min.max(1) => Err(format!("window {n} must be >= {}", min.max(1))),
            Ok(n) => Ok(n),
            Err(e) => Err(format!("{s}: {e}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_windows() {
        assert_eq!(parse_windows("24,72", 1).unwrap().as_slice(), &[24, 72]);
        assert_eq!(parse_windows(" 30 , 90 ,", 1).unwrap().as_slice(), &[30, 90]);
        assert!(parse_windows("", 1).unwrap().is_empty());
        assert!(parse_windows("30,abc", 1).is_err());
        assert!(parse_windows("0", 0).is_err());
    }

    #[test]
    fn test_trend_windows_need_two_points() {
        assert!(parse_windows("24,1", MIN_TREND_WINDOW).is_err());
        assert_eq!(parse_windows("2,24", MIN_TREND_WINDOW).unwrap().as_slice(), &[2, 24]);
        assert_eq!(parse_windows("1,8", 1).unwrap().as_slice(), &[1, 8]);
    }

    #[test]
    fn test_default_moving_average_windows() {
        assert_eq!(parse_windows("8,24,72,144", 1).unwrap().as_slice(), &[8, 24, 72, 144]);
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!("compare".parse::<RunMode>().unwrap(), RunMode::Compare);
        assert_eq!("Newton".parse::<RunMode>().unwrap(), RunMode::Single(Strategy::Newton));
        assert_eq!("auto".parse::<RunMode>().unwrap(), RunMode::Single(Strategy::Auto));
        assert!("gradient".parse::<RunMode>().is_err());
    }

    #[test]
    fn test_calibration_options_follow_config() {
        let config = AppConfig {
            data_dir: PathBuf::from("data"),
            mode: RunMode::Single(Strategy::Brent),
            tolerance: 1e-9,
            lower_bound: 1.0,
            upper_bound: 500.0,
            seed: 2.0,
            annealing_iterations: 200,
            annealing_rng_seed: 7,
            hourly_windows: parse_windows("24", MIN_TREND_WINDOW).unwrap(),
            daily_windows: parse_windows("30", MIN_TREND_WINDOW).unwrap(),
            hourly_moving_average_windows: parse_windows("24", 1).unwrap(),
            daily_moving_average_windows: parse_windows("30", 1).unwrap(),
        };
        let options = config.calibration_options();
        assert_eq!(options.strategy, Strategy::Brent);
        assert!((options.upper - 500.0).abs() < f64::EPSILON);
        assert!((options.seed - 2.0).abs() < f64::EPSILON);
        assert_eq!(options.annealing_rng_seed, 7);
        assert!(options.validated().is_ok());
    }
}
