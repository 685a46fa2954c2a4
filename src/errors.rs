/// Error types for the calibration core and the batch runner.
///
/// Only the input-domain variants cross the core boundary. A solver that
/// cannot find a root is not an error: it yields an absent `z`.
#[derive(Debug, thiserror::Error)]
pub enum CalibError {
    #[error("input domain error: non-positive price {price} at index {index}")]
    NonPositivePrice { index: usize, price: f64 },

    #[error("input domain error: window length must be >= 2, got {0}")]
    InvalidWindow(usize),

    #[error("input domain error: invalid pricing query: {0}")]
    InvalidQuery(String),

    #[error("input domain error: invalid calibration options: {0}")]
    InvalidOptions(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("task failed: {0}")]
    Task(String),
}

impl CalibError {
    /// True for the failures a caller of the pure core must handle.
    pub fn is_input_domain(&self) -> bool {
        matches!(
            self,
            Self::NonPositivePrice { .. }
                | Self::InvalidWindow(_)
                | Self::InvalidQuery(_)
                | Self::InvalidOptions(_)
        )
    }
}

impl From<serde_json::Error> for CalibError {
    fn from(e: serde_json::Error) -> Self {
        CalibError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for CalibError {
    fn from(e: rusqlite::Error) -> Self {
        CalibError::Database(e.to_string())
    }
}

impl From<std::io::Error> for CalibError {
    fn from(e: std::io::Error) -> Self {
        CalibError::Database(e.to_string())
    }
}

pub type CalibResult<T> = Result<T, CalibError>;
