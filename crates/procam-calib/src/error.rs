use procam_core::CoreError;
use procam_graycode::GrayCodeError;

/// Errors returned by the calibrators.
///
/// Expected failures (`DetectionFailed`, `InsufficientData`) leave all
/// accumulated state untouched; callers may simply retry or skip.
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not enough data (need {needed}, got {got}): {what}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("board not found: {0}")]
    DetectionFailed(String),

    #[error("solver diverged: {0}")]
    SolverDiverged(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("calibration cancelled")]
    Cancelled,

    #[error(transparent)]
    Scan(#[from] GrayCodeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<CoreError> for CalibrationError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(msg) => Self::InvalidInput(msg),
            CoreError::InsufficientData { what, needed, got } => {
                Self::InsufficientData { what, needed, got }
            }
            CoreError::SolverDiverged(msg) => Self::SolverDiverged(msg),
        }
    }
}
