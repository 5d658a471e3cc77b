use procam_calib::CalibrationError;
use procam_graycode::GrayCodeError;

/// Errors produced by the facade helpers and the command line tool.
#[derive(thiserror::Error, Debug)]
pub enum ProcamError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Scan(#[from] GrayCodeError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[cfg(feature = "image")]
    #[error(transparent)]
    Image(#[from] ::image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
