/// Errors produced while generating, decoding, scanning or persisting patterns.
#[derive(thiserror::Error, Debug)]
pub enum GrayCodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("captured frame count does not match the pattern (expected {expected}, got {got})")]
    FrameCountMismatch { expected: usize, got: usize },

    #[error("frame {index} is {got_w}x{got_h}, expected {expected_w}x{expected_h}")]
    FrameSizeMismatch {
        index: usize,
        expected_w: usize,
        expected_h: usize,
        got_w: usize,
        got_h: usize,
    },

    #[error("corrupt correspondence data set: {0}")]
    CorruptDataSet(String),

    #[error("video output is not ready")]
    OutputNotReady,

    #[error("camera returned no frame for pattern frame {index}")]
    NoFrame { index: usize },

    #[error("scan cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}
