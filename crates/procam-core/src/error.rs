/// Errors shared by the geometric building blocks of this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not enough data (need {needed}, got {got}): {what}")]
    InsufficientData {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("solver diverged: {0}")]
    SolverDiverged(String),
}
