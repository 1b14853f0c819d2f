//! Error types.
//!
//! - `AppError`: CLI and file failures, carrying the process exit code
//! - `SetupError`: a fit problem that was put together incorrectly
//! - `FitError`: solver failures reported through `FitDriver::error()`

/// Application-level error with an exit code for the `kinfit` binary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<SetupError> for AppError {
    fn from(err: SetupError) -> Self {
        AppError::new(2, format!("Invalid event: {err}"))
    }
}

/// Invalid construction of fit objects or constraints.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetupError {
    #[error("unknown fit object #{0}")]
    UnknownObject(usize),

    #[error("parameter index {index} out of range for '{object}' ({npar} parameters)")]
    ParameterIndex {
        object: String,
        index: usize,
        npar: usize,
    },

    #[error("covariance for '{object}' must be {npar}x{npar}, got {rows}x{cols}")]
    CovarianceShape {
        object: String,
        npar: usize,
        rows: usize,
        cols: usize,
    },

    #[error("expected {expected} values for '{object}', got {actual}")]
    ValueCount {
        object: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: f64 },

    #[error("constraint '{constraint}' needs a beam four-vector")]
    MissingBeam { constraint: String },
}

/// Solver failure.
///
/// `code()` is stable and is what `FitDriver::error_code()` reports; `0` is
/// reserved for success.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("no convergence after {iterations} iterations")]
    OutOfIterations { iterations: usize },

    #[error("chi-square diverged to {chi2:.4e}")]
    ChiSquareDiverged { chi2: f64 },

    #[error("singular linear system ({stage})")]
    SingularSystem { stage: &'static str },

    #[error("parameter updates stalled for {steps} consecutive steps")]
    NotStabilized { steps: usize },

    #[error("measurement covariance of '{object}' is not invertible")]
    InvalidCovariance { object: String },

    #[error("nothing to fit: no free parameters")]
    EmptyProblem,

    #[error("non-finite entries in the assembled {what}")]
    NonFinite { what: &'static str },
}

impl FitError {
    pub fn code(&self) -> i32 {
        match self {
            FitError::OutOfIterations { .. } => 1,
            FitError::ChiSquareDiverged { .. } => 2,
            FitError::SingularSystem { .. } => 3,
            FitError::NotStabilized { .. } => 4,
            FitError::InvalidCovariance { .. } => 10,
            FitError::EmptyProblem => 11,
            FitError::NonFinite { .. } => 99,
        }
    }
}
