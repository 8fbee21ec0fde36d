use std::fmt;

use thiserror::Error;

/// Recursion stage that raised a numerical failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Filter,
    Smoother,
    SimulationSmoother,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Filter => "filter",
            Stage::Smoother => "smoother",
            Stage::SimulationSmoother => "simulation smoother",
        };
        f.write_str(name)
    }
}

/// Errors raised while building a representation or running a recursion.
///
/// Shape problems are reported when the representation is built, never
/// from inside a recursion. Numerical failures abort the whole run and carry
/// the time index so that a caller (an optimizer, typically) can reject the
/// parameter point. Partially missing observations are not an error: the
/// affected entries of the results are NaN-filled instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SsmError {
    #[error("invalid shape for {name}: expected {expected}, got {got}")]
    ShapeMismatch {
        name: String,
        expected: String,
        got: String,
    },

    #[error("{what} length mismatch: expected {expected}, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("{stage} failed at t={time}: {matrix} is not positive definite")]
    NotPositiveDefinite {
        stage: Stage,
        time: usize,
        matrix: &'static str,
    },

    #[error("{stage} failed at t={time}: {matrix} is singular")]
    Singular {
        stage: Stage,
        time: usize,
        matrix: &'static str,
    },

    #[error("data error: {0}")]
    DataError(String),
}

impl SsmError {
    pub(crate) fn shape(name: &str, expected: impl fmt::Display, got: impl fmt::Debug) -> Self {
        SsmError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            got: format!("{:?}", got),
        }
    }

    /// True for errors detected while validating a representation or its inputs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SsmError::ShapeMismatch { .. }
                | SsmError::LengthMismatch { .. }
                | SsmError::Configuration(_)
        )
    }

    /// True for factorization failures inside a recursion.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            SsmError::NotPositiveDefinite { .. } | SsmError::Singular { .. }
        )
    }

    /// Attribute a numerical failure to `stage`; other errors pass through.
    pub(crate) fn in_stage(self, stage: Stage) -> Self {
        match self {
            SsmError::NotPositiveDefinite { time, matrix, .. } => {
                SsmError::NotPositiveDefinite { stage, time, matrix }
            }
            SsmError::Singular { time, matrix, .. } => SsmError::Singular { stage, time, matrix },
            other => other,
        }
    }

    /// Time index of a numerical failure.
    pub fn time(&self) -> Option<usize> {
        match self {
            SsmError::NotPositiveDefinite { time, .. } | SsmError::Singular { time, .. } => {
                Some(*time)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SsmError>;
