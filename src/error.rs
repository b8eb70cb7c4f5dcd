use thiserror::Error;

/// Failures raised by the recurrent layer itself.
///
/// Pipeline code (training, prediction, persistence) wraps these in
/// `anyhow::Error` with context.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GruError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("expected input shape [batch, time, features], got {0:?}")]
    InvalidInputShape(Vec<usize>),

    #[error("layer was built for {expected} input features, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("mask shape {actual:?} does not match input [batch, time] = {expected:?}")]
    MaskMismatch {
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("state tensor `{name}` has shape {actual:?}, expected {expected:?}")]
    StateMismatch {
        name: &'static str,
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("input sequence has no time steps")]
    EmptySequence,
}

pub type GruResult<T> = Result<T, GruError>;
