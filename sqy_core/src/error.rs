use thiserror::Error;

/// Every failure the engine can report.
///
/// Errors are plain values local to one call. The executor never retries or
/// recovers; the first failing stage's error is returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqyError {
    #[error("invalid pipeline name {name:?}: {reason}")]
    InvalidPipelineName { name: String, reason: String },

    #[error("destination buffer too small: {required} bytes required, {available} available")]
    BufferTooSmall { required: usize, available: usize },

    #[error("stage '{stage}' does not accept element type {found}")]
    UnsupportedElementType { stage: String, found: String },

    #[error("buffer does not match its shape: {reason}")]
    ShapeMismatch { reason: String },

    #[error("stage '{stage}' failed to encode: {reason}")]
    EncodeFailure { stage: String, reason: String },

    #[error("stage '{stage}' failed to decode: {reason}")]
    DecodeFailure { stage: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SqyError>;

impl SqyError {
    /// Stable nonzero status code for callers that speak integers. 0 means success.
    pub fn status(&self) -> i32 {
        match self {
            SqyError::BufferTooSmall { .. } => 1,
            SqyError::InvalidPipelineName { .. } => 2,
            SqyError::UnsupportedElementType { .. } => 3,
            SqyError::EncodeFailure { .. } => 4,
            SqyError::DecodeFailure { .. } => 5,
            SqyError::ShapeMismatch { .. } => 6,
        }
    }

    pub fn invalid_pipeline(name: impl Into<String>, reason: impl Into<String>) -> Self {
        SqyError::InvalidPipelineName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn buffer_too_small(required: usize, available: usize) -> Self {
        SqyError::BufferTooSmall {
            required,
            available,
        }
    }

    pub fn unsupported(stage: impl Into<String>, found: impl std::fmt::Display) -> Self {
        SqyError::UnsupportedElementType {
            stage: stage.into(),
            found: found.to_string(),
        }
    }

    pub fn shape(reason: impl Into<String>) -> Self {
        SqyError::ShapeMismatch {
            reason: reason.into(),
        }
    }

    pub fn encode(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        SqyError::EncodeFailure {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        SqyError::DecodeFailure {
            stage: stage.into(),
            reason: reason.into(),
        }
    }
}
