//! Domain-level error taxonomy for gradeflow.

/// Errors produced by payload validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Gradeflow domain errors.
#[derive(Debug, thiserror::Error)]
pub enum GradeflowError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Result type for gradeflow domain operations.
pub type Result<T> = std::result::Result<T, GradeflowError>;
