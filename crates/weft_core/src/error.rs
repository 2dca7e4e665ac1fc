//! Error types for the core record model.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the record and identifier layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// No mapping exists for the given display identifier.
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// The display identifier space collided at full length.
    ///
    /// Practically unreachable: it requires two distinct internal ids whose
    /// full hex forms are identical.
    #[error("display identifier space exhausted for {0}")]
    IdentifierExhausted(String),

    /// A serialized record failed to parse or validate.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::UnknownIdentifier("wf-zzzzzz".into());
        assert_eq!(err.to_string(), "unknown identifier: wf-zzzzzz");

        let err = CoreError::Malformed("truncated payload".into());
        assert!(err.to_string().contains("truncated"));
    }
}
