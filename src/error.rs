//! Error taxonomy for the relay core.
//!
//! Every variant is scoped to a single session: the Connection Manager turns
//! recoverable errors into an `error` event for the originating session and
//! never lets them reach another session.

use thiserror::Error;

/// Errors raised by the Response Generator collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeneratorError {
    /// The generator could not produce a response.
    #[error("generation failed: {0}")]
    Failed(String),

    /// The generator's upstream dependency is unavailable.
    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The handshake did not carry a usable identity, or the relay is shutting down.
    /// Terminal for the connection; clients should not retry with the same handshake.
    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    /// Joining or sending failed. The session stays usable.
    #[error("{0}")]
    Dispatch(String),

    /// The Response Generator failed. Chunks already delivered are not retracted.
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    /// A programming defect, such as releasing a stream controller twice.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
}

impl RelayError {
    /// Whether the error ends the connection rather than a single operation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ConnectionRejected(_))
    }
}

/// Result alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generator_error_converts() {
        let err: RelayError = GeneratorError::Failed("model offline".into()).into();
        assert_eq!(err.to_string(), "generation failed: model offline");
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_rejection_is_terminal() {
        let err = RelayError::ConnectionRejected("missing identity".into());
        assert!(err.is_terminal());
        assert!(err.to_string().contains("missing identity"));
    }
}
