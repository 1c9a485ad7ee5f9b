//! Error types for the Nimbus engine.

use thiserror::Error;

/// All possible errors from the Nimbus engine.
///
/// Everything except [`Error::Remote`] is raised locally, before any request
/// reaches the transport.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Local programmer errors
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("malformed data: {0}")]
    MalformedData(String),

    #[error("circular reference: {0}")]
    CircularReference(String),

    #[error("inconsistency: {0}")]
    Inconsistency(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Transport or backend errors
    #[error("remote failure ({code}): {message}")]
    Remote { code: i64, message: String },
}

impl Error {
    /// Build an [`Error::InvalidType`] for an illegal pairing of variants.
    pub(crate) fn mismatch(op: &str, lhs: &str, rhs: &str) -> Self {
        Error::InvalidType(format!("cannot {op} {rhs} to {lhs}"))
    }

    /// Whether the error came back from the transport rather than being
    /// raised locally.
    pub fn is_remote(&self) -> bool {
        matches!(self, Error::Remote { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::InvalidType("Object cannot be added".into());
        assert_eq!(err.to_string(), "invalid type: Object cannot be added");

        let err = Error::Remote {
            code: 101,
            message: "Object not found.".into(),
        };
        assert_eq!(err.to_string(), "remote failure (101): Object not found.");

        let err = Error::mismatch("add", "Number", "String");
        assert_eq!(err.to_string(), "invalid type: cannot add String to Number");
    }

    #[test]
    fn remote_classification() {
        assert!(Error::Remote {
            code: -1,
            message: "offline".into()
        }
        .is_remote());
        assert!(!Error::CircularReference("a".into()).is_remote());
        assert!(!Error::MalformedData("key".into()).is_remote());
    }
}
