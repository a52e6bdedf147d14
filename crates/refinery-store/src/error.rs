//! Store error classification
//!
//! The batch coordinator needs exactly three answers from a failed store
//! call: retry it (transient), treat it as success (schema object already
//! exists), or give up (anything else). Raw driver errors are classified by
//! their Neo4j status code or message text, which survives every driver
//! version's error shape.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// Store unreachable or a transient transaction conflict; the caller
    /// may safely retry the whole batch.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The schema object being created is already present.
    #[error("schema object already exists: {0}")]
    AlreadyExists(String),
    /// Permanent failure; retrying the same input cannot help.
    #[error("store failure: {0}")]
    Other(String),
}

const TRANSIENT_MARKERS: &[&str] = &[
    "TransientError",
    "ServiceUnavailable",
    "SessionExpired",
    "DatabaseUnavailable",
    "connection refused",
    "connection reset",
    "broken pipe",
    "timed out",
    "IOError",
];

const ALREADY_EXISTS_MARKERS: &[&str] = &[
    "AlreadyExists",
    "EquivalentSchemaRule",
    "already exists",
    "An equivalent index",
];

impl StoreError {
    /// Classify a raw driver error message.
    pub fn classify(raw: &str) -> StoreError {
        if TRANSIENT_MARKERS.iter().any(|m| raw.contains(m)) {
            StoreError::Transient(raw.to_owned())
        } else if ALREADY_EXISTS_MARKERS.iter().any(|m| raw.contains(m)) {
            StoreError::AlreadyExists(raw.to_owned())
        } else {
            StoreError::Other(raw.to_owned())
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neo4j_status_codes_classify() {
        assert!(StoreError::classify(
            "Neo.TransientError.Transaction.DeadlockDetected: try again"
        )
        .is_transient());
        assert!(StoreError::classify(
            "Neo.ClientError.Schema.EquivalentSchemaRuleAlreadyExists: index exists"
        )
        .is_already_exists());
        assert!(matches!(
            StoreError::classify("Neo.ClientError.Statement.SyntaxError: bad query"),
            StoreError::Other(_)
        ));
    }

    #[test]
    fn io_failures_are_transient() {
        assert!(StoreError::classify("IOError: connection refused").is_transient());
        assert!(StoreError::classify("write: broken pipe").is_transient());
    }
}
