//! Error taxonomy for the hive runtime.
//!
//! Only configuration problems are fatal. Transient input and timeouts are
//! skipped by the control loop; guardian breaches and duplicate merges are
//! modelled as values (`guardian::Breach`, `ledger::MergeOutcome`) rather
//! than errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HiveError>;

#[derive(Debug, Error)]
pub enum HiveError {
    /// Missing or malformed observation, or a collaborator that produced nothing usable.
    #[error("transient input: {0}")]
    TransientInput(String),

    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// Refuses to start.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("population bound: {0}")]
    PopulationBound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HiveError {
    pub fn config(msg: impl Into<String>) -> Self {
        HiveError::Configuration(msg.into())
    }

    pub fn timeout(operation: &str, millis: u64) -> Self {
        HiveError::Timeout {
            operation: operation.to_string(),
            millis,
        }
    }

    /// Errors the control loop skips instead of propagating.
    pub fn is_transient(&self) -> bool {
        matches!(self, HiveError::TransientInput(_) | HiveError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HiveError::TransientInput("no tick".into()).is_transient());
        assert!(HiveError::timeout("resolve", 250).is_transient());
        assert!(!HiveError::config("min_size > max_size").is_transient());
    }

    #[test]
    fn test_timeout_message() {
        let err = HiveError::timeout("decide", 100);
        assert_eq!(err.to_string(), "decide timed out after 100ms");
    }
}
