//! Error taxonomy for the monitoring mesh
//!
//! Every boundary call (hypervisor API, transport, store, model fit) returns
//! a typed [`SentinelError`]. Callers decide per kind whether to retry,
//! skip the entity for this cycle, or escalate.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Errors raised by the collection, aggregation and forecasting components
#[derive(Error, Debug)]
pub enum SentinelError {
    /// Network failure talking to the transport or the hypervisor API
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Credentials were rejected; not retried automatically
    #[error("authentication failed for {identity}: {reason}")]
    Auth { identity: String, reason: String },

    /// Not enough history to train a model this cycle
    #[error("insufficient data for {entity_id}: {available} points, need {required}")]
    InsufficientData {
        entity_id: String,
        available: usize,
        required: usize,
    },

    /// Training exceeded its deadline and was abandoned
    #[error("training for {entity_id} timed out after {timeout:?}")]
    TrainingTimeout { entity_id: String, timeout: Duration },

    /// The model could not be fitted to the series
    #[error("model fit failed for {entity_id}: {reason}")]
    ModelFit { entity_id: String, reason: String },

    /// Malformed sample or message
    #[error("validation failed: {0}")]
    Validation(String),

    /// Persistence failure in the metrics store
    #[error("store error: {0}")]
    Store(String),
}

/// Discriminant of [`SentinelError`], used for logging and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    Auth,
    InsufficientData,
    TrainingTimeout,
    ModelFit,
    Validation,
    Store,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::Auth => "auth",
            ErrorKind::InsufficientData => "insufficient_data",
            ErrorKind::TrainingTimeout => "training_timeout",
            ErrorKind::ModelFit => "model_fit",
            ErrorKind::Validation => "validation",
            ErrorKind::Store => "store",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SentinelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SentinelError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SentinelError::Auth { .. } => ErrorKind::Auth,
            SentinelError::InsufficientData { .. } => ErrorKind::InsufficientData,
            SentinelError::TrainingTimeout { .. } => ErrorKind::TrainingTimeout,
            SentinelError::ModelFit { .. } => ErrorKind::ModelFit,
            SentinelError::Validation(_) => ErrorKind::Validation,
            SentinelError::Store(_) => ErrorKind::Store,
        }
    }

    /// Whether the failed operation should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, SentinelError::TransientNetwork(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SentinelError::Validation(msg.into())
    }

    pub fn model_fit(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        SentinelError::ModelFit {
            entity_id: entity_id.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for SentinelError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            SentinelError::Auth {
                identity: err
                    .url()
                    .map(|u| u.as_str().to_string())
                    .unwrap_or_default(),
                reason: err.to_string(),
            }
        } else {
            SentinelError::TransientNetwork(err.to_string())
        }
    }
}

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        SentinelError::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(SentinelError::TransientNetwork("reset".into()).is_retryable());
        assert!(!SentinelError::Auth {
            identity: "monitor-pve1".into(),
            reason: "bad secret".into()
        }
        .is_retryable());
        assert!(!SentinelError::validation("cpu out of range").is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        let err = SentinelError::InsufficientData {
            entity_id: "pve1".into(),
            available: 5,
            required: 24,
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientData);
        assert_eq!(err.kind().as_str(), "insufficient_data");
        assert!(err.to_string().contains("5 points, need 24"));
    }
}
