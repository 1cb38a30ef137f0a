//! Error types shared across the collectors

use crate::store::ViewKind;
use thiserror::Error;

/// Failure reading from the cluster API. Always retryable.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("failed to decode {kind} object: {reason}")]
    Decode { kind: &'static str, reason: String },
}

/// Failure of a single collector tick or collector construction
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Upstream was unavailable; the previous snapshot stays published
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Invalid configuration; fatal for the affected collector only
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CollectorError {
    /// Whether the next tick may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CollectorError::Config(_))
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        CollectorError::Upstream(err.to_string())
    }
}

/// Misuse of the aggregation store
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("a writer for the {0} view has already been claimed")]
    WriterAlreadyClaimed(ViewKind),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CollectorError::Upstream("connection refused".into()).is_retryable());
        assert!(!CollectorError::Config("negative rate".into()).is_retryable());
    }

    #[test]
    fn test_store_error_message() {
        let err = StoreError::WriterAlreadyClaimed(ViewKind::Cost);
        assert_eq!(
            err.to_string(),
            "a writer for the cost view has already been claimed"
        );
    }
}
