use std::time::Duration;

use orgreg_core::CoreError;
use orgreg_storage::{ArtifactError, FetchError, RetryDisposition};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("network request failed: {0}")]
    Network(#[from] FetchError),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("csv parse failed: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Schema(#[from] CoreError),
    #[error("database error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("staging table {0}")]
    Staging(String),
    #[error("{job} exceeded its {budget:?} budget")]
    Timeout { job: &'static str, budget: Duration },
    #[error("queue error: {0}")]
    Queue(String),
}

impl PipelineError {
    pub fn integrity(message: impl Into<String>) -> Self {
        PipelineError::Integrity(message.into())
    }

    /// Whether the queue may re-attempt the job that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Network(err) => err.disposition() == RetryDisposition::Retryable,
            PipelineError::Artifact(ArtifactError::Io { .. } | ArtifactError::Join(_)) => true,
            PipelineError::Artifact(_) => false,
            PipelineError::Store(_) | PipelineError::Timeout { .. } => true,
            PipelineError::Integrity(_)
            | PipelineError::Csv(_)
            | PipelineError::Schema(_)
            | PipelineError::Staging(_)
            | PipelineError::Queue(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_are_never_retried() {
        assert!(!PipelineError::integrity("chunk count mismatch").is_retryable());
        assert!(!PipelineError::Artifact(ArtifactError::NoChunks {
            dir: "/tmp/chunks".into()
        })
        .is_retryable());
    }

    #[test]
    fn transient_failures_are_retried() {
        assert!(PipelineError::Timeout {
            job: "fetch_chunk",
            budget: Duration::from_secs(300)
        }
        .is_retryable());
        assert!(PipelineError::Network(FetchError::HttpStatus {
            status: 503,
            url: "http://x".into()
        })
        .is_retryable());
        assert!(!PipelineError::Network(FetchError::HttpStatus {
            status: 404,
            url: "http://x".into()
        })
        .is_retryable());
    }
}
