//! Ingestion error types.

use devpulse_core::{ProjectId, ValidationError};
use devpulse_metrics::MetricsError;
use devpulse_storage::StorageError;

/// Failure talking to the GitLab API. Never retried by the client.
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    /// HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Request did not complete
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        /// API path
        endpoint: String,
        /// Underlying error
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        /// API path
        endpoint: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Response body was not the expected JSON
    #[error("could not decode response from {endpoint}: {source}")]
    Decode {
        /// API path
        endpoint: String,
        /// Underlying error
        #[source]
        source: reqwest::Error,
    },
}

/// One fetched record that cannot be stored. Logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordProcessingError {
    /// A required field is absent
    #[error("{kind} record is missing '{field}'")]
    MissingField {
        /// Record kind
        kind: &'static str,
        /// Field name
        field: &'static str,
    },

    /// Merge request state outside opened/merged/closed/locked
    #[error("merge request {gitlab_mr_id} has unknown state '{state}'")]
    UnknownState {
        /// Merge request id
        gitlab_mr_id: i64,
        /// Raw state
        state: String,
    },

    /// Review of a merge request that is not stored
    #[error("review refers to unknown merge request {0}")]
    UnknownMergeRequest(i64),
}

/// Fatal failure of one project refresh.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Unknown project
    #[error("Project not found: {0}")]
    NotFound(ProjectId),

    /// Bad caller input
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Remote API failure
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    /// Storage failure; the batch was rolled back
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Snapshot calculation failure
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Result type for refresh operations.
pub type Result<T> = std::result::Result<T, SyncError>;
