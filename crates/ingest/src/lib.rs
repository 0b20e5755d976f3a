//! GitLab ingestion for DevPulse
//!
//! Rate-limited fetching, payload normalization, idempotent reconciliation
//! into storage, and the refresh triggers that tie them together.

#![warn(missing_docs)]

pub mod error;
pub mod rate_limiter;
pub mod client;
pub mod normalize;
pub mod reconcile;
pub mod refresh;

pub use error::{IngestionError, RecordProcessingError, Result, SyncError};
pub use rate_limiter::{Clock, RateLimiter, TokioClock, RATE_WINDOW};
pub use client::{ClientConfig, FetchQuery, GitLabClient};
pub use normalize::{
    FetchedDeployment, FetchedMergeRequest, FetchedNote, FetchedReview, FetchedUser, RemoteProject,
};
pub use reconcile::{derive_deployment_links, IdentityMap, SyncReconciler};
pub use refresh::{
    ActivityRefresh, BatchSummary, DeploymentRefresh, RefreshConfig, RefreshService, ReviewSource,
};
