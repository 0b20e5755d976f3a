//! DevPulse core data models.
//!
//! This crate defines the delivery records collected from the source-control
//! platform and the metric structures computed from them.

#![warn(missing_docs)]

// Core identities
mod id;

// Delivery records
mod project;
mod deployment;
mod team;

// Queries and results
mod window;
mod metrics;

// Re-exports
pub use id::*;

pub use project::Project;
pub use deployment::{Deployment, FAILURE_STATUSES, is_failure_status};
pub use team::{MergeRequest, MergeRequestState, Review, ReviewWithContext, TeamMember};
pub use window::{DateWindow, ValidationError, hours_between};
pub use metrics::{
    CycleTimeEntry, CycleTimeMetrics, CycleTimeStages, FourKeysResult, MemberActivity,
    ReviewLoad, StageBreakdown, StageStats, StageTimes,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
