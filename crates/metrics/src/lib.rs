//! Delivery metrics (Four Keys, cycle time, team activity)
//!
//! Aggregations are pure functions over stored records; the calculators
//! load a project's records for a window and run them.

#![warn(missing_docs)]

pub mod stats;
pub mod policy;
pub mod four_keys;
pub mod cycle_time;
pub mod activity;

pub use policy::EstimationPolicy;
pub use four_keys::{FourKeysCalculator, compute_four_keys};
pub use cycle_time::{CycleTimeAnalyzer, aggregate_stage_times, cycle_time_distribution, stage_times};
pub use activity::{ActivityAnalyzer, member_activity, review_load};

use devpulse_core::{Project, ProjectId, ValidationError};
use devpulse_storage::{Storage, StorageError};

/// Errors raised by metric calculators.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Caller supplied an invalid window
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unknown project
    #[error("Project not found: {0}")]
    NotFound(ProjectId),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for metric calculations.
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Load a project or fail with `NotFound`.
pub(crate) async fn require_project<S: Storage>(storage: &S, id: ProjectId) -> Result<Project> {
    storage.load_project(id).await?.ok_or(MetricsError::NotFound(id))
}
