//! Deployment records.

use serde::{Deserialize, Serialize};
use crate::id::{DeploymentId, ProjectId};
use crate::Time;

/// Deployment statuses that count as a failed change.
pub const FAILURE_STATUSES: &[&str] = &["failed", "canceled"];

/// Whether a raw deployment status marks a failure.
pub fn is_failure_status(status: &str) -> bool {
    FAILURE_STATUSES.contains(&status)
}

/// A deployment of a project to one environment.
///
/// `(project_id, gitlab_deployment_id)` is unique; re-fetching a deployment
/// updates this record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique identifier
    pub id: DeploymentId,

    /// Owning project
    pub project_id: ProjectId,

    /// Deployment id on the external platform
    pub gitlab_deployment_id: i64,

    /// Target environment name
    pub environment: String,

    /// Free-form status reported by the platform
    pub status: String,

    /// When the deployment started
    pub deployed_at: Time,

    /// When the deployment finished
    pub finished_at: Option<Time>,

    /// Deployed commit, at most 40 characters
    pub commit_sha: String,

    /// Linked merge request sequence number, if known
    pub merge_request_iid: Option<i64>,

    /// Derived from `status`
    pub is_failure: bool,

    /// Locally derived lead time for changes
    pub lead_time_hours: Option<f64>,

    /// Locally derived time to restore (failed deployments only)
    pub time_to_restore_hours: Option<f64>,
}

impl Deployment {
    /// Create a deployment with no derived fields.
    pub fn new(
        project_id: ProjectId,
        gitlab_deployment_id: i64,
        environment: impl Into<String>,
        status: impl Into<String>,
        deployed_at: Time,
    ) -> Self {
        let status = status.into();
        Self {
            id: DeploymentId::new(),
            project_id,
            gitlab_deployment_id,
            environment: environment.into(),
            is_failure: is_failure_status(&status),
            status,
            deployed_at,
            finished_at: None,
            commit_sha: String::new(),
            merge_request_iid: None,
            lead_time_hours: None,
            time_to_restore_hours: None,
        }
    }
}
