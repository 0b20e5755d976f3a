//! Stand-in estimates for data the platform does not provide yet.

use chrono::Duration;

/// Fixed estimates used where real commit-level data is unavailable.
///
/// Kept in one place so they can be replaced once commit history is
/// ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimationPolicy {
    /// Coding stage duration assumed for every merge request
    pub coding_time_hours: f64,

    /// Deployment stage duration when no deployment follows the merge
    pub default_deployment_hours: f64,

    /// How far after a merge to look for its deployment
    pub deployment_search_window: Duration,

    /// Commits assumed per authored merge request
    pub commits_per_merge_request: i64,
}

impl Default for EstimationPolicy {
    fn default() -> Self {
        Self {
            coding_time_hours: 24.0,
            default_deployment_hours: 0.5,
            deployment_search_window: Duration::days(7),
            commits_per_merge_request: 3,
        }
    }
}

impl EstimationPolicy {
    /// Estimated commit count for a number of authored merge requests.
    pub fn estimated_commits(&self, merge_requests: i64) -> i64 {
        merge_requests * self.commits_per_merge_request
    }
}
