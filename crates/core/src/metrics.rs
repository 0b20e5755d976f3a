//! Metric result types.
//!
//! Absent statistics are `None` and serialize as `null`; they are never
//! defaulted to zero except where an empty window defines zero as the answer.

use serde::{Deserialize, Serialize};
use crate::id::MemberId;
use crate::Time;

/// DORA Four Keys for one project and window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FourKeysResult {
    /// Window start
    pub period_start: Time,
    /// Window end
    pub period_end: Time,
    /// Deployments per day
    pub deployment_frequency: f64,
    /// Deployments in the window
    pub deployment_count: i64,
    /// Mean lead time for changes
    pub lead_time_hours: Option<f64>,
    /// Median lead time for changes
    pub lead_time_median_hours: Option<f64>,
    /// Percentage of failed deployments
    pub change_failure_rate: Option<f64>,
    /// Failed deployments in the window
    pub failed_deployment_count: i64,
    /// Mean time to restore
    pub time_to_restore_hours: Option<f64>,
    /// Median time to restore
    pub time_to_restore_median_hours: Option<f64>,
}

impl FourKeysResult {
    /// The defined answer for a window without deployments.
    pub fn empty(period_start: Time, period_end: Time) -> Self {
        Self {
            period_start,
            period_end,
            deployment_frequency: 0.0,
            deployment_count: 0,
            lead_time_hours: None,
            lead_time_median_hours: None,
            change_failure_rate: None,
            failed_deployment_count: 0,
            time_to_restore_hours: None,
            time_to_restore_median_hours: None,
        }
    }
}

/// Summary statistics for one cycle-time stage, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    /// Stage label
    pub name: String,
    /// Mean
    pub mean: f64,
    /// Median (average of the middle pair for even counts)
    pub median: f64,
    /// 75th percentile
    pub p75: f64,
    /// 90th percentile
    pub p90: f64,
    /// Minimum
    pub min: f64,
    /// Maximum
    pub max: f64,
}

impl StageStats {
    /// All-zero statistics.
    pub fn zero(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mean: 0.0,
            median: 0.0,
            p75: 0.0,
            p90: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }
}

/// Per-stage statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTimeStages {
    /// Coding stage
    pub coding: StageStats,
    /// Review stage
    pub review: StageStats,
    /// Deployment stage
    pub deployment: StageStats,
}

/// Share of the mean total cycle time spent in each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageBreakdown {
    /// Coding share
    pub coding_percentage: f64,
    /// Review share
    pub review_percentage: f64,
    /// Deployment share
    pub deployment_percentage: f64,
}

/// Cycle-time aggregate for one project and window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTimeMetrics {
    /// Merge requests that contributed
    pub count: usize,
    /// Per-stage statistics
    pub stages: CycleTimeStages,
    /// Statistics of the summed stages
    pub total: StageStats,
    /// Average stage shares
    pub stage_breakdown_avg: StageBreakdown,
}

impl CycleTimeMetrics {
    /// The defined answer when no merge request qualifies.
    pub fn empty() -> Self {
        Self {
            count: 0,
            stages: CycleTimeStages {
                coding: StageStats::zero("Coding"),
                review: StageStats::zero("Review"),
                deployment: StageStats::zero("Deployment"),
            },
            total: StageStats::zero("Total"),
            stage_breakdown_avg: StageBreakdown::default(),
        }
    }
}

/// Stage durations of one merge request, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTimes {
    /// Coding stage
    pub coding_time: f64,
    /// Creation to merge
    pub review_time: f64,
    /// Merge to first deployment
    pub deployment_time: f64,
    /// Sum of the stages
    pub total_time: f64,
}

/// One merge request in the cycle-time distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleTimeEntry {
    /// Merge request sequence number
    pub mr_id: i64,
    /// Title
    pub title: String,
    /// Merge time
    pub merged_at: Time,
    /// Stage durations
    #[serde(flatten)]
    pub times: StageTimes,
}

/// Activity of one team member over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberActivity {
    /// Member
    pub team_member_id: MemberId,
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Estimated, see `EstimationPolicy`
    pub commit_count: i64,
    /// Lines added across authored MRs
    pub lines_added: i64,
    /// Lines deleted across authored MRs
    pub lines_deleted: i64,
    /// MRs authored in the window
    pub mrs_created: i64,
    /// Of those, merged
    pub mrs_merged: i64,
    /// Closed without being merged
    pub mrs_closed: i64,
    /// Reviews given in the window
    pub reviews_given: i64,
    /// Comments across those reviews
    pub review_comments: i64,
    /// Mean hours from MR creation to this member's reviews
    pub avg_review_time_hours: Option<f64>,
}

/// One reviewer's share of the project's reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewLoad {
    /// Member
    pub team_member_id: MemberId,
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Reviews in the window
    pub review_count: i64,
    /// Comments across those reviews
    pub comment_count: i64,
    /// Percentage of all in-window reviews, two decimals
    pub review_load_percentage: f64,
}
