//! Cycle time broken into coding, review and deployment stages.

use std::sync::Arc;

use devpulse_core::{
    hours_between, CycleTimeEntry, CycleTimeMetrics, CycleTimeStages, DateWindow, Deployment,
    MergeRequest, MergeRequestState, ProjectId, StageBreakdown, StageTimes,
};
use devpulse_storage::Storage;
use tracing::{debug, info};

use crate::policy::EstimationPolicy;
use crate::stats::{mean, stage_stats};
use crate::{require_project, Result};

/// Stage durations of a merged merge request.
///
/// Review is creation to merge. Deployment is merge to the first deployment
/// of the project within the policy's search window, or the policy default.
/// Returns `None` for a merge request that was never merged.
pub fn stage_times(
    mr: &MergeRequest,
    deployments: &[Deployment],
    policy: &EstimationPolicy,
) -> Option<StageTimes> {
    let merged_at = mr.merged_at?;
    let search_end = merged_at + policy.deployment_search_window;

    let coding_time = policy.coding_time_hours;
    let review_time = hours_between(mr.created_at_gitlab, merged_at);
    let deployment_time = deployments
        .iter()
        .filter(|d| d.project_id == mr.project_id)
        .filter(|d| d.deployed_at >= merged_at && d.deployed_at <= search_end)
        .map(|d| d.deployed_at)
        .min()
        .map(|deployed_at| hours_between(merged_at, deployed_at))
        .unwrap_or(policy.default_deployment_hours);

    Some(StageTimes {
        coding_time,
        review_time,
        deployment_time,
        total_time: coding_time + review_time + deployment_time,
    })
}

/// Aggregate per-MR stage times into percentile statistics.
pub fn aggregate_stage_times(times: &[StageTimes]) -> CycleTimeMetrics {
    if times.is_empty() {
        return CycleTimeMetrics::empty();
    }

    let coding: Vec<f64> = times.iter().map(|t| t.coding_time).collect();
    let review: Vec<f64> = times.iter().map(|t| t.review_time).collect();
    let deployment: Vec<f64> = times.iter().map(|t| t.deployment_time).collect();
    let total: Vec<f64> = times.iter().map(|t| t.total_time).collect();

    let total_mean = mean(&total).unwrap_or_default();
    let share = |values: &[f64]| {
        if total_mean == 0.0 {
            0.0
        } else {
            mean(values).unwrap_or_default() / total_mean * 100.0
        }
    };

    CycleTimeMetrics {
        count: times.len(),
        stages: CycleTimeStages {
            coding: stage_stats("Coding", &coding),
            review: stage_stats("Review", &review),
            deployment: stage_stats("Deployment", &deployment),
        },
        total: stage_stats("Total", &total),
        stage_breakdown_avg: StageBreakdown {
            coding_percentage: share(&coding[..]),
            review_percentage: share(&review[..]),
            deployment_percentage: share(&deployment[..]),
        },
    }
}

/// One row per qualifying merge request, longest total first.
pub fn cycle_time_distribution(
    merge_requests: &[MergeRequest],
    deployments: &[Deployment],
    policy: &EstimationPolicy,
) -> Vec<CycleTimeEntry> {
    let mut rows: Vec<CycleTimeEntry> = merge_requests
        .iter()
        .filter(|mr| mr.state == MergeRequestState::Merged)
        .filter_map(|mr| {
            let times = stage_times(mr, deployments, policy)?;
            Some(CycleTimeEntry {
                mr_id: mr.gitlab_mr_iid,
                title: mr.title.clone(),
                merged_at: mr.merged_at?,
                times,
            })
        })
        .collect();

    rows.sort_by(|a, b| b.times.total_time.total_cmp(&a.times.total_time));
    rows
}

/// Cycle-time analyzer backed by stored merge requests and deployments.
pub struct CycleTimeAnalyzer<S: Storage> {
    storage: Arc<S>,
    policy: EstimationPolicy,
}

impl<S: Storage> CycleTimeAnalyzer<S> {
    /// Create an analyzer with the default estimation policy.
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_policy(storage, EstimationPolicy::default())
    }

    /// Create an analyzer with a custom estimation policy.
    pub fn with_policy(storage: Arc<S>, policy: EstimationPolicy) -> Self {
        Self { storage, policy }
    }

    /// Aggregate cycle-time statistics for MRs merged in `window`.
    pub async fn calculate_metrics(&self, project_id: ProjectId, window: &DateWindow) -> Result<CycleTimeMetrics> {
        let (merge_requests, deployments) = self.load(project_id, window).await?;

        let times: Vec<StageTimes> = merge_requests
            .iter()
            .filter_map(|mr| stage_times(mr, &deployments, &self.policy))
            .collect();

        info!(
            "Calculated cycle time for project {} over {} merge requests",
            project_id,
            times.len()
        );
        Ok(aggregate_stage_times(&times))
    }

    /// Per-MR stage times for MRs merged in `window`, longest first.
    pub async fn get_distribution(&self, project_id: ProjectId, window: &DateWindow) -> Result<Vec<CycleTimeEntry>> {
        let (merge_requests, deployments) = self.load(project_id, window).await?;
        Ok(cycle_time_distribution(&merge_requests, &deployments, &self.policy))
    }

    async fn load(&self, project_id: ProjectId, window: &DateWindow) -> Result<(Vec<MergeRequest>, Vec<Deployment>)> {
        require_project(self.storage.as_ref(), project_id).await?;

        let merge_requests = self.storage.list_merged_merge_requests(project_id, window).await?;

        // deployments of MRs merged near the end of the window may land after it
        let deployment_window = DateWindow::new(window.start, window.end + self.policy.deployment_search_window)?;
        let deployments = self.storage.list_deployments(project_id, &deployment_window).await?;

        debug!(
            "Loaded {} merged MRs and {} deployments for project {}",
            merge_requests.len(),
            deployments.len(),
            project_id
        );
        Ok((merge_requests, deployments))
    }
}
