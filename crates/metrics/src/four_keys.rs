//! DORA Four Keys calculation.

use std::sync::Arc;

use devpulse_core::{DateWindow, Deployment, FourKeysResult, ProjectId};
use devpulse_storage::Storage;
use tracing::{debug, info};

use crate::stats::{mean, median};
use crate::{require_project, Result};

/// Compute the Four Keys over the deployments that fall inside `window`.
///
/// An empty window yields [`FourKeysResult::empty`]. The change failure rate
/// is a plain percentage (not rounded) and is only absent when there are no
/// deployments at all.
pub fn compute_four_keys(deployments: &[Deployment], window: &DateWindow) -> FourKeysResult {
    let in_window: Vec<&Deployment> = deployments
        .iter()
        .filter(|d| window.contains(d.deployed_at))
        .collect();

    if in_window.is_empty() {
        return FourKeysResult::empty(window.start, window.end);
    }

    let total = in_window.len() as i64;
    let failed = in_window.iter().filter(|d| d.is_failure).count() as i64;

    let lead_times: Vec<f64> = in_window.iter().filter_map(|d| d.lead_time_hours).collect();
    let restore_times: Vec<f64> = in_window
        .iter()
        .filter_map(|d| d.time_to_restore_hours)
        .collect();

    FourKeysResult {
        period_start: window.start,
        period_end: window.end,
        deployment_frequency: total as f64 / window.days() as f64,
        deployment_count: total,
        lead_time_hours: mean(&lead_times),
        lead_time_median_hours: median(&lead_times),
        change_failure_rate: Some(100.0 * failed as f64 / total as f64),
        failed_deployment_count: failed,
        time_to_restore_hours: mean(&restore_times),
        time_to_restore_median_hours: median(&restore_times),
    }
}

/// Four Keys calculator backed by stored deployments.
pub struct FourKeysCalculator<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> FourKeysCalculator<S> {
    /// Create a new calculator.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Four Keys for a project over `window`.
    pub async fn calculate(&self, project_id: ProjectId, window: &DateWindow) -> Result<FourKeysResult> {
        require_project(self.storage.as_ref(), project_id).await?;

        let deployments = self.storage.list_deployments(project_id, window).await?;
        debug!("Loaded {} deployments for project {}", deployments.len(), project_id);

        Ok(compute_four_keys(&deployments, window))
    }

    /// Calculate and upsert the snapshot for this project and window.
    pub async fn calculate_and_save(
        &self,
        project_id: ProjectId,
        window: &DateWindow,
    ) -> Result<FourKeysResult> {
        let metrics = self.calculate(project_id, window).await?;
        self.storage.save_four_keys(project_id, &metrics).await?;

        info!(
            "Saved Four Keys for project {} ({} deployments, {:.2}/day)",
            project_id, metrics.deployment_count, metrics.deployment_frequency
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, seeded_storage};
    use crate::MetricsError;
    use chrono::Duration;
    use devpulse_storage::SyncBatch;
    use pretty_assertions::assert_eq;

    fn deployment(project: ProjectId, id: i64, when: &str, status: &str) -> Deployment {
        Deployment::new(project, id, "production", status, at(when))
    }

    #[test]
    fn test_empty_window_has_null_statistics() {
        let window = DateWindow::new(at("2024-01-01T00:00:00Z"), at("2024-01-08T00:00:00Z")).unwrap();
        let result = compute_four_keys(&[], &window);

        assert_eq!(result, FourKeysResult::empty(window.start, window.end));
        assert_eq!(result.deployment_count, 0);
        assert_eq!(result.deployment_frequency, 0.0);
        assert_eq!(result.change_failure_rate, None);
    }

    #[test]
    fn test_three_deployments_one_failed() {
        let project = ProjectId::new();
        let start = at("2024-01-01T00:00:00Z");
        let window = DateWindow::new(start, start + Duration::days(2)).unwrap();
        let deployments = vec![
            deployment(project, 1, "2024-01-01T00:00:00Z", "success"),
            deployment(project, 2, "2024-01-01T10:00:00Z", "failed"),
            deployment(project, 3, "2024-01-01T20:00:00Z", "success"),
        ];

        let result = compute_four_keys(&deployments, &window);
        assert_eq!(result.deployment_frequency, 1.5);
        assert_eq!(result.failed_deployment_count, 1);
        let cfr = result.change_failure_rate.unwrap();
        assert!((cfr - 33.33).abs() < 0.01);
    }

    #[test]
    fn test_no_failures_is_zero_rate() {
        let project = ProjectId::new();
        let window = DateWindow::from_dates("2024-01-01", "2024-01-01").unwrap();
        let deployments = vec![deployment(project, 1, "2024-01-01T08:00:00Z", "success")];

        let result = compute_four_keys(&deployments, &window);
        assert_eq!(result.change_failure_rate, Some(0.0));
        assert_eq!(result.deployment_frequency, 1.0);
    }

    #[test]
    fn test_lead_time_uses_only_known_values() {
        let project = ProjectId::new();
        let window = DateWindow::from_dates("2024-01-01", "2024-01-10").unwrap();
        let mut deployments: Vec<Deployment> = (1..=5)
            .map(|i| deployment(project, i, &format!("2024-01-0{i}T12:00:00Z"), "success"))
            .collect();
        for (d, hours) in deployments.iter_mut().zip([1.0, 2.0, 3.0, 4.0]) {
            d.lead_time_hours = Some(hours);
        }

        let result = compute_four_keys(&deployments, &window);
        assert_eq!(result.lead_time_hours, Some(2.5));
        assert_eq!(result.lead_time_median_hours, Some(2.5));
        assert_eq!(result.time_to_restore_hours, None);
        assert_eq!(result.time_to_restore_median_hours, None);
    }

    #[test]
    fn test_deployments_outside_window_are_ignored() {
        let project = ProjectId::new();
        let window = DateWindow::from_dates("2024-01-02", "2024-01-02").unwrap();
        let deployments = vec![
            deployment(project, 1, "2024-01-01T23:59:59Z", "failed"),
            deployment(project, 2, "2024-01-02T12:00:00Z", "success"),
        ];

        let result = compute_four_keys(&deployments, &window);
        assert_eq!(result.deployment_count, 1);
        assert_eq!(result.failed_deployment_count, 0);
    }

    #[tokio::test]
    async fn test_calculator_reads_storage_and_saves_snapshot() {
        let (storage, project) = seeded_storage().await;
        let mut batch = storage.begin().await.unwrap();
        for (id, when, status) in [
            (1, "2024-01-01T00:00:00Z", "success"),
            (2, "2024-01-01T10:00:00Z", "canceled"),
            (3, "2024-01-01T20:00:00Z", "success"),
        ] {
            batch.upsert_deployment(&deployment(project.id, id, when, status)).await.unwrap();
        }
        batch.commit().await.unwrap();

        let calculator = FourKeysCalculator::new(storage.clone());
        let start = at("2024-01-01T00:00:00Z");
        let window = DateWindow::new(start, start + Duration::days(2)).unwrap();

        let result = calculator.calculate_and_save(project.id, &window).await.unwrap();
        assert_eq!(result.deployment_count, 3);
        assert_eq!(result.failed_deployment_count, 1);

        let saved = storage.load_four_keys(project.id, &window).await.unwrap();
        assert_eq!(saved, Some(result));
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let (storage, _) = seeded_storage().await;
        let calculator = FourKeysCalculator::new(storage);
        let window = DateWindow::from_dates("2024-01-01", "2024-01-02").unwrap();

        let err = calculator.calculate(ProjectId::new(), &window).await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound(_)));
    }
}
