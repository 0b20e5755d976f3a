//! Refresh orchestration: fetch, reconcile, derive, snapshot.
//!
//! Network calls happen before a storage batch is opened, so a batch is
//! only ever held for local writes. Two refreshes of the same project may
//! run concurrently: each batch holds the storage write lock while it is
//! open, and natural-key upserts make the result the same as running them
//! one after the other.

use std::sync::Arc;

use chrono::Utc;
use devpulse_core::{DateWindow, Project, ProjectId};
use devpulse_metrics::{ActivityAnalyzer, FourKeysCalculator};
use devpulse_storage::{Storage, SyncBatch};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::GitLabClient;
use crate::error::{Result, SyncError};
use crate::normalize::{reviews_from_notes, FetchedMergeRequest, FetchedReview};
use crate::reconcile::{derive_deployment_links, IdentityMap, SyncReconciler};

/// Refresh settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshConfig {
    /// How far back to fetch
    pub days_back: i64,

    /// Trailing window of the snapshots written by the batch job
    pub snapshot_window_days: i64,

    /// Derive reviews from merge request notes (one extra call per MR)
    pub fetch_reviews: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            days_back: 90,
            snapshot_window_days: 30,
            fetch_reviews: false,
        }
    }
}

impl RefreshConfig {
    /// Where review data comes from.
    pub fn review_source(&self) -> ReviewSource {
        if self.fetch_reviews {
            ReviewSource::MergeRequestNotes
        } else {
            ReviewSource::Disabled
        }
    }
}

/// Source of review records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewSource {
    /// No review data is fetched
    Disabled,
    /// Non-author notes on each merge request
    MergeRequestNotes,
}

/// Result of a deployment refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentRefresh {
    /// Deployments inserted or updated
    pub deployments_processed: usize,
}

/// Result of an activity refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRefresh {
    /// Merge requests inserted or updated
    pub merge_requests: usize,
    /// Distinct members seen as author or reviewer
    pub team_members: usize,
    /// Reviews inserted or updated
    pub reviews: usize,
}

/// Result of a batch refresh over all projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Projects refreshed successfully
    pub projects_processed: usize,
    /// Projects whose refresh failed
    pub projects_failed: usize,
    /// Deployments processed across successful projects
    pub total_deployments: usize,
}

/// Refreshes stored project data from GitLab.
pub struct RefreshService<S: Storage> {
    storage: Arc<S>,
    client: GitLabClient,
    config: RefreshConfig,
}

impl<S: Storage> RefreshService<S> {
    /// Create a refresh service.
    pub fn new(storage: Arc<S>, client: GitLabClient, config: RefreshConfig) -> Self {
        Self { storage, client, config }
    }

    /// Refresh settings.
    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Fetch and reconcile deployments updated in the last `days_back` days.
    pub async fn refresh(&self, project_id: ProjectId, days_back: i64) -> Result<DeploymentRefresh> {
        let project = self.load(project_id).await?;
        let window = DateWindow::trailing(days_back, Utc::now())?;
        info!("Starting deployment refresh for project {} ({})", project.id, project.name);

        let query = self.client.query(window.start, window.end);
        let fetched = self.client.list_deployments(project.gitlab_id, &query).await?;
        debug!("Fetched {} deployments from GitLab", fetched.len());

        let mut batch = self.storage.begin().await?;
        let outcome = async {
            let processed = SyncReconciler::new(&mut batch).reconcile(project.id, &fetched).await?;
            derive_deployment_links(&mut batch, project.id).await?;
            batch.mark_synced(project.id, Utc::now()).await?;
            Ok::<_, SyncError>(processed)
        }
        .await;
        let processed = finish(batch, outcome).await?;

        info!("Refresh completed for project {}: {} deployments processed", project.id, processed);
        Ok(DeploymentRefresh { deployments_processed: processed })
    }

    /// Fetch and reconcile merge requests (and reviews when enabled)
    /// updated in the last `days_back` days.
    pub async fn refresh_activity(&self, project_id: ProjectId, days_back: i64) -> Result<ActivityRefresh> {
        let project = self.load(project_id).await?;
        let window = DateWindow::trailing(days_back, Utc::now())?;
        info!("Starting activity refresh for project {} ({})", project.id, project.name);

        let query = self.client.query(window.start, window.end);
        let merge_requests = self.client.list_merge_requests(project.gitlab_id, &query).await?;
        let reviews = match self.config.review_source() {
            ReviewSource::Disabled => Vec::new(),
            ReviewSource::MergeRequestNotes => self.fetch_reviews(&project, &merge_requests).await?,
        };
        debug!("Fetched {} merge requests and {} reviews", merge_requests.len(), reviews.len());

        let mut identity = IdentityMap::new();
        let mut batch = self.storage.begin().await?;
        let outcome = async {
            let mut reconciler = SyncReconciler::new(&mut batch);
            let mrs = reconciler
                .reconcile_merge_requests(project.id, &merge_requests, &mut identity)
                .await?;
            let reviewed = reconciler.reconcile_reviews(project.id, &reviews, &mut identity).await?;
            derive_deployment_links(&mut batch, project.id).await?;
            batch.mark_synced(project.id, Utc::now()).await?;
            Ok::<_, SyncError>((mrs, reviewed))
        }
        .await;
        let (mrs, reviewed) = finish(batch, outcome).await?;

        info!(
            "Activity refresh completed for project {}: {} merge requests, {} members",
            project.id,
            mrs,
            identity.len()
        );
        Ok(ActivityRefresh {
            merge_requests: mrs,
            team_members: identity.len(),
            reviews: reviewed,
        })
    }

    /// Refresh every project, then write trailing-window snapshots.
    ///
    /// A failing project is logged and counted; the remaining projects still
    /// run.
    pub async fn refresh_all(&self) -> Result<BatchSummary> {
        let projects = self.storage.list_projects().await?;
        if projects.is_empty() {
            info!("No projects to refresh");
        }

        let mut summary = BatchSummary {
            projects_processed: 0,
            projects_failed: 0,
            total_deployments: 0,
        };

        for project in &projects {
            match self.refresh_one(project).await {
                Ok(deployments) => {
                    summary.projects_processed += 1;
                    summary.total_deployments += deployments;
                }
                Err(e) => {
                    error!("Error refreshing project {} ({}): {}", project.id, project.name, e);
                    summary.projects_failed += 1;
                }
            }
        }

        info!(
            "Batch refresh completed: {} projects, {} failed, {} total deployments",
            summary.projects_processed, summary.projects_failed, summary.total_deployments
        );
        Ok(summary)
    }

    async fn refresh_one(&self, project: &Project) -> Result<usize> {
        let deployments = self.refresh(project.id, self.config.days_back).await?;
        self.refresh_activity(project.id, self.config.days_back).await?;

        let window = DateWindow::trailing(self.config.snapshot_window_days, Utc::now())?;
        FourKeysCalculator::new(self.storage.clone())
            .calculate_and_save(project.id, &window)
            .await?;
        ActivityAnalyzer::new(self.storage.clone())
            .calculate_and_save(project.id, &window)
            .await?;

        info!(
            "Refreshed project {} ({}): {} deployments",
            project.id, project.name, deployments.deployments_processed
        );
        Ok(deployments.deployments_processed)
    }

    async fn fetch_reviews(&self, project: &Project, merge_requests: &[FetchedMergeRequest]) -> Result<Vec<FetchedReview>> {
        let mut reviews = Vec::new();
        for mr in merge_requests {
            let (Some(id), Some(iid)) = (mr.gitlab_mr_id, mr.gitlab_mr_iid) else {
                continue;
            };
            let notes = self.client.list_merge_request_notes(project.gitlab_id, iid).await?;
            let author = mr.author.as_ref().map(|a| a.gitlab_user_id);
            reviews.extend(reviews_from_notes(id, author, &notes));
        }
        Ok(reviews)
    }

    async fn load(&self, project_id: ProjectId) -> Result<Project> {
        self.storage
            .load_project(project_id)
            .await?
            .ok_or(SyncError::NotFound(project_id))
    }
}

/// Commit on success; roll back and return the error otherwise.
async fn finish<B: SyncBatch, T>(batch: B, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            batch.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = batch.rollback().await {
                warn!("Rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::rate_limiter::tests::ManualClock;
    use devpulse_storage::SqliteStorage;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn recent(hours_ago: i64) -> String {
        (Utc::now() - chrono::Duration::hours(hours_ago)).to_rfc3339()
    }

    fn test_client(server: &MockServer) -> GitLabClient {
        GitLabClient::with_clock(
            ClientConfig {
                api_url: server.uri(),
                access_token: Some("token".to_string()),
                ..ClientConfig::default()
            },
            Arc::new(ManualClock::new()),
        )
        .unwrap()
    }

    async fn setup(server: &MockServer, config: RefreshConfig) -> (Arc<SqliteStorage>, RefreshService<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let service = RefreshService::new(storage.clone(), test_client(server), config);
        (storage, service)
    }

    async fn register(storage: &SqliteStorage, gitlab_id: i64, name: &str) -> Project {
        let project = Project::new(gitlab_id, name, format!("https://gitlab.example.com/{name}"));
        storage.register_project(&project).await.unwrap();
        project
    }

    async fn mock_json(server: &MockServer, route: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(server)
            .await;
    }

    fn deployment_payload() -> Value {
        json!([
            {
                "id": 1, "status": "failed", "created_at": recent(30), "updated_at": recent(29),
                "sha": "cafe", "environment": { "name": "production" }
            },
            {
                "id": 2, "status": "success", "created_at": recent(28), "updated_at": recent(27),
                "sha": "beef", "environment": { "name": "production" }
            },
            { "status": "success" }
        ])
    }

    fn merge_request_payload() -> Value {
        json!([
            {
                "id": 500, "iid": 5, "title": "Fix checkout", "state": "merged",
                "author": { "id": 1, "username": "alice", "name": "Alice" },
                "created_at": recent(40), "merged_at": recent(35),
                "source_branch": "fix", "target_branch": "main", "merge_commit_sha": "cafe"
            },
            {
                "id": 501, "iid": 6, "title": "Refactor", "state": "opened",
                "author": { "id": 1, "username": "alice", "name": "Alice" },
                "created_at": recent(20),
                "source_branch": "refactor", "target_branch": "main"
            }
        ])
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent_and_marks_synced() {
        let server = MockServer::start().await;
        mock_json(&server, "/projects/10/deployments", deployment_payload()).await;
        let (storage, service) = setup(&server, RefreshConfig::default()).await;
        let project = register(&storage, 10, "shop").await;

        let first = service.refresh(project.id, 90).await.unwrap();
        assert_eq!(first, DeploymentRefresh { deployments_processed: 2 });

        let second = service.refresh(project.id, 90).await.unwrap();
        assert_eq!(second.deployments_processed, 2);
        assert_eq!(storage.count_deployments(project.id).await.unwrap(), 2);

        let reloaded = storage.load_project(project.id).await.unwrap().unwrap();
        assert!(reloaded.last_synced_at.is_some());

        let window = DateWindow::trailing(90, Utc::now()).unwrap();
        let deployments = storage.list_deployments(project.id, &window).await.unwrap();
        let restore = deployments[0].time_to_restore_hours.unwrap();
        assert!((restore - 2.0).abs() < 1e-6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_match_sequential_result() {
        let server = MockServer::start().await;
        mock_json(&server, "/projects/10/deployments", deployment_payload()).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devpulse.db");
        let storage = Arc::new(SqliteStorage::new_from_path(&path).await.unwrap());
        let project = register(&storage, 10, "shop").await;

        // two services on separate pools, as two processes would have
        let other = Arc::new(SqliteStorage::new_from_path(&path).await.unwrap());
        let a = RefreshService::new(storage.clone(), test_client(&server), RefreshConfig::default());
        let b = RefreshService::new(other, test_client(&server), RefreshConfig::default());

        for _ in 0..20 {
            let (first, second) = tokio::join!(a.refresh(project.id, 90), b.refresh(project.id, 90));
            assert_eq!(first.unwrap().deployments_processed, 2);
            assert_eq!(second.unwrap().deployments_processed, 2);
        }

        assert_eq!(storage.count_deployments(project.id).await.unwrap(), 2);
        let window = DateWindow::trailing(90, Utc::now()).unwrap();
        let deployments = storage.list_deployments(project.id, &window).await.unwrap();
        let restore = deployments[0].time_to_restore_hours.unwrap();
        assert!((restore - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_refresh_activity_links_deployments_and_reviews() {
        let server = MockServer::start().await;
        mock_json(&server, "/projects/10/deployments", deployment_payload()).await;
        mock_json(&server, "/projects/10/merge_requests", merge_request_payload()).await;
        mock_json(
            &server,
            "/projects/10/merge_requests/5/notes",
            json!([
                { "author": { "id": 2, "username": "bob" }, "created_at": recent(38), "system": false },
                { "author": { "id": 2, "username": "bob" }, "created_at": recent(37), "system": false },
                { "author": { "id": 1, "username": "alice" }, "created_at": recent(36), "system": false }
            ]),
        )
        .await;
        mock_json(&server, "/projects/10/merge_requests/6/notes", json!([])).await;

        let config = RefreshConfig { fetch_reviews: true, ..RefreshConfig::default() };
        let (storage, service) = setup(&server, config).await;
        let project = register(&storage, 10, "shop").await;

        service.refresh(project.id, 90).await.unwrap();
        let activity = service.refresh_activity(project.id, 90).await.unwrap();
        assert_eq!(
            activity,
            ActivityRefresh { merge_requests: 2, team_members: 2, reviews: 1 }
        );

        let window = DateWindow::trailing(90, Utc::now()).unwrap();
        let deployments = storage.list_deployments(project.id, &window).await.unwrap();
        assert_eq!(deployments[0].merge_request_iid, Some(5));
        let lead = deployments[0].lead_time_hours.unwrap();
        assert!((lead - 10.0).abs() < 1e-6);

        let reviews = storage.list_project_reviews(project.id, &window).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].comment_count, 2);
    }

    #[tokio::test]
    async fn test_reviews_not_fetched_by_default() {
        let server = MockServer::start().await;
        mock_json(&server, "/projects/10/merge_requests", merge_request_payload()).await;
        Mock::given(method("GET"))
            .and(path("/projects/10/merge_requests/5/notes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let (storage, service) = setup(&server, RefreshConfig::default()).await;
        let project = register(&storage, 10, "shop").await;

        let activity = service.refresh_activity(project.id, 30).await.unwrap();
        assert_eq!(activity.reviews, 0);
        assert_eq!(activity.team_members, 1);
    }

    #[tokio::test]
    async fn test_ingestion_failure_stores_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/10/deployments"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let (storage, service) = setup(&server, RefreshConfig::default()).await;
        let project = register(&storage, 10, "shop").await;

        let err = service.refresh(project.id, 90).await.unwrap_err();
        assert!(matches!(err, SyncError::Ingestion(_)));

        let reloaded = storage.load_project(project.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_synced_at, None);
    }

    #[tokio::test]
    async fn test_invalid_inputs() {
        let server = MockServer::start().await;
        let (storage, service) = setup(&server, RefreshConfig::default()).await;
        let project = register(&storage, 10, "shop").await;

        assert!(matches!(
            service.refresh(ProjectId::new(), 90).await.unwrap_err(),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            service.refresh(project.id, 0).await.unwrap_err(),
            SyncError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_continues_past_failed_project() {
        let server = MockServer::start().await;
        mock_json(&server, "/projects/10/deployments", deployment_payload()).await;
        mock_json(&server, "/projects/10/merge_requests", merge_request_payload()).await;
        Mock::given(method("GET"))
            .and(path("/projects/20/deployments"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (storage, service) = setup(&server, RefreshConfig::default()).await;
        let healthy = register(&storage, 10, "shop").await;
        register(&storage, 20, "broken").await;

        let summary = service.refresh_all().await.unwrap();
        assert_eq!(
            summary,
            BatchSummary { projects_processed: 1, projects_failed: 1, total_deployments: 2 }
        );
        assert_eq!(storage.count_merge_requests(healthy.id).await.unwrap(), 2);
    }
}
