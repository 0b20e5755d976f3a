//! Storage trait abstraction.

use async_trait::async_trait;
use devpulse_core::{
    DateWindow, Deployment, FourKeysResult, MemberActivity, MemberId, MergeRequest,
    MergeRequestId, Project, ProjectId, Review, ReviewWithContext, TeamMember, Time,
};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A natural key is already taken
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored value could not be decoded
    #[error("Corrupt value in column '{column}': {value}")]
    Corrupt {
        /// Column name
        column: &'static str,
        /// Offending raw value
        value: String,
    },
}

/// Storage abstraction for DevPulse data.
///
/// Reads and project administration go straight to the store; writes made
/// by a refresh go through a [`SyncBatch`] so they commit as one unit.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Transactional unit used by reconciliation.
    type Batch: SyncBatch;

    // === Project operations ===

    /// Register a new project. Fails with `Conflict` if the external id is taken.
    async fn register_project(&self, project: &Project) -> Result<()>;

    /// Load a project by ID.
    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>>;

    /// List all projects, newest first.
    async fn list_projects(&self) -> Result<Vec<Project>>;

    /// Delete a project and everything it owns. Returns false if it did not exist.
    async fn delete_project(&self, id: ProjectId) -> Result<bool>;

    // === Window queries ===

    /// Deployments with `deployed_at` in the window, oldest first.
    async fn list_deployments(&self, project: ProjectId, window: &DateWindow) -> Result<Vec<Deployment>>;

    /// Merged merge requests with `merged_at` in the window.
    async fn list_merged_merge_requests(
        &self,
        project: ProjectId,
        window: &DateWindow,
    ) -> Result<Vec<MergeRequest>>;

    /// Merge requests authored by a member with creation time in the window.
    async fn list_authored_merge_requests(
        &self,
        author: MemberId,
        window: &DateWindow,
    ) -> Result<Vec<MergeRequest>>;

    /// Reviews given by a member in the window, with the reviewed MR's creation time.
    async fn list_reviews_by_reviewer(
        &self,
        reviewer: MemberId,
        window: &DateWindow,
    ) -> Result<Vec<ReviewWithContext>>;

    /// All reviews on the project's merge requests in the window.
    async fn list_project_reviews(&self, project: ProjectId, window: &DateWindow) -> Result<Vec<Review>>;

    /// Every team member of a project.
    async fn list_team_members(&self, project: ProjectId) -> Result<Vec<TeamMember>>;

    /// Stored deployment count for a project.
    async fn count_deployments(&self, project: ProjectId) -> Result<i64>;

    /// Stored merge request count for a project.
    async fn count_merge_requests(&self, project: ProjectId) -> Result<i64>;

    // === Metric snapshots ===

    /// Upsert a Four Keys snapshot keyed by project and period.
    async fn save_four_keys(&self, project: ProjectId, metrics: &FourKeysResult) -> Result<()>;

    /// Load the Four Keys snapshot for exactly this period.
    async fn load_four_keys(&self, project: ProjectId, window: &DateWindow) -> Result<Option<FourKeysResult>>;

    /// Upsert an activity snapshot keyed by member and period.
    async fn save_activity_metrics(&self, window: &DateWindow, metrics: &MemberActivity) -> Result<()>;

    /// Load the activity snapshot for exactly this period.
    async fn load_activity_metrics(
        &self,
        member: MemberId,
        window: &DateWindow,
    ) -> Result<Option<MemberActivity>>;

    // === Transaction support ===

    /// Open a batch. Dropping it without `commit` discards its writes.
    ///
    /// A batch holds the write lock from the start, so concurrent batches
    /// queue behind it instead of failing.
    async fn begin(&self) -> Result<Self::Batch>;

    /// Check if the database is reachable.
    async fn health_check(&self) -> bool;
}

/// Writes of one reconciliation pass, applied atomically.
///
/// Lookups go through the same transaction so they observe earlier writes
/// of the batch.
#[async_trait]
pub trait SyncBatch: Send {
    /// Find a deployment by its natural key.
    async fn find_deployment(&mut self, project: ProjectId, gitlab_deployment_id: i64) -> Result<Option<Deployment>>;

    /// Insert a deployment, or refresh the platform-reported fields of the
    /// one stored under the same natural key.
    ///
    /// On conflict the stored id, merge request link and lead time are kept;
    /// time to restore is kept only while the deployment is still a failure.
    async fn upsert_deployment(&mut self, deployment: &Deployment) -> Result<()>;

    /// Overwrite a stored deployment, matched by id.
    async fn update_deployment(&mut self, deployment: &Deployment) -> Result<()>;

    /// All deployments of a project, oldest first.
    async fn project_deployments(&mut self, project: ProjectId) -> Result<Vec<Deployment>>;

    /// Find a member by its natural key.
    async fn find_member(&mut self, project: ProjectId, gitlab_user_id: i64) -> Result<Option<TeamMember>>;

    /// Insert a new member.
    async fn insert_member(&mut self, member: &TeamMember) -> Result<()>;

    /// Find a merge request by its natural key.
    async fn find_merge_request(&mut self, project: ProjectId, gitlab_mr_id: i64) -> Result<Option<MergeRequest>>;

    /// Insert a merge request, or update the one stored under the same
    /// natural key. The stored id is kept, as is a stored merge commit when
    /// the new record has none.
    async fn upsert_merge_request(&mut self, merge_request: &MergeRequest) -> Result<()>;

    /// All merge requests of a project.
    async fn project_merge_requests(&mut self, project: ProjectId) -> Result<Vec<MergeRequest>>;

    /// Find the review a member left on a merge request.
    async fn find_review(&mut self, merge_request: MergeRequestId, reviewer: MemberId) -> Result<Option<Review>>;

    /// Insert a new review.
    async fn insert_review(&mut self, review: &Review) -> Result<()>;

    /// Overwrite a stored review, matched by id.
    async fn update_review(&mut self, review: &Review) -> Result<()>;

    /// Record a completed synchronization.
    async fn mark_synced(&mut self, project: ProjectId, at: Time) -> Result<()>;

    /// Commit all writes of the batch.
    async fn commit(self) -> Result<()>;

    /// Discard all writes of the batch.
    async fn rollback(self) -> Result<()>;
}
