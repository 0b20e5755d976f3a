//! Idempotent reconciliation of fetched records into storage.

use std::collections::HashMap;

use devpulse_core::{
    hours_between, Deployment, MemberId, MergeRequest, MergeRequestId, MergeRequestState,
    ProjectId, Review, ReviewId, TeamMember,
};
use devpulse_storage::{StorageError, SyncBatch};
use tracing::{debug, warn};

use crate::error::RecordProcessingError;
use crate::normalize::{FetchedDeployment, FetchedMergeRequest, FetchedReview, FetchedUser};

/// Outcome of one record.
enum RecordError {
    /// Skip this record, keep the batch
    Skip(RecordProcessingError),
    /// Abort the batch
    Fatal(StorageError),
}

impl From<RecordProcessingError> for RecordError {
    fn from(e: RecordProcessingError) -> Self {
        RecordError::Skip(e)
    }
}

impl From<StorageError> for RecordError {
    fn from(e: StorageError) -> Self {
        RecordError::Fatal(e)
    }
}

type RecordResult<T> = std::result::Result<T, RecordError>;

/// Team members resolved during one reconciliation pass, keyed by GitLab user id.
///
/// Lookups fall back to storage and then to insertion, so each distinct user
/// gets at most one row no matter how often it appears.
#[derive(Debug, Default)]
pub struct IdentityMap {
    members: HashMap<i64, TeamMember>,
    created: usize,
}

impl IdentityMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Member id for `user`, creating the member if needed.
    pub async fn resolve<B: SyncBatch>(
        &mut self,
        batch: &mut B,
        project: ProjectId,
        user: &FetchedUser,
    ) -> Result<MemberId, StorageError> {
        if let Some(member) = self.members.get(&user.gitlab_user_id) {
            return Ok(member.id);
        }

        let member = match batch.find_member(project, user.gitlab_user_id).await? {
            Some(member) => member,
            None => {
                let member = TeamMember {
                    id: MemberId::new(),
                    project_id: project,
                    gitlab_user_id: user.gitlab_user_id,
                    username: user.username.clone(),
                    name: user.name.clone(),
                    email: user.email.clone(),
                    avatar_url: user.avatar_url.clone(),
                };
                batch.insert_member(&member).await?;
                self.created += 1;
                debug!("Created team member {} ({})", member.username, member.gitlab_user_id);
                member
            }
        };

        let id = member.id;
        self.members.insert(user.gitlab_user_id, member);
        Ok(id)
    }

    /// Distinct members resolved.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members inserted by this map.
    pub fn created(&self) -> usize {
        self.created
    }
}

/// Applies fetched records to one open batch.
///
/// Records are applied in fetch order. A malformed record is logged and
/// skipped; a storage error aborts and is returned so the caller can roll
/// the batch back.
pub struct SyncReconciler<'a, B: SyncBatch> {
    batch: &'a mut B,
}

impl<'a, B: SyncBatch> SyncReconciler<'a, B> {
    /// Reconcile into `batch`.
    pub fn new(batch: &'a mut B) -> Self {
        Self { batch }
    }

    /// Upsert deployments by `(project, gitlab_deployment_id)`. Returns the number applied.
    pub async fn reconcile(&mut self, project: ProjectId, deployments: &[FetchedDeployment]) -> Result<usize, StorageError> {
        let mut applied = 0;
        for fetched in deployments {
            match self.apply_deployment(project, fetched).await {
                Ok(()) => applied += 1,
                Err(RecordError::Skip(e)) => warn!("Skipping deployment: {}", e),
                Err(RecordError::Fatal(e)) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Upsert merge requests by `(project, gitlab_mr_id)`, resolving authors
    /// through `identity`. Returns the number applied.
    pub async fn reconcile_merge_requests(
        &mut self,
        project: ProjectId,
        merge_requests: &[FetchedMergeRequest],
        identity: &mut IdentityMap,
    ) -> Result<usize, StorageError> {
        let mut applied = 0;
        for fetched in merge_requests {
            match self.apply_merge_request(project, fetched, identity).await {
                Ok(()) => applied += 1,
                Err(RecordError::Skip(e)) => warn!("Skipping merge request: {}", e),
                Err(RecordError::Fatal(e)) => return Err(e),
            }
        }
        Ok(applied)
    }

    /// Upsert reviews by `(merge_request, reviewer)`. Returns the number applied.
    pub async fn reconcile_reviews(
        &mut self,
        project: ProjectId,
        reviews: &[FetchedReview],
        identity: &mut IdentityMap,
    ) -> Result<usize, StorageError> {
        let mut applied = 0;
        for fetched in reviews {
            match self.apply_review(project, fetched, identity).await {
                Ok(()) => applied += 1,
                Err(RecordError::Skip(e)) => warn!("Skipping review: {}", e),
                Err(RecordError::Fatal(e)) => return Err(e),
            }
        }
        Ok(applied)
    }

    async fn apply_deployment(&mut self, project: ProjectId, fetched: &FetchedDeployment) -> RecordResult<()> {
        let gitlab_id = fetched.gitlab_deployment_id.ok_or(RecordProcessingError::MissingField {
            kind: "deployment",
            field: "id",
        })?;

        let deployment = match self.batch.find_deployment(project, gitlab_id).await? {
            Some(mut existing) => {
                existing.environment = fetched.environment.clone();
                existing.status = fetched.status.clone();
                existing.is_failure = fetched.is_failure;
                existing.finished_at = fetched.finished_at;
                if let Some(deployed_at) = fetched.deployed_at {
                    existing.deployed_at = deployed_at;
                }
                if !fetched.commit_sha.is_empty() {
                    existing.commit_sha = fetched.commit_sha.clone();
                }
                existing
            }
            None => {
                let deployed_at = fetched.deployed_at.ok_or(RecordProcessingError::MissingField {
                    kind: "deployment",
                    field: "created_at",
                })?;
                let mut deployment = Deployment::new(
                    project,
                    gitlab_id,
                    fetched.environment.clone(),
                    fetched.status.clone(),
                    deployed_at,
                );
                deployment.is_failure = fetched.is_failure;
                deployment.finished_at = fetched.finished_at;
                deployment.commit_sha = fetched.commit_sha.clone();
                deployment
            }
        };

        // locally derived fields survive the upsert
        self.batch.upsert_deployment(&deployment).await?;
        debug!("Upserted deployment {}", gitlab_id);
        Ok(())
    }

    async fn apply_merge_request(
        &mut self,
        project: ProjectId,
        fetched: &FetchedMergeRequest,
        identity: &mut IdentityMap,
    ) -> RecordResult<()> {
        let missing = |field| RecordProcessingError::MissingField { kind: "merge request", field };

        let gitlab_mr_id = fetched.gitlab_mr_id.ok_or_else(|| missing("id"))?;
        let gitlab_mr_iid = fetched.gitlab_mr_iid.ok_or_else(|| missing("iid"))?;
        let created_at = fetched.created_at.ok_or_else(|| missing("created_at"))?;
        let author = fetched.author.as_ref().ok_or_else(|| missing("author"))?;
        let state = MergeRequestState::parse(&fetched.state).ok_or_else(|| RecordProcessingError::UnknownState {
            gitlab_mr_id,
            state: fetched.state.clone(),
        })?;

        let author_id = identity.resolve(&mut *self.batch, project, author).await?;

        let mr = MergeRequest {
            id: MergeRequestId::new(),
            project_id: project,
            author_id,
            gitlab_mr_id,
            gitlab_mr_iid,
            title: fetched.title.clone(),
            state,
            created_at_gitlab: created_at,
            merged_at: fetched.merged_at,
            closed_at: fetched.closed_at,
            source_branch: fetched.source_branch.clone(),
            target_branch: fetched.target_branch.clone(),
            additions: fetched.additions,
            deletions: fetched.deletions,
            merge_commit_sha: fetched.merge_commit_sha.clone(),
        };
        self.batch.upsert_merge_request(&mr).await?;
        debug!("Upserted merge request !{}", gitlab_mr_iid);
        Ok(())
    }

    async fn apply_review(
        &mut self,
        project: ProjectId,
        fetched: &FetchedReview,
        identity: &mut IdentityMap,
    ) -> RecordResult<()> {
        let mr = self
            .batch
            .find_merge_request(project, fetched.gitlab_mr_id)
            .await?
            .ok_or(RecordProcessingError::UnknownMergeRequest(fetched.gitlab_mr_id))?;
        let reviewer_id = identity.resolve(&mut *self.batch, project, &fetched.reviewer).await?;

        match self.batch.find_review(mr.id, reviewer_id).await? {
            Some(mut existing) => {
                existing.reviewed_at = fetched.reviewed_at;
                existing.comment_count = fetched.comment_count;
                existing.approval_status = fetched.approval_status.clone();
                self.batch.update_review(&existing).await?;
            }
            None => {
                let review = Review {
                    id: ReviewId::new(),
                    merge_request_id: mr.id,
                    reviewer_id,
                    reviewed_at: fetched.reviewed_at,
                    comment_count: fetched.comment_count,
                    approval_status: fetched.approval_status.clone(),
                };
                self.batch.insert_review(&review).await?;
            }
        }
        Ok(())
    }
}

/// Fill derived deployment fields that are still empty.
///
/// Links a deployment to the merge request whose merge commit it deployed,
/// derives lead time from that merge request's creation, and for a failed
/// deployment derives time to restore from the next success in the same
/// environment. Values already stored are never overwritten. Returns the
/// number of deployments changed.
pub async fn derive_deployment_links<B: SyncBatch>(batch: &mut B, project: ProjectId) -> Result<usize, StorageError> {
    let merge_requests = batch.project_merge_requests(project).await?;
    let by_sha: HashMap<&str, &MergeRequest> = merge_requests
        .iter()
        .filter_map(|mr| mr.merge_commit_sha.as_deref().map(|sha| (sha, mr)))
        .collect();
    let by_iid: HashMap<i64, &MergeRequest> = merge_requests.iter().map(|mr| (mr.gitlab_mr_iid, mr)).collect();

    let deployments = batch.project_deployments(project).await?;
    let mut changed = 0;

    for (i, deployment) in deployments.iter().enumerate() {
        let mut derived = deployment.clone();

        if derived.merge_request_iid.is_none() && !derived.commit_sha.is_empty() {
            derived.merge_request_iid = by_sha.get(derived.commit_sha.as_str()).map(|mr| mr.gitlab_mr_iid);
        }

        if derived.lead_time_hours.is_none() {
            derived.lead_time_hours = derived
                .merge_request_iid
                .and_then(|iid| by_iid.get(&iid))
                .map(|mr| hours_between(mr.created_at_gitlab, derived.deployed_at))
                .filter(|hours| *hours >= 0.0);
        }

        if derived.is_failure && derived.time_to_restore_hours.is_none() {
            derived.time_to_restore_hours = deployments[i + 1..]
                .iter()
                .find(|next| {
                    next.environment == derived.environment
                        && next.status == "success"
                        && next.deployed_at > derived.deployed_at
                })
                .map(|restored| hours_between(derived.deployed_at, restored.deployed_at));
        }

        if derived != *deployment {
            batch.update_deployment(&derived).await?;
            changed += 1;
        }
    }

    debug!("Derived links for {} deployments", changed);
    Ok(changed)
}
