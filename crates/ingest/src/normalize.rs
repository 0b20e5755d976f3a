//! Normalization of raw GitLab payloads.
//!
//! Parsing is total: absent or malformed fields become `None` (or an empty
//! default) and the reconciler decides whether the record is usable.

use chrono::{DateTime, Utc};
use devpulse_core::{is_failure_status, Time};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Longest commit SHA kept.
pub const MAX_SHA_LEN: usize = 40;

/// Parse an ISO-8601 timestamp; anything unparseable is absent.
pub fn parse_timestamp(raw: Option<&str>) -> Option<Time> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Truncate a commit SHA to at most 40 characters.
pub fn truncate_sha(sha: &str) -> String {
    sha.chars().take(MAX_SHA_LEN).collect()
}

/// Decode `value` as `T`; a payload of the wrong shape decodes as `T::default()`.
fn lenient<T: for<'de> Deserialize<'de> + Default>(value: &Value) -> T {
    T::deserialize(value).unwrap_or_default()
}

// =============================================================================
// GitLab API payloads
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ProjectPayload {
    id: Option<i64>,
    name: Option<String>,
    name_with_namespace: Option<String>,
    web_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserPayload {
    id: Option<i64>,
    username: Option<String>,
    name: Option<String>,
    public_email: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EnvironmentPayload {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeploymentPayload {
    id: Option<i64>,
    status: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    sha: Option<String>,
    environment: Option<EnvironmentPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct MergeRequestPayload {
    id: Option<i64>,
    iid: Option<i64>,
    title: Option<String>,
    state: Option<String>,
    author: Option<UserPayload>,
    created_at: Option<String>,
    merged_at: Option<String>,
    closed_at: Option<String>,
    source_branch: Option<String>,
    target_branch: Option<String>,
    additions: Option<i64>,
    deletions: Option<i64>,
    merge_commit_sha: Option<String>,
    squash_commit_sha: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NotePayload {
    author: Option<UserPayload>,
    created_at: Option<String>,
    system: Option<bool>,
}

// =============================================================================
// Normalized records
// =============================================================================

/// Project metadata from `GET /projects/:id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteProject {
    /// GitLab project id
    pub gitlab_id: i64,
    /// Display name
    pub name: String,
    /// Web URL
    pub web_url: String,
}

impl RemoteProject {
    /// Normalize a project payload.
    pub fn from_json(value: &Value) -> Option<Self> {
        let raw: ProjectPayload = lenient(value);
        Some(Self {
            gitlab_id: raw.id?,
            name: raw.name_with_namespace.or(raw.name).unwrap_or_default(),
            web_url: raw.web_url.unwrap_or_default(),
        })
    }
}

/// A user reference (author, note author).
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedUser {
    /// GitLab user id
    pub gitlab_user_id: i64,
    /// Login name
    pub username: String,
    /// Display name, falling back to the username
    pub name: String,
    /// Public email
    pub email: Option<String>,
    /// Avatar URL
    pub avatar_url: Option<String>,
}

impl FetchedUser {
    /// Normalize a user payload; `None` without a numeric id.
    pub fn from_json(value: &Value) -> Option<Self> {
        Self::from_payload(lenient(value))
    }

    fn from_payload(raw: UserPayload) -> Option<Self> {
        let gitlab_user_id = raw.id?;
        let username = raw.username.unwrap_or_else(|| format!("user-{gitlab_user_id}"));
        Some(Self {
            gitlab_user_id,
            name: raw.name.unwrap_or_else(|| username.clone()),
            username,
            email: raw.public_email.or(raw.email),
            avatar_url: raw.avatar_url,
        })
    }
}

/// A deployment as reported by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedDeployment {
    /// Deployment id; required
    pub gitlab_deployment_id: Option<i64>,
    /// Environment name, `"unknown"` when absent
    pub environment: String,
    /// Raw status, `"unknown"` when absent
    pub status: String,
    /// Creation time of the deployment
    pub deployed_at: Option<Time>,
    /// Last update time of the deployment
    pub finished_at: Option<Time>,
    /// Deployed commit
    pub commit_sha: String,
    /// Derived from `status`
    pub is_failure: bool,
}

impl FetchedDeployment {
    /// Normalize a deployment payload.
    pub fn from_json(value: &Value) -> Self {
        let raw: DeploymentPayload = lenient(value);
        let status = raw.status.unwrap_or_else(|| "unknown".to_string());
        Self {
            gitlab_deployment_id: raw.id,
            environment: raw
                .environment
                .and_then(|env| env.name)
                .unwrap_or_else(|| "unknown".to_string()),
            is_failure: is_failure_status(&status),
            status,
            deployed_at: parse_timestamp(raw.created_at.as_deref()),
            finished_at: parse_timestamp(raw.updated_at.as_deref()),
            commit_sha: truncate_sha(raw.sha.as_deref().unwrap_or_default()),
        }
    }
}

/// A merge request as reported by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMergeRequest {
    /// Global id; required
    pub gitlab_mr_id: Option<i64>,
    /// Per-project sequence number
    pub gitlab_mr_iid: Option<i64>,
    /// Title
    pub title: String,
    /// Raw state string
    pub state: String,
    /// Author; required
    pub author: Option<FetchedUser>,
    /// Creation time; required
    pub created_at: Option<Time>,
    /// Merge time
    pub merged_at: Option<Time>,
    /// Close time
    pub closed_at: Option<Time>,
    /// Source branch
    pub source_branch: String,
    /// Target branch
    pub target_branch: String,
    /// Lines added, 0 when not reported
    pub additions: i64,
    /// Lines deleted, 0 when not reported
    pub deletions: i64,
    /// Merge commit, or the squash commit when there is none
    pub merge_commit_sha: Option<String>,
}

impl FetchedMergeRequest {
    /// Normalize a merge request payload.
    pub fn from_json(value: &Value) -> Self {
        let raw: MergeRequestPayload = lenient(value);
        let merge_commit_sha = raw
            .merge_commit_sha
            .filter(|sha| !sha.is_empty())
            .or(raw.squash_commit_sha)
            .filter(|sha| !sha.is_empty())
            .map(|sha| truncate_sha(&sha));

        Self {
            gitlab_mr_id: raw.id,
            gitlab_mr_iid: raw.iid,
            title: raw.title.unwrap_or_default(),
            state: raw.state.unwrap_or_default(),
            author: raw.author.and_then(FetchedUser::from_payload),
            created_at: parse_timestamp(raw.created_at.as_deref()),
            merged_at: parse_timestamp(raw.merged_at.as_deref()),
            closed_at: parse_timestamp(raw.closed_at.as_deref()),
            source_branch: raw.source_branch.unwrap_or_default(),
            target_branch: raw.target_branch.unwrap_or_default(),
            additions: raw.additions.unwrap_or(0),
            deletions: raw.deletions.unwrap_or(0),
            merge_commit_sha,
        }
    }
}

/// A discussion note on a merge request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedNote {
    /// Note author
    pub author: Option<FetchedUser>,
    /// Creation time
    pub created_at: Option<Time>,
    /// Generated by GitLab rather than written by a person
    pub system: bool,
}

impl FetchedNote {
    /// Normalize a note payload.
    pub fn from_json(value: &Value) -> Self {
        let raw: NotePayload = lenient(value);
        Self {
            author: raw.author.and_then(FetchedUser::from_payload),
            created_at: parse_timestamp(raw.created_at.as_deref()),
            system: raw.system.unwrap_or(false),
        }
    }
}

/// One reviewer's activity on one merge request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedReview {
    /// Reviewed merge request (global id)
    pub gitlab_mr_id: i64,
    /// Reviewer
    pub reviewer: FetchedUser,
    /// Time of the reviewer's first note
    pub reviewed_at: Time,
    /// Notes left by the reviewer
    pub comment_count: i64,
    /// Outcome
    pub approval_status: Option<String>,
}

/// Fold the notes of one merge request into per-reviewer reviews.
///
/// System notes, notes without author or timestamp, and the MR author's own
/// notes are ignored.
pub fn reviews_from_notes(gitlab_mr_id: i64, author_user_id: Option<i64>, notes: &[FetchedNote]) -> Vec<FetchedReview> {
    let mut by_reviewer: BTreeMap<i64, FetchedReview> = BTreeMap::new();

    for note in notes.iter().filter(|n| !n.system) {
        let (Some(user), Some(created_at)) = (&note.author, note.created_at) else {
            continue;
        };
        if Some(user.gitlab_user_id) == author_user_id {
            continue;
        }

        by_reviewer
            .entry(user.gitlab_user_id)
            .and_modify(|review| {
                review.comment_count += 1;
                review.reviewed_at = review.reviewed_at.min(created_at);
            })
            .or_insert_with(|| FetchedReview {
                gitlab_mr_id,
                reviewer: user.clone(),
                reviewed_at: created_at,
                comment_count: 1,
                approval_status: Some("commented".to_string()),
            });
    }

    by_reviewer.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp() {
        let t = parse_timestamp(Some("2024-03-01T10:00:00.000+02:00")).unwrap();
        assert_eq!(t, "2024-03-01T08:00:00Z".parse::<Time>().unwrap());
        assert_eq!(parse_timestamp(Some("yesterday")), None);
        assert_eq!(parse_timestamp(Some("")), None);
        assert_eq!(parse_timestamp(None), None);
    }

    #[test]
    fn test_deployment_normalization() {
        let sha = "a".repeat(64);
        let d = FetchedDeployment::from_json(&json!({
            "id": 17,
            "status": "canceled",
            "created_at": "2024-03-01T10:00:00Z",
            "updated_at": "not a date",
            "sha": sha,
            "environment": { "name": "production" }
        }));

        assert_eq!(d.gitlab_deployment_id, Some(17));
        assert_eq!(d.environment, "production");
        assert!(d.is_failure);
        assert_eq!(d.commit_sha.len(), 40);
        assert!(d.deployed_at.is_some());
        assert_eq!(d.finished_at, None);
    }

    #[test]
    fn test_deployment_defaults() {
        let d = FetchedDeployment::from_json(&json!({ "id": 1 }));
        assert_eq!(d.environment, "unknown");
        assert_eq!(d.status, "unknown");
        assert!(!d.is_failure);
        assert_eq!(d.commit_sha, "");
        assert_eq!(d.deployed_at, None);
    }

    #[test]
    fn test_merge_request_normalization() {
        let mr = FetchedMergeRequest::from_json(&json!({
            "id": 9001,
            "iid": 12,
            "title": "Add checkout",
            "state": "merged",
            "author": { "id": 5, "username": "alice", "name": "Alice" },
            "created_at": "2024-03-01T10:00:00Z",
            "merged_at": "2024-03-02T10:00:00Z",
            "closed_at": null,
            "source_branch": "checkout",
            "target_branch": "main",
            "merge_commit_sha": null,
            "squash_commit_sha": "abc123"
        }));

        assert_eq!(mr.gitlab_mr_id, Some(9001));
        assert_eq!(mr.author.as_ref().map(|a| a.username.as_str()), Some("alice"));
        assert_eq!(mr.closed_at, None);
        assert_eq!(mr.additions, 0);
        assert_eq!(mr.merge_commit_sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_wrong_shaped_payload_is_unusable() {
        let d = FetchedDeployment::from_json(&json!({ "id": "seventeen", "status": "success" }));
        assert_eq!(d.gitlab_deployment_id, None);

        let mr = FetchedMergeRequest::from_json(&json!(["not", "an", "object"]));
        assert_eq!(mr.gitlab_mr_id, None);
        assert_eq!(mr.author, None);
    }

    #[test]
    fn test_user_name_falls_back_to_username() {
        let user = FetchedUser::from_json(&json!({ "id": 3, "username": "bob" })).unwrap();
        assert_eq!(user.name, "bob");
        assert_eq!(FetchedUser::from_json(&json!({ "username": "ghost" })), None);
    }

    #[test]
    fn test_reviews_from_notes() {
        let note = |user: i64, at: &str, system: bool| {
            FetchedNote::from_json(&json!({
                "author": { "id": user, "username": format!("u{user}") },
                "created_at": at,
                "system": system
            }))
        };
        let notes = vec![
            note(2, "2024-03-01T12:00:00Z", false),
            note(2, "2024-03-01T11:00:00Z", false),
            note(1, "2024-03-01T11:30:00Z", false),
            note(3, "2024-03-01T09:00:00Z", true),
            note(4, "2024-03-02T08:00:00Z", false),
        ];

        let reviews = reviews_from_notes(77, Some(1), &notes);
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].reviewer.gitlab_user_id, 2);
        assert_eq!(reviews[0].comment_count, 2);
        assert_eq!(reviews[0].reviewed_at, "2024-03-01T11:00:00Z".parse::<Time>().unwrap());
        assert_eq!(reviews[1].reviewer.gitlab_user_id, 4);
        assert_eq!(reviews[1].gitlab_mr_id, 77);
    }
}
