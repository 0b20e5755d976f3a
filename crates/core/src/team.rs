//! Contributors, merge requests and reviews.

use serde::{Deserialize, Serialize};
use crate::id::{MemberId, MergeRequestId, ProjectId, ReviewId};
use crate::Time;

/// A contributor observed in a project.
///
/// Created lazily the first time the user shows up as an author or reviewer;
/// `(project_id, gitlab_user_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    /// Unique identifier
    pub id: MemberId,
    /// Owning project
    pub project_id: ProjectId,
    /// User id on the external platform
    pub gitlab_user_id: i64,
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Email, when the platform exposes it
    pub email: Option<String>,
    /// Avatar URL
    pub avatar_url: Option<String>,
}

/// Lifecycle state of a merge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeRequestState {
    /// Open (including platform-side "locked")
    Opened,
    /// Merged into the target branch
    Merged,
    /// Closed without merging
    Closed,
}

impl MergeRequestState {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRequestState::Opened => "opened",
            MergeRequestState::Merged => "merged",
            MergeRequestState::Closed => "closed",
        }
    }

    /// Parse a platform state string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opened" | "locked" => Some(MergeRequestState::Opened),
            "merged" => Some(MergeRequestState::Merged),
            "closed" => Some(MergeRequestState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MergeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A merge request, owned by a project and authored by a team member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Unique identifier
    pub id: MergeRequestId,
    /// Owning project
    pub project_id: ProjectId,
    /// Author
    pub author_id: MemberId,
    /// Global id on the external platform (unique per project)
    pub gitlab_mr_id: i64,
    /// Per-project sequence number
    pub gitlab_mr_iid: i64,
    /// Title
    pub title: String,
    /// Lifecycle state
    pub state: MergeRequestState,
    /// Creation time on the platform
    pub created_at_gitlab: Time,
    /// Merge time
    pub merged_at: Option<Time>,
    /// Close time
    pub closed_at: Option<Time>,
    /// Source branch
    pub source_branch: String,
    /// Target branch
    pub target_branch: String,
    /// Lines added
    pub additions: i64,
    /// Lines deleted
    pub deletions: i64,
    /// Commit produced by the merge (or squash), used to link deployments
    pub merge_commit_sha: Option<String>,
}

/// One reviewer's review of a merge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Unique identifier
    pub id: ReviewId,
    /// Reviewed merge request
    pub merge_request_id: MergeRequestId,
    /// Reviewer
    pub reviewer_id: MemberId,
    /// When the review happened
    pub reviewed_at: Time,
    /// Number of review comments
    pub comment_count: i64,
    /// Outcome, e.g. "approved" or "commented"
    pub approval_status: Option<String>,
}

/// A review joined with the creation time of the merge request it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewWithContext {
    /// The review
    pub review: Review,
    /// Creation time of the reviewed merge request
    pub merge_request_created_at: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse() {
        assert_eq!(MergeRequestState::parse("merged"), Some(MergeRequestState::Merged));
        assert_eq!(MergeRequestState::parse("locked"), Some(MergeRequestState::Opened));
        assert_eq!(MergeRequestState::parse("draft"), None);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&MergeRequestState::Closed).unwrap();
        assert_eq!(json, "\"closed\"");
    }
}
