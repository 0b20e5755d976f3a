//! Team activity and review load.

use std::collections::HashMap;
use std::sync::Arc;

use devpulse_core::{
    hours_between, DateWindow, MemberActivity, MemberId, MergeRequest, MergeRequestState,
    ProjectId, Review, ReviewLoad, ReviewWithContext, TeamMember,
};
use devpulse_storage::Storage;
use tracing::{debug, info};

use crate::policy::EstimationPolicy;
use crate::stats::{mean, round2};
use crate::{require_project, Result};

/// Activity of one member from the MRs they authored and the reviews they gave.
pub fn member_activity(
    member: &TeamMember,
    authored: &[MergeRequest],
    reviews: &[ReviewWithContext],
    policy: &EstimationPolicy,
) -> MemberActivity {
    let mrs_created = authored.len() as i64;
    let mrs_merged = authored
        .iter()
        .filter(|mr| mr.state == MergeRequestState::Merged)
        .count() as i64;
    let mrs_closed = authored
        .iter()
        .filter(|mr| mr.state == MergeRequestState::Closed && mr.merged_at.is_none())
        .count() as i64;

    let review_hours: Vec<f64> = reviews
        .iter()
        .map(|r| hours_between(r.merge_request_created_at, r.review.reviewed_at))
        .collect();

    MemberActivity {
        team_member_id: member.id,
        username: member.username.clone(),
        name: member.name.clone(),
        commit_count: policy.estimated_commits(mrs_created),
        lines_added: authored.iter().map(|mr| mr.additions).sum(),
        lines_deleted: authored.iter().map(|mr| mr.deletions).sum(),
        mrs_created,
        mrs_merged,
        mrs_closed,
        reviews_given: reviews.len() as i64,
        review_comments: reviews.iter().map(|r| r.review.comment_count).sum(),
        avg_review_time_hours: mean(&review_hours),
    }
}

/// Each reviewer's share of `reviews`, busiest reviewer first.
///
/// Reviews by someone not in `members` are ignored.
pub fn review_load(members: &[TeamMember], reviews: &[Review]) -> Vec<ReviewLoad> {
    let by_id: HashMap<MemberId, &TeamMember> = members.iter().map(|m| (m.id, m)).collect();

    let mut tally: HashMap<MemberId, (i64, i64)> = HashMap::new();
    for review in reviews.iter().filter(|r| by_id.contains_key(&r.reviewer_id)) {
        let entry = tally.entry(review.reviewer_id).or_default();
        entry.0 += 1;
        entry.1 += review.comment_count;
    }

    let total: i64 = tally.values().map(|(count, _)| count).sum();

    let mut loads: Vec<ReviewLoad> = tally
        .into_iter()
        .filter_map(|(id, (review_count, comment_count))| {
            let member = by_id.get(&id)?;
            let share = if total > 0 {
                review_count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            Some(ReviewLoad {
                team_member_id: id,
                username: member.username.clone(),
                name: member.name.clone(),
                review_count,
                comment_count,
                review_load_percentage: round2(share),
            })
        })
        .collect();

    loads.sort_by(|a, b| {
        b.review_count
            .cmp(&a.review_count)
            .then_with(|| a.username.cmp(&b.username))
    });
    loads
}

/// Team activity analyzer backed by stored records.
pub struct ActivityAnalyzer<S: Storage> {
    storage: Arc<S>,
    policy: EstimationPolicy,
}

impl<S: Storage> ActivityAnalyzer<S> {
    /// Create an analyzer with the default estimation policy.
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_policy(storage, EstimationPolicy::default())
    }

    /// Create an analyzer with a custom estimation policy.
    pub fn with_policy(storage: Arc<S>, policy: EstimationPolicy) -> Self {
        Self { storage, policy }
    }

    /// Activity of every team member of the project, active or not.
    pub async fn calculate_activity_metrics(
        &self,
        project_id: ProjectId,
        window: &DateWindow,
    ) -> Result<Vec<MemberActivity>> {
        require_project(self.storage.as_ref(), project_id).await?;

        let members = self.storage.list_team_members(project_id).await?;
        let mut activity = Vec::with_capacity(members.len());

        for member in &members {
            let authored = self.storage.list_authored_merge_requests(member.id, window).await?;
            let reviews = self.storage.list_reviews_by_reviewer(member.id, window).await?;
            debug!(
                "{}: {} authored MRs, {} reviews",
                member.username,
                authored.len(),
                reviews.len()
            );
            activity.push(member_activity(member, &authored, &reviews, &self.policy));
        }

        info!("Calculated activity for {} members of project {}", activity.len(), project_id);
        Ok(activity)
    }

    /// Share of the project's in-window reviews handled by each reviewer.
    pub async fn get_review_load_distribution(
        &self,
        project_id: ProjectId,
        window: &DateWindow,
    ) -> Result<Vec<ReviewLoad>> {
        require_project(self.storage.as_ref(), project_id).await?;

        let members = self.storage.list_team_members(project_id).await?;
        let reviews = self.storage.list_project_reviews(project_id, window).await?;

        Ok(review_load(&members, &reviews))
    }

    /// Calculate and upsert one activity snapshot per member.
    pub async fn calculate_and_save(
        &self,
        project_id: ProjectId,
        window: &DateWindow,
    ) -> Result<Vec<MemberActivity>> {
        let activity = self.calculate_activity_metrics(project_id, window).await?;
        for metrics in &activity {
            self.storage.save_activity_metrics(window, metrics).await?;
        }
        Ok(activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, member, merge_request, seeded_storage};
    use crate::MetricsError;
    use devpulse_core::{Project, ReviewId};
    use devpulse_storage::SyncBatch;
    use pretty_assertions::assert_eq;

    fn review(mr: &MergeRequest, reviewer: &TeamMember, when: &str, comments: i64) -> Review {
        Review {
            id: ReviewId::new(),
            merge_request_id: mr.id,
            reviewer_id: reviewer.id,
            reviewed_at: at(when),
            comment_count: comments,
            approval_status: None,
        }
    }

    #[test]
    fn test_member_activity_counts() {
        let project = Project::new(1, "api", "https://example.com/api");
        let alice = member(&project, 1, "alice");

        let mut merged = merge_request(&project, &alice, 1, "2024-01-02T00:00:00Z");
        merged.state = MergeRequestState::Merged;
        merged.merged_at = Some(at("2024-01-03T00:00:00Z"));
        merged.additions = 120;
        merged.deletions = 30;

        let mut closed = merge_request(&project, &alice, 2, "2024-01-04T00:00:00Z");
        closed.state = MergeRequestState::Closed;
        closed.closed_at = Some(at("2024-01-05T00:00:00Z"));
        closed.additions = 5;

        let open = merge_request(&project, &alice, 3, "2024-01-06T00:00:00Z");

        let bob = member(&project, 2, "bob");
        let other = merge_request(&project, &bob, 4, "2024-01-01T00:00:00Z");
        let reviews = vec![
            ReviewWithContext {
                review: review(&other, &alice, "2024-01-01T02:00:00Z", 3),
                merge_request_created_at: other.created_at_gitlab,
            },
            ReviewWithContext {
                review: review(&other, &alice, "2024-01-01T06:00:00Z", 1),
                merge_request_created_at: other.created_at_gitlab,
            },
        ];

        let activity = member_activity(&alice, &[merged, closed, open], &reviews, &EstimationPolicy::default());
        assert_eq!(activity.mrs_created, 3);
        assert_eq!(activity.mrs_merged, 1);
        assert_eq!(activity.mrs_closed, 1);
        assert_eq!(activity.commit_count, 9);
        assert_eq!(activity.lines_added, 125);
        assert_eq!(activity.lines_deleted, 30);
        assert_eq!(activity.reviews_given, 2);
        assert_eq!(activity.review_comments, 4);
        assert_eq!(activity.avg_review_time_hours, Some(4.0));
    }

    #[test]
    fn test_inactive_member_has_null_review_time() {
        let project = Project::new(1, "api", "https://example.com/api");
        let idle = member(&project, 9, "idle");

        let activity = member_activity(&idle, &[], &[], &EstimationPolicy::default());
        assert_eq!(activity.mrs_created, 0);
        assert_eq!(activity.commit_count, 0);
        assert_eq!(activity.avg_review_time_hours, None);
    }

    #[test]
    fn test_review_load_share() {
        let project = Project::new(1, "api", "https://example.com/api");
        let author = member(&project, 1, "author");
        let busy = member(&project, 2, "busy");
        let light = member(&project, 3, "light");
        let mr = merge_request(&project, &author, 1, "2024-01-01T00:00:00Z");

        let mut reviews = Vec::new();
        for _ in 0..3 {
            reviews.push(review(&mr, &light, "2024-01-02T00:00:00Z", 1));
        }
        for _ in 0..7 {
            reviews.push(review(&mr, &busy, "2024-01-02T00:00:00Z", 2));
        }

        let loads = review_load(&[author, busy, light], &reviews);
        assert_eq!(loads.len(), 2);
        assert_eq!(loads[0].username, "busy");
        assert_eq!(loads[0].review_load_percentage, 70.0);
        assert_eq!(loads[0].comment_count, 14);
        assert_eq!(loads[1].username, "light");
        assert_eq!(loads[1].review_count, 3);
        assert_eq!(loads[1].review_load_percentage, 30.0);
    }

    #[test]
    fn test_review_load_empty() {
        assert!(review_load(&[], &[]).is_empty());
    }

    #[tokio::test]
    async fn test_analyzer_covers_every_member() {
        let (storage, project) = seeded_storage().await;
        let alice = member(&project, 1, "alice");
        let bob = member(&project, 2, "bob");
        let idle = member(&project, 3, "idle");

        let mut mr = merge_request(&project, &alice, 1, "2024-01-10T00:00:00Z");
        mr.state = MergeRequestState::Merged;
        mr.merged_at = Some(at("2024-01-11T00:00:00Z"));
        mr.additions = 40;

        let mut batch = storage.begin().await.unwrap();
        for m in [&alice, &bob, &idle] {
            batch.insert_member(m).await.unwrap();
        }
        batch.upsert_merge_request(&mr).await.unwrap();
        batch.insert_review(&review(&mr, &bob, "2024-01-10T12:00:00Z", 5)).await.unwrap();
        batch.commit().await.unwrap();

        let analyzer = ActivityAnalyzer::new(storage.clone());
        let window = DateWindow::from_dates("2024-01-01", "2024-01-31").unwrap();

        let activity = analyzer.calculate_and_save(project.id, &window).await.unwrap();
        assert_eq!(activity.len(), 3);

        let by_name: HashMap<&str, &MemberActivity> =
            activity.iter().map(|a| (a.username.as_str(), a)).collect();
        assert_eq!(by_name["alice"].mrs_merged, 1);
        assert_eq!(by_name["alice"].lines_added, 40);
        assert_eq!(by_name["bob"].reviews_given, 1);
        assert_eq!(by_name["bob"].avg_review_time_hours, Some(12.0));
        assert_eq!(by_name["idle"].mrs_created, 0);

        let saved = storage.load_activity_metrics(bob.id, &window).await.unwrap();
        assert_eq!(saved.as_ref(), Some(by_name["bob"]));

        let loads = analyzer.get_review_load_distribution(project.id, &window).await.unwrap();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].review_load_percentage, 100.0);
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let (storage, _) = seeded_storage().await;
        let analyzer = ActivityAnalyzer::new(storage);
        let window = DateWindow::from_dates("2024-01-01", "2024-01-31").unwrap();

        let err = analyzer.calculate_activity_metrics(ProjectId::new(), &window).await.unwrap_err();
        assert!(matches!(err, MetricsError::NotFound(_)));
    }
}
