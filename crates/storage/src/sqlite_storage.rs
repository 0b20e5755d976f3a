//! SQLite storage backend for DevPulse.
//!
//! Every natural key of the data model is a `UNIQUE` constraint and every
//! child table cascades on project deletion. Timestamps are stored as
//! fixed-width RFC 3339 UTC text, so window filters compare lexically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use devpulse_core::{
    DateWindow, Deployment, FourKeysResult, MemberActivity, MemberId, MergeRequest,
    MergeRequestId, MergeRequestState, Project, ProjectId, Review, ReviewWithContext,
    TeamMember, Time,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use ulid::Ulid;

use super::trait_::{Result, Storage, StorageError, SyncBatch};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        gitlab_id INTEGER NOT NULL UNIQUE,
        name TEXT NOT NULL,
        url TEXT NOT NULL,
        last_synced_at TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS deployments (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        gitlab_deployment_id INTEGER NOT NULL,
        environment TEXT NOT NULL,
        status TEXT NOT NULL,
        deployed_at TEXT NOT NULL,
        finished_at TEXT,
        commit_sha TEXT NOT NULL,
        merge_request_iid INTEGER,
        is_failure INTEGER NOT NULL DEFAULT 0,
        lead_time_hours REAL,
        time_to_restore_hours REAL,
        UNIQUE (project_id, gitlab_deployment_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_deployments_deployed_at ON deployments(project_id, deployed_at)",
    "CREATE TABLE IF NOT EXISTS team_members (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        gitlab_user_id INTEGER NOT NULL,
        username TEXT NOT NULL,
        name TEXT NOT NULL,
        email TEXT,
        avatar_url TEXT,
        UNIQUE (project_id, gitlab_user_id)
    )",
    "CREATE TABLE IF NOT EXISTS merge_requests (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        author_id TEXT NOT NULL REFERENCES team_members(id) ON DELETE CASCADE,
        gitlab_mr_id INTEGER NOT NULL,
        gitlab_mr_iid INTEGER NOT NULL,
        title TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at_gitlab TEXT NOT NULL,
        merged_at TEXT,
        closed_at TEXT,
        source_branch TEXT NOT NULL,
        target_branch TEXT NOT NULL,
        additions INTEGER NOT NULL DEFAULT 0,
        deletions INTEGER NOT NULL DEFAULT 0,
        merge_commit_sha TEXT,
        UNIQUE (project_id, gitlab_mr_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_merge_requests_merged_at ON merge_requests(project_id, state, merged_at)",
    "CREATE INDEX IF NOT EXISTS idx_merge_requests_author ON merge_requests(author_id, created_at_gitlab)",
    "CREATE TABLE IF NOT EXISTS reviews (
        id TEXT PRIMARY KEY,
        merge_request_id TEXT NOT NULL REFERENCES merge_requests(id) ON DELETE CASCADE,
        reviewer_id TEXT NOT NULL REFERENCES team_members(id) ON DELETE CASCADE,
        reviewed_at TEXT NOT NULL,
        comment_count INTEGER NOT NULL DEFAULT 0,
        approval_status TEXT,
        UNIQUE (merge_request_id, reviewer_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_reviews_reviewer ON reviews(reviewer_id, reviewed_at)",
    "CREATE TABLE IF NOT EXISTS four_keys_metrics (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        period_start TEXT NOT NULL,
        period_end TEXT NOT NULL,
        deployment_frequency REAL NOT NULL,
        deployment_count INTEGER NOT NULL,
        lead_time_hours REAL,
        lead_time_median_hours REAL,
        change_failure_rate REAL,
        failed_deployment_count INTEGER NOT NULL DEFAULT 0,
        time_to_restore_hours REAL,
        time_to_restore_median_hours REAL,
        UNIQUE (project_id, period_start, period_end)
    )",
    "CREATE TABLE IF NOT EXISTS activity_metrics (
        id TEXT PRIMARY KEY,
        team_member_id TEXT NOT NULL REFERENCES team_members(id) ON DELETE CASCADE,
        period_start TEXT NOT NULL,
        period_end TEXT NOT NULL,
        commit_count INTEGER NOT NULL DEFAULT 0,
        lines_added INTEGER NOT NULL DEFAULT 0,
        lines_deleted INTEGER NOT NULL DEFAULT 0,
        mrs_created INTEGER NOT NULL DEFAULT 0,
        mrs_merged INTEGER NOT NULL DEFAULT 0,
        mrs_closed INTEGER NOT NULL DEFAULT 0,
        reviews_given INTEGER NOT NULL DEFAULT 0,
        review_comments INTEGER NOT NULL DEFAULT 0,
        avg_review_time_hours REAL,
        UNIQUE (team_member_id, period_start, period_end)
    )",
];

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const DEPLOYMENT_COLUMNS: &str = "id, project_id, gitlab_deployment_id, environment, status, \
    deployed_at, finished_at, commit_sha, merge_request_iid, is_failure, lead_time_hours, \
    time_to_restore_hours";

const MERGE_REQUEST_COLUMNS: &str = "id, project_id, author_id, gitlab_mr_id, gitlab_mr_iid, \
    title, state, created_at_gitlab, merged_at, closed_at, source_branch, target_branch, \
    additions, deletions, merge_commit_sha";

const MEMBER_COLUMNS: &str = "id, project_id, gitlab_user_id, username, name, email, avatar_url";

const REVIEW_COLUMNS: &str = "id, merge_request_id, reviewer_id, reviewed_at, comment_count, approval_status";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Database connection pool
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) a database file.
    pub async fn new_from_path(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory SQLite storage for testing.
    ///
    /// The pool holds exactly one connection that never expires, since each
    /// SQLite connection to `:memory:` is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Initialize the database schema.
    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema initialized ({} statements)", SCHEMA.len());
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    type Batch = SqliteBatch;

    // === Project operations ===

    async fn register_project(&self, project: &Project) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO projects (id, gitlab_id, name, url, last_synced_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(project.id.to_string())
        .bind(project.gitlab_id)
        .bind(&project.name)
        .bind(&project.url)
        .bind(opt_ts(project.last_synced_at))
        .bind(ts(&project.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StorageError::Conflict(
                format!("project with GitLab ID {} already exists", project.gitlab_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_project(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, gitlab_id, name, url, last_synced_at, created_at FROM projects WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query(
            "SELECT id, gitlab_id, name, url, last_synced_at, created_at FROM projects ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(project_from_row).collect()
    }

    async fn delete_project(&self, id: ProjectId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // === Window queries ===

    async fn list_deployments(&self, project: ProjectId, window: &DateWindow) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments
            WHERE project_id = ? AND deployed_at >= ? AND deployed_at <= ?
            ORDER BY deployed_at"
        ))
        .bind(project.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(deployment_from_row).collect()
    }

    async fn list_merged_merge_requests(
        &self,
        project: ProjectId,
        window: &DateWindow,
    ) -> Result<Vec<MergeRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {MERGE_REQUEST_COLUMNS} FROM merge_requests
            WHERE project_id = ? AND state = 'merged' AND merged_at >= ? AND merged_at <= ?
            ORDER BY merged_at"
        ))
        .bind(project.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(merge_request_from_row).collect()
    }

    async fn list_authored_merge_requests(
        &self,
        author: MemberId,
        window: &DateWindow,
    ) -> Result<Vec<MergeRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {MERGE_REQUEST_COLUMNS} FROM merge_requests
            WHERE author_id = ? AND created_at_gitlab >= ? AND created_at_gitlab <= ?
            ORDER BY created_at_gitlab"
        ))
        .bind(author.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(merge_request_from_row).collect()
    }

    async fn list_reviews_by_reviewer(
        &self,
        reviewer: MemberId,
        window: &DateWindow,
    ) -> Result<Vec<ReviewWithContext>> {
        let rows = sqlx::query(
            "SELECT r.id, r.merge_request_id, r.reviewer_id, r.reviewed_at, r.comment_count,
                r.approval_status, m.created_at_gitlab AS mr_created_at
            FROM reviews r JOIN merge_requests m ON m.id = r.merge_request_id
            WHERE r.reviewer_id = ? AND r.reviewed_at >= ? AND r.reviewed_at <= ?
            ORDER BY r.reviewed_at",
        )
        .bind(reviewer.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ReviewWithContext {
                    review: review_from_row(row)?,
                    merge_request_created_at: get_time(row, "mr_created_at")?,
                })
            })
            .collect()
    }

    async fn list_project_reviews(&self, project: ProjectId, window: &DateWindow) -> Result<Vec<Review>> {
        let rows = sqlx::query(
            "SELECT r.id, r.merge_request_id, r.reviewer_id, r.reviewed_at, r.comment_count, r.approval_status
            FROM reviews r JOIN merge_requests m ON m.id = r.merge_request_id
            WHERE m.project_id = ? AND r.reviewed_at >= ? AND r.reviewed_at <= ?
            ORDER BY r.reviewed_at",
        )
        .bind(project.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(review_from_row).collect()
    }

    async fn list_team_members(&self, project: ProjectId) -> Result<Vec<TeamMember>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM team_members WHERE project_id = ? ORDER BY username"
        ))
        .bind(project.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    async fn count_deployments(&self, project: ProjectId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deployments WHERE project_id = ?")
            .bind(project.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_merge_requests(&self, project: ProjectId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM merge_requests WHERE project_id = ?")
            .bind(project.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // === Metric snapshots ===

    async fn save_four_keys(&self, project: ProjectId, metrics: &FourKeysResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO four_keys_metrics (id, project_id, period_start, period_end,
                deployment_frequency, deployment_count, lead_time_hours, lead_time_median_hours,
                change_failure_rate, failed_deployment_count, time_to_restore_hours,
                time_to_restore_median_hours)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, period_start, period_end) DO UPDATE SET
                deployment_frequency = excluded.deployment_frequency,
                deployment_count = excluded.deployment_count,
                lead_time_hours = excluded.lead_time_hours,
                lead_time_median_hours = excluded.lead_time_median_hours,
                change_failure_rate = excluded.change_failure_rate,
                failed_deployment_count = excluded.failed_deployment_count,
                time_to_restore_hours = excluded.time_to_restore_hours,
                time_to_restore_median_hours = excluded.time_to_restore_median_hours",
        )
        .bind(Ulid::new().to_string())
        .bind(project.to_string())
        .bind(ts(&metrics.period_start))
        .bind(ts(&metrics.period_end))
        .bind(metrics.deployment_frequency)
        .bind(metrics.deployment_count)
        .bind(metrics.lead_time_hours)
        .bind(metrics.lead_time_median_hours)
        .bind(metrics.change_failure_rate)
        .bind(metrics.failed_deployment_count)
        .bind(metrics.time_to_restore_hours)
        .bind(metrics.time_to_restore_median_hours)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_four_keys(&self, project: ProjectId, window: &DateWindow) -> Result<Option<FourKeysResult>> {
        let row = sqlx::query(
            "SELECT period_start, period_end, deployment_frequency, deployment_count,
                lead_time_hours, lead_time_median_hours, change_failure_rate,
                failed_deployment_count, time_to_restore_hours, time_to_restore_median_hours
            FROM four_keys_metrics
            WHERE project_id = ? AND period_start = ? AND period_end = ?",
        )
        .bind(project.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| {
                Ok(FourKeysResult {
                    period_start: get_time(row, "period_start")?,
                    period_end: get_time(row, "period_end")?,
                    deployment_frequency: row.try_get("deployment_frequency")?,
                    deployment_count: row.try_get("deployment_count")?,
                    lead_time_hours: row.try_get("lead_time_hours")?,
                    lead_time_median_hours: row.try_get("lead_time_median_hours")?,
                    change_failure_rate: row.try_get("change_failure_rate")?,
                    failed_deployment_count: row.try_get("failed_deployment_count")?,
                    time_to_restore_hours: row.try_get("time_to_restore_hours")?,
                    time_to_restore_median_hours: row.try_get("time_to_restore_median_hours")?,
                })
            })
            .transpose()
    }

    async fn save_activity_metrics(&self, window: &DateWindow, metrics: &MemberActivity) -> Result<()> {
        sqlx::query(
            "INSERT INTO activity_metrics (id, team_member_id, period_start, period_end,
                commit_count, lines_added, lines_deleted, mrs_created, mrs_merged, mrs_closed,
                reviews_given, review_comments, avg_review_time_hours)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (team_member_id, period_start, period_end) DO UPDATE SET
                commit_count = excluded.commit_count,
                lines_added = excluded.lines_added,
                lines_deleted = excluded.lines_deleted,
                mrs_created = excluded.mrs_created,
                mrs_merged = excluded.mrs_merged,
                mrs_closed = excluded.mrs_closed,
                reviews_given = excluded.reviews_given,
                review_comments = excluded.review_comments,
                avg_review_time_hours = excluded.avg_review_time_hours",
        )
        .bind(Ulid::new().to_string())
        .bind(metrics.team_member_id.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .bind(metrics.commit_count)
        .bind(metrics.lines_added)
        .bind(metrics.lines_deleted)
        .bind(metrics.mrs_created)
        .bind(metrics.mrs_merged)
        .bind(metrics.mrs_closed)
        .bind(metrics.reviews_given)
        .bind(metrics.review_comments)
        .bind(metrics.avg_review_time_hours)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_activity_metrics(
        &self,
        member: MemberId,
        window: &DateWindow,
    ) -> Result<Option<MemberActivity>> {
        let row = sqlx::query(
            "SELECT a.team_member_id, t.username, t.name, a.commit_count, a.lines_added,
                a.lines_deleted, a.mrs_created, a.mrs_merged, a.mrs_closed, a.reviews_given,
                a.review_comments, a.avg_review_time_hours
            FROM activity_metrics a JOIN team_members t ON t.id = a.team_member_id
            WHERE a.team_member_id = ? AND a.period_start = ? AND a.period_end = ?",
        )
        .bind(member.to_string())
        .bind(ts(&window.start))
        .bind(ts(&window.end))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| {
                Ok(MemberActivity {
                    team_member_id: get_id(row, "team_member_id")?,
                    username: row.try_get("username")?,
                    name: row.try_get("name")?,
                    commit_count: row.try_get("commit_count")?,
                    lines_added: row.try_get("lines_added")?,
                    lines_deleted: row.try_get("lines_deleted")?,
                    mrs_created: row.try_get("mrs_created")?,
                    mrs_merged: row.try_get("mrs_merged")?,
                    mrs_closed: row.try_get("mrs_closed")?,
                    reviews_given: row.try_get("reviews_given")?,
                    review_comments: row.try_get("review_comments")?,
                    avg_review_time_hours: row.try_get("avg_review_time_hours")?,
                })
            })
            .transpose()
    }

    // === Transaction support ===

    async fn begin(&self) -> Result<SqliteBatch> {
        let mut tx = self.pool.begin().await?;

        // first statement must be a write: takes the write lock up front,
        // like BEGIN IMMEDIATE
        sqlx::query("UPDATE projects SET id = id WHERE 0")
            .execute(&mut *tx)
            .await?;

        Ok(SqliteBatch { tx })
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// One SQLite transaction used by a reconciliation pass.
pub struct SqliteBatch {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl SyncBatch for SqliteBatch {
    async fn find_deployment(&mut self, project: ProjectId, gitlab_deployment_id: i64) -> Result<Option<Deployment>> {
        let row = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE project_id = ? AND gitlab_deployment_id = ?"
        ))
        .bind(project.to_string())
        .bind(gitlab_deployment_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(deployment_from_row).transpose()
    }

    async fn upsert_deployment(&mut self, d: &Deployment) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO deployments ({DEPLOYMENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, gitlab_deployment_id) DO UPDATE SET
                environment = excluded.environment,
                status = excluded.status,
                deployed_at = excluded.deployed_at,
                finished_at = excluded.finished_at,
                commit_sha = excluded.commit_sha,
                is_failure = excluded.is_failure,
                time_to_restore_hours = CASE WHEN excluded.is_failure
                    THEN deployments.time_to_restore_hours END"
        ))
        .bind(d.id.to_string())
        .bind(d.project_id.to_string())
        .bind(d.gitlab_deployment_id)
        .bind(&d.environment)
        .bind(&d.status)
        .bind(ts(&d.deployed_at))
        .bind(opt_ts(d.finished_at))
        .bind(&d.commit_sha)
        .bind(d.merge_request_iid)
        .bind(d.is_failure)
        .bind(d.lead_time_hours)
        .bind(d.time_to_restore_hours)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn update_deployment(&mut self, d: &Deployment) -> Result<()> {
        let result = sqlx::query(
            "UPDATE deployments SET environment = ?, status = ?, deployed_at = ?, finished_at = ?,
                commit_sha = ?, merge_request_iid = ?, is_failure = ?, lead_time_hours = ?,
                time_to_restore_hours = ?
            WHERE id = ?",
        )
        .bind(&d.environment)
        .bind(&d.status)
        .bind(ts(&d.deployed_at))
        .bind(opt_ts(d.finished_at))
        .bind(&d.commit_sha)
        .bind(d.merge_request_iid)
        .bind(d.is_failure)
        .bind(d.lead_time_hours)
        .bind(d.time_to_restore_hours)
        .bind(d.id.to_string())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("deployment {}", d.id)));
        }
        Ok(())
    }

    async fn project_deployments(&mut self, project: ProjectId) -> Result<Vec<Deployment>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE project_id = ? ORDER BY deployed_at"
        ))
        .bind(project.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(deployment_from_row).collect()
    }

    async fn find_member(&mut self, project: ProjectId, gitlab_user_id: i64) -> Result<Option<TeamMember>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM team_members WHERE project_id = ? AND gitlab_user_id = ?"
        ))
        .bind(project.to_string())
        .bind(gitlab_user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(member_from_row).transpose()
    }

    async fn insert_member(&mut self, m: &TeamMember) -> Result<()> {
        sqlx::query(&format!("INSERT INTO team_members ({MEMBER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"))
            .bind(m.id.to_string())
            .bind(m.project_id.to_string())
            .bind(m.gitlab_user_id)
            .bind(&m.username)
            .bind(&m.name)
            .bind(&m.email)
            .bind(&m.avatar_url)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn find_merge_request(&mut self, project: ProjectId, gitlab_mr_id: i64) -> Result<Option<MergeRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {MERGE_REQUEST_COLUMNS} FROM merge_requests WHERE project_id = ? AND gitlab_mr_id = ?"
        ))
        .bind(project.to_string())
        .bind(gitlab_mr_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(merge_request_from_row).transpose()
    }

    async fn upsert_merge_request(&mut self, mr: &MergeRequest) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO merge_requests ({MERGE_REQUEST_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (project_id, gitlab_mr_id) DO UPDATE SET
                author_id = excluded.author_id,
                gitlab_mr_iid = excluded.gitlab_mr_iid,
                title = excluded.title,
                state = excluded.state,
                created_at_gitlab = excluded.created_at_gitlab,
                merged_at = excluded.merged_at,
                closed_at = excluded.closed_at,
                source_branch = excluded.source_branch,
                target_branch = excluded.target_branch,
                additions = excluded.additions,
                deletions = excluded.deletions,
                merge_commit_sha = COALESCE(excluded.merge_commit_sha, merge_requests.merge_commit_sha)"
        ))
        .bind(mr.id.to_string())
        .bind(mr.project_id.to_string())
        .bind(mr.author_id.to_string())
        .bind(mr.gitlab_mr_id)
        .bind(mr.gitlab_mr_iid)
        .bind(&mr.title)
        .bind(mr.state.as_str())
        .bind(ts(&mr.created_at_gitlab))
        .bind(opt_ts(mr.merged_at))
        .bind(opt_ts(mr.closed_at))
        .bind(&mr.source_branch)
        .bind(&mr.target_branch)
        .bind(mr.additions)
        .bind(mr.deletions)
        .bind(&mr.merge_commit_sha)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn project_merge_requests(&mut self, project: ProjectId) -> Result<Vec<MergeRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {MERGE_REQUEST_COLUMNS} FROM merge_requests WHERE project_id = ? ORDER BY created_at_gitlab"
        ))
        .bind(project.to_string())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(merge_request_from_row).collect()
    }

    async fn find_review(&mut self, merge_request: MergeRequestId, reviewer: MemberId) -> Result<Option<Review>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE merge_request_id = ? AND reviewer_id = ?"
        ))
        .bind(merge_request.to_string())
        .bind(reviewer.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(review_from_row).transpose()
    }

    async fn insert_review(&mut self, r: &Review) -> Result<()> {
        sqlx::query(&format!("INSERT INTO reviews ({REVIEW_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"))
            .bind(r.id.to_string())
            .bind(r.merge_request_id.to_string())
            .bind(r.reviewer_id.to_string())
            .bind(ts(&r.reviewed_at))
            .bind(r.comment_count)
            .bind(&r.approval_status)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn update_review(&mut self, r: &Review) -> Result<()> {
        sqlx::query("UPDATE reviews SET reviewed_at = ?, comment_count = ?, approval_status = ? WHERE id = ?")
            .bind(ts(&r.reviewed_at))
            .bind(r.comment_count)
            .bind(&r.approval_status)
            .bind(r.id.to_string())
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn mark_synced(&mut self, project: ProjectId, at: Time) -> Result<()> {
        let result = sqlx::query("UPDATE projects SET last_synced_at = ? WHERE id = ?")
            .bind(ts(&at))
            .bind(project.to_string())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("project {project}")));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        warn!("Rolling back sync batch");
        self.tx.rollback().await?;
        Ok(())
    }
}

// === Row codecs ===

fn ts(t: &Time) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: Option<Time>) -> Option<String> {
    t.as_ref().map(ts)
}

fn parse_time(column: &'static str, raw: String) -> Result<Time> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt { column, value: raw })
}

fn get_time(row: &SqliteRow, column: &'static str) -> Result<Time> {
    let raw: String = row.try_get(column)?;
    parse_time(column, raw)
}

fn get_opt_time(row: &SqliteRow, column: &'static str) -> Result<Option<Time>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| parse_time(column, raw)).transpose()
}

fn get_id<T: FromStr>(row: &SqliteRow, column: &'static str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|_| StorageError::Corrupt { column, value: raw })
}

fn project_from_row(row: &SqliteRow) -> Result<Project> {
    Ok(Project {
        id: get_id(row, "id")?,
        gitlab_id: row.try_get("gitlab_id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        last_synced_at: get_opt_time(row, "last_synced_at")?,
        created_at: get_time(row, "created_at")?,
    })
}

fn deployment_from_row(row: &SqliteRow) -> Result<Deployment> {
    Ok(Deployment {
        id: get_id(row, "id")?,
        project_id: get_id(row, "project_id")?,
        gitlab_deployment_id: row.try_get("gitlab_deployment_id")?,
        environment: row.try_get("environment")?,
        status: row.try_get("status")?,
        deployed_at: get_time(row, "deployed_at")?,
        finished_at: get_opt_time(row, "finished_at")?,
        commit_sha: row.try_get("commit_sha")?,
        merge_request_iid: row.try_get("merge_request_iid")?,
        is_failure: row.try_get("is_failure")?,
        lead_time_hours: row.try_get("lead_time_hours")?,
        time_to_restore_hours: row.try_get("time_to_restore_hours")?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<TeamMember> {
    Ok(TeamMember {
        id: get_id(row, "id")?,
        project_id: get_id(row, "project_id")?,
        gitlab_user_id: row.try_get("gitlab_user_id")?,
        username: row.try_get("username")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        avatar_url: row.try_get("avatar_url")?,
    })
}

fn merge_request_from_row(row: &SqliteRow) -> Result<MergeRequest> {
    let state: String = row.try_get("state")?;
    let state = MergeRequestState::parse(&state)
        .ok_or(StorageError::Corrupt { column: "state", value: state })?;

    Ok(MergeRequest {
        id: get_id(row, "id")?,
        project_id: get_id(row, "project_id")?,
        author_id: get_id(row, "author_id")?,
        gitlab_mr_id: row.try_get("gitlab_mr_id")?,
        gitlab_mr_iid: row.try_get("gitlab_mr_iid")?,
        title: row.try_get("title")?,
        state,
        created_at_gitlab: get_time(row, "created_at_gitlab")?,
        merged_at: get_opt_time(row, "merged_at")?,
        closed_at: get_opt_time(row, "closed_at")?,
        source_branch: row.try_get("source_branch")?,
        target_branch: row.try_get("target_branch")?,
        additions: row.try_get("additions")?,
        deletions: row.try_get("deletions")?,
        merge_commit_sha: row.try_get("merge_commit_sha")?,
    })
}

fn review_from_row(row: &SqliteRow) -> Result<Review> {
    Ok(Review {
        id: get_id(row, "id")?,
        merge_request_id: get_id(row, "merge_request_id")?,
        reviewer_id: get_id(row, "reviewer_id")?,
        reviewed_at: get_time(row, "reviewed_at")?,
        comment_count: row.try_get("comment_count")?,
        approval_status: row.try_get("approval_status")?,
    })
}
