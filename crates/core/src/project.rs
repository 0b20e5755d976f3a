//! Project model - the root of all delivery data.

use serde::{Deserialize, Serialize};
use crate::id::ProjectId;
use crate::Time;

/// A source-control project registered for metric collection.
///
/// Deleting a project removes every deployment, member, merge request,
/// review and metric snapshot that belongs to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Unique identifier
    pub id: ProjectId,

    /// Project id on the external platform
    pub gitlab_id: i64,

    /// Display name
    pub name: String,

    /// Web URL of the project
    pub url: String,

    /// Last successful synchronization; only the refresh flow writes this
    pub last_synced_at: Option<Time>,

    /// When registered
    pub created_at: Time,
}

impl Project {
    /// Create a project that has never been synchronized.
    pub fn new(gitlab_id: i64, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            gitlab_id,
            name: name.into(),
            url: url.into(),
            last_synced_at: None,
            created_at: chrono::Utc::now(),
        }
    }
}
