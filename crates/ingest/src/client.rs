//! Rate-limited GitLab REST client.

use chrono::SecondsFormat;
use devpulse_core::Time;
use reqwest::{Client, ClientBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::IngestionError;
use crate::normalize::{FetchedDeployment, FetchedMergeRequest, FetchedNote, RemoteProject};
use crate::rate_limiter::{Clock, RateLimiter, TokioClock};

/// GitLab API connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base API URL, e.g. `https://gitlab.com/api/v4`
    pub api_url: String,

    /// Personal or project access token
    pub access_token: Option<String>,

    /// Outbound calls allowed per rolling minute
    pub rate_limit_per_minute: usize,

    /// Records requested per page
    pub page_size: u32,

    /// Timeout of a single HTTP call
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://gitlab.com/api/v4".to_string(),
            access_token: None,
            rate_limit_per_minute: 60,
            page_size: 100,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Time range and page size of a list request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchQuery {
    /// Records updated at or after this time
    pub since: Time,
    /// Records updated at or before this time
    pub until: Time,
    /// Records per page
    pub page_size: u32,
}

type Result<T> = std::result::Result<T, IngestionError>;

/// GitLab API client.
///
/// Every request waits on the rate limiter first. Failures are returned to
/// the caller as [`IngestionError`] without retrying.
pub struct GitLabClient {
    config: ClientConfig,
    http: Client,
    limiter: RateLimiter,
}

impl GitLabClient {
    /// Create a client on the tokio clock.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a client whose rate limiter uses `clock`.
    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.access_token.is_none() {
            warn!("GitLab access token not configured");
        }

        let http = ClientBuilder::new()
            .timeout(config.request_timeout)
            .build()
            .map_err(IngestionError::Client)?;
        let limiter = RateLimiter::with_clock(config.rate_limit_per_minute, clock);

        Ok(Self { config, http, limiter })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Query over `[since, until]` with the configured page size.
    pub fn query(&self, since: Time, until: Time) -> FetchQuery {
        FetchQuery {
            since,
            until,
            page_size: self.config.page_size.max(1),
        }
    }

    /// Project metadata.
    pub async fn get_project(&self, gitlab_id: i64) -> Result<Option<RemoteProject>> {
        let endpoint = format!("projects/{gitlab_id}");
        let response = self.send(&endpoint, &[]).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|source| IngestionError::Decode { endpoint, source })?;

        Ok(RemoteProject::from_json(&body))
    }

    /// All deployments updated inside the query range.
    pub async fn list_deployments(&self, gitlab_id: i64, query: &FetchQuery) -> Result<Vec<FetchedDeployment>> {
        let endpoint = format!("projects/{gitlab_id}/deployments");
        let params = range_params(query);

        let items = self.get_all(&endpoint, &params, query.page_size).await?;
        Ok(items.iter().map(FetchedDeployment::from_json).collect())
    }

    /// All merge requests, in any state, updated inside the query range.
    pub async fn list_merge_requests(&self, gitlab_id: i64, query: &FetchQuery) -> Result<Vec<FetchedMergeRequest>> {
        let endpoint = format!("projects/{gitlab_id}/merge_requests");
        let mut params = range_params(query);
        params.push(("state", "all".to_string()));

        let items = self.get_all(&endpoint, &params, query.page_size).await?;
        Ok(items.iter().map(FetchedMergeRequest::from_json).collect())
    }

    /// All notes of one merge request.
    pub async fn list_merge_request_notes(&self, gitlab_id: i64, iid: i64) -> Result<Vec<FetchedNote>> {
        let endpoint = format!("projects/{gitlab_id}/merge_requests/{iid}/notes");
        let params = vec![("sort", "asc".to_string())];

        let items = self.get_all(&endpoint, &params, self.config.page_size.max(1)).await?;
        Ok(items.iter().map(FetchedNote::from_json).collect())
    }

    /// Fetch every page of a list endpoint.
    ///
    /// Follows `X-Next-Page` when the server sends it; otherwise stops at
    /// the first page shorter than `page_size`.
    async fn get_all(&self, endpoint: &str, params: &[(&str, String)], page_size: u32) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut paged = params.to_vec();
            paged.push(("page", page.to_string()));
            paged.push(("per_page", page_size.to_string()));

            let response = self.send(endpoint, &paged).await?;
            let next_page = response
                .headers()
                .get("x-next-page")
                .map(|v| v.to_str().ok().and_then(|s| s.trim().parse::<u32>().ok()));

            let batch: Vec<Value> = response.json().await.map_err(|source| IngestionError::Decode {
                endpoint: endpoint.to_string(),
                source,
            })?;
            let received = batch.len();
            items.extend(batch);
            debug!("{} page {}: {} records", endpoint, page, received);

            page = match next_page {
                Some(Some(next)) if next > page => next,
                Some(_) => break,
                None if received == 0 || received < page_size as usize => break,
                None => page + 1,
            };
        }

        Ok(items)
    }

    async fn send(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Response> {
        self.limiter.acquire().await;

        let url = format!(
            "{}/{}",
            self.config.api_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        debug!("GET {}", url);

        let mut request = self.http.get(&url).query(params);
        if let Some(token) = &self.config.access_token {
            request = request.header("PRIVATE-TOKEN", token);
        }

        let response = request.send().await.map_err(|source| IngestionError::Transport {
            endpoint: endpoint.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = error_body(endpoint, response.text().await);
            return Err(IngestionError::Status {
                endpoint: endpoint.to_string(),
                status,
                body,
            });
        }

        Ok(response)
    }
}

/// Body of a failed response, or a marker when it could not be read.
fn error_body(endpoint: &str, body: reqwest::Result<String>) -> String {
    match body {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read error body from {}: {}", endpoint, e);
            format!("<unreadable body: {e}>")
        }
    }
}

fn range_params(query: &FetchQuery) -> Vec<(&'static str, String)> {
    vec![
        ("updated_after", query.since.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("updated_before", query.until.to_rfc3339_opts(SecondsFormat::Secs, true)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::tests::ManualClock;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, page_size: u32) -> GitLabClient {
        let config = ClientConfig {
            api_url: format!("{}/api/v4", server.uri()),
            access_token: Some("secret-token".to_string()),
            page_size,
            ..ClientConfig::default()
        };
        GitLabClient::with_clock(config, Arc::new(ManualClock::new())).unwrap()
    }

    fn query(client: &GitLabClient) -> FetchQuery {
        client.query(
            "2024-01-01T00:00:00Z".parse().unwrap(),
            "2024-01-31T00:00:00Z".parse().unwrap(),
        )
    }

    fn deployments(ids: std::ops::Range<i64>) -> Value {
        Value::Array(
            ids.map(|id| {
                json!({
                    "id": id,
                    "status": "success",
                    "created_at": "2024-01-10T00:00:00Z",
                    "sha": "abc",
                    "environment": { "name": "production" }
                })
            })
            .collect(),
        )
    }

    #[tokio::test]
    async fn test_pages_until_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "2"))
            .and(header("PRIVATE-TOKEN", "secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deployments(1..3)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deployments(3..4)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 2);
        let fetched = client.list_deployments(42, &query(&client)).await.unwrap();

        let ids: Vec<Option<i64>> = fetched.iter().map(|d| d.gitlab_deployment_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_follows_next_page_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .and(query_param("page", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "2")
                    .set_body_json(deployments(1..2)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Next-Page", "")
                    .set_body_json(deployments(2..3)),
            )
            .expect(1)
            .mount(&server)
            .await;

        // a short first page alone would stop paging; the header wins
        let client = client(&server, 100);
        let fetched = client.list_deployments(42, &query(&client)).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn test_full_last_page_then_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/merge_requests"))
            .and(query_param("page", "1"))
            .and(query_param("state", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }, { "id": 2 }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/merge_requests"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 2);
        let fetched = client.list_merge_requests(42, &query(&client)).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn test_non_success_is_ingestion_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 100);
        let err = client.list_deployments(42, &query(&client)).await.unwrap_err();
        match err {
            IngestionError::Status { endpoint, status, body } => {
                assert_eq!(endpoint, "projects/42/deployments");
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client(&server, 100);
        let err = client.list_deployments(42, &query(&client)).await.unwrap_err();
        assert!(matches!(err, IngestionError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_get_project() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "name": "api",
                "name_with_namespace": "acme / api",
                "web_url": "https://gitlab.example.com/acme/api"
            })))
            .mount(&server)
            .await;

        let client = client(&server, 100);
        let project = client.get_project(7).await.unwrap().unwrap();
        assert_eq!(project.name, "acme / api");
        assert_eq!(project.web_url, "https://gitlab.example.com/acme/api");
    }

    #[tokio::test]
    async fn test_sends_update_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/42/deployments"))
            .and(query_param("updated_after", "2024-01-01T00:00:00Z"))
            .and(query_param("updated_before", "2024-01-31T00:00:00Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 100);
        let fetched = client.list_deployments(42, &query(&client)).await.unwrap();
        assert!(fetched.is_empty());
    }

    #[test]
    fn test_unreadable_error_body_is_reported() {
        let read_error = Client::new().get("not a url").build().unwrap_err();
        let body = error_body("projects/42/deployments", Err(read_error));
        assert!(body.starts_with("<unreadable body:"), "{body}");

        assert_eq!(error_body("projects/42/deployments", Ok("boom".to_string())), "boom");
    }
}
