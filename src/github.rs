use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cfg::Config;
use crate::models::{Author, Commit, RepositoryMeta};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
/// Fallback delay for a 403 that the rate-limit snapshot cannot explain.
const FORBIDDEN_RETRY_DELAY: Duration = Duration::from_secs(60);
/// How many forbidden responses are absorbed per request before the
/// condition is surfaced to the caller.
const RATE_LIMIT_RETRIES: usize = 3;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint: {0}")]
    Url(#[from] url::ParseError),
    /// Surfaced only when a request stays forbidden after the client has
    /// waited out the quota (or the fallback delay) and retried.
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("unexpected response status: {0}")]
    Api(u16),
    #[error("failed to parse response body: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("operation canceled")]
    Canceled,
}

/// Remembered `X-Ratelimit-*` values; shared by every worker in the
/// process since the quota is global to the token.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimit {
    pub limit: i64,
    pub remaining: i64,
    pub reset: i64,
}

#[async_trait]
pub trait GitClient: Send + Sync {
    async fn fetch_repo_metadata(&self, full_name: &str) -> Result<RepositoryMeta, ClientError>;

    /// Fetches one page of commits. A non-empty `resume_hash` is passed
    /// as the starting revision and the date window is omitted. The bool
    /// is true when upstream advertises a successor page.
    async fn fetch_commits(
        &self,
        repo: &RepositoryMeta,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        resume_hash: &str,
        page: i32,
        per_page: u32,
    ) -> Result<(Vec<Commit>, bool), ClientError>;
}

pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    rate: Mutex<RateLimit>,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    html_url: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    forks_count: i64,
    #[serde(default)]
    stargazers_count: i64,
    #[serde(default)]
    open_issues_count: i64,
    #[serde(default)]
    watchers_count: i64,
    owner: RepoOwner,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct CommitItem {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    date: DateTime<Utc>,
}

impl GitHubClient {
    pub fn new(cfg: &Config, cancel: CancellationToken) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("commit-indexer/0.1"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if !cfg.github_token.is_empty() {
            if let Ok(val) = HeaderValue::from_str(&format!("Bearer {}", cfg.github_token)) {
                headers.insert(AUTHORIZATION, val);
            }
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.git_api_base_url.clone(),
            rate: Mutex::new(RateLimit::default()),
            cancel,
        })
    }

    pub fn rate_limit(&self) -> RateLimit {
        *self.rate.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update_rate_limit(&self, headers: &HeaderMap) {
        let mut rate = self.rate.lock().unwrap_or_else(|e| e.into_inner());
        rate.limit = header_i64(headers, "x-ratelimit-limit").unwrap_or(rate.limit);
        rate.remaining = header_i64(headers, "x-ratelimit-remaining").unwrap_or(rate.remaining);
        rate.reset = header_i64(headers, "x-ratelimit-reset").unwrap_or(rate.reset);
    }

    /// Suspends the caller until the quota reset when the remembered
    /// remaining count has reached zero.
    async fn wait_for_reset(&self) -> Result<(), ClientError> {
        let rate = self.rate_limit();
        if rate.remaining > 0 {
            return Ok(());
        }
        let wait = rate.reset - Utc::now().timestamp();
        if wait <= 0 {
            return Ok(());
        }
        info!("rate limit exhausted, sleeping {}s until reset", wait);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Canceled),
            _ = sleep(Duration::from_secs(wait as u64)) => Ok(()),
        }
    }

    /// A forbidden response is absorbed by waiting out the quota reset
    /// (or a fixed delay when the snapshot cannot explain the 403) so
    /// the request can be retried; once the retry budget is spent the
    /// condition surfaces as RateLimited.
    async fn backoff_forbidden(&self, attempt: usize) -> Result<(), ClientError> {
        if attempt >= RATE_LIMIT_RETRIES {
            return Err(ClientError::RateLimited);
        }
        if quota_exhausted(&self.rate_limit(), Utc::now().timestamp()) {
            return self.wait_for_reset().await;
        }
        warn!(
            "forbidden response without exhausted quota, retrying in {}s",
            FORBIDDEN_RETRY_DELAY.as_secs()
        );
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Canceled),
            _ = sleep(FORBIDDEN_RETRY_DELAY) => Ok(()),
        }
    }
}

#[async_trait]
impl GitClient for GitHubClient {
    async fn fetch_repo_metadata(&self, full_name: &str) -> Result<RepositoryMeta, ClientError> {
        let endpoint = format!("https://{}/repos/{}", self.base_url, full_name);
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Canceled);
            }
            let resp = self.http.get(&endpoint).send().await?;
            let status = resp.status();
            self.update_rate_limit(resp.headers());

            if status == StatusCode::FORBIDDEN {
                self.backoff_forbidden(attempt).await?;
                attempt += 1;
                continue;
            }
            self.wait_for_reset().await?;
            if status != StatusCode::OK {
                warn!("fetching metadata for {}: http {}", full_name, status);
                return Err(ClientError::Api(status.as_u16()));
            }
            let body = resp.text().await?;
            let repo: RepoResponse = serde_json::from_str(&body)?;
            return Ok(repo_meta_from_response(repo));
        }
    }

    async fn fetch_commits(
        &self,
        repo: &RepositoryMeta,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        resume_hash: &str,
        page: i32,
        per_page: u32,
    ) -> Result<(Vec<Commit>, bool), ClientError> {
        let url = build_commits_url(
            &self.base_url,
            &repo.name,
            since,
            until,
            resume_hash,
            page,
            per_page,
        )?;
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Canceled);
            }
            let resp = self.http.get(url.clone()).send().await?;
            let status = resp.status();
            self.update_rate_limit(resp.headers());

            if status == StatusCode::FORBIDDEN {
                self.backoff_forbidden(attempt).await?;
                attempt += 1;
                continue;
            }
            self.wait_for_reset().await?;
            if status != StatusCode::OK {
                return Err(ClientError::Api(status.as_u16()));
            }

            let has_more = resp
                .headers()
                .get(reqwest::header::LINK)
                .and_then(|v| v.to_str().ok())
                .map(has_next_page)
                .unwrap_or(false);

            let body = resp.text().await?;
            let items: Vec<CommitItem> = serde_json::from_str(&body)?;
            return Ok((items.into_iter().map(commit_from_item).collect(), has_more));
        }
    }
}

fn repo_meta_from_response(repo: RepoResponse) -> RepositoryMeta {
    let now = Utc::now();
    RepositoryMeta {
        id: 0,
        owner: repo.owner.login,
        name: repo.full_name,
        description: repo.description.unwrap_or_default(),
        language: repo.language.unwrap_or_default(),
        url: repo.html_url,
        forks_count: repo.forks_count,
        stars_count: repo.stargazers_count,
        open_issues_count: repo.open_issues_count,
        watchers_count: repo.watchers_count,
        since: now,
        last_page: 0,
        last_fetched_commit: String::new(),
        index_active: false,
        created_at: now,
        updated_at: now,
    }
}

fn commit_from_item(item: CommitItem) -> Commit {
    Commit {
        id: 0,
        hash: item.sha,
        message: item.commit.message,
        date: item.commit.author.date,
        author: Author {
            id: 0,
            name: item.commit.author.name,
            email: item.commit.author.email,
            commit_count: 0,
        },
        author_id: 0,
        repository_id: 0,
        page: 0,
    }
}

fn build_commits_url(
    base_url: &str,
    repo_name: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    resume_hash: &str,
    page: i32,
    per_page: u32,
) -> Result<reqwest::Url, url::ParseError> {
    let mut url =
        reqwest::Url::parse(&format!("https://{}/repos/{}/commits", base_url, repo_name))?;
    {
        let mut query = url.query_pairs_mut();
        if resume_hash.is_empty() {
            query.append_pair("since", &since.to_rfc3339());
            query.append_pair("until", &until.to_rfc3339());
        } else {
            query.append_pair("sha", resume_hash);
        }
        query.append_pair("per_page", &per_page.to_string());
        query.append_pair("page", &page.max(1).to_string());
    }
    Ok(url)
}

/// Splits a `Link` header into rel -> URL.
fn parse_link_header(header: &str) -> HashMap<String, String> {
    let mut links = HashMap::new();
    for part in header.split(',') {
        let mut sections = part.splitn(2, ';');
        let url = match sections.next() {
            Some(s) => s.trim().trim_start_matches('<').trim_end_matches('>'),
            None => continue,
        };
        let rel = match sections.next() {
            Some(s) => s.trim().trim_start_matches("rel=").trim_matches('"'),
            None => continue,
        };
        links.insert(rel.to_string(), url.to_string());
    }
    links
}

fn has_next_page(link_header: &str) -> bool {
    parse_link_header(link_header).contains_key("next")
}

fn quota_exhausted(rate: &RateLimit, now: i64) -> bool {
    rate.remaining == 0 && rate.reset > now
}

fn header_i64(headers: &HeaderMap, key: &str) -> Option<i64> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}
