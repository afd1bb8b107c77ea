use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::db::{CommitStore, StoreError};
use crate::indexer::{IndexError, Indexer};
use crate::models::{Author, Commit, CommitPaging, PagingInfo, RepositoryMeta};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CommitStore>,
    pub indexer: Arc<Indexer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/repositories", post(add_repository))
        .route("/repositories/:owner/:name", get(get_repository))
        .route("/commits/:owner/:name", get(list_commits))
        .route("/authors/:owner/:name/top", get(top_authors))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": msg})),
    )
}

fn internal_error<E: std::fmt::Display>(e: E) -> ApiError {
    tracing::error!("internal error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
}

#[derive(Debug, Serialize)]
struct OwnerDto {
    login: String,
}

#[derive(Debug, Serialize)]
struct RepositoryDto {
    name: String,
    html_url: String,
    description: String,
    language: String,
    owner: OwnerDto,
    forks_count: i64,
    stargazers_count: i64,
    open_issues_count: i64,
    watchers_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RepositoryMeta> for RepositoryDto {
    fn from(repo: RepositoryMeta) -> Self {
        Self {
            name: repo.name,
            html_url: repo.url,
            description: repo.description,
            language: repo.language,
            owner: OwnerDto { login: repo.owner },
            forks_count: repo.forks_count,
            stargazers_count: repo.stars_count,
            open_issues_count: repo.open_issues_count,
            watchers_count: repo.watchers_count,
            created_at: repo.created_at,
            updated_at: repo.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthorDto {
    name: String,
    email: String,
    commit_count: i64,
}

impl From<Author> for AuthorDto {
    fn from(author: Author) -> Self {
        Self {
            name: author.name,
            email: author.email,
            commit_count: author.commit_count,
        }
    }
}

#[derive(Debug, Serialize)]
struct CommitDto {
    id: i64,
    hash: String,
    message: String,
    date: DateTime<Utc>,
    author: AuthorDto,
}

impl From<Commit> for CommitDto {
    fn from(commit: Commit) -> Self {
        Self {
            id: commit.id,
            hash: commit.hash,
            message: commit.message,
            date: commit.date,
            author: commit.author.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PagingInfoDto {
    #[serde(rename = "totalCount")]
    total_count: i64,
    page: u32,
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
    count: usize,
}

#[derive(Debug, Serialize)]
struct CommitsPageDto {
    commits: Vec<CommitDto>,
    page_info: PagingInfoDto,
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "commit-indexer",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct AddRepositoryRequest {
    #[serde(default)]
    name: String,
}

async fn add_repository(
    State(state): State<AppState>,
    payload: Result<Json<AddRepositoryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RepositoryDto>), ApiError> {
    let Ok(Json(req)) = payload else {
        return Err(bad_request("invalid request body"));
    };
    if req.name.trim().is_empty() {
        return Err(bad_request("invalid request body"));
    }
    match state.indexer.initiate_indexing(req.name.trim()).await {
        Ok(repo) => Ok((StatusCode::CREATED, Json(repo.into()))),
        Err(e @ (IndexError::InvalidName | IndexError::AlreadyAdded)) => {
            Err(bad_request(&e.to_string()))
        }
        Err(e) => Err(internal_error(e)),
    }
}

async fn get_repository(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<RepositoryDto>, ApiError> {
    let repo_name = format!("{}/{}", owner, name);
    match state.store.repo_by_name(&repo_name).await {
        Ok(repo) => Ok(Json(repo.into())),
        Err(StoreError::NotFound) => Err(bad_request("no repository found")),
        Err(e) => Err(internal_error(e)),
    }
}

// Paging values arrive as strings; anything unparseable falls back to
// the defaults, like the rest of the listing parameters.
#[derive(Debug, Default, Deserialize)]
struct CommitsQuery {
    limit: Option<String>,
    page: Option<String>,
    sort: Option<String>,
    direction: Option<String>,
}

async fn list_commits(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<CommitsQuery>,
) -> Result<Json<CommitsPageDto>, ApiError> {
    let repo_name = format!("{}/{}", owner, name);
    let repo = match state.store.repo_by_name(&repo_name).await {
        Ok(repo) => repo,
        Err(StoreError::NotFound) => return Err(bad_request("no repository found")),
        Err(e) => return Err(internal_error(e)),
    };

    let paging = CommitPaging {
        page: parse_or_zero(query.page.as_deref()),
        limit: parse_or_zero(query.limit.as_deref()),
        sort: query.sort.unwrap_or_default(),
        direction: query.direction.unwrap_or_default(),
    }
    .normalized();

    let (commits, total) = state
        .store
        .commits_by_repo(&repo, &paging)
        .await
        .map_err(internal_error)?;
    let info = PagingInfo::new(&paging, total, commits.len());

    Ok(Json(CommitsPageDto {
        commits: commits.into_iter().map(CommitDto::from).collect(),
        page_info: PagingInfoDto {
            total_count: info.total_count,
            page: info.page,
            has_next_page: info.has_next_page,
            count: info.count,
        },
    }))
}

#[derive(Debug, Default, Deserialize)]
struct TopAuthorsQuery {
    n: Option<String>,
}

async fn top_authors(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<TopAuthorsQuery>,
) -> Result<Json<Vec<AuthorDto>>, ApiError> {
    let n: i64 = query
        .n
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if n <= 0 {
        return Err(bad_request("invalid number of authors"));
    }
    let repo_name = format!("{}/{}", owner, name);
    let authors = state
        .store
        .top_authors(&repo_name, n)
        .await
        .map_err(internal_error)?;
    Ok(Json(authors.into_iter().map(AuthorDto::from).collect()))
}

fn parse_or_zero(raw: Option<&str>) -> u32 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(0)
}
