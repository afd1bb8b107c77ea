use chrono::{DateTime, Utc};

/// Metadata row for a tracked repository. `name` holds the full
/// `owner/name` form and is unique; `last_page` / `last_fetched_commit`
/// are the durable ingestion cursor.
#[derive(Debug, Clone)]
pub struct RepositoryMeta {
    pub id: i64,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub language: String,
    pub url: String,
    pub forks_count: i64,
    pub stars_count: i64,
    pub open_issues_count: i64,
    pub watchers_count: i64,
    pub since: DateTime<Utc>,
    pub last_page: i32,
    pub last_fetched_commit: String,
    pub index_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub commit_count: i64,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub id: i64,
    pub hash: String,
    pub message: String,
    pub date: DateTime<Utc>,
    pub author: Author,
    pub author_id: i64,
    pub repository_id: i64,
    /// Page at which the commit was first seen by a worker.
    pub page: i32,
}

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_LIMIT: u32 = 10;
pub const DEFAULT_SORT: &str = "created_at";
pub const DEFAULT_DIRECTION: &str = "desc";

/// Columns the commit listing may sort on. Anything else falls back to
/// the default, which also keeps the column name safe to interpolate
/// into SQL.
const SORT_COLUMNS: &[&str] = &["created_at", "commit_date", "commit_hash"];

#[derive(Debug, Clone, Default)]
pub struct CommitPaging {
    pub page: u32,
    pub limit: u32,
    pub sort: String,
    pub direction: String,
}

impl CommitPaging {
    /// Fills in defaults and rejects unknown sort columns / directions.
    pub fn normalized(&self) -> CommitPaging {
        let page = if self.page == 0 { DEFAULT_PAGE } else { self.page };
        let limit = if self.limit == 0 { DEFAULT_LIMIT } else { self.limit };
        let sort = if SORT_COLUMNS.contains(&self.sort.as_str()) {
            self.sort.clone()
        } else {
            DEFAULT_SORT.to_string()
        };
        let direction = match self.direction.to_lowercase().as_str() {
            "asc" => "asc".to_string(),
            "desc" => "desc".to_string(),
            _ => DEFAULT_DIRECTION.to_string(),
        };
        CommitPaging { page, limit, sort, direction }
    }

    pub fn offset(&self) -> u64 {
        if self.page > 1 {
            (self.limit as u64) * (self.page as u64 - 1)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct PagingInfo {
    pub total_count: i64,
    pub page: u32,
    pub has_next_page: bool,
    pub count: usize,
}

impl PagingInfo {
    pub fn new(paging: &CommitPaging, total_count: i64, count: usize) -> Self {
        let has_next_page = (paging.page as i64) * (paging.limit as i64) < total_count;
        PagingInfo {
            total_count,
            page: paging.page,
            has_next_page,
            count,
        }
    }
}
