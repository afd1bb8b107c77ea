use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mysql_async as my;
use mysql_async::params;
use mysql_async::prelude::Queryable;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{Author, Commit, CommitPaging, RepositoryMeta};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record found")]
    NotFound,
    #[error("record already exists")]
    Duplicate,
    #[error("operation canceled")]
    Canceled,
    #[error(transparent)]
    Database(#[from] my::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn save_repo_metadata(&self, repo: RepositoryMeta) -> StoreResult<RepositoryMeta>;
    async fn update_repo_metadata(&self, repo: &RepositoryMeta) -> StoreResult<()>;
    async fn repo_by_name(&self, name: &str) -> StoreResult<RepositoryMeta>;
    async fn all_repos(&self) -> StoreResult<Vec<RepositoryMeta>>;
    async fn set_all_repos_index_active(&self, active: bool) -> StoreResult<()>;
    async fn commit_by_hash(&self, hash: &str) -> StoreResult<Commit>;
    async fn save_commit(&self, commit: Commit) -> StoreResult<Commit>;
    async fn commits_by_repo(
        &self,
        repo: &RepositoryMeta,
        paging: &CommitPaging,
    ) -> StoreResult<(Vec<Commit>, i64)>;
    async fn top_authors(&self, repo_name: &str, limit: i64) -> StoreResult<Vec<Author>>;
}

pub async fn ensure_schema(pool: &my::Pool) -> StoreResult<()> {
    let mut conn = pool.get_conn().await?;
    conn.query_drop(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            owner VARCHAR(255) NOT NULL,
            name VARCHAR(255) NOT NULL,
            description TEXT,
            language VARCHAR(128),
            url VARCHAR(255),
            forks_count BIGINT NOT NULL DEFAULT 0,
            stars_count BIGINT NOT NULL DEFAULT 0,
            open_issues_count BIGINT NOT NULL DEFAULT 0,
            watchers_count BIGINT NOT NULL DEFAULT 0,
            since DATETIME NULL,
            last_page INT NOT NULL DEFAULT 0,
            last_fetched_commit VARCHAR(64) NOT NULL DEFAULT '',
            index_active BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
            UNIQUE KEY uq_repositories_name (name),
            INDEX idx_repositories_owner (owner)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .await?;
    conn.query_drop(
        r#"
        CREATE TABLE IF NOT EXISTS authors (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            email VARCHAR(320) NOT NULL,
            commit_count BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
            UNIQUE KEY uq_authors_identity (name, email),
            INDEX idx_authors_email (email)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .await?;
    conn.query_drop(
        r#"
        CREATE TABLE IF NOT EXISTS commits (
            id BIGINT AUTO_INCREMENT PRIMARY KEY,
            commit_hash VARCHAR(64) NOT NULL,
            message TEXT,
            commit_date DATETIME NULL,
            author_id BIGINT NOT NULL,
            repository_id BIGINT NOT NULL,
            last_page INT NOT NULL DEFAULT 0,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            UNIQUE KEY uq_commits_hash (commit_hash),
            INDEX idx_commits_repository (repository_id),
            INDEX idx_commits_author (author_id)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci
        "#,
    )
    .await?;
    Ok(())
}

pub struct MySqlStore {
    pool: my::Pool,
    cancel: CancellationToken,
}

const REPO_COLUMNS: &str = r#"
    id, owner, name, COALESCE(description, ''), COALESCE(language, ''), COALESCE(url, ''),
    forks_count, stars_count, open_issues_count, watchers_count,
    DATE_FORMAT(since, '%Y-%m-%d %H:%i:%s'),
    last_page, last_fetched_commit, index_active,
    DATE_FORMAT(created_at, '%Y-%m-%d %H:%i:%s'),
    DATE_FORMAT(updated_at, '%Y-%m-%d %H:%i:%s')
"#;

const COMMIT_COLUMNS: &str = r#"
    c.id, c.commit_hash, COALESCE(c.message, ''),
    DATE_FORMAT(c.commit_date, '%Y-%m-%d %H:%i:%s'),
    c.author_id, c.repository_id, c.last_page,
    a.name, a.email, a.commit_count
"#;

impl MySqlStore {
    pub fn new(pool: my::Pool, cancel: CancellationToken) -> Self {
        Self { pool, cancel }
    }

    fn check_cancel(&self) -> StoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Canceled);
        }
        Ok(())
    }
}

#[async_trait]
impl CommitStore for MySqlStore {
    async fn save_repo_metadata(&self, repo: RepositoryMeta) -> StoreResult<RepositoryMeta> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let result = conn
            .exec_drop(
                r#"
                INSERT INTO repositories (
                    owner, name, description, language, url,
                    forks_count, stars_count, open_issues_count, watchers_count,
                    since, last_page, last_fetched_commit, index_active
                ) VALUES (
                    :owner, :name, :description, :language, :url,
                    :forks_count, :stars_count, :open_issues_count, :watchers_count,
                    :since, :last_page, :last_fetched_commit, :index_active
                )
                "#,
                params! {
                    "owner" => &repo.owner,
                    "name" => &repo.name,
                    "description" => &repo.description,
                    "language" => &repo.language,
                    "url" => &repo.url,
                    "forks_count" => repo.forks_count,
                    "stars_count" => repo.stars_count,
                    "open_issues_count" => repo.open_issues_count,
                    "watchers_count" => repo.watchers_count,
                    "since" => fmt_db_datetime(repo.since),
                    "last_page" => repo.last_page,
                    "last_fetched_commit" => &repo.last_fetched_commit,
                    "index_active" => repo.index_active,
                },
            )
            .await;
        if let Err(e) = result {
            return Err(map_duplicate(e));
        }
        drop(conn);
        self.repo_by_name(&repo.name).await
    }

    async fn update_repo_metadata(&self, repo: &RepositoryMeta) -> StoreResult<()> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            r#"
            UPDATE repositories SET
                description = :description,
                language = :language,
                url = :url,
                forks_count = :forks_count,
                stars_count = :stars_count,
                open_issues_count = :open_issues_count,
                watchers_count = :watchers_count,
                since = :since,
                last_page = :last_page,
                last_fetched_commit = :last_fetched_commit,
                index_active = :index_active
            WHERE id = :id
            "#,
            params! {
                "description" => &repo.description,
                "language" => &repo.language,
                "url" => &repo.url,
                "forks_count" => repo.forks_count,
                "stars_count" => repo.stars_count,
                "open_issues_count" => repo.open_issues_count,
                "watchers_count" => repo.watchers_count,
                "since" => fmt_db_datetime(repo.since),
                "last_page" => repo.last_page,
                "last_fetched_commit" => &repo.last_fetched_commit,
                "index_active" => repo.index_active,
                "id" => repo.id,
            },
        )
        .await?;
        Ok(())
    }

    async fn repo_by_name(&self, name: &str) -> StoreResult<RepositoryMeta> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let row: Option<my::Row> = conn
            .exec_first(
                format!("SELECT {} FROM repositories WHERE name = :name", REPO_COLUMNS),
                params! {"name" => name},
            )
            .await?;
        row.map(repo_from_row).ok_or(StoreError::NotFound)
    }

    async fn all_repos(&self) -> StoreResult<Vec<RepositoryMeta>> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<my::Row> = conn
            .exec(
                format!("SELECT {} FROM repositories ORDER BY id", REPO_COLUMNS),
                (),
            )
            .await?;
        Ok(rows.into_iter().map(repo_from_row).collect())
    }

    // Runs on the shutdown path after the root token has fired, so it
    // deliberately skips the cancellation check.
    async fn set_all_repos_index_active(&self, active: bool) -> StoreResult<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE repositories SET index_active = :active WHERE index_active = TRUE",
            params! {"active" => active},
        )
        .await?;
        Ok(())
    }

    async fn commit_by_hash(&self, hash: &str) -> StoreResult<Commit> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let row: Option<my::Row> = conn
            .exec_first(
                format!(
                    r#"
                    SELECT {} FROM commits c
                    INNER JOIN authors a ON a.id = c.author_id
                    WHERE c.commit_hash = :hash
                    "#,
                    COMMIT_COLUMNS
                ),
                params! {"hash" => hash},
            )
            .await?;
        row.map(commit_from_row).ok_or(StoreError::NotFound)
    }

    async fn save_commit(&self, commit: Commit) -> StoreResult<Commit> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(my::TxOpts::default()).await?;

        tx.exec_drop(
            r#"
            INSERT INTO authors (name, email, commit_count)
            VALUES (:name, :email, 0)
            ON DUPLICATE KEY UPDATE id = LAST_INSERT_ID(id)
            "#,
            params! {
                "name" => &commit.author.name,
                "email" => &commit.author.email,
            },
        )
        .await?;
        let author_id: i64 = tx
            .exec_first("SELECT LAST_INSERT_ID()", ())
            .await?
            .unwrap_or(0);

        let inserted = tx
            .exec_drop(
                r#"
                INSERT INTO commits (commit_hash, message, commit_date, author_id, repository_id, last_page)
                VALUES (:hash, :message, :date, :author_id, :repository_id, :last_page)
                "#,
                params! {
                    "hash" => &commit.hash,
                    "message" => &commit.message,
                    "date" => fmt_db_datetime(commit.date),
                    "author_id" => author_id,
                    "repository_id" => commit.repository_id,
                    "last_page" => commit.page,
                },
            )
            .await;
        if let Err(e) = inserted {
            tx.rollback().await?;
            return Err(map_duplicate(e));
        }
        let commit_id: i64 = tx
            .exec_first("SELECT LAST_INSERT_ID()", ())
            .await?
            .unwrap_or(0);

        tx.exec_drop(
            "UPDATE authors SET commit_count = commit_count + 1 WHERE id = :id",
            params! {"id" => author_id},
        )
        .await?;
        tx.commit().await?;

        let mut saved = commit;
        saved.id = commit_id;
        saved.author_id = author_id;
        saved.author.id = author_id;
        Ok(saved)
    }

    async fn commits_by_repo(
        &self,
        repo: &RepositoryMeta,
        paging: &CommitPaging,
    ) -> StoreResult<(Vec<Commit>, i64)> {
        self.check_cancel()?;
        let paging = paging.normalized();
        let mut conn = self.pool.get_conn().await?;

        let total: i64 = conn
            .exec_first(
                "SELECT COUNT(*) FROM commits WHERE repository_id = :id",
                params! {"id" => repo.id},
            )
            .await?
            .unwrap_or(0);

        // Sort column and direction come from the whitelist in
        // CommitPaging::normalized, so interpolation is safe here.
        let rows: Vec<my::Row> = conn
            .exec(
                format!(
                    r#"
                    SELECT {} FROM commits c
                    INNER JOIN authors a ON a.id = c.author_id
                    WHERE c.repository_id = :id
                    ORDER BY c.{} {}
                    LIMIT :limit OFFSET :offset
                    "#,
                    COMMIT_COLUMNS, paging.sort, paging.direction
                ),
                params! {
                    "id" => repo.id,
                    "limit" => paging.limit,
                    "offset" => paging.offset(),
                },
            )
            .await?;

        Ok((rows.into_iter().map(commit_from_row).collect(), total))
    }

    async fn top_authors(&self, repo_name: &str, limit: i64) -> StoreResult<Vec<Author>> {
        self.check_cancel()?;
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<(i64, String, String, i64)> = conn
            .exec(
                r#"
                SELECT a.id, a.name, a.email, COUNT(c.id) AS commit_count
                FROM authors a
                INNER JOIN commits c ON c.author_id = a.id
                INNER JOIN repositories r ON r.id = c.repository_id
                WHERE r.name = :name
                GROUP BY a.id, a.name, a.email
                ORDER BY commit_count DESC, a.id ASC
                LIMIT :limit
                "#,
                params! {"name" => repo_name, "limit" => limit},
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, name, email, commit_count)| Author { id, name, email, commit_count })
            .collect())
    }
}

fn map_duplicate(e: my::Error) -> StoreError {
    match e {
        my::Error::Server(ref se) if se.code == 1062 => StoreError::Duplicate,
        other => StoreError::Database(other),
    }
}

fn fmt_db_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_db_datetime(raw: Option<String>) -> DateTime<Utc> {
    raw.as_deref()
        .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
        .map(|n| Utc.from_utc_datetime(&n))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn repo_from_row(mut row: my::Row) -> RepositoryMeta {
    RepositoryMeta {
        id: row.take::<i64, _>(0).unwrap_or(0),
        owner: row.take::<String, _>(1).unwrap_or_default(),
        name: row.take::<String, _>(2).unwrap_or_default(),
        description: row.take::<String, _>(3).unwrap_or_default(),
        language: row.take::<String, _>(4).unwrap_or_default(),
        url: row.take::<String, _>(5).unwrap_or_default(),
        forks_count: row.take::<i64, _>(6).unwrap_or(0),
        stars_count: row.take::<i64, _>(7).unwrap_or(0),
        open_issues_count: row.take::<i64, _>(8).unwrap_or(0),
        watchers_count: row.take::<i64, _>(9).unwrap_or(0),
        since: parse_db_datetime(row.take::<Option<String>, _>(10).unwrap_or(None)),
        last_page: row.take::<i32, _>(11).unwrap_or(0),
        last_fetched_commit: row.take::<String, _>(12).unwrap_or_default(),
        index_active: row.take::<bool, _>(13).unwrap_or(false),
        created_at: parse_db_datetime(row.take::<Option<String>, _>(14).unwrap_or(None)),
        updated_at: parse_db_datetime(row.take::<Option<String>, _>(15).unwrap_or(None)),
    }
}

fn commit_from_row(mut row: my::Row) -> Commit {
    let author_id = row.take::<i64, _>(4).unwrap_or(0);
    Commit {
        id: row.take::<i64, _>(0).unwrap_or(0),
        hash: row.take::<String, _>(1).unwrap_or_default(),
        message: row.take::<String, _>(2).unwrap_or_default(),
        date: parse_db_datetime(row.take::<Option<String>, _>(3).unwrap_or(None)),
        author_id,
        repository_id: row.take::<i64, _>(5).unwrap_or(0),
        page: row.take::<i32, _>(6).unwrap_or(0),
        author: Author {
            id: author_id,
            name: row.take::<String, _>(7).unwrap_or_default(),
            email: row.take::<String, _>(8).unwrap_or_default(),
            commit_count: row.take::<i64, _>(9).unwrap_or(0),
        },
    }
}
