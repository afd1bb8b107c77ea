use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::{CommitStore, StoreError, StoreResult};
use crate::github::{ClientError, GitClient};
use crate::models::{Author, Commit, CommitPaging, RepositoryMeta};

pub(crate) fn mk_repo(name: &str) -> RepositoryMeta {
    let owner = name.split('/').next().unwrap_or_default().to_string();
    let now = Utc::now();
    RepositoryMeta {
        id: 0,
        owner,
        name: name.to_string(),
        description: String::new(),
        language: String::new(),
        url: format!("https://github.com/{}", name),
        forks_count: 0,
        stars_count: 0,
        open_issues_count: 0,
        watchers_count: 0,
        since: now,
        last_page: 0,
        last_fetched_commit: String::new(),
        index_active: true,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn mk_commit(hash: &str, author: &str, email: &str) -> Commit {
    Commit {
        id: 0,
        hash: hash.to_string(),
        message: format!("commit {}", hash),
        date: Utc::now(),
        author: Author {
            id: 0,
            name: author.to_string(),
            email: email.to_string(),
            commit_count: 0,
        },
        author_id: 0,
        repository_id: 0,
        page: 0,
    }
}

#[derive(Default)]
struct Inner {
    repos: Vec<RepositoryMeta>,
    authors: Vec<Author>,
    commits: Vec<Commit>,
    next_repo_id: i64,
    next_author_id: i64,
    next_commit_id: i64,
}

/// In-memory store with the same uniqueness behavior as the MySQL
/// implementation; backs the worker and handler tests.
pub(crate) struct MemoryStore {
    cancel: CancellationToken,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub(crate) fn commit_count(&self) -> usize {
        self.inner.lock().unwrap().commits.len()
    }

    pub(crate) fn author_count(&self) -> usize {
        self.inner.lock().unwrap().authors.len()
    }

    fn check_cancel(&self) -> StoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(StoreError::Canceled);
        }
        Ok(())
    }
}

#[async_trait]
impl CommitStore for MemoryStore {
    async fn save_repo_metadata(&self, repo: RepositoryMeta) -> StoreResult<RepositoryMeta> {
        self.check_cancel()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.repos.iter().any(|r| r.name == repo.name) {
            return Err(StoreError::Duplicate);
        }
        inner.next_repo_id += 1;
        let mut saved = repo;
        saved.id = inner.next_repo_id;
        inner.repos.push(saved.clone());
        Ok(saved)
    }

    async fn update_repo_metadata(&self, repo: &RepositoryMeta) -> StoreResult<()> {
        self.check_cancel()?;
        let mut inner = self.inner.lock().unwrap();
        match inner.repos.iter_mut().find(|r| r.id == repo.id) {
            Some(existing) => {
                *existing = repo.clone();
                existing.updated_at = Utc::now();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn repo_by_name(&self, name: &str) -> StoreResult<RepositoryMeta> {
        self.check_cancel()?;
        self.inner
            .lock()
            .unwrap()
            .repos
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn all_repos(&self) -> StoreResult<Vec<RepositoryMeta>> {
        self.check_cancel()?;
        Ok(self.inner.lock().unwrap().repos.clone())
    }

    async fn set_all_repos_index_active(&self, active: bool) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        for repo in inner.repos.iter_mut().filter(|r| r.index_active) {
            repo.index_active = active;
        }
        Ok(())
    }

    async fn commit_by_hash(&self, hash: &str) -> StoreResult<Commit> {
        self.check_cancel()?;
        self.inner
            .lock()
            .unwrap()
            .commits
            .iter()
            .find(|c| c.hash == hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn save_commit(&self, commit: Commit) -> StoreResult<Commit> {
        self.check_cancel()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.commits.iter().any(|c| c.hash == commit.hash) {
            return Err(StoreError::Duplicate);
        }

        let existing = inner
            .authors
            .iter()
            .find(|a| a.name == commit.author.name && a.email == commit.author.email)
            .map(|a| a.id);
        let author_id = match existing {
            Some(id) => id,
            None => {
                inner.next_author_id += 1;
                let id = inner.next_author_id;
                inner.authors.push(Author {
                    id,
                    name: commit.author.name.clone(),
                    email: commit.author.email.clone(),
                    commit_count: 0,
                });
                id
            }
        };
        if let Some(author) = inner.authors.iter_mut().find(|a| a.id == author_id) {
            author.commit_count += 1;
        }

        inner.next_commit_id += 1;
        let mut saved = commit;
        saved.id = inner.next_commit_id;
        saved.author_id = author_id;
        saved.author.id = author_id;
        inner.commits.push(saved.clone());
        Ok(saved)
    }

    async fn commits_by_repo(
        &self,
        repo: &RepositoryMeta,
        paging: &CommitPaging,
    ) -> StoreResult<(Vec<Commit>, i64)> {
        self.check_cancel()?;
        let paging = paging.normalized();
        let inner = self.inner.lock().unwrap();
        let mut filtered: Vec<Commit> = inner
            .commits
            .iter()
            .filter(|c| c.repository_id == repo.id)
            .cloned()
            .collect();
        match paging.sort.as_str() {
            "commit_date" => filtered.sort_by_key(|c| c.date),
            "commit_hash" => filtered.sort_by(|a, b| a.hash.cmp(&b.hash)),
            _ => filtered.sort_by_key(|c| c.id),
        }
        if paging.direction == "desc" {
            filtered.reverse();
        }
        let total = filtered.len() as i64;
        let page: Vec<Commit> = filtered
            .into_iter()
            .skip(paging.offset() as usize)
            .take(paging.limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn top_authors(&self, repo_name: &str, limit: i64) -> StoreResult<Vec<Author>> {
        self.check_cancel()?;
        let inner = self.inner.lock().unwrap();
        let repo_id = match inner.repos.iter().find(|r| r.name == repo_name) {
            Some(r) => r.id,
            None => return Ok(vec![]),
        };
        let mut ranked: Vec<Author> = inner
            .authors
            .iter()
            .filter_map(|author| {
                let count = inner
                    .commits
                    .iter()
                    .filter(|c| c.repository_id == repo_id && c.author_id == author.id)
                    .count() as i64;
                (count > 0).then(|| Author {
                    commit_count: count,
                    ..author.clone()
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.commit_count.cmp(&a.commit_count).then(a.id.cmp(&b.id)));
        ranked.truncate(limit.max(0) as usize);
        Ok(ranked)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FetchCall {
    pub page: i32,
    pub resume_hash: String,
}

/// Scripted forge client: each fetch pops the next prepared page, and
/// every call is recorded for assertions. An exhausted script behaves
/// like an upstream with no commits left.
pub(crate) struct ScriptedGit {
    script: Mutex<VecDeque<Result<(Vec<Commit>, bool), ClientError>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedGit {
    pub(crate) fn new(pages: Vec<Result<(Vec<Commit>, bool), ClientError>>) -> Self {
        Self {
            script: Mutex::new(pages.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_page(&self, page: Result<(Vec<Commit>, bool), ClientError>) {
        self.script.lock().unwrap().push_back(page);
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitClient for ScriptedGit {
    async fn fetch_repo_metadata(&self, full_name: &str) -> Result<RepositoryMeta, ClientError> {
        let mut meta = mk_repo(full_name);
        meta.index_active = false;
        Ok(meta)
    }

    async fn fetch_commits(
        &self,
        _repo: &RepositoryMeta,
        _since: DateTime<Utc>,
        _until: DateTime<Utc>,
        resume_hash: &str,
        page: i32,
        _per_page: u32,
    ) -> Result<(Vec<Commit>, bool), ClientError> {
        self.calls.lock().unwrap().push(FetchCall {
            page,
            resume_hash: resume_hash.to_string(),
        });
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok((vec![], false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn duplicate_hash_is_rejected() {
        let store = store();
        let repo = store.save_repo_metadata(mk_repo("a/b")).await.unwrap();
        let mut c = mk_commit("abc", "Jane", "jane@example.com");
        c.repository_id = repo.id;
        store.save_commit(c.clone()).await.unwrap();

        let second = store.save_commit(c).await;
        assert!(matches!(second, Err(StoreError::Duplicate)));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn one_author_row_per_identity() {
        let store = store();
        let repo = store.save_repo_metadata(mk_repo("a/b")).await.unwrap();
        for (hash, name, email) in [
            ("h1", "Jane", "jane@example.com"),
            ("h2", "Jane", "jane@example.com"),
            ("h3", "Jane", "jane@work.example.com"),
        ] {
            let mut c = mk_commit(hash, name, email);
            c.repository_id = repo.id;
            store.save_commit(c).await.unwrap();
        }
        assert_eq!(store.author_count(), 2);
    }

    #[tokio::test]
    async fn top_authors_scoped_to_repository_with_stable_ties() {
        let store = store();
        let one = store.save_repo_metadata(mk_repo("a/one")).await.unwrap();
        let two = store.save_repo_metadata(mk_repo("a/two")).await.unwrap();

        for hash in ["x1", "x2", "x3"] {
            let mut c = mk_commit(hash, "Busy", "busy@example.com");
            c.repository_id = one.id;
            store.save_commit(c).await.unwrap();
        }
        let mut tie_a = mk_commit("t1", "Alpha", "alpha@example.com");
        tie_a.repository_id = one.id;
        store.save_commit(tie_a).await.unwrap();
        let mut tie_b = mk_commit("t2", "Beta", "beta@example.com");
        tie_b.repository_id = one.id;
        store.save_commit(tie_b).await.unwrap();
        let mut other = mk_commit("y1", "Elsewhere", "else@example.com");
        other.repository_id = two.id;
        store.save_commit(other).await.unwrap();

        let top = store.top_authors("a/one", 5).await.unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].name, "Busy");
        assert_eq!(top[0].commit_count, 3);
        // Equal counts resolve by author id, lowest first.
        assert_eq!(top[1].name, "Alpha");
        assert_eq!(top[2].name, "Beta");

        assert!(store.top_authors("a/none", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_listing_pages_and_counts() {
        let store = store();
        let repo = store.save_repo_metadata(mk_repo("a/b")).await.unwrap();
        for i in 0..5 {
            let mut c = mk_commit(&format!("h{}", i), "Jane", "jane@example.com");
            c.repository_id = repo.id;
            store.save_commit(c).await.unwrap();
        }

        let paging = CommitPaging { page: 2, limit: 2, ..Default::default() };
        let (commits, total) = store.commits_by_repo(&repo, &paging).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(commits.len(), 2);
        // Default sort is newest first.
        assert_eq!(commits[0].hash, "h2");
        assert_eq!(commits[1].hash, "h1");
    }

    #[tokio::test]
    async fn canceled_store_refuses_work() {
        let cancel = CancellationToken::new();
        let store = MemoryStore::new(cancel.clone());
        cancel.cancel();
        let result = store.save_commit(mk_commit("h", "J", "j@x.com")).await;
        assert!(matches!(result, Err(StoreError::Canceled)));
    }
}
