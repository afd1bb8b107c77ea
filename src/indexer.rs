use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cfg::Config;
use crate::db::{CommitStore, StoreError};
use crate::github::{ClientError, GitClient};
use crate::models::RepositoryMeta;

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid repository name, expected format: owner/name")]
    InvalidName,
    #[error("repository has already been added")]
    AlreadyAdded,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Owns the per-repository ingestion workers. Each tracked repository
/// gets exactly one task: it drives back-fill while `index_active` is
/// set, then settles into periodic reconciliation until the root token
/// is canceled.
pub struct Indexer {
    store: Arc<dyn CommitStore>,
    git: Arc<dyn GitClient>,
    cfg: Config,
    cancel: CancellationToken,
    workers: Mutex<HashSet<String>>,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn CommitStore>,
        git: Arc<dyn GitClient>,
        cfg: Config,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            git,
            cfg,
            cancel,
            workers: Mutex::new(HashSet::new()),
        })
    }

    pub async fn seed_default_repository(self: &Arc<Self>) -> Result<(), IndexError> {
        let name = self.cfg.default_repository.clone();
        match self.initiate_indexing(&name).await {
            Ok(repo) => {
                info!("seeded default repository {}", repo.name);
                Ok(())
            }
            Err(IndexError::AlreadyAdded) => {
                info!("default repository {} already tracked", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Registers a repository and starts its worker. Racing
    /// registrations are resolved by the unique key on the repository
    /// name; the loser sees AlreadyAdded.
    pub async fn initiate_indexing(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<RepositoryMeta, IndexError> {
        if !is_valid_repo_name(name) {
            return Err(IndexError::InvalidName);
        }
        match self.store.repo_by_name(name).await {
            Ok(_) => return Err(IndexError::AlreadyAdded),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut meta = self.git.fetch_repo_metadata(name).await?;
        meta.index_active = true;
        meta.since = self.cfg.default_since;

        let saved = match self.store.save_repo_metadata(meta).await {
            Ok(m) => m,
            Err(StoreError::Duplicate) => return Err(IndexError::AlreadyAdded),
            Err(e) => return Err(e.into()),
        };

        info!("indexing initiated for repository {}", saved.name);
        self.spawn_worker(saved.clone()).await;
        Ok(saved)
    }

    /// Restarts one worker per stored repository; the durable cursor on
    /// each row decides whether it resumes back-fill or reconciles.
    pub async fn resume_indexing(self: &Arc<Self>) -> Result<(), StoreError> {
        let repos = self.store.all_repos().await?;
        info!("resuming indexing for {} repositories", repos.len());
        for repo in repos {
            self.spawn_worker(repo).await;
        }
        Ok(())
    }

    async fn spawn_worker(self: &Arc<Self>, repo: RepositoryMeta) {
        {
            let mut workers = self.workers.lock().await;
            if !workers.insert(repo.name.clone()) {
                return;
            }
        }
        let indexer = Arc::clone(self);
        tokio::spawn(async move { indexer.run_worker(repo).await });
    }

    #[cfg(test)]
    pub(crate) async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    async fn run_worker(self: Arc<Self>, mut repo: RepositoryMeta) {
        if repo.index_active {
            self.backfill(&mut repo).await;
        }
        self.monitor(repo).await;
    }

    /// Periodic poll; each tick re-reads the repository row so external
    /// changes (including the shutdown flag reset) are picked up.
    async fn monitor(&self, repo: RepositoryMeta) {
        info!("commit monitor started for {}", repo.name);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("commit monitor stopped for {}", repo.name);
                    return;
                }
                _ = sleep(self.cfg.monitor_interval) => {}
            }

            let mut fresh = match self.store.repo_by_name(&repo.name).await {
                Ok(r) => r,
                Err(StoreError::Canceled) => {
                    info!("commit monitor stopped for {}", repo.name);
                    return;
                }
                Err(e) => {
                    error!("reloading repository {}: {}", repo.name, e);
                    continue;
                }
            };

            if fresh.index_active {
                self.backfill(&mut fresh).await;
            } else {
                self.reconcile(&mut fresh).await;
            }
        }
    }

    /// Walks the repository history page by page from the configured
    /// start date until upstream stops advertising a successor page,
    /// persisting the cursor after every page.
    async fn backfill(&self, repo: &mut RepositoryMeta) {
        let mut page = repo.last_page.max(1);
        let mut latest = repo.last_fetched_commit.clone();
        info!("starting back-fill for {} from page {}", repo.name, page);

        loop {
            if self.cancel.is_cancelled() {
                info!("back-fill canceled for {}", repo.name);
                return;
            }

            let (commits, has_more) = match self
                .git
                .fetch_commits(
                    repo,
                    self.cfg.default_since,
                    self.cfg.default_until,
                    "",
                    page,
                    self.cfg.per_page,
                )
                .await
            {
                Ok(v) => v,
                Err(ClientError::Canceled) => {
                    info!("back-fill canceled for {}", repo.name);
                    return;
                }
                // The client already waited out the quota before giving
                // up; retry the page without piling on the transport
                // back-off.
                Err(ClientError::RateLimited) => {
                    warn!(
                        "upstream still rate limited for {} page {}, retrying",
                        repo.name, page
                    );
                    continue;
                }
                Err(e) => {
                    error!("fetching commits for {} page {}: {}", repo.name, page, e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = sleep(RETRY_BACKOFF) => {}
                    }
                    continue;
                }
            };

            for mut commit in commits {
                commit.repository_id = repo.id;
                commit.page = page;
                let hash = commit.hash.clone();
                match self.store.save_commit(commit).await {
                    // A replayed hash is already durable, so the cursor
                    // may advance past it.
                    Ok(_) | Err(StoreError::Duplicate) => latest = hash,
                    Err(StoreError::Canceled) => {
                        info!("back-fill canceled for {}", repo.name);
                        return;
                    }
                    Err(e) => {
                        error!("saving commit {} for {}: {}", hash, repo.name, e);
                    }
                }
            }

            repo.last_fetched_commit = latest.clone();
            repo.last_page = page;
            if let Err(e) = self.store.update_repo_metadata(repo).await {
                if matches!(e, StoreError::Canceled) {
                    return;
                }
                error!("updating metadata for {}: {}", repo.name, e);
                continue;
            }

            if !has_more {
                repo.index_active = false;
                if let Err(e) = self.store.update_repo_metadata(repo).await {
                    if matches!(e, StoreError::Canceled) {
                        return;
                    }
                    error!("updating indexing status for {}: {}", repo.name, e);
                }
                info!("back-fill finished for {} at page {}", repo.name, page);
                return;
            }
            page += 1;
        }
    }

    /// One reconciliation pass: resumes from the stored cursor, inserts
    /// hashes not yet persisted, and resets the cursor when upstream
    /// reports an empty page for the resume hash.
    async fn reconcile(&self, repo: &mut RepositoryMeta) {
        let mut page = repo.last_page.max(1);
        let mut resume = repo.last_fetched_commit.clone();
        let mut until = self.cfg.default_until;
        info!("reconciling {} from page {}", repo.name, page);

        loop {
            if self.cancel.is_cancelled() {
                info!("reconciliation halted for {}", repo.name);
                return;
            }

            let (commits, has_more) = match self
                .git
                .fetch_commits(repo, self.cfg.default_since, until, &resume, page, self.cfg.per_page)
                .await
            {
                Ok(v) => v,
                Err(ClientError::Canceled) => {
                    info!("reconciliation halted for {}", repo.name);
                    return;
                }
                // Persistent forbidden despite the client's reset waits:
                // nothing to gain from hammering, the next tick retries.
                Err(ClientError::RateLimited) => {
                    warn!("upstream rate limited for {}, ending pass", repo.name);
                    return;
                }
                Err(e) => {
                    // The pass ends here; the next tick retries.
                    error!("fetching commits for {}: {}", repo.name, e);
                    return;
                }
            };

            if commits.is_empty() {
                if page == 1 && resume.is_empty() {
                    info!("no new commits for {}", repo.name);
                    return;
                }
                info!("no commits at cursor for {}, resetting page to 1", repo.name);
                page = 1;
                resume.clear();
                repo.last_page = 1;
                repo.last_fetched_commit.clear();
                if let Err(e) = self.store.update_repo_metadata(repo).await {
                    if !matches!(e, StoreError::Canceled) {
                        error!("updating metadata for {}: {}", repo.name, e);
                    }
                    return;
                }
                continue;
            }

            for mut commit in commits {
                match self.store.commit_by_hash(&commit.hash).await {
                    Ok(_) => continue,
                    Err(StoreError::NotFound) => {}
                    Err(StoreError::Canceled) => {
                        info!("reconciliation halted for {}", repo.name);
                        return;
                    }
                    Err(e) => {
                        error!("looking up commit {} for {}: {}", commit.hash, repo.name, e);
                        continue;
                    }
                }
                commit.repository_id = repo.id;
                commit.page = page;
                let hash = commit.hash.clone();
                match self.store.save_commit(commit).await {
                    Ok(_) | Err(StoreError::Duplicate) => resume = hash,
                    Err(StoreError::Canceled) => {
                        info!("reconciliation halted for {}", repo.name);
                        return;
                    }
                    Err(e) => {
                        error!("saving commit {} for {}: {}", hash, repo.name, e);
                    }
                }
            }

            repo.last_fetched_commit = resume.clone();
            repo.last_page = page;
            if let Err(e) = self.store.update_repo_metadata(repo).await {
                if !matches!(e, StoreError::Canceled) {
                    error!("updating metadata for {}: {}", repo.name, e);
                }
                return;
            }

            if !has_more {
                info!("no more commits to fetch for {}", repo.name);
                return;
            }
            page += 1;
            until = Utc::now();
        }
    }
}

fn is_valid_repo_name(name: &str) -> bool {
    matches!(
        name.split_once('/'),
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/')
    )
}
