use anyhow::{Context, Result};
use mysql_async as my;
use mysql_async::prelude::Queryable;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api;
mod cfg;
mod db;
mod github;
mod indexer;
mod models;
#[cfg(test)]
mod testutil;

use cfg::Config;
use db::{CommitStore, MySqlStore};
use github::{GitClient, GitHubClient};
use indexer::Indexer;

const DB_PING_DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "commit_indexer=info,tower_http=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cfg = Config::from_env().context("loading configuration")?;
    info!("DB URI: {}", cfg.mysql_masked_url());
    info!(
        "forge: https://{} (token: {}), monitor interval {:?}, per_page {}",
        cfg.git_api_base_url,
        if cfg.github_token.is_empty() { "none" } else { "set" },
        cfg.monitor_interval,
        cfg.per_page
    );

    let pool = my::Pool::new(cfg.build_mysql_opts());
    db::ensure_schema(&pool)
        .await
        .context("ensuring database schema")?;
    ping_database(&pool).await.context("database ping")?;

    let cancel = CancellationToken::new();
    let store: Arc<dyn CommitStore> = Arc::new(MySqlStore::new(pool.clone(), cancel.clone()));
    let git: Arc<dyn GitClient> =
        Arc::new(GitHubClient::new(&cfg, cancel.clone()).context("building forge client")?);
    let indexer = Indexer::new(store.clone(), git, cfg.clone(), cancel.clone());

    indexer
        .seed_default_repository()
        .await
        .context("seeding default repository")?;
    indexer.resume_indexing().await.context("resuming indexing")?;

    let app = api::router(api::AppState {
        store: store.clone(),
        indexer,
    });
    let addr = cfg.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("commit-indexer listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, stopping workers");
    cancel.cancel();
    if let Err(e) = store.set_all_repos_index_active(false).await {
        error!("resetting index flags on shutdown: {}", e);
    }
    pool.disconnect().await?;
    Ok(())
}

async fn ping_database(pool: &my::Pool) -> Result<()> {
    let mut conn = tokio::time::timeout(DB_PING_DEADLINE, pool.get_conn())
        .await
        .context("timed out acquiring connection")??;
    tokio::time::timeout(DB_PING_DEADLINE, conn.ping())
        .await
        .context("timed out pinging database")??;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
