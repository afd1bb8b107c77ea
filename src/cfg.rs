use anyhow::{Context, Result};
use chrono::{DateTime, Months, Utc};
use mysql_async as my;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    // Database
    pub db_host: String,
    pub db_port: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_ssl_mode: String,

    // Upstream forge
    pub git_api_base_url: String,
    pub github_token: String,
    pub per_page: u32,

    // Indexing
    pub monitor_interval: Duration,
    pub default_since: DateTime<Utc>,
    pub default_until: DateTime<Utc>,
    pub default_repository: String,

    // HTTP
    pub server_address: String,
    pub server_port: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let db_host = std::env::var("DB_HOST").context("DB_HOST must be set")?;
        let db_port = std::env::var("DB_PORT").context("DB_PORT must be set")?;
        let db_user = std::env::var("DB_USER").context("DB_USER must be set")?;
        let db_password = std::env::var("DB_PASSWORD").context("DB_PASSWORD must be set")?;
        let db_name = std::env::var("DB_NAME").context("DB_NAME must be set")?;
        let db_ssl_mode = env("DB_SSL_MODE", "disable");

        let git_api_base_url =
            std::env::var("GIT_API_BASE_URL").context("GIT_API_BASE_URL must be set")?;
        let github_token = env("GITHUB_TOKEN", "");
        let per_page = clamp_per_page(&env("GIT_COMMIT_FETCH_PER_PAGE", "100"));

        let monitor_interval = humantime::parse_duration(&env("MONITOR_INTERVAL", "1h"))
            .context("MONITOR_INTERVAL parse")?;
        let default_since = parse_date_or(
            std::env::var("DEFAULT_START_DATE").ok().as_deref(),
            ten_months_ago(),
        )
        .context("DEFAULT_START_DATE parse")?;
        let default_until = parse_date_or(
            std::env::var("DEFAULT_END_DATE").ok().as_deref(),
            Utc::now(),
        )
        .context("DEFAULT_END_DATE parse")?;
        let default_repository = env("DEFAULT_REPOSITORY", "chromium/chromium");

        let server_address = env("SERVER_ADDRESS", "localhost");
        let server_port = env("SERVER_PORT", "8080");

        Ok(Self {
            db_host,
            db_port,
            db_user,
            db_password,
            db_name,
            db_ssl_mode,
            git_api_base_url,
            github_token,
            per_page,
            monitor_interval,
            default_since,
            default_until,
            default_repository,
            server_address,
            server_port,
        })
    }

    pub fn mysql_masked_url(&self) -> String {
        format!(
            "mysql://{}:***@{}:{}/{}",
            self.db_user, self.db_host, self.db_port, self.db_name
        )
    }

    pub fn build_mysql_opts(&self) -> my::Opts {
        let port: u16 = self.db_port.parse().unwrap_or(3306);
        let mut builder = my::OptsBuilder::default()
            .ip_or_hostname(self.db_host.clone())
            .tcp_port(port)
            .user(Some(self.db_user.clone()))
            .pass(Some(self.db_password.clone()))
            .db_name(Some(self.db_name.clone()));
        if !self.db_ssl_mode.eq_ignore_ascii_case("disable") {
            builder = builder.ssl_opts(my::SslOpts::default());
        }
        my::Opts::from(builder)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn ten_months_ago() -> DateTime<Utc> {
    let now = Utc::now();
    now.checked_sub_months(Months::new(10)).unwrap_or(now)
}

fn parse_date_or(raw: Option<&str>, fallback: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match raw {
        Some(s) if !s.trim().is_empty() => {
            let parsed = DateTime::parse_from_rfc3339(s.trim())
                .with_context(|| format!("invalid RFC 3339 date: {}", s))?;
            Ok(parsed.with_timezone(&Utc))
        }
        _ => Ok(fallback),
    }
}

/// Page size sent upstream; GitHub caps per_page at 100.
fn clamp_per_page(raw: &str) -> u32 {
    raw.trim().parse::<u32>().unwrap_or(100).clamp(1, 100)
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_tests() -> Self {
        Self {
            db_host: "localhost".into(),
            db_port: "3306".into(),
            db_user: "server".into(),
            db_password: "".into(),
            db_name: "commits".into(),
            db_ssl_mode: "disable".into(),
            git_api_base_url: "api.github.com".into(),
            github_token: "".into(),
            per_page: 100,
            monitor_interval: Duration::from_secs(3600),
            default_since: ten_months_ago(),
            default_until: Utc::now(),
            default_repository: "chromium/chromium".into(),
            server_address: "localhost".into(),
            server_port: "8080".into(),
        }
    }
}
