//! Configuration
//!
//! All configuration is read once at process start from a flat environment
//! namespace. Missing or malformed required values are fatal (`Error::Config`);
//! workers exit non-zero rather than running half-configured.

use std::collections::HashMap;
use std::env;

use crate::error::{Error, Result};

// ============================================================================
// Database
// ============================================================================

/// Database connection settings.
///
/// Either `DATABASE_URL` is provided directly, or the URL is assembled from
/// `DB_HOST` / `DB_USER` / `DB_PASS` / `DB_NAME` according to `DB_MODE`.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub mode: DbMode,
    /// Queries slower than this are logged at WARN.
    pub slow_query_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    Local,
    Azure,
    ServiceConnector,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        if let Ok(url) = env::var("DATABASE_URL") {
            return Ok(Self {
                url,
                mode: DbMode::ServiceConnector,
                slow_query_ms: slow_query_ms_from_env(),
            });
        }

        let host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let user = env::var("DB_USER").unwrap_or_else(|_| "docbias_user".to_string());
        let pass = env::var("DB_PASS").unwrap_or_else(|_| "docbias_pass".to_string());
        let name = env::var("DB_NAME").unwrap_or_else(|_| "docbias".to_string());
        let mode = match env::var("DB_MODE").as_deref() {
            Ok("azure") => DbMode::Azure,
            Ok("service_connector") => DbMode::ServiceConnector,
            Ok("local") | Err(_) => DbMode::Local,
            Ok(other) => {
                return Err(Error::Config(format!(
                    "DB_MODE must be local, azure or service_connector, got '{other}'"
                )))
            }
        };

        let sslmode = match mode {
            DbMode::Local => "disable",
            _ => "require",
        };
        let url = format!("postgres://{user}:{pass}@{host}:5432/{name}?sslmode={sslmode}");

        Ok(Self {
            url,
            mode,
            slow_query_ms: slow_query_ms_from_env(),
        })
    }
}

fn slow_query_ms_from_env() -> u64 {
    env::var("DB_SLOW_QUERY_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(500)
}

// ============================================================================
// Queue
// ============================================================================

/// Queue fabric settings.
///
/// The queue backend lives in the same Postgres instance by default; a
/// dedicated host can be pointed at via `QUEUE_HOST`/`QUEUE_PORT` with
/// credentials from `QUEUE_USERNAME`/`QUEUE_PASSWORD`.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub url: Option<String>,
    /// Seconds a claimed message stays invisible before redelivery.
    pub lease_seconds: i64,
    /// Poll interval while the queue is empty.
    pub poll_interval_ms: u64,
    /// Reconnect attempts before the consumer loop surfaces the failure.
    pub max_connect_attempts: u32,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self> {
        let url = match env::var("QUEUE_HOST") {
            Ok(host) => {
                let port: u16 = env::var("QUEUE_PORT")
                    .unwrap_or_else(|_| "5432".to_string())
                    .parse()
                    .map_err(|_| Error::Config("QUEUE_PORT must be an integer".to_string()))?;
                let user = env::var("QUEUE_USERNAME").unwrap_or_else(|_| "guest".to_string());
                let pass = env::var("QUEUE_PASSWORD").unwrap_or_else(|_| "guest".to_string());
                Some(format!("postgres://{user}:{pass}@{host}:{port}/docbias_queue"))
            }
            Err(_) => None,
        };

        Ok(Self {
            url,
            lease_seconds: env::var("QUEUE_LEASE_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(600),
            poll_interval_ms: env::var("QUEUE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            max_connect_attempts: 5,
        })
    }
}

// ============================================================================
// LLM / scoring service
// ============================================================================

/// Settings for the external bias-scoring service and its LLM backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL of the scoring service (exposes /score_page and /score_snippets).
    pub endpoint: Option<String>,
    pub deployment: String,
    pub api_key: Option<String>,
    /// Managed-identity client id; used when no API key is configured.
    pub client_id: Option<String>,
    /// Requests per rolling 60-second window.
    pub requests_per_minute: u32,
    pub batch_size: usize,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("LLM_ENDPOINT").ok(),
            deployment: env::var("LLM_DEPLOYMENT").unwrap_or_else(|_| "gpt-35-turbo".to_string()),
            api_key: env::var("LLM_KEY").ok(),
            client_id: env::var("LLM_CLIENT_ID").ok(),
            requests_per_minute: env::var("LLM_RPM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            batch_size: env::var("LLM_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
        }
    }

    /// Whether the scoring service is reachable at all. Without it, snippet
    /// scoring falls back to on-box heuristics.
    pub fn is_available(&self) -> bool {
        self.endpoint.is_some() && (self.api_key.is_some() || self.client_id.is_some())
    }
}

// ============================================================================
// Application
// ============================================================================

#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub user_agent: String,
    pub max_retries: i32,
    /// Lock TTL for per-URL processing locks.
    pub lock_timeout_minutes: i64,
    /// Divisor for partial-baseline coverage estimation. The default matches
    /// the Azure docs corpus; override per deployment.
    pub nominal_repo_files: usize,
    pub otlp_endpoint: Option<String>,
    /// Mapping from a private repo full name to its public mirror, parsed
    /// from `PUBLIC_MIRRORS` ("owner/private=owner/public,..." pairs).
    pub public_mirrors: HashMap<String, String>,
}

impl ApplicationConfig {
    pub fn from_env() -> Result<Self> {
        let mut public_mirrors = HashMap::new();
        if let Ok(raw) = env::var("PUBLIC_MIRRORS") {
            for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
                let (private, public) = pair.split_once('=').ok_or_else(|| {
                    Error::Config(format!(
                        "PUBLIC_MIRRORS entries must be 'private=public', got '{pair}'"
                    ))
                })?;
                public_mirrors.insert(private.trim().to_string(), public.trim().to_string());
            }
        }

        Ok(Self {
            user_agent: env::var("USER_AGENT").unwrap_or_else(|_| {
                format!("docbias/{}", env!("CARGO_PKG_VERSION"))
            }),
            max_retries: env::var("MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            lock_timeout_minutes: env::var("LOCK_TIMEOUT_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
            nominal_repo_files: env::var("NOMINAL_REPO_FILES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(13_500),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            public_mirrors,
        })
    }

    /// Look up the configured public mirror for a private repo, if any.
    pub fn public_mirror(&self, repo_full_name: &str) -> Option<&str> {
        self.public_mirrors
            .get(repo_full_name)
            .map(|s| s.as_str())
            .filter(|public| *public != repo_full_name)
    }
}

// ============================================================================
// Combined config
// ============================================================================

/// Everything a worker process needs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub llm: LlmConfig,
    pub application: ApplicationConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            queue: QueueConfig::from_env()?,
            llm: LlmConfig::from_env(),
            application: ApplicationConfig::from_env()?,
        })
    }

    pub fn github_token() -> Result<String> {
        env::var("GITHUB_TOKEN")
            .map_err(|_| Error::Config("GITHUB_TOKEN must be set to scan GitHub repos".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var driven tests mutate process state, so they run single-threaded
    // on distinct variables.

    #[test]
    fn database_url_passthrough() {
        env::set_var("DATABASE_URL", "postgres://u:p@db:5432/x");
        let cfg = DatabaseConfig::from_env().unwrap();
        assert_eq!(cfg.url, "postgres://u:p@db:5432/x");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn llm_defaults() {
        let cfg = LlmConfig {
            endpoint: None,
            deployment: "gpt-35-turbo".into(),
            api_key: None,
            client_id: None,
            requests_per_minute: 60,
            batch_size: 10,
        };
        assert!(!cfg.is_available());
        assert_eq!(cfg.requests_per_minute, 60);
    }

    #[test]
    fn public_mirror_lookup() {
        let mut mirrors = HashMap::new();
        mirrors.insert(
            "MicrosoftDocs/azure-docs-pr".to_string(),
            "MicrosoftDocs/azure-docs".to_string(),
        );
        let app = ApplicationConfig {
            user_agent: "test".into(),
            max_retries: 3,
            lock_timeout_minutes: 30,
            nominal_repo_files: 13_500,
            otlp_endpoint: None,
            public_mirrors: mirrors,
        };
        assert_eq!(
            app.public_mirror("MicrosoftDocs/azure-docs-pr"),
            Some("MicrosoftDocs/azure-docs")
        );
        assert_eq!(app.public_mirror("unknown/repo"), None);
    }
}
