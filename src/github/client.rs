//! GitHub REST client
//!
//! Typed wrapper over the handful of GitHub v3 endpoints the scan pipeline
//! needs: branch HEAD lookup, commit comparison, recursive trees and file
//! contents. The client tracks rate-limit headers from every response and
//! pauses before the limit is exhausted, so a discovery run over a large
//! repo never trips a 403.

use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
    Client, StatusCode,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::github::models::{
    Branch, CompareResult, FileContents, ParsedRepoUrl, RepoInfo, Tree, TreeEntryType,
};

const GITHUB_API_BASE: &str = "https://api.github.com";

/// Remaining-request floor below which the client sleeps until reset.
const RATE_LIMIT_FLOOR: i64 = 100;
/// Extra slack added past the advertised reset instant.
const RATE_LIMIT_RESET_BUFFER_SECS: i64 = 60;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: GITHUB_API_BASE.to_string(),
            timeout_secs: 30,
            user_agent: user_agent.into(),
        }
    }

    /// Point at a GitHub Enterprise instance.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

// ============================================================================
// Rate limit tracking
// ============================================================================

/// Rate limit state parsed from response headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset: DateTime<Utc>,
}

impl RateLimitInfo {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let parse = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        };
        let limit = parse("x-ratelimit-limit")?;
        let remaining = parse("x-ratelimit-remaining")?;
        let reset = DateTime::from_timestamp(parse("x-ratelimit-reset")?, 0)?;
        Some(Self {
            limit,
            remaining,
            reset,
        })
    }
}

// ============================================================================
// Client
// ============================================================================

/// GitHub API client shared across a worker's tasks.
#[derive(Clone)]
pub struct GitHubClient {
    config: GitHubConfig,
    client: Client,
    last_rate_limit: Arc<RwLock<Option<RateLimitInfo>>>,
    repo_cache: Arc<Mutex<HashMap<String, RepoInfo>>>,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(Error::Config("GitHub token is required".to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.token))
                .map_err(|e| Error::Config(format!("Invalid GitHub token: {e}")))?,
        );
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| Error::Config(format!("Invalid user agent: {e}")))?,
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            last_rate_limit: Arc::new(RwLock::new(None)),
            repo_cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    // ========================================================================
    // Rate limit discipline
    // ========================================================================

    /// Sleep if the previous response said we are close to the limit.
    async fn wait_for_rate_limit(&self) {
        let info = self.last_rate_limit.read().await.clone();
        if let Some(info) = info {
            if info.remaining < RATE_LIMIT_FLOOR {
                let resume_at =
                    info.reset + chrono::Duration::seconds(RATE_LIMIT_RESET_BUFFER_SECS);
                let wait = resume_at - Utc::now();
                if wait > chrono::Duration::zero() {
                    warn!(
                        remaining = info.remaining,
                        limit = info.limit,
                        wait_secs = wait.num_seconds(),
                        "GitHub rate limit approaching, pausing until reset"
                    );
                    tokio::time::sleep(Duration::from_secs(wait.num_seconds().max(0) as u64))
                        .await;
                }
            }
        }
    }

    async fn update_rate_limit(&self, headers: &HeaderMap) {
        if let Some(info) = RateLimitInfo::from_headers(headers) {
            *self.last_rate_limit.write().await = Some(info);
        }
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        match self.get_optional(path).await? {
            Some(value) => Ok(value),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    /// GET that reports 404 as None so callers can try a fallback repo.
    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.wait_for_rate_limit().await;

        let url = format!("{}{}", self.config.base_url, path);
        debug!(%url, "GET");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::github(e.to_string()))?;

        self.update_rate_limit(response.headers()).await;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN
                && self
                    .last_rate_limit
                    .read()
                    .await
                    .as_ref()
                    .map(|i| i.remaining == 0)
                    .unwrap_or(false))
        {
            let reset_at = self
                .last_rate_limit
                .read()
                .await
                .as_ref()
                .map(|i| i.reset)
                .unwrap_or_else(Utc::now);
            return Err(Error::RateLimited { reset_at });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::github(format!("HTTP {status}: {body}")));
        }

        let value = response
            .json()
            .await
            .map_err(|e| Error::github(format!("decode error: {e}")))?;
        Ok(Some(value))
    }

    // ========================================================================
    // URL parsing and predicates
    // ========================================================================

    /// Parse a repository URL of the form
    /// `https://github.com/{owner}/{repo}[/tree/{branch}[/{path}]]`.
    pub fn parse_github_url(url: &str) -> Result<ParsedRepoUrl> {
        use once_cell::sync::Lazy;
        use regex::Regex;

        static REPO_URL: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^https://github\.com/([^/]+/[^/]+?)(?:/tree/([^/]+)(/.*)?)?/?$").unwrap()
        });

        let caps = REPO_URL
            .captures(url)
            .ok_or_else(|| Error::Validation(format!("not a GitHub repository URL: {url}")))?;

        Ok(ParsedRepoUrl {
            repo_full_name: caps[1].to_string(),
            branch: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "main".to_string()),
            path: caps
                .get(3)
                .map(|m| m.as_str().trim_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    /// Blob URL for a file, used as the page identity across scans.
    pub fn blob_url(repo_full_name: &str, branch: &str, file_path: &str) -> String {
        let file_path = file_path.trim_start_matches('/');
        format!("https://github.com/{repo_full_name}/blob/{branch}/{file_path}")
    }

    // ========================================================================
    // Repository operations
    // ========================================================================

    /// Repository metadata, memoized so repeated lookups cost no API calls.
    pub async fn repo_info(&self, repo_full_name: &str) -> Result<Option<RepoInfo>> {
        {
            let cache = self.repo_cache.lock().await;
            if let Some(info) = cache.get(repo_full_name) {
                return Ok(Some(info.clone()));
            }
        }

        let info: Option<RepoInfo> = self.get_optional(&format!("/repos/{repo_full_name}")).await?;
        if let Some(ref info) = info {
            self.repo_cache
                .lock()
                .await
                .insert(repo_full_name.to_string(), info.clone());
        }
        Ok(info)
    }

    /// HEAD commit of a branch. `Ok(None)` means the repo or branch was not
    /// found (404), which discovery uses to fall back to a public mirror;
    /// transport problems surface as errors.
    pub async fn head_commit(
        &self,
        repo_full_name: &str,
        branch: &str,
    ) -> Result<Option<String>> {
        let branch_info: Option<Branch> = self
            .get_optional(&format!("/repos/{repo_full_name}/branches/{branch}"))
            .await?;
        Ok(branch_info.map(|b| b.commit.sha))
    }

    /// Compare two commits; one API call regardless of repo size.
    pub async fn compare_commits(
        &self,
        repo_full_name: &str,
        base_sha: &str,
        head_sha: &str,
    ) -> Result<CompareResult> {
        self.get(&format!(
            "/repos/{repo_full_name}/compare/{base_sha}...{head_sha}"
        ))
        .await
    }

    /// Fetch a (recursive) tree. When `path` is non-root, the parent tree is
    /// walked one segment at a time so a scoped scan never downloads the
    /// whole repository tree.
    pub async fn tree(
        &self,
        repo_full_name: &str,
        sha: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Tree> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return self.fetch_tree(repo_full_name, sha, recursive).await;
        }

        let mut current = self.fetch_tree(repo_full_name, sha, false).await?;
        for segment in path.split('/') {
            let subtree_sha = current
                .entries
                .iter()
                .find(|e| e.entry_type == TreeEntryType::Tree && e.path == segment)
                .map(|e| e.sha.clone())
                .ok_or_else(|| {
                    Error::NotFound(format!("path '{path}' not found in {repo_full_name}@{sha}"))
                })?;
            current = self.fetch_tree(repo_full_name, &subtree_sha, false).await?;
        }

        if recursive {
            self.fetch_tree(repo_full_name, &current.sha, true).await
        } else {
            Ok(current)
        }
    }

    async fn fetch_tree(&self, repo_full_name: &str, sha: &str, recursive: bool) -> Result<Tree> {
        let suffix = if recursive { "?recursive=1" } else { "" };
        let tree: Tree = self
            .get(&format!("/repos/{repo_full_name}/git/trees/{sha}{suffix}"))
            .await?;
        if tree.truncated {
            warn!(repo = repo_full_name, %sha, "GitHub tree response was truncated");
        }
        Ok(tree)
    }

    /// Fetch and decode a file's content.
    pub async fn file_content(
        &self,
        repo_full_name: &str,
        file_path: &str,
        branch: &str,
    ) -> Result<String> {
        let file_path = file_path.trim_start_matches('/');
        let contents: FileContents = self
            .get(&format!(
                "/repos/{repo_full_name}/contents/{file_path}?ref={branch}"
            ))
            .await?;

        if contents.encoding != "base64" {
            return Err(Error::github(format!(
                "unexpected content encoding '{}' for {file_path}",
                contents.encoding
            )));
        }

        let raw: String = contents.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(|e| Error::github(format!("base64 decode failed for {file_path}: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::github(format!("non-UTF8 content in {file_path}: {e}")))
    }

    pub async fn cached_rate_limit(&self) -> Option<RateLimitInfo> {
        self.last_rate_limit.read().await.clone()
    }
}

// ============================================================================
// Windows-content fast path
// ============================================================================

/// Paths that are intentionally Windows-scoped; scanning them is wasted work.
pub fn is_windows_focused_path(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    path.contains("/windows/")
        || path.contains("/powershell/")
        || path.contains("/cmd/")
        || path.contains("/cli-windows/")
}

/// Markdown whose title names PowerShell is treated as intentionally
/// Windows-scoped. The title comes from frontmatter first, then the
/// leading heading.
pub fn is_windows_focused_content(content: &str) -> bool {
    crate::extract::markdown_title(content)
        .map(|title| title.to_ascii_lowercase().contains("powershell"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_repo_url() {
        let parsed =
            GitHubClient::parse_github_url("https://github.com/MicrosoftDocs/azure-docs").unwrap();
        assert_eq!(parsed.repo_full_name, "MicrosoftDocs/azure-docs");
        assert_eq!(parsed.branch, "main");
        assert_eq!(parsed.path, "");
    }

    #[test]
    fn parse_url_with_branch_and_path() {
        let parsed = GitHubClient::parse_github_url(
            "https://github.com/MicrosoftDocs/azure-docs-pr/tree/live/articles/aks",
        )
        .unwrap();
        assert_eq!(parsed.repo_full_name, "MicrosoftDocs/azure-docs-pr");
        assert_eq!(parsed.branch, "live");
        assert_eq!(parsed.path, "articles/aks");
    }

    #[test]
    fn parse_rejects_non_github_urls() {
        assert!(GitHubClient::parse_github_url("https://gitlab.com/a/b").is_err());
        assert!(GitHubClient::parse_github_url("not a url").is_err());
    }

    #[test]
    fn blob_url_strips_leading_slash() {
        assert_eq!(
            GitHubClient::blob_url("owner/repo", "main", "/articles/a.md"),
            "https://github.com/owner/repo/blob/main/articles/a.md"
        );
    }

    #[test]
    fn windows_focused_paths() {
        assert!(is_windows_focused_path("articles/powershell/intro.md"));
        assert!(is_windows_focused_path("docs/Windows/setup.md"));
        assert!(is_windows_focused_path("docs/cli-windows/usage.md"));
        assert!(!is_windows_focused_path("articles/aks/install.md"));
        // Substrings that are not path segments do not match.
        assert!(!is_windows_focused_path("articles/windows-server-notes.md"));
    }

    #[test]
    fn windows_focused_content_checks_title() {
        assert!(is_windows_focused_content(
            "# Azure PowerShell reference\n\nSome content"
        ));
        assert!(is_windows_focused_content(
            "---\ntitle: Install Azure PowerShell\n---\n\nBody text"
        ));
        // PowerShell in the body alone does not make the page Windows-scoped.
        assert!(!is_windows_focused_content(
            "# Install the Azure CLI\n\nUse PowerShell or bash."
        ));
        assert!(!is_windows_focused_content("No headings at all"));
    }

    #[test]
    fn client_requires_token() {
        let config = GitHubConfig::new("", "docbias-test");
        assert!(GitHubClient::new(config).is_err());
    }

    #[tokio::test]
    async fn client_builds_with_token() {
        let config = GitHubConfig::new("ghp_test_token", "docbias-test");
        assert!(GitHubClient::new(config).is_ok());
    }
}
