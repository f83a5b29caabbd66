//! GitHub file discovery
//!
//! Decides which files of a repository need (re)processing and feeds the
//! `changed_files` queue, using as few GitHub API calls as possible:
//!
//! - *Incremental*: a recent complete scan provides a commit baseline; one
//!   compare call yields the exact change set.
//! - *Recovery*: no recent complete scan, but processing history provides a
//!   partial (file -> sha) map; one tree call plus a local diff.
//! - *Initial*: no usable baseline; one recursive tree call enqueues
//!   everything.
//!
//! Discovery is the only writer of `working_commit_sha` and
//! `baseline_type`. It never touches `last_commit_sha`; only finalization
//! promotes the working commit, so an interrupted scan cannot poison
//! future baselines.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::ApplicationConfig;
use crate::db::scans;
use crate::error::Result;
use crate::github::{
    is_windows_focused_path, ChangeType, FileChange, GitHubClient, ParsedRepoUrl, TreeEntryType,
};
use crate::history::ProcessingHistoryService;
use crate::queue::{ChangedFileMessage, QueueName, QueueService};

/// Subtrees that never contain scannable documentation.
const EXCLUDED_PATTERNS: &[&str] = &[
    "/media/",
    "/.github/",
    "/node_modules/",
    "/archive/",
    "/deprecated/",
];

const COMPLETE_BASELINE_MAX_AGE_DAYS: i64 = 7;
const PARTIAL_BASELINE_MAX_AGE_DAYS: i64 = 30;
const MIN_PARTIAL_COVERAGE: f64 = 0.10;
const PUBLISH_BATCH_SIZE: usize = 100;

// ============================================================================
// Baselines
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineType {
    Complete,
    Partial,
    None,
}

impl BaselineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaselineType::Complete => "complete",
            BaselineType::Partial => "partial",
            BaselineType::None => "none",
        }
    }
}

/// The prior repository state discovery diffs against.
#[derive(Debug, Clone)]
pub struct BaselineInfo {
    pub baseline_type: BaselineType,
    pub commit_sha: Option<String>,
    pub scan_id: Option<i64>,
    pub file_map: Option<HashMap<String, String>>,
    pub coverage: f64,
    pub age: Option<Duration>,
    pub reason: String,
}

impl BaselineInfo {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            baseline_type: BaselineType::None,
            commit_sha: None,
            scan_id: None,
            file_map: None,
            coverage: 0.0,
            age: None,
            reason: reason.into(),
        }
    }
}

/// Chooses the cheapest viable baseline for a repository.
#[derive(Clone)]
pub struct BaselineManager {
    history: ProcessingHistoryService,
    nominal_repo_files: usize,
}

impl BaselineManager {
    pub fn new(nominal_repo_files: usize) -> Self {
        Self {
            history: ProcessingHistoryService,
            nominal_repo_files: nominal_repo_files.max(1),
        }
    }

    pub async fn optimal_baseline(&self, pool: &PgPool, repo_url: &str) -> Result<BaselineInfo> {
        if let Some(complete) = self.last_complete_baseline(pool, repo_url).await? {
            let fresh = complete
                .age
                .map(|age| age < Duration::days(COMPLETE_BASELINE_MAX_AGE_DAYS))
                .unwrap_or(false);
            if fresh {
                return Ok(complete);
            }
        }

        let partial = self.partial_baseline(pool, repo_url).await?;
        if partial.baseline_type == BaselineType::Partial {
            return Ok(partial);
        }

        Ok(BaselineInfo::none("no suitable baseline found"))
    }

    async fn last_complete_baseline(
        &self,
        pool: &PgPool,
        repo_url: &str,
    ) -> Result<Option<BaselineInfo>> {
        let Some(scan) = scans::last_complete_scan(pool, repo_url).await? else {
            return Ok(None);
        };

        let age = scan.finished_at.map(|finished| Utc::now() - finished);
        Ok(Some(BaselineInfo {
            baseline_type: BaselineType::Complete,
            commit_sha: scan.last_commit_sha.clone(),
            scan_id: Some(scan.id),
            file_map: None,
            coverage: 1.0,
            age,
            reason: format!("last complete scan {} from {:?}", scan.id, scan.finished_at),
        }))
    }

    async fn partial_baseline(&self, pool: &PgPool, repo_url: &str) -> Result<BaselineInfo> {
        let file_map = self
            .history
            .processed_files_map(pool, repo_url, PARTIAL_BASELINE_MAX_AGE_DAYS)
            .await?;
        if file_map.is_empty() {
            return Ok(BaselineInfo::none("no processing history found"));
        }

        let coverage = coverage_estimate(file_map.len(), self.nominal_repo_files);
        if coverage <= MIN_PARTIAL_COVERAGE {
            return Ok(BaselineInfo::none(format!(
                "partial baseline coverage too low ({:.1}%)",
                coverage * 100.0
            )));
        }

        let reason = format!(
            "partial baseline from processing history, {} files, {:.1}% coverage",
            file_map.len(),
            coverage * 100.0
        );
        Ok(BaselineInfo {
            baseline_type: BaselineType::Partial,
            commit_sha: None,
            scan_id: None,
            file_map: Some(file_map),
            coverage,
            age: None,
            reason,
        })
    }
}

/// Coverage of a partial baseline, estimated against the nominal repo size.
fn coverage_estimate(files_known: usize, nominal_repo_files: usize) -> f64 {
    (files_known as f64 / nominal_repo_files.max(1) as f64).min(1.0)
}

// ============================================================================
// Discovery service
// ============================================================================

#[derive(Clone)]
pub struct DiscoveryService {
    github: GitHubClient,
    queue: QueueService,
    baselines: BaselineManager,
    app: ApplicationConfig,
}

/// What one discovery run enqueued.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub files_queued: i64,
    pub discovery_type: &'static str,
}

impl DiscoveryService {
    pub fn new(github: GitHubClient, queue: QueueService, app: ApplicationConfig) -> Self {
        let baselines = BaselineManager::new(app.nominal_repo_files);
        Self {
            github,
            queue,
            baselines,
            app,
        }
    }

    /// Discover and enqueue the files that need processing.
    ///
    /// On a 404 for a private/preview repo, the configured public mirror is
    /// tried before giving up.
    pub async fn discover_changes(
        &self,
        pool: &PgPool,
        repo_url: &str,
        scan_id: i64,
        force_full_scan: bool,
    ) -> Result<DiscoveryOutcome> {
        let parsed = GitHubClient::parse_github_url(repo_url)?;
        info!(repo = %parsed.repo_full_name, scan_id, "starting discovery");

        match self
            .try_discovery(pool, &parsed, repo_url, scan_id, force_full_scan)
            .await?
        {
            Some(outcome) => Ok(outcome),
            None => {
                let Some(public) = self.app.public_mirror(&parsed.repo_full_name) else {
                    warn!(repo = %parsed.repo_full_name, "repository not found and no public mirror configured");
                    return Ok(DiscoveryOutcome::default());
                };

                info!(
                    private = %parsed.repo_full_name,
                    public,
                    "private repo not accessible, retrying against public mirror"
                );
                let mirrored = ParsedRepoUrl {
                    repo_full_name: public.to_string(),
                    branch: parsed.branch.clone(),
                    path: parsed.path.clone(),
                };
                Ok(self
                    .try_discovery(pool, &mirrored, repo_url, scan_id, force_full_scan)
                    .await?
                    .unwrap_or_default())
            }
        }
    }

    /// One discovery attempt; None means the repo/branch 404'd.
    async fn try_discovery(
        &self,
        pool: &PgPool,
        parsed: &ParsedRepoUrl,
        repo_url: &str,
        scan_id: i64,
        force_full_scan: bool,
    ) -> Result<Option<DiscoveryOutcome>> {
        let baseline = if force_full_scan {
            BaselineInfo::none("forced full scan")
        } else {
            self.baselines.optimal_baseline(pool, repo_url).await?
        };
        info!(
            baseline = baseline.baseline_type.as_str(),
            reason = %baseline.reason,
            "baseline selected"
        );

        // Memoized repo metadata settles accessibility before any
        // tree-sized call; a 404 here means private/missing and triggers
        // the mirror fallback.
        if self.github.repo_info(&parsed.repo_full_name).await?.is_none() {
            return Ok(None);
        }

        let Some(head) = self
            .github
            .head_commit(&parsed.repo_full_name, &parsed.branch)
            .await?
        else {
            return Ok(None);
        };

        scans::set_working_commit(pool, scan_id, &head, baseline.baseline_type.as_str()).await?;

        let outcome = match baseline.baseline_type {
            BaselineType::Complete => {
                let queued = self
                    .incremental_discovery(parsed, scan_id, &baseline, &head)
                    .await?;
                DiscoveryOutcome {
                    files_queued: queued,
                    discovery_type: "incremental",
                }
            }
            BaselineType::Partial => {
                let queued = self
                    .recovery_discovery(parsed, scan_id, &baseline, &head)
                    .await?;
                DiscoveryOutcome {
                    files_queued: queued,
                    discovery_type: "recovery",
                }
            }
            BaselineType::None => {
                let queued = self.initial_discovery(parsed, scan_id, &head).await?;
                DiscoveryOutcome {
                    files_queued: queued,
                    discovery_type: "initial",
                }
            }
        };

        info!(
            files_queued = outcome.files_queued,
            discovery_type = outcome.discovery_type,
            "discovery complete"
        );
        Ok(Some(outcome))
    }

    /// Compare-API discovery from a complete baseline. One API call.
    async fn incremental_discovery(
        &self,
        parsed: &ParsedRepoUrl,
        scan_id: i64,
        baseline: &BaselineInfo,
        head: &str,
    ) -> Result<i64> {
        let base = baseline
            .commit_sha
            .as_deref()
            .expect("complete baseline always carries a commit sha");

        if base == head {
            info!(%head, "repository is up to date");
            return Ok(0);
        }

        let comparison = self
            .github
            .compare_commits(&parsed.repo_full_name, base, head)
            .await?;
        info!(
            changed = comparison.files.len(),
            base = &base[..base.len().min(8)],
            head = &head[..head.len().min(8)],
            "compared commits"
        );

        let messages: Vec<ChangedFileMessage> = comparison
            .files
            .iter()
            .filter(|change| should_process_change(change))
            .map(|change| ChangedFileMessage {
                scan_id,
                path: change.filename.clone(),
                sha: change.sha.clone(),
                change_type: change.status,
                commit_sha: Some(head.to_string()),
            })
            .collect();

        let queued = messages.len() as i64;
        for batch in messages.chunks(PUBLISH_BATCH_SIZE) {
            self.queue.publish_batch(QueueName::ChangedFiles, batch).await?;
        }
        Ok(queued)
    }

    /// Trees-API discovery with no baseline: everything is `added`.
    async fn initial_discovery(
        &self,
        parsed: &ParsedRepoUrl,
        scan_id: i64,
        head: &str,
    ) -> Result<i64> {
        let tree = self
            .github
            .tree(&parsed.repo_full_name, head, &parsed.path, true)
            .await?;

        let mut messages = Vec::new();
        for entry in &tree.entries {
            if entry.entry_type != TreeEntryType::Blob || !entry.path.ends_with(".md") {
                continue;
            }
            let full_path = prefix_scoped_path(&parsed.path, &entry.path);
            if !should_process_path(&full_path) {
                continue;
            }
            messages.push(ChangedFileMessage {
                scan_id,
                path: full_path,
                sha: entry.sha.clone(),
                change_type: ChangeType::Added,
                commit_sha: Some(head.to_string()),
            });
        }

        info!(markdown_files = messages.len(), "initial discovery enumerated tree");

        let queued = messages.len() as i64;
        for batch in messages.chunks(PUBLISH_BATCH_SIZE) {
            self.queue.publish_batch(QueueName::ChangedFiles, batch).await?;
        }
        Ok(queued)
    }

    /// Tree diff against the partial (file -> sha) baseline.
    async fn recovery_discovery(
        &self,
        parsed: &ParsedRepoUrl,
        scan_id: i64,
        baseline: &BaselineInfo,
        head: &str,
    ) -> Result<i64> {
        let file_map = baseline
            .file_map
            .as_ref()
            .expect("partial baseline always carries a file map");
        info!(
            baseline_files = file_map.len(),
            coverage = format!("{:.1}%", baseline.coverage * 100.0),
            "starting recovery discovery"
        );

        let tree = self
            .github
            .tree(&parsed.repo_full_name, head, &parsed.path, true)
            .await?;

        let mut messages = Vec::new();
        let mut skipped = 0usize;
        let mut new_files = 0usize;
        let mut changed_files = 0usize;

        for entry in &tree.entries {
            if entry.entry_type != TreeEntryType::Blob || !entry.path.ends_with(".md") {
                continue;
            }
            // Tree entries are relative to the scoped root; baseline paths
            // are repo-root-relative, so re-prefix before the lookup.
            let full_path = prefix_scoped_path(&parsed.path, &entry.path);
            if !should_process_path(&full_path) {
                continue;
            }

            match file_map.get(&full_path) {
                Some(known_sha) if known_sha == &entry.sha => {
                    skipped += 1;
                }
                known => {
                    let change_type = if known.is_some() {
                        changed_files += 1;
                        ChangeType::Modified
                    } else {
                        new_files += 1;
                        ChangeType::Added
                    };
                    messages.push(ChangedFileMessage {
                        scan_id,
                        path: full_path,
                        sha: entry.sha.clone(),
                        change_type,
                        commit_sha: Some(head.to_string()),
                    });
                }
            }
        }

        info!(
            queued = messages.len(),
            new_files, changed_files, skipped, "recovery discovery complete"
        );

        let queued = messages.len() as i64;
        for batch in messages.chunks(PUBLISH_BATCH_SIZE) {
            self.queue.publish_batch(QueueName::ChangedFiles, batch).await?;
        }
        Ok(queued)
    }
}

// ============================================================================
// Filters
// ============================================================================

fn is_excluded_path(path: &str) -> bool {
    let path = path.to_ascii_lowercase();
    EXCLUDED_PATTERNS.iter().any(|p| path.contains(p))
}

/// Filter for compare-API results: markdown, not removed, not excluded,
/// not intentionally Windows-scoped.
fn should_process_change(change: &FileChange) -> bool {
    change.filename.ends_with(".md")
        && change.status != ChangeType::Removed
        && !is_excluded_path(&change.filename)
        && !is_windows_focused_path(&change.filename)
}

/// Filter for tree-walk paths.
fn should_process_path(path: &str) -> bool {
    !is_excluded_path(path) && !is_windows_focused_path(path)
}

/// Tree entries under a scoped path come back relative to the scope root;
/// re-prefix so queue messages and baseline lookups always use
/// repo-root-relative paths.
fn prefix_scoped_path(scope: &str, entry_path: &str) -> String {
    let scope = scope.trim_matches('/');
    if scope.is_empty() || entry_path.starts_with(&format!("{scope}/")) {
        entry_path.to_string()
    } else {
        format!("{scope}/{entry_path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(filename: &str, status: ChangeType) -> FileChange {
        serde_json::from_value(serde_json::json!({
            "filename": filename,
            "sha": "abc123",
            "status": status.as_str(),
        }))
        .unwrap()
    }

    #[test]
    fn excluded_subtrees() {
        assert!(is_excluded_path("articles/media/x.md"));
        assert!(is_excluded_path("articles/aks/.github/workflow.md"));
        assert!(is_excluded_path("old/archive/setup.md"));
        assert!(is_excluded_path("pkg/node_modules/readme.md"));
        assert!(is_excluded_path("articles/deprecated/old.md"));
        assert!(!is_excluded_path("articles/aks/install.md"));
    }

    #[test]
    fn compare_filter_rules() {
        assert!(should_process_change(&change(
            "articles/aks/install.md",
            ChangeType::Modified
        )));
        // Not markdown.
        assert!(!should_process_change(&change(
            "articles/aks/diagram.png",
            ChangeType::Added
        )));
        // Removed files are handled by page bookkeeping, not re-fetching.
        assert!(!should_process_change(&change(
            "articles/aks/install.md",
            ChangeType::Removed
        )));
        // Excluded subtree.
        assert!(!should_process_change(&change(
            "articles/media/x.md",
            ChangeType::Added
        )));
        // Intentionally Windows-scoped.
        assert!(!should_process_change(&change(
            "articles/powershell/intro.md",
            ChangeType::Added
        )));
    }

    #[test]
    fn scoped_paths_are_reprefixed() {
        assert_eq!(
            prefix_scoped_path("articles", "aks/install.md"),
            "articles/aks/install.md"
        );
        // Already prefixed entries stay untouched.
        assert_eq!(
            prefix_scoped_path("articles", "articles/aks/install.md"),
            "articles/aks/install.md"
        );
        assert_eq!(prefix_scoped_path("", "aks/install.md"), "aks/install.md");
        assert_eq!(
            prefix_scoped_path("/articles/", "aks/install.md"),
            "articles/aks/install.md"
        );
    }

    #[test]
    fn coverage_estimation() {
        assert_eq!(coverage_estimate(1_350, 13_500), 0.1);
        assert_eq!(coverage_estimate(27_000, 13_500), 1.0);
        assert_eq!(coverage_estimate(0, 13_500), 0.0);
    }

    #[test]
    fn baseline_none_constructor() {
        let baseline = BaselineInfo::none("forced full scan");
        assert_eq!(baseline.baseline_type, BaselineType::None);
        assert_eq!(baseline.reason, "forced full scan");
        assert!(baseline.file_map.is_none());
    }
}
