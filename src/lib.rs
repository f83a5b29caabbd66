//! # docbias - Windows-bias documentation scan pipeline
//!
//! A distributed, queue-driven system that scans large GitHub Markdown
//! repositories for documentation presenting Windows/PowerShell
//! instructions as the only path, scores the findings, and tracks them
//! over time.
//!
//! ## Pipeline
//!
//! - **Discovery**: GitHub compare/tree APIs plus a multi-source baseline
//!   work out exactly which files need (re)processing.
//! - **Staging**: per-file change messages resolve a global
//!   (URL, content-hash) lock and stage document-processing tasks.
//! - **Scoring**: regex heuristics pre-filter snippets, the scoring
//!   service's LLM confirms them in batches, and slow holistic page
//!   analysis is deferred to a dedicated queue.
//! - **Completion**: a scan finalizes only when file processing and the
//!   asynchronous LLM phase have both drained, keeping incremental scans
//!   safe to resume.
//!
//! ## Processes
//!
//! Four long-running worker binaries share this library: the scan
//! orchestrator, the changed-files worker, the document worker and the
//! LLM scoring worker.

pub mod bias;
pub mod completion;
pub mod config;
pub mod db;
pub mod discovery;
pub mod docset;
pub mod error;
pub mod extract;
pub mod github;
pub mod history;
pub mod lock;
pub mod progress;
pub mod queue;
pub mod scoring;
pub mod snapshots;
pub mod telemetry;
pub mod workers;

pub use bias::{is_biased, page_priority, HolisticResult, Priority, ReviewMethod, Severity};
pub use completion::ScanCompletionService;
pub use config::Config;
pub use db::{init_db, Page, PageStatus, Scan, ScanStatus, Snippet};
pub use discovery::{BaselineInfo, BaselineManager, BaselineType, DiscoveryService};
pub use error::{Error, Result};
pub use github::{GitHubClient, GitHubConfig};
pub use history::ProcessingHistoryService;
pub use lock::UrlLockService;
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressService, ProgressTracker};
pub use queue::{QueueHandler, QueueName, QueueService};
pub use scoring::{LlmRateLimiter, ScoringClient, ScoringService};
pub use snapshots::BiasSnapshotService;
