//! GitHub access layer
//!
//! Rate-limit-aware wrapper over the GitHub REST API plus the cheap
//! Windows-content predicates shared by discovery and the file workers.

pub mod client;
pub mod models;

pub use client::{
    is_windows_focused_content, is_windows_focused_path, GitHubClient, GitHubConfig, RateLimitInfo,
};
pub use models::{
    ChangeType, CompareResult, FileChange, ParsedRepoUrl, RepoInfo, Tree, TreeEntry, TreeEntryType,
};
