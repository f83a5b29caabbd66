//! GitHub API response models
//!
//! Only the fields the scan pipeline reads are decoded; everything else in
//! the GitHub payloads is ignored.

use serde::{Deserialize, Serialize};

/// Components of a parsed GitHub repository URL.
///
/// `path` is the optional subtree scope ("articles" for
/// `https://github.com/owner/repo/tree/main/articles`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRepoUrl {
    pub repo_full_name: String,
    pub branch: String,
    pub path: String,
}

/// Change status reported by the compare API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    Renamed,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Removed => "removed",
            ChangeType::Renamed => "renamed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeType::Added),
            "modified" => Some(ChangeType::Modified),
            "removed" => Some(ChangeType::Removed),
            "renamed" => Some(ChangeType::Renamed),
            _ => None,
        }
    }
}

/// One file entry from the compare API.
#[derive(Debug, Clone, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub sha: String,
    pub status: ChangeType,
}

/// Result of comparing two commits.
#[derive(Debug, Clone, Deserialize)]
pub struct CompareResult {
    #[serde(default)]
    pub files: Vec<FileChange>,
}

/// One entry of a git tree.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub entry_type: TreeEntryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeEntryType {
    Blob,
    Tree,
    Commit,
}

/// A (possibly recursive) git tree.
#[derive(Debug, Clone, Deserialize)]
pub struct Tree {
    pub sha: String,
    #[serde(rename = "tree", default)]
    pub entries: Vec<TreeEntry>,
    #[serde(default)]
    pub truncated: bool,
}

/// Branch lookup response; only the HEAD commit is needed.
#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    pub name: String,
    pub commit: BranchCommit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchCommit {
    pub sha: String,
}

/// Contents API response for a single file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileContents {
    pub sha: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub size: i64,
}

/// Repository metadata memoized by the repo cache.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub full_name: String,
    pub default_branch: String,
    #[serde(default)]
    pub private: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_decodes_from_compare_payload() {
        let json = r#"{"filename": "articles/a.md", "sha": "abc123", "status": "modified"}"#;
        let change: FileChange = serde_json::from_str(json).unwrap();
        assert_eq!(change.status, ChangeType::Modified);
    }

    #[test]
    fn tree_entry_types() {
        let json = r#"{"sha": "root", "tree": [
            {"path": "articles", "sha": "t1", "type": "tree"},
            {"path": "README.md", "sha": "b1", "type": "blob"}
        ]}"#;
        let tree: Tree = serde_json::from_str(json).unwrap();
        assert_eq!(tree.entries.len(), 2);
        assert_eq!(tree.entries[0].entry_type, TreeEntryType::Tree);
        assert_eq!(tree.entries[1].entry_type, TreeEntryType::Blob);
        assert!(!tree.truncated);
    }
}
