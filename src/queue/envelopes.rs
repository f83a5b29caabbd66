//! Queue message envelopes
//!
//! Every envelope carries at least `scan_id`. Decoding is the validation
//! step: a payload that fails to decode is a poison message and is
//! dead-lettered instead of being retried forever.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::github::ChangeType;

fn github_source() -> String {
    "github".to_string()
}

/// Trigger for one repository scan (queue `scan_tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    pub url: String,
    pub scan_id: i64,
    #[serde(default = "github_source")]
    pub source: String,
    #[serde(default)]
    pub force_rescan: bool,
}

/// Per-file change notification from discovery (queue `changed_files`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFileMessage {
    pub scan_id: i64,
    pub path: String,
    pub sha: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

/// Per-file processing work (queue `doc_processing`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocProcessingTask {
    pub page_id: i64,
    pub scan_id: i64,
    pub url: String,
    pub file_content: String,
    #[serde(default = "github_source")]
    pub source: String,
}

/// Deferred holistic LLM scoring (queue `llm_scoring`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmScoringTask {
    pub scan_id: i64,
    pub page_id: i64,
    pub page_url: String,
    pub page_content: String,
}

/// Decode an envelope, mapping failures to `Error::Validation` so consumers
/// dead-letter the message.
pub fn decode<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::Validation(format!("malformed task message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scan_task_defaults() {
        let task: ScanTask = decode(&json!({
            "url": "https://github.com/MicrosoftDocs/azure-docs",
            "scan_id": 42
        }))
        .unwrap();
        assert_eq!(task.source, "github");
        assert!(!task.force_rescan);
    }

    #[test]
    fn changed_file_round_trip() {
        let msg = ChangedFileMessage {
            scan_id: 7,
            path: "articles/aks/install.md".into(),
            sha: "abc123".into(),
            change_type: ChangeType::Modified,
            commit_sha: Some("deadbeef".into()),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["change_type"], "modified");
        let back: ChangedFileMessage = decode(&value).unwrap();
        assert_eq!(back.path, msg.path);
    }

    #[test]
    fn missing_required_field_is_validation_error() {
        let result: Result<DocProcessingTask> = decode(&json!({"scan_id": 1}));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn llm_task_requires_content() {
        let result: Result<LlmScoringTask> = decode(&json!({
            "scan_id": 1, "page_id": 2, "page_url": "https://example"
        }));
        assert!(result.is_err());
    }
}
