//! Bias scoring pipeline
//!
//! Per-snippet scoring runs in two passes: the regex heuristics pick out
//! likely-biased snippets, then the scoring service's LLM confirms them in
//! batches. When no snippet trips the heuristics the whole set is sent to
//! the LLM, so pages with subtle bias are not silently dropped. When the
//! scoring service is unreachable, an on-box heuristic score with
//! `method = "heuristic_fallback"` keeps the pipeline moving.

pub mod client;
pub mod heuristics;
pub mod limiter;

pub use client::{ScoringClient, SnippetScore, SnippetScoreRequest};
pub use heuristics::is_windows_biased;
pub use limiter::LlmRateLimiter;

use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;

/// A snippet staged for scoring, tied back to its database row.
#[derive(Debug, Clone)]
pub struct ScoringSnippet {
    /// Snippet row id; batch responses map back through it.
    pub id: i64,
    pub code: String,
    pub context: String,
    pub language: Option<String>,
    pub url: String,
    pub under_az_powershell_tab: bool,
    pub windows_header: bool,
}

/// Orchestrates heuristic and LLM scoring.
#[derive(Clone)]
pub struct ScoringService {
    client: ScoringClient,
}

impl ScoringService {
    pub fn new(client: ScoringClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ScoringClient {
        &self.client
    }

    /// Snippets flagged by the heuristic pre-filter.
    pub fn apply_heuristic_scoring<'a>(
        &self,
        snippets: &'a [ScoringSnippet],
    ) -> Vec<&'a ScoringSnippet> {
        let flagged: Vec<&ScoringSnippet> = snippets
            .iter()
            .filter(|s| is_windows_biased(s))
            .collect();
        info!(
            flagged = flagged.len(),
            total = snippets.len(),
            "heuristic pre-filter complete"
        );
        flagged
    }

    /// Score snippets with the LLM in batches, falling back to heuristic
    /// scores per batch when the service is unavailable or errors out.
    /// Returns (snippet_id, score) pairs.
    pub async fn score_snippets(
        &self,
        snippets: &[&ScoringSnippet],
    ) -> Result<Vec<(i64, serde_json::Value)>> {
        if snippets.is_empty() {
            return Ok(Vec::new());
        }

        if !self.client.is_available() {
            warn!("scoring service unavailable, using heuristic fallback for all snippets");
            return Ok(snippets
                .iter()
                .map(|s| (s.id, heuristic_fallback_score(s)))
                .collect());
        }

        let mut scored = Vec::with_capacity(snippets.len());
        for batch in snippets.chunks(self.client.batch_size()) {
            let requests: Vec<SnippetScoreRequest> = batch
                .iter()
                .map(|s| SnippetScoreRequest {
                    id: s.id,
                    code: s.code.clone(),
                    language: s.language.clone(),
                    context: s.context.clone(),
                })
                .collect();

            match self.client.score_snippets(&requests).await {
                Ok(results) => {
                    for result in results {
                        let id = result.id;
                        scored.push((id, serde_json::to_value(result)?));
                    }
                }
                Err(err) => {
                    warn!(%err, "batch scoring failed, falling back to heuristic scores");
                    for snippet in batch {
                        scored.push((snippet.id, heuristic_fallback_score(snippet)));
                    }
                }
            }
        }

        Ok(scored)
    }
}

/// Build an LLM-score-shaped result from the heuristics alone.
pub fn heuristic_fallback_score(snippet: &ScoringSnippet) -> serde_json::Value {
    let biased = is_windows_biased(snippet);
    let code = snippet.code.to_ascii_lowercase();

    json!({
        "windows_biased": biased,
        "bias_types": {
            "powershell_only": code.contains("powershell")
                || (["get-", "set-", "new-", "remove-"].iter().any(|c| code.contains(c))),
            "windows_paths": code.contains("c:\\") || code.contains("\\users\\"),
            "windows_commands": (["dir ", "copy ", "del ", "cls", "type "]
                .iter()
                .any(|c| code.contains(c))),
            "windows_tools": (["regedit", "msiexec", "choco", "winget"]
                .iter()
                .any(|c| code.contains(c))),
            "missing_linux_example": biased,
            "windows_specific_syntax": code.contains("$env:"),
            "windows_registry": code.contains("registry") || code.contains("regedit"),
            "windows_services": (["net start", "net stop", "sc "].iter().any(|c| code.contains(c))),
        },
        "explanation": if biased {
            "Heuristic fallback: Windows bias detected"
        } else {
            "Heuristic fallback: no obvious Windows bias"
        },
        "suggested_linux_alternative":
            "Consider providing equivalent Linux/macOS commands or cross-platform alternatives.",
        "method": "heuristic_fallback",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(id: i64, code: &str) -> ScoringSnippet {
        ScoringSnippet {
            id,
            code: code.to_string(),
            context: String::new(),
            language: None,
            url: "https://github.com/o/r/blob/main/articles/aks/a.md".to_string(),
            under_az_powershell_tab: false,
            windows_header: false,
        }
    }

    #[test]
    fn fallback_score_shape() {
        let score = heuristic_fallback_score(&snippet(1, "choco install azure-cli"));
        assert_eq!(score["windows_biased"], true);
        assert_eq!(score["method"], "heuristic_fallback");
        assert_eq!(score["bias_types"]["windows_tools"], true);
        assert_eq!(score["bias_types"]["windows_registry"], false);
    }

    #[test]
    fn fallback_score_unbiased() {
        let score = heuristic_fallback_score(&snippet(1, "az vm list"));
        assert_eq!(score["windows_biased"], false);
        assert_eq!(score["bias_types"]["missing_linux_example"], false);
    }

    #[tokio::test]
    async fn unavailable_service_scores_all_heuristically() {
        use crate::config::LlmConfig;
        use std::sync::Arc;

        let config = LlmConfig {
            endpoint: None,
            deployment: "gpt-35-turbo".into(),
            api_key: None,
            client_id: None,
            requests_per_minute: 60,
            batch_size: 10,
        };
        let client = ScoringClient::new(config, Arc::new(LlmRateLimiter::new(60))).unwrap();
        let service = ScoringService::new(client);

        let snippets = vec![snippet(1, "Get-AzVM"), snippet(2, "az vm list")];
        let refs: Vec<&ScoringSnippet> = snippets.iter().collect();
        let scored = service.score_snippets(&refs).await.unwrap();

        assert_eq!(scored.len(), 2);
        assert_eq!(scored[0].0, 1);
        assert_eq!(scored[0].1["method"], "heuristic_fallback");
        assert_eq!(scored[0].1["windows_biased"], true);
        assert_eq!(scored[1].1["windows_biased"], false);
    }

    #[test]
    fn heuristic_filter_selects_flagged() {
        use crate::config::LlmConfig;
        use std::sync::Arc;

        let config = LlmConfig {
            endpoint: None,
            deployment: "gpt-35-turbo".into(),
            api_key: None,
            client_id: None,
            requests_per_minute: 60,
            batch_size: 10,
        };
        let client = ScoringClient::new(config, Arc::new(LlmRateLimiter::new(60))).unwrap();
        let service = ScoringService::new(client);

        let snippets = vec![snippet(1, "Get-AzVM"), snippet(2, "az vm list")];
        let flagged = service.apply_heuristic_scoring(&snippets);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, 1);
    }
}
