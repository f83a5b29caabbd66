//! Scoring service HTTP client
//!
//! Talks to the external bias-scoring service: `/score_page` for holistic
//! page analysis and `/score_snippets` for batched per-snippet scoring.
//! Every request passes the shared rate limiter first; HTTP 429 responses
//! are retried with exponential backoff plus jitter.

use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bias::{HolisticResult, ReviewMethod};
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::scoring::limiter::LlmRateLimiter;

const PAGE_TIMEOUT: Duration = Duration::from_secs(60);
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(1);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SnippetScoreRequest {
    pub id: i64,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub context: String,
}

/// Per-snippet scoring result. `bias_types` is a category -> bool map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetScore {
    pub id: i64,
    #[serde(default)]
    pub windows_biased: Option<bool>,
    #[serde(default)]
    pub bias_types: serde_json::Value,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_linux_alternative: Option<String>,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Deserialize)]
struct SnippetBatchResponse {
    #[serde(default)]
    results: Vec<SnippetScore>,
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct ScoringClient {
    http: Client,
    config: LlmConfig,
    limiter: Arc<LlmRateLimiter>,
}

impl ScoringClient {
    pub fn new(config: LlmConfig, limiter: Arc<LlmRateLimiter>) -> Result<Self> {
        let http = Client::builder()
            .timeout(BATCH_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    pub fn is_available(&self) -> bool {
        self.config.is_available()
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    fn endpoint(&self, path: &str) -> Result<String> {
        let base = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("LLM_ENDPOINT is not configured".to_string()))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), path))
    }

    /// Holistic page analysis; the slow (~60 s) call the LLM worker owns.
    pub async fn score_page(&self, page_content: &str, page_url: &str) -> Result<HolisticResult> {
        let url = self.endpoint("score_page")?;
        let body = serde_json::json!({
            "page_content": page_content,
            "metadata": {"url": page_url},
        });

        debug!(page_url, "requesting holistic page score");
        let value = self.post_with_retry(&url, &body, PAGE_TIMEOUT).await?;

        let mut result: HolisticResult = serde_json::from_value(value)
            .map_err(|e| Error::llm(format!("malformed score_page response: {e}")))?;
        result.review_method = Some(ReviewMethod::Llm);
        Ok(result)
    }

    /// Batched per-snippet scoring; responses map back by snippet id.
    pub async fn score_snippets(
        &self,
        snippets: &[SnippetScoreRequest],
    ) -> Result<Vec<SnippetScore>> {
        if snippets.is_empty() {
            return Ok(Vec::new());
        }

        let url = self.endpoint("score_snippets")?;
        let body = serde_json::json!({ "snippets": snippets });

        info!(count = snippets.len(), "requesting snippet batch score");
        let value = self.post_with_retry(&url, &body, BATCH_TIMEOUT).await?;

        let response: SnippetBatchResponse = serde_json::from_value(value)
            .map_err(|e| Error::llm(format!("malformed score_snippets response: {e}")))?;
        Ok(response.results)
    }

    async fn post_with_retry(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        for attempt in 0..MAX_RETRIES {
            self.limiter.acquire().await;

            let mut request = self.http.post(url).timeout(timeout).json(body);
            if let Some(key) = &self.config.api_key {
                request = request.header("api-key", key);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => return Err(Error::llm(e.to_string())),
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=1000));
                let delay = RETRY_BASE * 2u32.pow(attempt) + jitter;
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scoring service returned 429, backing off"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(Error::llm(format!("HTTP {status}: {text}")));
            }

            return response
                .json()
                .await
                .map_err(|e| Error::llm(format!("decode error: {e}")));
        }

        Err(Error::llm(format!(
            "scoring service still rate limiting after {MAX_RETRIES} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: Option<&str>) -> LlmConfig {
        LlmConfig {
            endpoint: endpoint.map(String::from),
            deployment: "gpt-35-turbo".into(),
            api_key: Some("key".into()),
            client_id: None,
            requests_per_minute: 60,
            batch_size: 10,
        }
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let client = ScoringClient::new(
            config(Some("http://scorer:9000/")),
            Arc::new(LlmRateLimiter::new(60)),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("score_page").unwrap(),
            "http://scorer:9000/score_page"
        );
    }

    #[test]
    fn missing_endpoint_is_config_error() {
        let client =
            ScoringClient::new(config(None), Arc::new(LlmRateLimiter::new(60))).unwrap();
        assert!(matches!(
            client.endpoint("score_page"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn snippet_score_decodes_with_defaults() {
        let score: SnippetScore = serde_json::from_value(serde_json::json!({
            "id": 3,
            "windows_biased": true,
        }))
        .unwrap();
        assert_eq!(score.id, 3);
        assert_eq!(score.windows_biased, Some(true));
        assert_eq!(score.method, "");
    }
}
