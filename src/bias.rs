//! Page-level bias rules
//!
//! The holistic result (`mcp_holistic`) is schema-flexible JSON produced by
//! the scoring service. It decodes into a typed record with an `extra` bag
//! for forward compatibility. Severity is the authoritative bias indicator
//! and dominates `bias_types`: a page whose severity is "none" is never
//! reported as biased, whatever its bias_types list says.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Holistic result
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Case-insensitive parse; unknown values are treated as absent by
    /// callers rather than failing the whole record.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Severity::None),
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMethod {
    Heuristic,
    Llm,
    LlmPending,
    LlmError,
}

impl ReviewMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMethod::Heuristic => "heuristic",
            ReviewMethod::Llm => "llm",
            ReviewMethod::LlmPending => "llm_pending",
            ReviewMethod::LlmError => "llm_error",
        }
    }
}

/// Typed view of the holistic page score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HolisticResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default)]
    pub bias_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_method: Option<ReviewMethod>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl HolisticResult {
    /// Placeholder written by the document worker while the holistic score
    /// waits on the llm_scoring queue.
    pub fn pending() -> Self {
        Self {
            review_method: Some(ReviewMethod::LlmPending),
            ..Default::default()
        }
    }

    /// Result recorded when the holistic LLM call fails.
    pub fn llm_error(error: impl Into<String>) -> Self {
        let mut extra = HashMap::new();
        extra.insert("error".to_string(), serde_json::Value::String(error.into()));
        Self {
            review_method: Some(ReviewMethod::LlmError),
            extra,
            ..Default::default()
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        self.severity.as_deref().and_then(Severity::parse)
    }
}

// ============================================================================
// Bias rules
// ============================================================================

/// Whether a holistic result marks a page as biased.
///
/// severity != "none" wins; with severity absent, a non-empty bias_types
/// list decides.
pub fn is_biased(holistic: &HolisticResult) -> bool {
    match holistic.severity() {
        Some(Severity::None) => false,
        Some(_) => true,
        None => !holistic.bias_types.is_empty(),
    }
}

/// Same rule applied straight to the stored JSON column.
pub fn is_biased_value(value: &serde_json::Value) -> bool {
    serde_json::from_value::<HolisticResult>(value.clone())
        .map(|h| is_biased(&h))
        .unwrap_or(false)
}

/// Page priority derived from how many bias categories the holistic review
/// found. Used identically by leaderboards, docset rollups and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn label(&self) -> &'static str {
        match self {
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }

    pub fn score(&self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

pub fn page_priority(holistic: &HolisticResult) -> Priority {
    match holistic.bias_types.len() {
        n if n >= 3 => Priority::High,
        2 => Priority::Medium,
        _ => Priority::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn holistic(value: serde_json::Value) -> HolisticResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn severity_none_dominates_bias_types() {
        let h = holistic(json!({
            "severity": "none",
            "bias_types": ["powershell_only"],
        }));
        assert!(!is_biased(&h));
    }

    #[test]
    fn severity_is_case_insensitive() {
        let h = holistic(json!({"severity": "NONE", "bias_types": ["x"]}));
        assert!(!is_biased(&h));
        let h = holistic(json!({"severity": "High", "bias_types": []}));
        assert!(is_biased(&h));
    }

    #[test]
    fn missing_severity_falls_back_to_bias_types() {
        let h = holistic(json!({"bias_types": ["powershell_only"]}));
        assert!(is_biased(&h));
        let h = holistic(json!({"bias_types": []}));
        assert!(!is_biased(&h));
    }

    #[test]
    fn unknown_severity_is_treated_as_absent() {
        let h = holistic(json!({"severity": "critical", "bias_types": ["a"]}));
        assert!(is_biased(&h));
        let h = holistic(json!({"severity": "critical", "bias_types": []}));
        assert!(!is_biased(&h));
    }

    #[test]
    fn priority_from_bias_type_count() {
        let h = holistic(json!({"bias_types": ["a", "b", "c"]}));
        assert_eq!(page_priority(&h), Priority::High);
        assert_eq!(page_priority(&h).score(), 3);

        let h = holistic(json!({"bias_types": ["a", "b"]}));
        assert_eq!(page_priority(&h), Priority::Medium);

        let h = holistic(json!({"bias_types": ["a"]}));
        assert_eq!(page_priority(&h), Priority::Low);

        let h = holistic(json!({"bias_types": []}));
        assert_eq!(page_priority(&h), Priority::Low);
        assert_eq!(page_priority(&h).score(), 1);
    }

    #[test]
    fn pending_placeholder_round_trips() {
        let value = serde_json::to_value(HolisticResult::pending()).unwrap();
        assert_eq!(value["review_method"], "llm_pending");
        assert!(!is_biased_value(&value));
    }

    #[test]
    fn extra_fields_survive_decode() {
        let h = holistic(json!({
            "severity": "low",
            "bias_types": ["powershell_only"],
            "confidence": 0.92,
        }));
        assert!(is_biased(&h));
        assert_eq!(h.extra["confidence"], json!(0.92));
    }

    #[test]
    fn malformed_value_is_not_biased() {
        assert!(!is_biased_value(&json!("not an object")));
    }
}
