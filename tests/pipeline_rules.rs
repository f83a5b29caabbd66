//! Cross-module pipeline rules
//!
//! Exercises the decision logic that holds the pipeline together without
//! external services: discovery filters, extraction-to-heuristics flow,
//! the severity rule, and queue envelope handling.

use docbias::bias::{is_biased, page_priority, HolisticResult, Priority, ReviewMethod};
use docbias::docset::extract_doc_set_from_url;
use docbias::extract::{extract_html_snippets, extract_markdown_snippets};
use docbias::github::{is_windows_focused_content, is_windows_focused_path, GitHubClient};
use docbias::queue::{decode, ChangedFileMessage, DocProcessingTask, ScanTask};
use docbias::scoring::{heuristic_fallback_score, is_windows_biased, ScoringSnippet};
use serde_json::json;

fn holistic(value: serde_json::Value) -> HolisticResult {
    serde_json::from_value(value).unwrap()
}

// ----------------------------------------------------------------------
// Severity dominance (scenario: severity "none" with bias_types set)
// ----------------------------------------------------------------------

#[test]
fn severity_none_page_is_never_reported_biased() {
    let result = holistic(json!({
        "severity": "none",
        "bias_types": ["powershell_only"],
        "summary": "PowerShell examples within a Windows-scoped page",
    }));
    assert!(!is_biased(&result));
    // Priority still derives from bias_types, independent of is_biased.
    assert_eq!(page_priority(&result), Priority::Low);
}

#[test]
fn priority_bands_match_bias_type_count() {
    let high = holistic(json!({"severity": "high", "bias_types": ["a", "b", "c", "d"]}));
    let medium = holistic(json!({"severity": "low", "bias_types": ["a", "b"]}));
    let low = holistic(json!({"severity": "low", "bias_types": ["a"]}));
    assert_eq!(page_priority(&high).score(), 3);
    assert_eq!(page_priority(&medium).score(), 2);
    assert_eq!(page_priority(&low).score(), 1);
}

#[test]
fn pending_pages_are_not_biased_and_round_trip() {
    let pending = HolisticResult::pending();
    assert_eq!(pending.review_method, Some(ReviewMethod::LlmPending));
    assert!(!is_biased(&pending));

    let value = serde_json::to_value(&pending).unwrap();
    let back = holistic(value);
    assert_eq!(back.review_method, Some(ReviewMethod::LlmPending));
}

// ----------------------------------------------------------------------
// Discovery-time filtering (scenario: media files excluded at discovery)
// ----------------------------------------------------------------------

#[test]
fn windows_scoped_paths_are_skipped_before_fetching() {
    assert!(is_windows_focused_path(
        "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/powershell/intro.md"
    ));
    assert!(!is_windows_focused_path(
        "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/aks/install.md"
    ));
}

#[test]
fn powershell_titled_documents_are_skipped_after_fetching() {
    let doc = "---\ntitle: Azure PowerShell overview\n---\n# Azure PowerShell overview\n";
    assert!(is_windows_focused_content(doc));

    let doc = "# Install the Azure CLI\n\nWorks in bash and PowerShell.\n";
    assert!(!is_windows_focused_content(doc));
}

#[test]
fn blob_url_is_the_page_identity() {
    let parsed = GitHubClient::parse_github_url(
        "https://github.com/MicrosoftDocs/azure-docs-pr/tree/main/articles",
    )
    .unwrap();
    let url = GitHubClient::blob_url(&parsed.repo_full_name, &parsed.branch, "articles/a.md");
    assert_eq!(
        url,
        "https://github.com/MicrosoftDocs/azure-docs-pr/blob/main/articles/a.md"
    );
    // A file directly under articles/ has no service segment; it groups
    // under the repo name.
    assert_eq!(
        extract_doc_set_from_url(&url),
        Some("azure-docs-pr".to_string())
    );
}

// ----------------------------------------------------------------------
// Extraction feeds the heuristics (tab and header exemptions survive)
// ----------------------------------------------------------------------

fn to_scoring(id: i64, url: &str, s: &docbias::extract::ExtractedSnippet) -> ScoringSnippet {
    ScoringSnippet {
        id,
        code: s.code.clone(),
        context: s.context.clone(),
        language: s.language.clone(),
        url: url.to_string(),
        under_az_powershell_tab: s.under_az_powershell_tab,
        windows_header: s.windows_header,
    }
}

#[test]
fn markdown_pipeline_flags_windows_only_snippets() {
    let md = "\
# Create a resource group

```azurecli
az group create --name demo --location westus
```

```powershell
New-AzResourceGroup -Name demo -Location westus
```
";
    let url = "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/aks/install.md";
    let extracted = extract_markdown_snippets(md);
    assert_eq!(extracted.len(), 2);

    let flags: Vec<bool> = extracted
        .iter()
        .enumerate()
        .map(|(i, s)| is_windows_biased(&to_scoring(i as i64, url, s)))
        .collect();
    assert_eq!(flags, vec![false, true]);
}

#[test]
fn html_pipeline_exempts_azure_powershell_tabs() {
    let html = r#"
    <html><body>
        <div data-tab="azure-powershell">
            <pre>New-AzResourceGroup -Name demo</pre>
        </div>
        <div data-tab="azure-cli">
            <pre>New-AzResourceGroup -Name demo</pre>
        </div>
    </body></html>
    "#;
    let url = "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/aks/install.md";
    let extracted = extract_html_snippets(html);
    assert_eq!(extracted.len(), 2);

    // Identical code: the tabbed snippet is exempt, the other is flagged.
    assert!(!is_windows_biased(&to_scoring(1, url, &extracted[0])));
    assert!(is_windows_biased(&to_scoring(2, url, &extracted[1])));
}

#[test]
fn windows_heading_exempts_whole_section() {
    let html = r#"
    <html><body>
        <section>
            <h2>Install on Windows</h2>
            <pre>choco install kubernetes-cli</pre>
        </section>
    </body></html>
    "#;
    let url = "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/aks/install.md";
    let extracted = extract_html_snippets(html);
    assert!(extracted[0].windows_header);
    assert!(!is_windows_biased(&to_scoring(1, url, &extracted[0])));
}

#[test]
fn fallback_scores_match_the_llm_result_shape() {
    let snippet = ScoringSnippet {
        id: 5,
        code: "Set-ExecutionPolicy RemoteSigned".into(),
        context: String::new(),
        language: Some("powershell".into()),
        url: "https://github.com/o/r/blob/main/articles/vm/quickstart.md".into(),
        under_az_powershell_tab: false,
        windows_header: false,
    };
    let score = heuristic_fallback_score(&snippet);
    assert_eq!(score["method"], "heuristic_fallback");
    assert_eq!(score["windows_biased"], true);
    // Same keys the scoring service emits per category.
    for key in [
        "powershell_only",
        "windows_paths",
        "windows_commands",
        "windows_tools",
        "missing_linux_example",
        "windows_specific_syntax",
        "windows_registry",
        "windows_services",
    ] {
        assert!(score["bias_types"].get(key).is_some(), "missing {key}");
    }
}

// ----------------------------------------------------------------------
// Queue envelopes (poison-message protection)
// ----------------------------------------------------------------------

#[test]
fn envelopes_decode_and_reject_malformed_payloads() {
    let task: ScanTask = decode(&json!({
        "url": "https://github.com/MicrosoftDocs/azure-docs",
        "scan_id": 1,
        "force_rescan": true,
    }))
    .unwrap();
    assert!(task.force_rescan);

    let msg: ChangedFileMessage = decode(&json!({
        "scan_id": 1,
        "path": "articles/aks/install.md",
        "sha": "abc123",
        "change_type": "added",
        "commit_sha": "deadbeef",
    }))
    .unwrap();
    assert_eq!(msg.path, "articles/aks/install.md");

    // Missing file_content must be dropped, not retried.
    let poison: docbias::error::Result<DocProcessingTask> = decode(&json!({
        "page_id": 1, "scan_id": 1, "url": "https://x",
    }));
    assert!(matches!(poison, Err(docbias::error::Error::Validation(_))));
}

#[test]
fn replayed_changed_file_messages_are_equal() {
    // Same (scan_id, path, sha) encodes to the same payload, which is the
    // precondition for the replay no-op on settled pages.
    let build = || ChangedFileMessage {
        scan_id: 9,
        path: "articles/storage/quickstart.md".into(),
        sha: "f00dcafe".into(),
        change_type: docbias::github::ChangeType::Modified,
        commit_sha: Some("abc".into()),
    };
    assert_eq!(
        serde_json::to_value(build()).unwrap(),
        serde_json::to_value(build()).unwrap()
    );
}
