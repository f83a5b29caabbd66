//! Docset derivation from page URLs
//!
//! A docset is the logical documentation area a page belongs to: for Azure
//! docs it is the first path segment under `/articles/`, otherwise the first
//! segment after the product root. Docsets feed leaderboards and per-area
//! snapshot rollups.

use once_cell::sync::Lazy;
use regex::Regex;

static AZURE_DOCS_ARTICLES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"azure-docs[^/]*/blob/[^/]+/articles/([^/]+)").unwrap());
static GITHUB_BLOB_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"github\.com/[^/]+/([^/]+)/blob/[^/]+/([^/]+)").unwrap());
static GITHUB_REPO: Lazy<Regex> = Lazy::new(|| Regex::new(r"github\.com/[^/]+/([^/]+)").unwrap());
static MS_LEARN_AZURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"learn\.microsoft\.com/[^/]+/azure/([^/]+)").unwrap());
static MS_LEARN_PRODUCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"learn\.microsoft\.com/[^/]+/([^/]+)").unwrap());

/// Derive the docset for a page URL, or None when the URL has no
/// recognizable structure.
pub fn extract_doc_set_from_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    if url.contains("github.com") {
        if let Some(caps) = AZURE_DOCS_ARTICLES.captures(url) {
            let segment = &caps[1];
            // Files sitting directly under articles/ have no service
            // segment; those group under the repo name below.
            if !segment.ends_with(".md") {
                return Some(segment.to_string());
            }
        } else if let Some(caps) = GITHUB_BLOB_PATH.captures(url) {
            let first_segment = &caps[2];
            if first_segment != "articles" && !first_segment.ends_with(".md") {
                return Some(first_segment.to_string());
            }
        }
        if let Some(caps) = GITHUB_REPO.captures(url) {
            return Some(caps[1].to_string());
        }
        return None;
    }

    if url.contains("learn.microsoft.com") {
        if let Some(caps) = MS_LEARN_AZURE.captures(url) {
            return Some(caps[1].to_string());
        }
        if let Some(caps) = MS_LEARN_PRODUCT.captures(url) {
            return Some(caps[1].to_string());
        }
    }

    None
}

/// Human-readable docset label for dashboards.
pub fn format_doc_set_name(doc_set: Option<&str>) -> String {
    let Some(doc_set) = doc_set else {
        return "Unknown".to_string();
    };

    let spaced = doc_set.replace(['-', '_'], " ");
    let titled = spaced
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    // Common initialisms keep their canonical casing.
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("Api", "API"),
        ("Ai", "AI"),
        ("Ml", "ML"),
        ("Iot", "IoT"),
        ("Sql", "SQL"),
        ("Vm", "VM"),
        ("Vms", "VMs"),
        ("Cli", "CLI"),
        ("Sdk", "SDK"),
        ("Dns", "DNS"),
        ("Vpn", "VPN"),
        ("Cdn", "CDN"),
    ];

    titled
        .split_whitespace()
        .map(|word| {
            REPLACEMENTS
                .iter()
                .find(|(from, _)| *from == word)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn azure_docs_service_segment() {
        let url = "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/virtual-machines/overview.md";
        assert_eq!(
            extract_doc_set_from_url(url),
            Some("virtual-machines".to_string())
        );
    }

    #[test]
    fn azure_docs_pr_mirror_matches_too() {
        let url = "https://github.com/MicrosoftDocs/azure-docs-pr/blob/main/articles/aks/install.md";
        assert_eq!(extract_doc_set_from_url(url), Some("aks".to_string()));
    }

    #[test]
    fn generic_github_repo_uses_first_segment() {
        let url = "https://github.com/MicrosoftDocs/sql-docs/blob/live/docs/connect.md";
        assert_eq!(extract_doc_set_from_url(url), Some("docs".to_string()));
    }

    #[test]
    fn ms_learn_azure_service() {
        let url = "https://learn.microsoft.com/en-us/azure/storage/blobs/quickstart";
        assert_eq!(extract_doc_set_from_url(url), Some("storage".to_string()));
    }

    #[test]
    fn ms_learn_product_root() {
        let url = "https://learn.microsoft.com/en-us/dotnet/core/install";
        assert_eq!(extract_doc_set_from_url(url), Some("dotnet".to_string()));
    }

    #[test]
    fn empty_and_unknown_urls() {
        assert_eq!(extract_doc_set_from_url(""), None);
        assert_eq!(extract_doc_set_from_url("https://example.com/page"), None);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(format_doc_set_name(Some("virtual-machines")), "Virtual Machines");
        assert_eq!(format_doc_set_name(Some("azure_sql")), "Azure SQL");
        assert_eq!(format_doc_set_name(Some("iot-hub")), "IoT Hub");
        assert_eq!(format_doc_set_name(None), "Unknown");
    }
}
