//! Code snippet extraction
//!
//! Pulls code snippets out of the two page shapes the pipeline sees:
//! Markdown files from GitHub (fenced code blocks) and rendered HTML pages
//! (`<pre>` blocks). HTML snippets carry the nearest heading as context and
//! two flags the heuristics exempt: code under an Azure PowerShell tab and
//! code under a Windows-specific heading.

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};
use scraper::{ElementRef, Html, Selector};

/// One extracted snippet, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedSnippet {
    pub code: String,
    pub context: String,
    pub language: Option<String>,
    pub under_az_powershell_tab: bool,
    pub windows_header: bool,
}

impl ExtractedSnippet {
    fn new(code: String, context: String, language: Option<String>, under_tab: bool) -> Self {
        let windows_header = context.to_ascii_lowercase().contains("windows");
        Self {
            code,
            context,
            language,
            under_az_powershell_tab: under_tab,
            windows_header,
        }
    }
}

// ============================================================================
// Markdown
// ============================================================================

/// Extract fenced code blocks from Markdown. Context stays empty for
/// Markdown sources; the fence info string is kept as the language hint.
pub fn extract_markdown_snippets(content: &str) -> Vec<ExtractedSnippet> {
    let mut snippets = Vec::new();
    let mut current: Option<(Option<String>, String)> = None;

    for event in Parser::new(content) {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let language = info
                    .split_whitespace()
                    .next()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string());
                current = Some((language, String::new()));
            }
            Event::Text(text) => {
                if let Some((_, ref mut code)) = current {
                    code.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((language, code)) = current.take() {
                    if !code.trim().is_empty() {
                        snippets.push(ExtractedSnippet::new(code, String::new(), language, false));
                    }
                }
            }
            _ => {}
        }
    }

    snippets
}

// ============================================================================
// Markdown titles
// ============================================================================

static FRONTMATTER: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?s)\A---\s*\n(.*?)\n---").unwrap());
static FRONTMATTER_TITLE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(
        r#"(?m)^title:\s*(?:"([^"\\]*(?:\\.[^"\\]*)*)"|'([^'\\]*(?:\\.[^'\\]*)*)'|(.+?))\s*$"#,
    )
    .unwrap()
});
static H1_TITLE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?m)^#\s+(.+?)(?:\s*#*)?\s*$").unwrap());
static H2_TITLE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"(?m)^##\s+(.+?)(?:\s*#*)?\s*$").unwrap());

/// YAML frontmatter block, without the `---` delimiters.
pub fn extract_yaml_frontmatter(content: &str) -> Option<&str> {
    FRONTMATTER
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Page title: frontmatter `title:` first, then the first H1, then the
/// first H2.
pub fn markdown_title(content: &str) -> Option<String> {
    if let Some(frontmatter) = extract_yaml_frontmatter(content) {
        if let Some(caps) = FRONTMATTER_TITLE.captures(frontmatter) {
            let title = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().trim());
            if let Some(title) = title.filter(|t| !t.is_empty()) {
                return Some(title.to_string());
            }
        }
    }

    for pattern in [&H1_TITLE, &H2_TITLE] {
        if let Some(caps) = pattern.captures(content) {
            return Some(caps[1].trim().to_string());
        }
    }

    None
}

// ============================================================================
// HTML
// ============================================================================

static PRE: Lazy<Selector> = Lazy::new(|| Selector::parse("pre").unwrap());
static HEADINGS: Lazy<Selector> = Lazy::new(|| Selector::parse("h1, h2, h3, h4, h5, h6").unwrap());

fn is_heading(name: &str) -> bool {
    matches!(name, "h1" | "h2" | "h3" | "h4" | "h5" | "h6")
}

/// Extract `<pre>` snippets from a rendered HTML page.
///
/// Context resolution order: the first heading inside the nearest enclosing
/// section/article/div, then the nearest heading preceding the block in
/// document order.
pub fn extract_html_snippets(html: &str) -> Vec<ExtractedSnippet> {
    let document = Html::parse_document(html);

    // Single document-order pass: the heading last seen before each <pre>
    // is its fallback context.
    let mut fallback_context: Vec<String> = Vec::new();
    let mut last_heading = String::new();
    for node in document.tree.root().descendants() {
        if let Some(element) = ElementRef::wrap(node) {
            let name = element.value().name();
            if is_heading(name) {
                last_heading = element.text().collect::<String>().trim().to_string();
            } else if name == "pre" {
                fallback_context.push(last_heading.clone());
            }
        }
    }

    let mut snippets = Vec::new();
    for (index, pre) in document.select(&PRE).enumerate() {
        let code = pre.text().collect::<String>();
        if code.trim().is_empty() {
            continue;
        }

        let under_tab = pre.ancestors().filter_map(ElementRef::wrap).any(|el| {
            el.value()
                .attr("data-tab")
                .map(|tab| tab.eq_ignore_ascii_case("azure-powershell"))
                .unwrap_or(false)
        });

        let container_heading = pre
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| matches!(el.value().name(), "section" | "article" | "div"))
            .and_then(|container| {
                container
                    .select(&HEADINGS)
                    .next()
                    .map(|h| h.text().collect::<String>().trim().to_string())
            })
            .filter(|text| !text.is_empty());

        let context = container_heading
            .or_else(|| fallback_context.get(index).cloned())
            .unwrap_or_default();

        snippets.push(ExtractedSnippet::new(code, context, None, under_tab));
    }

    snippets
}

#[cfg(test)]
mod tests {
    use super::*;

    // ------------------------------------------------------------------
    // Markdown
    // ------------------------------------------------------------------

    #[test]
    fn markdown_fenced_blocks() {
        let md = "# Title\n\n```bash\naz group create -n demo\n```\n\ntext\n\n```\ndir C:\\\n```\n";
        let snippets = extract_markdown_snippets(md);
        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].code, "az group create -n demo\n");
        assert_eq!(snippets[0].language.as_deref(), Some("bash"));
        assert_eq!(snippets[0].context, "");
        assert_eq!(snippets[1].language, None);
    }

    #[test]
    fn markdown_without_code_is_empty() {
        assert!(extract_markdown_snippets("plain prose only").is_empty());
        assert!(extract_markdown_snippets("").is_empty());
    }

    #[test]
    fn markdown_empty_fence_is_skipped() {
        assert!(extract_markdown_snippets("```\n\n```").is_empty());
    }

    #[test]
    fn markdown_indented_blocks_are_ignored() {
        let md = "text\n\n    indented code\n\nmore";
        assert!(extract_markdown_snippets(md).is_empty());
    }

    // ------------------------------------------------------------------
    // Titles
    // ------------------------------------------------------------------

    #[test]
    fn title_from_frontmatter() {
        let md = "---\ntitle: Deploy a container app\nauthor: someone\n---\n# Different heading\n";
        assert_eq!(markdown_title(md).as_deref(), Some("Deploy a container app"));
    }

    #[test]
    fn title_from_quoted_frontmatter() {
        let md = "---\ntitle: \"Quickstart: create a cluster\"\n---\ncontent";
        assert_eq!(
            markdown_title(md).as_deref(),
            Some("Quickstart: create a cluster")
        );
        let md = "---\ntitle: 'Single quoted'\n---\ncontent";
        assert_eq!(markdown_title(md).as_deref(), Some("Single quoted"));
    }

    #[test]
    fn title_falls_back_to_h1_then_h2() {
        assert_eq!(
            markdown_title("# First Heading\n\ntext").as_deref(),
            Some("First Heading")
        );
        assert_eq!(
            markdown_title("intro\n\n## Second Level\n\ntext").as_deref(),
            Some("Second Level")
        );
        assert_eq!(markdown_title("no headings here"), None);
        assert_eq!(markdown_title(""), None);
    }

    #[test]
    fn frontmatter_requires_leading_delimiter() {
        assert_eq!(extract_yaml_frontmatter("text\n---\ntitle: x\n---"), None);
        assert_eq!(
            extract_yaml_frontmatter("---\ntitle: x\n---\nbody"),
            Some("title: x")
        );
    }

    // ------------------------------------------------------------------
    // HTML
    // ------------------------------------------------------------------

    #[test]
    fn html_without_pre_is_empty() {
        assert!(extract_html_snippets("").is_empty());
        assert!(extract_html_snippets("<html><body><p>No code</p></body></html>").is_empty());
    }

    #[test]
    fn html_single_pre() {
        let snippets = extract_html_snippets("<html><body><pre>echo hello</pre></body></html>");
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].code, "echo hello");
    }

    #[test]
    fn html_context_from_parent_container_heading() {
        let html = r#"
        <html><body>
            <section>
                <h2>Install Azure CLI</h2>
                <pre>curl -sL https://aka.ms/InstallAzureCLIDeb | sudo bash</pre>
            </section>
        </body></html>
        "#;
        let snippets = extract_html_snippets(html);
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].context, "Install Azure CLI");
    }

    #[test]
    fn html_context_from_previous_heading() {
        let html = r#"
        <html><body>
            <h2>Configuration Steps</h2>
            <p>Run the following:</p>
            <pre>az configure</pre>
        </body></html>
        "#;
        let snippets = extract_html_snippets(html);
        assert_eq!(snippets[0].context, "Configuration Steps");
    }

    #[test]
    fn html_context_from_any_heading_level() {
        for level in 1..=6 {
            let html = format!(
                "<html><body><h{level}>Heading Level {level}</h{level}><pre>code</pre></body></html>"
            );
            let snippets = extract_html_snippets(&html);
            assert_eq!(snippets[0].context, format!("Heading Level {level}"));
        }
    }

    #[test]
    fn html_detects_azure_powershell_tab() {
        let html = r#"
        <html><body>
            <div data-tab="azure-powershell">
                <pre>Get-AzResourceGroup</pre>
            </div>
        </body></html>
        "#;
        let snippets = extract_html_snippets(html);
        assert!(snippets[0].under_az_powershell_tab);
    }

    #[test]
    fn html_tab_detection_is_case_insensitive() {
        let html = r#"<div data-tab="Azure-PowerShell"><pre>Get-AzVM</pre></div>"#;
        let snippets = extract_html_snippets(html);
        assert!(snippets[0].under_az_powershell_tab);
    }

    #[test]
    fn html_other_tabs_not_flagged() {
        let html = r#"<div data-tab="azure-cli"><pre>az vm list</pre></div>"#;
        let snippets = extract_html_snippets(html);
        assert_eq!(snippets.len(), 1);
        assert!(!snippets[0].under_az_powershell_tab);
    }

    #[test]
    fn html_windows_header_flag() {
        let html = r#"
        <html><body>
            <section>
                <h2>Install on Windows</h2>
                <pre>choco install azure-cli</pre>
            </section>
        </body></html>
        "#;
        let snippets = extract_html_snippets(html);
        assert!(snippets[0].windows_header);
    }

    #[test]
    fn html_multiple_pre_blocks_keep_order() {
        let html = r#"
        <html><body>
            <h2>First</h2>
            <pre>echo first</pre>
            <h2>Second</h2>
            <pre>echo second</pre>
        </body></html>
        "#;
        let snippets = extract_html_snippets(html);
        assert_eq!(snippets.len(), 2);
        assert_eq!(snippets[0].context, "First");
        assert_eq!(snippets[1].context, "Second");
    }
}
