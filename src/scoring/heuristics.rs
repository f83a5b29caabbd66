//! Regex-based Windows bias pre-filter
//!
//! Cheap first pass over extracted snippets. A snippet is exempt when it is
//! intentionally Windows-scoped: under an Azure PowerShell tab, under a
//! Windows heading, or on a Windows-focused page. Everything else is
//! matched against a pattern table of Windows-only commands, paths and
//! tools.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::scoring::ScoringSnippet;

static WINDOWS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Windows paths and prompts
        r"(?im)^\s*C:\\",
        r"(?i)[A-Za-z0-9_.%]+\\[A-Za-z0-9_.%\\]+",
        r"(?i)\\Users\\",
        r"(?i)PS [A-Z]:",
        // Shells
        r"(?i)cmd\.exe",
        r"(?i)powershell",
        // PowerShell cmdlets
        r"\b(Get|Set|New|Remove|Start|Stop)-[A-Za-z]+\b",
        r"(?i)\bSet-ExecutionPolicy\b",
        // DOS commands
        r"(?im)^\s*dir\b",
        r"(?im)^\s*copy\b",
        r"(?im)^\s*del\b",
        r"(?im)^\s*cls\b",
        r"(?im)^\s*type\b",
        // Windows tools and service management
        r"(?i)\bregedit\b",
        r"(?i)\bchoco(\s|$)",
        r"(?i)\bwinget(\s|$)",
        r"(?i)\bmsiexec\b",
        r"(?i)\btasklist\b",
        r"(?i)\btaskkill\b",
        r"(?i)\bicacls\b",
        r"(?i)\bnet use\b",
        r"(?i)\bnet start\b",
        r"(?i)\bnet stop\b",
        r"(?i)\bsc \b",
        r"(?i)\bexplorer\.exe\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Whether a snippet looks Windows-biased to the heuristic filter.
pub fn is_windows_biased(snippet: &ScoringSnippet) -> bool {
    if snippet.under_az_powershell_tab || snippet.windows_header {
        return false;
    }

    let context = snippet.context.to_ascii_lowercase();
    if context.contains("windows") || context.contains("powershell") {
        return false;
    }

    let url = snippet.url.to_ascii_lowercase();
    if url.contains("/windows/")
        || url.contains("/powershell/")
        || url.contains("/cmd/")
        || url.contains("/cli-windows/")
        || url.contains("/windows-")
    {
        return false;
    }

    WINDOWS_PATTERNS.iter().any(|p| p.is_match(&snippet.code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(code: &str) -> ScoringSnippet {
        ScoringSnippet {
            id: 1,
            code: code.to_string(),
            context: String::new(),
            language: None,
            url: "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/aks/install.md"
                .to_string(),
            under_az_powershell_tab: false,
            windows_header: false,
        }
    }

    #[test]
    fn flags_powershell_cmdlets() {
        assert!(is_windows_biased(&snippet("Get-AzResourceGroup")));
        assert!(is_windows_biased(&snippet("New-Item -Path foo")));
        assert!(is_windows_biased(&snippet(
            "Set-ExecutionPolicy RemoteSigned"
        )));
    }

    #[test]
    fn flags_windows_paths_and_prompts() {
        assert!(is_windows_biased(&snippet("C:\\Program Files\\app.exe")));
        assert!(is_windows_biased(&snippet("cd \\Users\\demo")));
        assert!(is_windows_biased(&snippet("PS C: Get-Help")));
    }

    #[test]
    fn flags_dos_commands_and_tools() {
        assert!(is_windows_biased(&snippet("dir /s")));
        assert!(is_windows_biased(&snippet("choco install azure-cli")));
        assert!(is_windows_biased(&snippet("winget install Microsoft.AzureCLI")));
        assert!(is_windows_biased(&snippet("msiexec /i setup.msi")));
        assert!(is_windows_biased(&snippet("net start w32time")));
    }

    #[test]
    fn does_not_flag_cross_platform_code() {
        assert!(!is_windows_biased(&snippet("az group create -n demo")));
        assert!(!is_windows_biased(&snippet(
            "curl -sL https://aka.ms/InstallAzureCLIDeb | sudo bash"
        )));
        assert!(!is_windows_biased(&snippet("ls -la /var/log")));
    }

    #[test]
    fn azure_powershell_tab_is_exempt() {
        let mut s = snippet("Get-AzVM");
        s.under_az_powershell_tab = true;
        assert!(!is_windows_biased(&s));
    }

    #[test]
    fn windows_header_is_exempt() {
        let mut s = snippet("choco install git");
        s.windows_header = true;
        assert!(!is_windows_biased(&s));
    }

    #[test]
    fn windows_context_is_exempt() {
        let mut s = snippet("dir /s");
        s.context = "Install on Windows".to_string();
        assert!(!is_windows_biased(&s));

        let mut s = snippet("Get-AzVM");
        s.context = "Azure PowerShell quickstart".to_string();
        assert!(!is_windows_biased(&s));
    }

    #[test]
    fn windows_focused_url_is_exempt() {
        let mut s = snippet("Get-AzVM");
        s.url =
            "https://github.com/MicrosoftDocs/azure-docs/blob/main/articles/powershell/intro.md"
                .to_string();
        assert!(!is_windows_biased(&s));

        let mut s = snippet("dir /s");
        s.url = "https://learn.microsoft.com/en-us/windows-server/setup".to_string();
        assert!(!is_windows_biased(&s));
    }
}
