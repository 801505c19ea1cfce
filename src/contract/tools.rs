//! Research tool vocabulary
//!
//! Tool names, argument builders and the parsers that read the servers'
//! textual results back into something checkable.

use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Tools a research server must expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResearchTool {
    SearchPapers,
    DownloadPaper,
    ExtractMetadata,
    DebugTest,
}

impl ResearchTool {
    /// Every tool the contract requires in `tools/list`
    pub const REQUIRED: [ResearchTool; 4] = [
        ResearchTool::SearchPapers,
        ResearchTool::DownloadPaper,
        ResearchTool::ExtractMetadata,
        ResearchTool::DebugTest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::SearchPapers => "search_papers",
            Self::DownloadPaper => "download_paper",
            Self::ExtractMetadata => "extract_metadata",
            Self::DebugTest => "debug_test",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::REQUIRED.into_iter().find(|tool| tool.name() == name)
    }
}

impl fmt::Display for ResearchTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub fn debug_args(message: &str) -> Value {
    json!({ "message": message })
}

pub fn search_args(query: &str, limit: Option<u32>) -> Value {
    match limit {
        Some(limit) => json!({ "query": query, "limit": limit }),
        None => json!({ "query": query }),
    }
}

pub fn download_args(doi: &str, filename: Option<&str>) -> Value {
    let mut args = json!({ "doi": doi });
    if let Some(filename) = filename {
        args["filename"] = json!(filename);
    }
    args
}

pub fn metadata_args(input: &str) -> Value {
    json!({ "input": input })
}

/// Whether a requested filename would escape the download directory
///
/// Rejects empty names, `..` segments, absolute paths, path separators,
/// drive prefixes, percent-encoded dots/separators and NUL bytes.
pub fn filename_escapes_directory(filename: &str) -> bool {
    if filename.is_empty() || filename.contains('\0') {
        return true;
    }
    if filename.contains('/') || filename.contains('\\') {
        return true;
    }
    if filename == "." || filename.contains("..") {
        return true;
    }

    let bytes = filename.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return true;
    }

    let lower = filename.to_ascii_lowercase();
    ["%2e%2e", "%2f", "%5c"]
        .iter()
        .any(|encoded| lower.contains(encoded))
}

/// A size indicator such as `📦 Size: 512 KB`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeIndicator {
    pub value: f64,
    pub unit: SizeUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    Kilobytes,
    Megabytes,
}

impl SizeIndicator {
    /// Approximate size in bytes
    pub fn bytes(&self) -> u64 {
        let factor = match self.unit {
            SizeUnit::Bytes => 1.0,
            SizeUnit::Kilobytes => 1024.0,
            SizeUnit::Megabytes => 1024.0 * 1024.0,
        };
        (self.value * factor) as u64
    }
}

/// Find the first `<number> <unit>` size indicator in a result text
pub fn parse_size_indicator(text: &str) -> Option<SizeIndicator> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.windows(2).find_map(|pair| {
        let value: f64 = pair[0].replace(',', "").parse().ok()?;
        let unit_token = pair[1].trim_end_matches(|c: char| !c.is_ascii_alphabetic());
        let unit = match unit_token.to_ascii_lowercase().as_str() {
            "bytes" | "byte" | "b" => SizeUnit::Bytes,
            "kb" | "kib" => SizeUnit::Kilobytes,
            "mb" | "mib" => SizeUnit::Megabytes,
            _ => return None,
        };
        (value >= 0.0).then_some(SizeIndicator { value, unit })
    })
}

/// What a `search_papers` result text says
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchSummary {
    /// The `Found N` count
    pub count: usize,

    /// Per-result DOIs
    pub dois: Vec<String>,

    /// Per-result source attributions
    pub sources: Vec<String>,
}

impl SearchSummary {
    /// Distinct providers that produced results
    pub fn providers(&self) -> BTreeSet<&str> {
        self.sources.iter().map(String::as_str).collect()
    }
}

/// Parse a search result text; `None` when no `Found N` count is present
pub fn parse_search_summary(text: &str) -> Option<SearchSummary> {
    let count = parse_found_count(text)?;
    let dois = labelled_values(text, "DOI:");
    let sources = labelled_values(text, "Source:");
    Some(SearchSummary {
        count,
        dois,
        sources,
    })
}

fn parse_found_count(text: &str) -> Option<usize> {
    let (_, after) = text.split_once("Found ")?;
    let digits: String = after.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn labelled_values(text: &str, label: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_once(label))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_names() {
        let names: Vec<_> = ResearchTool::REQUIRED.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["search_papers", "download_paper", "extract_metadata", "debug_test"]
        );
        assert_eq!(
            ResearchTool::from_name("download_paper"),
            Some(ResearchTool::DownloadPaper)
        );
        assert_eq!(ResearchTool::from_name("search_code"), None);
    }

    #[test]
    fn test_argument_builders() {
        assert_eq!(
            download_args("10.1038/test", Some("../malicious.pdf")),
            json!({"doi": "10.1038/test", "filename": "../malicious.pdf"})
        );
        assert_eq!(download_args("10.1/x", None), json!({"doi": "10.1/x"}));
        assert_eq!(search_args("q", Some(3))["limit"], 3);
        assert!(search_args("q", None).get("limit").is_none());
        assert_eq!(metadata_args("10.1/x"), json!({"input": "10.1/x"}));
    }

    #[test]
    fn test_filename_traversal() {
        assert!(filename_escapes_directory("../malicious.pdf"));
        assert!(filename_escapes_directory("..\\evil.pdf"));
        assert!(filename_escapes_directory("/etc/passwd"));
        assert!(filename_escapes_directory("sub/dir.pdf"));
        assert!(filename_escapes_directory("C:evil.pdf"));
        assert!(filename_escapes_directory("%2e%2e%2fpaper.pdf"));
        assert!(filename_escapes_directory(""));
        assert!(filename_escapes_directory(".."));

        assert!(!filename_escapes_directory("paper.pdf"));
        assert!(!filename_escapes_directory("nature12373 v2.pdf"));
    }

    #[test]
    fn test_size_indicator() {
        let text = "✅ Download successful!\n\n📄 File: /tmp/x.pdf\n📦 Size: 512 KB\n✓ Status: Complete";
        let size = parse_size_indicator(text).unwrap();
        assert_eq!(size.unit, SizeUnit::Kilobytes);
        assert_eq!(size.bytes(), 512 * 1024);

        let size = parse_size_indicator("Saved 2.5 MB.").unwrap();
        assert_eq!(size.unit, SizeUnit::Megabytes);

        let size = parse_size_indicator("wrote 1,024 bytes").unwrap();
        assert_eq!(size.bytes(), 1024);

        assert!(parse_size_indicator("Download failed").is_none());
    }

    #[test]
    fn test_search_summary() {
        let text = "📚 Found 2 papers for 'crispr'\n\n\
                    1. Paper one (Relevance: 90%)\n  📖 DOI: 10.1/one\n  🔍 Source: arXiv\n\n\
                    2. Paper two (Relevance: 80%)\n  ⚠️ No DOI available (cannot download)\n  🔍 Source: CrossRef";
        let summary = parse_search_summary(text).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.dois, vec!["10.1/one"]);
        assert_eq!(summary.sources, vec!["arXiv", "CrossRef"]);
        assert_eq!(summary.providers().len(), 2);

        let empty = parse_search_summary("📚 Found 0 papers for 'zzz'").unwrap();
        assert_eq!(empty.count, 0);
        assert!(empty.sources.is_empty());

        assert!(parse_search_summary("Search failed: network").is_none());
    }
}
