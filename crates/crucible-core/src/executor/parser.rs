//! Tool-call extraction from model responses.
//!
//! The canonical format is `TOOL_CALL: name(args)`. Models drift, so a
//! few weaker phrasings are tolerated; only names present in the registry
//! count. Order is preserved and duplicates within one response are
//! collapsed.

use regex::Regex;
use std::sync::OnceLock;

use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Default)]
pub struct ParsedCalls {
    pub calls: Vec<String>,
    /// True when the response tried to call tools (the marker is present)
    /// but nothing parseable came out of it.
    pub format_error: bool,
}

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // Canonical: TOOL_CALL: name(args) — args optional.
            Regex::new(r"(?i)TOOL_CALL:\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?:\([^)]*\))?").unwrap(),
            // Bare invocation on its own line: name(args)
            Regex::new(r"(?m)^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\([^)]*\)\s*$").unwrap(),
            // Conversational variants.
            Regex::new(r"(?i)\bUsing\s+([A-Za-z_][A-Za-z0-9_]*)\s+tool\b").unwrap(),
            Regex::new(r"(?i)\bCalling\s+([A-Za-z_][A-Za-z0-9_]*)\b").unwrap(),
        ]
    })
}

/// Extract registry-valid tool calls from one model response.
pub fn extract_tool_calls(response: &str, registry: &ToolRegistry) -> ParsedCalls {
    let mut calls: Vec<String> = Vec::new();
    for pattern in patterns() {
        for cap in pattern.captures_iter(response) {
            let name = &cap[1];
            if registry.contains(name) && !calls.iter().any(|c| c == name) {
                calls.push(name.to_string());
            }
        }
    }

    let has_marker = response.to_uppercase().contains("TOOL_CALL");
    ParsedCalls { format_error: has_marker && calls.is_empty(), calls }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        for name in ["data_reader", "data_parser", "file_writer"] {
            r.ensure(name);
        }
        r
    }

    #[test]
    fn canonical_format_parses() {
        let parsed = extract_tool_calls(
            "I'll start.\nTOOL_CALL: data_reader(path=\"in.csv\")\nTOOL_CALL: data_parser()",
            &registry(),
        );
        assert_eq!(parsed.calls, vec!["data_reader", "data_parser"]);
        assert!(!parsed.format_error);
    }

    #[test]
    fn marker_without_parens_is_tolerated() {
        let parsed = extract_tool_calls("TOOL_CALL: file_writer", &registry());
        assert_eq!(parsed.calls, vec!["file_writer"]);
    }

    #[test]
    fn bare_invocation_lines_parse() {
        let parsed = extract_tool_calls("data_reader(path=\"x\")\n", &registry());
        assert_eq!(parsed.calls, vec!["data_reader"]);
    }

    #[test]
    fn conversational_variants_parse() {
        let parsed =
            extract_tool_calls("Using data_reader tool first, then calling data_parser.", &registry());
        assert_eq!(parsed.calls, vec!["data_reader", "data_parser"]);
    }

    #[test]
    fn unknown_tools_are_ignored() {
        let parsed = extract_tool_calls("TOOL_CALL: rm_rf_slash()", &registry());
        assert!(parsed.calls.is_empty());
        assert!(parsed.format_error);
    }

    #[test]
    fn duplicates_collapse_preserving_order() {
        let parsed = extract_tool_calls(
            "TOOL_CALL: data_parser()\nTOOL_CALL: data_reader()\nTOOL_CALL: data_parser()",
            &registry(),
        );
        assert_eq!(parsed.calls, vec!["data_parser", "data_reader"]);
    }

    #[test]
    fn prose_without_marker_is_not_a_format_error() {
        let parsed = extract_tool_calls("I believe the task is complete.", &registry());
        assert!(parsed.calls.is_empty());
        assert!(!parsed.format_error);
    }
}
