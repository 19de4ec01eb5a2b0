//! Prompt text parsing - turns a completed prompt block into a ToolUseRequest
//!
//! The agent renders permission prompts as free text; there is no schema.
//! Extraction is best-effort regex matching over the stripped block: a
//! sub-pattern that doesn't match leaves its field unset, never errors.
//! Worst case the request carries only `tool_name = "Unknown"` and a
//! generic summary.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Sentinel tool name when extraction finds nothing.
pub const UNKNOWN_TOOL: &str = "Unknown";

/// Structured result of classifying one buffered prompt block.
///
/// Built once per detected prompt, immutable, consumed once by the
/// approval path. Serializes to camelCase JSON for the decision surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseRequest {
    /// Tool the agent wants to run; never empty
    pub tool_name: String,
    /// Human-readable one-line description; always non-empty
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Diff content when supplied upstream; never populated from the stream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_content: Option<String>,
    /// The full stripped block, for audit/display
    pub raw_text: String,
}

/// Tool name: first `allow <token>` match, case-insensitive
fn tool_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\ballow\s+(\w+)").unwrap())
}

/// File path: `path` or `file_path` label, then a quoted or bare token
/// with no embedded whitespace
fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\b(?:file_path|path)\b\s*:?\s*"?([^"\s]+)"?"#).unwrap())
}

/// Command: a `command:` label at line start, then the rest of the line.
/// Anchored so prose mentions of the word ("run this command?") are
/// never mistaken for the label.
fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*command\s*:\s*(.+)$").unwrap())
}

/// Parse a completed, stripped prompt block into a ToolUseRequest.
///
/// Pure and total: every extraction rule is independent and best-effort.
pub fn parse_prompt(stripped: &str) -> ToolUseRequest {
    let tool_name = tool_regex()
        .captures(stripped)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| UNKNOWN_TOOL.to_string());

    let file_path = path_regex().captures(stripped).map(|c| c[1].to_string());

    // Command extraction only applies to bash prompts; other tools may
    // legitimately mention "command" in prose.
    let command = if tool_name.eq_ignore_ascii_case("bash") {
        command_regex().captures(stripped).map(|c| {
            c[1].trim()
                .trim_matches(|ch| ch == '"' || ch == '\'' || ch == '`')
                .to_string()
        })
    } else {
        None
    };

    let summary = if let Some(ref cmd) = command {
        format!("Run command: {}", cmd)
    } else if let Some(ref path) = file_path {
        format!("{} {}", tool_name, path)
    } else {
        format!("Use tool: {}", tool_name)
    };

    ToolUseRequest {
        tool_name,
        summary,
        file_path,
        command,
        before_content: None,
        after_content: None,
        raw_text: stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- tool name ----

    #[test]
    fn extracts_tool_name() {
        let req = parse_prompt("Allow Read to access this file?\n(Y)es / (N)o\n");
        assert_eq!(req.tool_name, "Read");
    }

    #[test]
    fn tool_name_case_insensitive() {
        let req = parse_prompt("ALLOW write to modify?\n");
        assert_eq!(req.tool_name, "write");
    }

    #[test]
    fn unknown_tool_when_no_match() {
        let req = parse_prompt("garbage text with no markers");
        assert_eq!(req.tool_name, UNKNOWN_TOOL);
        assert_eq!(req.summary, "Use tool: Unknown");
    }

    // ---- file path ----

    #[test]
    fn extracts_bare_path() {
        let req = parse_prompt("Allow Edit?\nfile_path: /tmp/notes.md\n");
        assert_eq!(req.file_path.as_deref(), Some("/tmp/notes.md"));
        assert_eq!(req.summary, "Edit /tmp/notes.md");
    }

    #[test]
    fn extracts_quoted_path() {
        let req = parse_prompt("Allow Write?\npath: \"/home/u/a.txt\"\n");
        assert_eq!(req.file_path.as_deref(), Some("/home/u/a.txt"));
    }

    #[test]
    fn no_path_when_absent() {
        let req = parse_prompt("Allow Read to continue?\n");
        assert_eq!(req.file_path, None);
        assert_eq!(req.summary, "Use tool: Read");
    }

    // ---- command ----

    #[test]
    fn extracts_command_for_bash() {
        let req = parse_prompt("Allow Bash to run this command?\ncommand: echo hi\n");
        assert_eq!(req.tool_name, "Bash");
        assert_eq!(req.command.as_deref(), Some("echo hi"));
        assert_eq!(req.summary, "Run command: echo hi");
    }

    #[test]
    fn command_trims_quotes() {
        let req = parse_prompt("Allow bash?\ncommand: \"ls -la\"\n");
        assert_eq!(req.command.as_deref(), Some("ls -la"));
    }

    #[test]
    fn prose_command_mention_is_not_the_label() {
        // The first line talks about a command; only the labeled line
        // below it carries one
        let req = parse_prompt("Allow Bash to run this command?\ncommand: echo hi\n(Y)es / (N)o\n");
        assert_eq!(req.command.as_deref(), Some("echo hi"));
        assert_eq!(req.summary, "Run command: echo hi");
    }

    #[test]
    fn unlabeled_command_is_ignored() {
        let req = parse_prompt("Allow Bash to run this command?\n(Y)es / (N)o\n");
        assert_eq!(req.command, None);
        assert_eq!(req.summary, "Use tool: Bash");
    }

    #[test]
    fn command_ignored_for_non_bash() {
        let req = parse_prompt("Allow Write?\ncommand: rm -rf /\n");
        assert_eq!(req.command, None);
        assert_eq!(req.summary, "Use tool: Write");
    }

    // ---- summary priority ----

    #[test]
    fn command_beats_path_in_summary() {
        let req = parse_prompt("Allow Bash?\npath: /tmp/x\ncommand: make test\n");
        assert_eq!(req.summary, "Run command: make test");
    }

    // ---- totality ----

    #[test]
    fn never_fails_on_empty_input() {
        let req = parse_prompt("");
        assert_eq!(req.tool_name, UNKNOWN_TOOL);
        assert!(!req.summary.is_empty());
        assert_eq!(req.raw_text, "");
    }

    #[test]
    fn raw_text_carries_full_block() {
        let block = "Allow Grep to search?\npattern: foo\n(Y)es / (N)o\n";
        let req = parse_prompt(block);
        assert_eq!(req.raw_text, block);
    }

    // ---- wire form ----

    #[test]
    fn serializes_camel_case_without_absent_fields() {
        let req = parse_prompt("Allow Read?\n");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"toolName\":\"Read\""));
        assert!(json.contains("\"rawText\""));
        assert!(!json.contains("filePath"));
        assert!(!json.contains("command"));
    }
}
