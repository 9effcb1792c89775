//! Diagnostics as reported by external linters and compilers, plus the two
//! input formats accepted on stdin.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Unknown => "",
        }
    }
}

/// Rule identifier with an optional documentation link
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleCode {
    pub value: String,
    pub url: Option<String>,
}

/// Replacement text for the new-side lines `start..=end`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Suggestion {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl Suggestion {
    /// A review comment anchored at `line` can carry this replacement only
    /// when the range ends on that line.
    pub fn applies_at(&self, line: usize) -> bool {
        line > 0 && self.end_line == line && (1..=line).contains(&self.start_line)
    }

    /// First line of a multi-line replacement, `None` for a single line.
    pub fn range_start(&self) -> Option<usize> {
        (self.start_line < self.end_line).then_some(self.start_line)
    }
}

/// One issue reported by a tool
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    /// Repo-relative, forward-slash path
    pub path: String,
    /// 1-based; 0 means the issue is about the file as a whole
    pub line: usize,
    pub column: Option<usize>,
    pub message: String,
    pub severity: Severity,
    /// Name of the reporting tool
    pub source: Option<String>,
    pub code: Option<RuleCode>,
    pub suggestion: Option<Suggestion>,
}

impl Diagnostic {
    pub fn new(path: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            line,
            column: None,
            message: message.into(),
            severity: Severity::Unknown,
            source: None,
            code: None,
            suggestion: None,
        }
    }

    pub fn is_file_level(&self) -> bool {
        self.line == 0
    }
}

/// Accepted stdin formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputFormat {
    /// One JSON diagnostic per line
    #[default]
    Rdjsonl,
    /// `path:line[:column]: message`
    Line,
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rdjsonl" => Ok(InputFormat::Rdjsonl),
            "line" => Ok(InputFormat::Line),
            other => Err(format!("unknown input format '{}' (rdjsonl, line)", other)),
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::Rdjsonl => f.write_str("rdjsonl"),
            InputFormat::Line => f.write_str("line"),
        }
    }
}

/// Parse tool output. Lines that do not match the format are skipped.
/// `tool` fills in the source name where the input has none.
pub fn parse_diagnostics(input: &str, format: InputFormat, tool: Option<&str>) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = match format {
            InputFormat::Rdjsonl => parse_json_line(line),
            InputFormat::Line => parse_colon_line(line),
        };
        match parsed {
            Some(mut d) => {
                if d.source.is_none() {
                    d.source = tool.map(str::to_string);
                }
                out.push(d);
            }
            None => tracing::debug!(line = idx + 1, "skipping unparseable diagnostic line"),
        }
    }
    out
}

// ── rdjsonl ──

#[derive(Deserialize)]
struct JsonDiagnostic {
    message: String,
    location: JsonLocation,
    #[serde(default)]
    severity: Severity,
    source: Option<JsonSource>,
    code: Option<JsonCode>,
    #[serde(default)]
    suggestions: Vec<JsonSuggestion>,
}

#[derive(Deserialize)]
struct JsonLocation {
    path: String,
    range: Option<JsonRange>,
}

#[derive(Deserialize)]
struct JsonRange {
    start: JsonPosition,
    end: Option<JsonPosition>,
}

#[derive(Deserialize, Default)]
struct JsonPosition {
    #[serde(default)]
    line: usize,
    column: Option<usize>,
}

#[derive(Deserialize)]
struct JsonSource {
    name: String,
}

#[derive(Deserialize)]
struct JsonCode {
    value: String,
    url: Option<String>,
}

#[derive(Deserialize)]
struct JsonSuggestion {
    range: JsonRange,
    text: String,
}

fn parse_json_line(line: &str) -> Option<Diagnostic> {
    let raw: JsonDiagnostic = serde_json::from_str(line).ok()?;
    let (line_no, column) = raw
        .location
        .range
        .as_ref()
        .map(|r| (r.start.line, r.start.column))
        .unwrap_or((0, None));

    let suggestion = raw.suggestions.into_iter().next().map(|s| {
        let start_line = s.range.start.line;
        let end_line = s.range.end.map(|e| e.line).unwrap_or(start_line).max(start_line);
        Suggestion {
            start_line,
            end_line,
            text: s.text,
        }
    });

    Some(Diagnostic {
        path: raw.location.path,
        line: line_no,
        column,
        message: raw.message,
        severity: raw.severity,
        source: raw.source.map(|s| s.name),
        code: raw.code.map(|c| RuleCode {
            value: c.value,
            url: c.url.filter(|u| !u.is_empty()),
        }),
        suggestion,
    })
}

// ── path:line:col: message ──

fn parse_colon_line(line: &str) -> Option<Diagnostic> {
    // Windows drive letters ("C:\...") would split wrong; skip past them.
    let offset = match line.as_bytes() {
        [d, b':', b'\\' | b'/', ..] if d.is_ascii_alphabetic() => 2,
        _ => 0,
    };
    let (path_part, rest) = line[offset..].split_once(':')?;
    let path = format!("{}{}", &line[..offset], path_part);
    let (line_str, rest) = rest.split_once(':')?;
    let line_no: usize = line_str.trim().parse().ok()?;

    let (column, message) = match rest.split_once(':') {
        Some((col, msg)) => match col.trim().parse::<usize>() {
            Ok(c) => (Some(c), msg),
            Err(_) => (None, rest),
        },
        None => (None, rest),
    };

    let message = message.trim();
    if path.is_empty() || message.is_empty() {
        return None;
    }

    let mut d = Diagnostic::new(path, line_no, message);
    d.column = column;
    Some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_line_full() {
        let input = r#"{"message":"unused variable","location":{"path":"src/a.rs","range":{"start":{"line":3,"column":9}}},"severity":"WARNING","source":{"name":"clippy"},"code":{"value":"unused","url":"https://example.com/unused"},"suggestions":[{"range":{"start":{"line":3},"end":{"line":4}},"text":"let _x = 1;"}]}"#;
        let ds = parse_diagnostics(input, InputFormat::Rdjsonl, None);
        assert_eq!(ds.len(), 1);
        let d = &ds[0];
        assert_eq!(d.path, "src/a.rs");
        assert_eq!(d.line, 3);
        assert_eq!(d.column, Some(9));
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.source.as_deref(), Some("clippy"));
        assert_eq!(d.code.as_ref().unwrap().url.as_deref(), Some("https://example.com/unused"));
        let s = d.suggestion.as_ref().unwrap();
        assert_eq!((s.start_line, s.end_line), (3, 4));
    }

    #[test]
    fn suggestion_applies_only_when_ending_on_the_line() {
        let s = |start_line, end_line| Suggestion {
            start_line,
            end_line,
            text: String::new(),
        };
        assert!(s(3, 3).applies_at(3));
        assert!(s(1, 3).applies_at(3));
        assert!(!s(3, 5).applies_at(3));
        assert!(!s(2, 2).applies_at(3));
        assert!(!s(0, 0).applies_at(0));
        assert_eq!(s(1, 3).range_start(), Some(1));
        assert_eq!(s(3, 3).range_start(), None);
    }

    #[test]
    fn json_line_without_range_is_file_level() {
        let input = r#"{"message":"file too long","location":{"path":"big.rs"}}"#;
        let ds = parse_diagnostics(input, InputFormat::Rdjsonl, Some("tool"));
        assert_eq!(ds.len(), 1);
        assert!(ds[0].is_file_level());
        assert_eq!(ds[0].severity, Severity::Unknown);
        assert_eq!(ds[0].source.as_deref(), Some("tool"));
    }

    #[test]
    fn json_unknown_severity_maps_to_unknown() {
        let input = r#"{"message":"m","location":{"path":"a"},"severity":"HINT"}"#;
        let ds = parse_diagnostics(input, InputFormat::Rdjsonl, None);
        assert_eq!(ds[0].severity, Severity::Unknown);
    }

    #[test]
    fn json_garbage_is_skipped() {
        let input = "not json\n{\"message\":\"ok\",\"location\":{\"path\":\"a\"}}\n";
        let ds = parse_diagnostics(input, InputFormat::Rdjsonl, None);
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn colon_line_with_column() {
        let ds = parse_diagnostics("src/lib.rs:10:5: missing docs", InputFormat::Line, Some("lint"));
        assert_eq!(ds.len(), 1);
        assert_eq!(ds[0].path, "src/lib.rs");
        assert_eq!(ds[0].line, 10);
        assert_eq!(ds[0].column, Some(5));
        assert_eq!(ds[0].message, "missing docs");
        assert_eq!(ds[0].source.as_deref(), Some("lint"));
    }

    #[test]
    fn colon_line_without_column_keeps_colons_in_message() {
        let ds = parse_diagnostics("a.py:7: E501: line too long", InputFormat::Line, None);
        assert_eq!(ds[0].line, 7);
        assert_eq!(ds[0].column, None);
        assert_eq!(ds[0].message, "E501: line too long");
    }

    #[test]
    fn colon_line_windows_drive() {
        let ds = parse_diagnostics(r"C:\src\a.rs:2:1: bad", InputFormat::Line, None);
        assert_eq!(ds[0].path, r"C:\src\a.rs");
        assert_eq!(ds[0].line, 2);
    }

    #[test]
    fn colon_line_noise_is_skipped() {
        let ds = parse_diagnostics("warning: 3 issues found\n\nerror", InputFormat::Line, None);
        assert!(ds.is_empty());
    }

    #[test]
    fn input_format_from_str() {
        assert_eq!("line".parse::<InputFormat>().unwrap(), InputFormat::Line);
        assert!("xml".parse::<InputFormat>().is_err());
    }
}
