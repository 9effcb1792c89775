use crate::diagnostic::Diagnostic;
use crate::git::DiffHunkIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Types ──

/// Which lines count as "in the diff"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Only lines introduced by an addition
    #[default]
    Added,
    /// Added lines plus the unchanged context lines shown in hunks
    DiffContext,
    /// Any line of a file touched by the diff
    File,
    /// Everything
    #[serde(rename = "nofilter", alias = "no_filter")]
    NoFilter,
}

impl FromStr for FilterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(FilterMode::Added),
            "diff_context" => Ok(FilterMode::DiffContext),
            "file" => Ok(FilterMode::File),
            "nofilter" | "no_filter" => Ok(FilterMode::NoFilter),
            other => Err(format!(
                "unknown filter mode '{}' (added, diff_context, file, nofilter)",
                other
            )),
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterMode::Added => "added",
            FilterMode::DiffContext => "diff_context",
            FilterMode::File => "file",
            FilterMode::NoFilter => "nofilter",
        })
    }
}

/// A diagnostic classified against the diff
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredDiagnostic {
    /// `diagnostic.path` is rewritten to the repo-relative new-side path
    pub diagnostic: Diagnostic,
    pub in_diff: bool,
    /// The file itself is part of the change (used for line-0 diagnostics)
    pub in_diff_file: bool,
    /// Set only for in-diff lines that also exist on the old side
    pub old_path: Option<String>,
    pub old_line: Option<usize>,
}

impl FilteredDiagnostic {
    pub fn path(&self) -> &str {
        &self.diagnostic.path
    }

    pub fn line(&self) -> usize {
        self.diagnostic.line
    }
}

/// Classifies diagnostics against a [`DiffHunkIndex`].
#[derive(Debug, Clone, Default)]
pub struct DiagnosticFilter {
    pub mode: FilterMode,
    /// Absolute repository root, used to relativize absolute diagnostic paths
    pub repo_root: Option<String>,
}

impl DiagnosticFilter {
    pub fn new(mode: FilterMode) -> Self {
        Self {
            mode,
            repo_root: None,
        }
    }

    pub fn with_repo_root(mut self, root: impl Into<String>) -> Self {
        self.repo_root = Some(root.into());
        self
    }

    /// `workdir` is the tool's working directory relative to the repository
    /// root ("" when run from the root). Nothing is dropped: diagnostics
    /// outside the diff come back with `in_diff == false`.
    pub fn filter(
        &self,
        diagnostics: Vec<Diagnostic>,
        index: &DiffHunkIndex,
        workdir: &str,
    ) -> Vec<FilteredDiagnostic> {
        diagnostics
            .into_iter()
            .map(|d| self.classify(d, index, workdir))
            .collect()
    }

    fn classify(
        &self,
        mut diagnostic: Diagnostic,
        index: &DiffHunkIndex,
        workdir: &str,
    ) -> FilteredDiagnostic {
        let resolved = resolve_path(&diagnostic.path, workdir, self.repo_root.as_deref());
        diagnostic.path = index
            .new_path(&resolved)
            .map(str::to_string)
            .unwrap_or(resolved);

        let path = diagnostic.path.as_str();
        let line = diagnostic.line;
        let in_diff_file = self.mode == FilterMode::NoFilter || index.contains_file(path);

        // File-level diagnostics are routed by policy, never matched against hunks.
        if line == 0 {
            return FilteredDiagnostic {
                diagnostic,
                in_diff: false,
                in_diff_file,
                old_path: None,
                old_line: None,
            };
        }

        let in_diff = match self.mode {
            FilterMode::Added => index.is_added_line(path, line),
            FilterMode::DiffContext => index.is_in_hunk(path, line),
            FilterMode::File => index.contains_file(path),
            FilterMode::NoFilter => true,
        };

        let (old_path, old_line) = if in_diff {
            match index.old_position(path, line) {
                Some((old_path, old_line)) => (Some(old_path.to_string()), Some(old_line)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        FilteredDiagnostic {
            diagnostic,
            in_diff,
            in_diff_file,
            old_path,
            old_line,
        }
    }
}

/// Normalise a tool-reported path to a forward-slash path relative to the
/// repository root.
pub fn resolve_path(path: &str, workdir: &str, repo_root: Option<&str>) -> String {
    let path = path.replace('\\', "/");

    if is_absolute(&path) {
        if let Some(root) = repo_root {
            let root = root.replace('\\', "/");
            let root = root.trim_end_matches('/');
            if let Some(rest) = path.strip_prefix(root) {
                if rest.starts_with('/') {
                    return clean_path(rest);
                }
            }
        }
        return path;
    }

    let workdir = workdir.replace('\\', "/");
    if workdir.is_empty() {
        clean_path(&path)
    } else {
        clean_path(&format!("{}/{}", workdir, path))
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
        || matches!(path.as_bytes(), [d, b':', b'/', ..] if d.is_ascii_alphabetic())
}

/// Collapse "." and ".." components and duplicate slashes.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = r#"diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,4 @@
 use std::io;
+use std::fmt;
 fn a() {}
 fn b() {}
diff --git a/old_file.go b/new_file.go
rename from old_file.go
rename to new_file.go
--- a/old_file.go
+++ b/new_file.go
@@ -6,2 +13,3 @@
 x := 1
 y := 2
+z := 3
"#;

    fn index() -> DiffHunkIndex {
        DiffHunkIndex::build(DIFF, 1).unwrap()
    }

    fn diag(path: &str, line: usize) -> Diagnostic {
        Diagnostic::new(path, line, "msg")
    }

    #[test]
    fn added_line_is_in_diff() {
        let out = DiagnosticFilter::default().filter(vec![diag("src/lib.rs", 2)], &index(), "");
        assert!(out[0].in_diff);
        assert!(out[0].in_diff_file);
        assert_eq!(out[0].old_path, None);
        assert_eq!(out[0].old_line, None);
    }

    #[test]
    fn context_line_not_in_diff_in_added_mode() {
        let out = DiagnosticFilter::default().filter(vec![diag("src/lib.rs", 3)], &index(), "");
        assert!(!out[0].in_diff);
        assert!(out[0].in_diff_file);
        assert_eq!(out[0].old_path, None);
    }

    #[test]
    fn diff_context_mode_maps_old_position_for_context_only() {
        let filter = DiagnosticFilter::new(FilterMode::DiffContext);
        let out = filter.filter(
            vec![diag("new_file.go", 14), diag("new_file.go", 15), diag("src/lib.rs", 4)],
            &index(),
            "",
        );
        assert!(out[0].in_diff);
        assert_eq!(out[0].old_path.as_deref(), Some("old_file.go"));
        assert_eq!(out[0].old_line, Some(7));

        // pure addition: in diff, no old position
        assert!(out[1].in_diff);
        assert_eq!(out[1].old_path, None);
        assert_eq!(out[1].old_line, None);

        assert_eq!(out[2].old_path.as_deref(), Some("src/lib.rs"));
        assert_eq!(out[2].old_line, Some(3));
    }

    #[test]
    fn outside_diff_is_retained() {
        let out = DiagnosticFilter::default().filter(
            vec![diag("src/lib.rs", 40), diag("README.md", 1)],
            &index(),
            "",
        );
        assert_eq!(out.len(), 2);
        assert!(!out[0].in_diff);
        assert!(!out[1].in_diff);
        assert!(!out[1].in_diff_file);
    }

    #[test]
    fn line_zero_is_file_level() {
        let filter = DiagnosticFilter::new(FilterMode::NoFilter);
        let out = filter.filter(vec![diag("src/lib.rs", 0)], &index(), "");
        assert!(!out[0].in_diff);
        assert!(out[0].in_diff_file);
        assert_eq!(out[0].old_line, None);
    }

    #[test]
    fn workdir_is_joined() {
        let out = DiagnosticFilter::default().filter(vec![diag("lib.rs", 2)], &index(), "src");
        assert_eq!(out[0].path(), "src/lib.rs");
        assert!(out[0].in_diff);
    }

    #[test]
    fn old_name_is_rewritten_to_new_name() {
        let out = DiagnosticFilter::default().filter(vec![diag("old_file.go", 15)], &index(), "");
        assert_eq!(out[0].path(), "new_file.go");
        assert!(out[0].in_diff);
    }

    #[test]
    fn copy_source_is_not_rewritten_to_the_copy() {
        let raw = r#"diff --git a/a.rs b/b.rs
similarity index 80%
copy from a.rs
copy to b.rs
--- a/a.rs
+++ b/b.rs
@@ -1,1 +1,2 @@
 keep
+added
"#;
        let idx = DiffHunkIndex::build(raw, 1).unwrap();
        let out =
            DiagnosticFilter::default().filter(vec![diag("a.rs", 2), diag("b.rs", 2)], &idx, "");

        assert_eq!(out[0].path(), "a.rs");
        assert!(!out[0].in_diff);
        assert!(!out[0].in_diff_file);

        assert_eq!(out[1].path(), "b.rs");
        assert!(out[1].in_diff);
    }

    #[test]
    fn file_and_nofilter_modes() {
        let idx = index();
        let file = DiagnosticFilter::new(FilterMode::File)
            .filter(vec![diag("src/lib.rs", 99), diag("other.rs", 1)], &idx, "");
        assert!(file[0].in_diff);
        assert!(!file[1].in_diff);

        let all = DiagnosticFilter::new(FilterMode::NoFilter).filter(vec![diag("other.rs", 1)], &idx, "");
        assert!(all[0].in_diff);
        assert_eq!(all[0].old_path, None);
    }

    #[test]
    fn resolve_absolute_under_root() {
        assert_eq!(
            resolve_path("/home/u/repo/src/lib.rs", "sub", Some("/home/u/repo")),
            "src/lib.rs"
        );
        assert_eq!(
            resolve_path("/home/u/repository/x.rs", "", Some("/home/u/repo")),
            "/home/u/repository/x.rs"
        );
    }

    #[test]
    fn resolve_relative_cleans_components() {
        assert_eq!(resolve_path("./a/../b.rs", "pkg", None), "pkg/b.rs");
        assert_eq!(resolve_path("../top.rs", "pkg", None), "top.rs");
        assert_eq!(resolve_path(r"src\win.rs", "", None), "src/win.rs");
    }

    #[test]
    fn filter_mode_parse_and_display() {
        assert_eq!("diff_context".parse::<FilterMode>().unwrap(), FilterMode::DiffContext);
        assert_eq!(FilterMode::NoFilter.to_string(), "nofilter");
        assert!("bogus".parse::<FilterMode>().is_err());
    }
}
