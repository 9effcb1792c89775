use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Diff text could not be turned into a hunk map.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DiffParseError {
    #[error("diff line {line}: malformed hunk header '{header}'")]
    MalformedHunkHeader { line: usize, header: String },

    #[error("diff line {line}: hunk header appears before any file header")]
    HunkOutsideFile { line: usize },

    #[error(
        "diff line {line}: hunk in '{path}' is short by {old_left} old and {new_left} new lines"
    )]
    TruncatedHunk {
        line: usize,
        path: String,
        old_left: usize,
        new_left: usize,
    },

    #[error("diff line {line}: '{content}' overruns the hunk counts for '{path}'")]
    HunkOverrun {
        line: usize,
        path: String,
        content: String,
    },
}

/// File change status in the diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileStatus {
    Added,
    #[default]
    Modified,
    Deleted,
    Renamed,
    /// The source file still exists unchanged
    Copied,
}

/// Per-file line classification built from its hunks
#[derive(Debug, Clone, Default)]
pub struct DiffFile {
    pub path: String,
    pub old_path: String,
    pub status: FileStatus,
    added: BTreeSet<usize>,
    /// new line -> old line, for lines present on both sides
    context: HashMap<usize, usize>,
    has_hunks: bool,
}

impl DiffFile {
    fn new(path: String, old_path: String) -> Self {
        Self {
            path,
            old_path,
            ..Default::default()
        }
    }

    pub fn is_added(&self, line: usize) -> bool {
        self.added.contains(&line)
    }

    pub fn old_line(&self, line: usize) -> Option<usize> {
        self.context.get(&line).copied()
    }
}

/// Lookup structure answering "did this change touch `path:line`?"
#[derive(Debug, Clone, Default)]
pub struct DiffHunkIndex {
    files: HashMap<String, DiffFile>,
    /// old path -> new path, renames only
    aliases: HashMap<String, String>,
}

impl DiffHunkIndex {
    /// Parse unified diff text, dropping `strip` leading path components
    /// from `---`/`+++` names (same meaning as `patch -p`).
    pub fn build(raw: &str, strip: usize) -> Result<Self, DiffParseError> {
        let mut parser = Parser::new(strip);
        let mut last = 0;
        for (idx, line) in raw.lines().enumerate() {
            last = idx + 1;
            parser.feed(last, line)?;
        }
        let files = parser.finish(last)?;

        let mut index = DiffHunkIndex::default();
        for file in files {
            if file.status == FileStatus::Deleted || file.path.is_empty() {
                continue;
            }
            // A copy source is still its own file; only renames move a path.
            if file.status == FileStatus::Renamed && file.old_path != file.path {
                index
                    .aliases
                    .insert(file.old_path.clone(), file.path.clone());
            }
            // A file can show up twice (e.g. concatenated diffs); later hunks add to it.
            match index.files.get_mut(&file.path) {
                Some(existing) => {
                    existing.added.extend(file.added);
                    existing.context.extend(file.context);
                }
                None => {
                    index.files.insert(file.path.clone(), file);
                }
            }
        }
        Ok(index)
    }

    fn file(&self, path: &str) -> Option<&DiffFile> {
        self.files.get(path).or_else(|| {
            self.aliases
                .get(path)
                .and_then(|new_path| self.files.get(new_path))
        })
    }

    /// True only for lines introduced by an addition.
    pub fn is_added_line(&self, path: &str, line: usize) -> bool {
        self.file(path).is_some_and(|f| f.is_added(line))
    }

    /// True for added lines and unchanged context lines shown in a hunk.
    pub fn is_in_hunk(&self, path: &str, line: usize) -> bool {
        self.file(path)
            .is_some_and(|f| f.is_added(line) || f.old_line(line).is_some())
    }

    /// Old-side position of a line present on both sides of the diff.
    pub fn old_position(&self, path: &str, line: usize) -> Option<(&str, usize)> {
        let file = self.file(path)?;
        let old_line = file.old_line(line)?;
        Some((file.old_path.as_str(), old_line))
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.file(path).is_some()
    }

    /// New-side name of a file, following renames.
    pub fn new_path(&self, path: &str) -> Option<&str> {
        self.file(path).map(|f| f.path.as_str())
    }

    pub fn files(&self) -> impl Iterator<Item = &DiffFile> {
        self.files.values()
    }
}

const DEV_NULL: &str = "/dev/null";

/// Remaining body lines of the hunk being read
struct HunkCursor {
    old_line: usize,
    new_line: usize,
    old_left: usize,
    new_left: usize,
}

struct Parser {
    strip: usize,
    files: Vec<DiffFile>,
    current: Option<DiffFile>,
    hunk: Option<HunkCursor>,
}

impl Parser {
    fn new(strip: usize) -> Self {
        Self {
            strip,
            files: Vec::new(),
            current: None,
            hunk: None,
        }
    }

    fn feed(&mut self, line_no: usize, line: &str) -> Result<(), DiffParseError> {
        if self.hunk.is_some() {
            return self.feed_hunk_body(line_no, line);
        }

        // New file header: diff --git a/path b/path
        if let Some(rest) = line.strip_prefix("diff --git ") {
            self.finish_file();
            let (old, new) = split_git_header(rest);
            self.current = Some(DiffFile::new(
                strip_path(new, self.strip),
                strip_path(old, self.strip),
            ));
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            // Plain `diff -u` output has no `diff --git` line; `---` opens the file.
            if self.current.as_ref().map_or(true, |f| f.has_hunks) {
                self.finish_file();
                self.current = Some(DiffFile::default());
            }
            let old = strip_path(header_path(rest), self.strip);
            if let Some(file) = self.current.as_mut() {
                if matches!(file.status, FileStatus::Modified) {
                    file.old_path = old;
                }
            }
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            let new = strip_path(header_path(rest), self.strip);
            if let Some(file) = self.current.as_mut() {
                if new == DEV_NULL {
                    file.status = FileStatus::Deleted;
                } else {
                    if file.old_path == DEV_NULL {
                        file.status = FileStatus::Added;
                    }
                    file.path = new;
                }
            }
            return Ok(());
        }

        if line.starts_with("@@") {
            let Some(file) = self.current.as_mut() else {
                return Err(DiffParseError::HunkOutsideFile { line: line_no });
            };
            let cursor =
                parse_hunk_header(line).ok_or_else(|| DiffParseError::MalformedHunkHeader {
                    line: line_no,
                    header: line.to_string(),
                })?;
            file.has_hunks = true;
            if cursor.old_left > 0 || cursor.new_left > 0 {
                self.hunk = Some(cursor);
            }
            return Ok(());
        }

        // Extended git headers (paths here are never prefixed)
        if let Some(file) = self.current.as_mut() {
            if let Some(old) = line.strip_prefix("rename from ") {
                file.old_path = old.to_string();
                file.status = FileStatus::Renamed;
            } else if let Some(new) = line.strip_prefix("rename to ") {
                file.path = new.to_string();
            } else if let Some(old) = line.strip_prefix("copy from ") {
                file.old_path = old.to_string();
                file.status = FileStatus::Copied;
            } else if let Some(new) = line.strip_prefix("copy to ") {
                file.path = new.to_string();
            } else if line.starts_with("new file") {
                file.status = FileStatus::Added;
            } else if line.starts_with("deleted file") {
                file.status = FileStatus::Deleted;
            }
        }
        // index, mode, similarity, Binary files, "\ No newline": nothing to record
        Ok(())
    }

    fn feed_hunk_body(&mut self, line_no: usize, line: &str) -> Result<(), DiffParseError> {
        let (Some(file), Some(cursor)) = (self.current.as_mut(), self.hunk.as_mut()) else {
            return Ok(());
        };

        match line.as_bytes().first() {
            Some(b'+') => {
                if cursor.new_left == 0 {
                    return Err(overrun(line_no, &file.path, line));
                }
                file.added.insert(cursor.new_line);
                cursor.new_line += 1;
                cursor.new_left -= 1;
            }
            Some(b'-') => {
                if cursor.old_left == 0 {
                    return Err(overrun(line_no, &file.path, line));
                }
                cursor.old_line += 1;
                cursor.old_left -= 1;
            }
            // Some tools strip the leading space off blank context lines
            Some(b' ') | None => {
                if cursor.old_left == 0 || cursor.new_left == 0 {
                    return Err(overrun(line_no, &file.path, line));
                }
                file.context.insert(cursor.new_line, cursor.old_line);
                cursor.old_line += 1;
                cursor.new_line += 1;
                cursor.old_left -= 1;
                cursor.new_left -= 1;
            }
            Some(b'\\') => {} // \ No newline at end of file
            Some(_) => {
                return Err(DiffParseError::TruncatedHunk {
                    line: line_no,
                    path: file.path.clone(),
                    old_left: cursor.old_left,
                    new_left: cursor.new_left,
                });
            }
        }

        if cursor.old_left == 0 && cursor.new_left == 0 {
            self.hunk = None;
        }
        Ok(())
    }

    fn finish_file(&mut self) {
        if let Some(file) = self.current.take() {
            self.files.push(file);
        }
    }

    fn finish(mut self, last_line: usize) -> Result<Vec<DiffFile>, DiffParseError> {
        if let Some(cursor) = self.hunk.take() {
            return Err(DiffParseError::TruncatedHunk {
                line: last_line,
                path: self
                    .current
                    .as_ref()
                    .map(|f| f.path.clone())
                    .unwrap_or_default(),
                old_left: cursor.old_left,
                new_left: cursor.new_left,
            });
        }
        self.finish_file();
        Ok(self.files)
    }
}

fn overrun(line_no: usize, path: &str, line: &str) -> DiffParseError {
    DiffParseError::HunkOverrun {
        line: line_no,
        path: path.to_string(),
        content: line.to_string(),
    }
}

/// Split "a/path b/path". Paths with spaces are only reliable when both
/// sides are equal length, which holds for every non-rename entry.
fn split_git_header(rest: &str) -> (&str, &str) {
    let mid = rest.len() / 2;
    if rest.len() % 2 == 1 && rest.is_char_boundary(mid) && rest.as_bytes()[mid] == b' ' {
        return (&rest[..mid], &rest[mid + 1..]);
    }
    rest.rsplit_once(' ').unwrap_or((rest, rest))
}

/// Path portion of a `---`/`+++` line, without a trailing timestamp
fn header_path(rest: &str) -> &str {
    rest.split('\t').next().unwrap_or(rest).trim_end()
}

/// Drop `strip` leading components, keeping at least the file name.
fn strip_path(path: &str, strip: usize) -> String {
    if path == DEV_NULL {
        return path.to_string();
    }
    let mut rest = path;
    for _ in 0..strip {
        match rest.split_once('/') {
            Some((_, tail)) if !tail.is_empty() => rest = tail,
            _ => break,
        }
    }
    rest.to_string()
}

/// Parse a hunk header like "@@ -10,4 +10,15 @@ fn foo()" into a cursor at
/// the first body line.
fn parse_hunk_header(line: &str) -> Option<HunkCursor> {
    let after_first = line.strip_prefix("@@ ")?;
    let end_idx = after_first.find(" @@")?;
    let range_str = &after_first[..end_idx];

    let mut parts = range_str.split_whitespace();
    let old = parts.next()?.strip_prefix('-')?;
    let new = parts.next()?.strip_prefix('+')?;
    if parts.next().is_some() {
        return None;
    }

    let (old_line, old_left) = parse_range(old)?;
    let (new_line, new_left) = parse_range(new)?;

    Some(HunkCursor {
        old_line,
        new_line,
        old_left,
        new_left,
    })
}

/// Parse "start,count" or just "start" (count defaults to 1)
fn parse_range(s: &str) -> Option<(usize, usize)> {
    if let Some((start, count)) = s.split_once(',') {
        Some((start.parse().ok()?, count.parse().ok()?))
    } else {
        Some((s.parse().ok()?, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFIED: &str = r#"diff --git a/src/main.rs b/src/main.rs
index abc123..def456 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,4 +1,5 @@ fn main()
 fn main() {
+    println!("hello");
     let x = 1;
-    let y = 2;
+    let y = 3;
 }
"#;

    #[test]
    fn added_lines_are_exactly_the_additions() {
        let index = DiffHunkIndex::build(MODIFIED, 1).unwrap();
        assert!(index.is_added_line("src/main.rs", 2));
        assert!(index.is_added_line("src/main.rs", 4));
        assert!(!index.is_added_line("src/main.rs", 1)); // context
        assert!(!index.is_added_line("src/main.rs", 3)); // context
        assert!(!index.is_added_line("src/main.rs", 5)); // context
        assert!(!index.is_added_line("src/main.rs", 6)); // outside the hunk
        assert!(!index.is_added_line("src/other.rs", 2));
    }

    #[test]
    fn context_lines_map_to_old_side() {
        let index = DiffHunkIndex::build(MODIFIED, 1).unwrap();
        assert_eq!(index.old_position("src/main.rs", 1), Some(("src/main.rs", 1)));
        assert_eq!(index.old_position("src/main.rs", 3), Some(("src/main.rs", 2)));
        assert_eq!(index.old_position("src/main.rs", 5), Some(("src/main.rs", 4)));
        assert_eq!(index.old_position("src/main.rs", 2), None);
        assert_eq!(index.old_position("src/main.rs", 4), None);
        assert!(index.is_in_hunk("src/main.rs", 3));
        assert!(!index.is_in_hunk("src/main.rs", 9));
    }

    #[test]
    fn modified_file_status() {
        let index = DiffHunkIndex::build(MODIFIED, 1).unwrap();
        let file = index.files().next().unwrap();
        assert_eq!(file.status, FileStatus::Modified);
        assert_eq!(file.old_path, "src/main.rs");
    }

    #[test]
    fn deletion_only_hunk_adds_nothing() {
        let raw = r#"diff --git a/lib.rs b/lib.rs
--- a/lib.rs
+++ b/lib.rs
@@ -1,3 +1,1 @@
-fn old() {}
-fn also_old() {}
 fn kept() {}
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(!index.is_added_line("lib.rs", 1));
        assert_eq!(index.old_position("lib.rs", 1), Some(("lib.rs", 3)));
    }

    #[test]
    fn new_file_is_all_additions() {
        let raw = r#"diff --git a/new.rs b/new.rs
new file mode 100644
index 0000000..abc1234
--- /dev/null
+++ b/new.rs
@@ -0,0 +1,2 @@
+fn hello() {}
+fn world() {}
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(index.is_added_line("new.rs", 1));
        assert!(index.is_added_line("new.rs", 2));
        assert_eq!(index.old_position("new.rs", 1), None);
        assert_eq!(index.files().next().unwrap().status, FileStatus::Added);
    }

    #[test]
    fn deleted_file_is_not_indexed() {
        let raw = r#"diff --git a/gone.rs b/gone.rs
deleted file mode 100644
--- a/gone.rs
+++ /dev/null
@@ -1,1 +0,0 @@
-fn gone() {}
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(!index.contains_file("gone.rs"));
        assert_eq!(index.files().count(), 0);
    }

    #[test]
    fn rename_aliases_old_path_and_maps_context_only() {
        let raw = r#"diff --git a/old_file.go b/new_file.go
similarity index 90%
rename from old_file.go
rename to new_file.go
index 1111111..2222222 100644
--- a/old_file.go
+++ b/new_file.go
@@ -5,4 +5,5 @@ func x()
 a := 1
 b := 2
+c := 3
 d := 4
 e := 5
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        // context line keeps its old position under the old name
        assert_eq!(index.old_position("new_file.go", 8), Some(("old_file.go", 7)));
        // pure addition never maps
        assert_eq!(index.old_position("new_file.go", 7), None);
        assert!(index.is_added_line("new_file.go", 7));
        // old name resolves through the alias
        assert!(index.is_added_line("old_file.go", 7));
        assert_eq!(index.files().next().unwrap().status, FileStatus::Renamed);
    }

    #[test]
    fn copy_source_keeps_its_own_identity() {
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
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(index.is_added_line("b.rs", 2));
        assert_eq!(index.old_position("b.rs", 1), Some(("a.rs", 1)));

        // the source file was not touched
        assert!(!index.is_added_line("a.rs", 2));
        assert!(!index.is_in_hunk("a.rs", 1));
        assert!(!index.contains_file("a.rs"));
        assert_eq!(index.new_path("a.rs"), None);
        assert_eq!(index.files().next().unwrap().status, FileStatus::Copied);
    }

    #[test]
    fn pure_rename_without_hunks_is_known() {
        let raw = r#"diff --git a/a.txt b/b.txt
similarity index 100%
rename from a.txt
rename to b.txt
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(index.contains_file("b.txt"));
        assert!(index.contains_file("a.txt"));
        assert!(!index.is_added_line("b.txt", 1));
    }

    #[test]
    fn strip_components() {
        let raw = r#"--- x/y/src/lib.rs	2024-01-01 00:00:00
+++ x/y/src/lib.rs	2024-01-02 00:00:00
@@ -1 +1 @@
-old
+new
"#;
        let index = DiffHunkIndex::build(raw, 2).unwrap();
        assert!(index.is_added_line("src/lib.rs", 1));

        let index = DiffHunkIndex::build(raw, 0).unwrap();
        assert!(index.is_added_line("x/y/src/lib.rs", 1));
    }

    #[test]
    fn plain_unified_diff_with_multiple_files() {
        let raw = r#"--- a/one.txt
+++ b/one.txt
@@ -1,2 +1,2 @@
-- removed list item
+- added list item
 tail
--- a/two.txt
+++ b/two.txt
@@ -3,0 +4,1 @@
+appended
"#;
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        // a deleted "-- ..." line inside a hunk is not a file header
        assert!(index.is_added_line("one.txt", 1));
        assert!(index.is_added_line("two.txt", 4));
        assert_eq!(index.files().count(), 2);
    }

    #[test]
    fn no_newline_marker_is_ignored() {
        let raw = "diff --git a/f b/f\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+b\n\\ No newline at end of file\n";
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert!(index.is_added_line("f", 1));
    }

    #[test]
    fn blank_context_line_without_space() {
        let raw = "--- a/f\n+++ b/f\n@@ -1,3 +1,4 @@\n a\n\n+c\n d\n";
        let index = DiffHunkIndex::build(raw, 1).unwrap();
        assert_eq!(index.old_position("f", 2), Some(("f", 2)));
        assert!(index.is_added_line("f", 3));
    }

    #[test]
    fn malformed_hunk_header_is_an_error() {
        let raw = "--- a/f\n+++ b/f\n@@ -x,1 +1,1 @@\n+a\n";
        let err = DiffHunkIndex::build(raw, 1).unwrap_err();
        assert_eq!(
            err,
            DiffParseError::MalformedHunkHeader {
                line: 3,
                header: "@@ -x,1 +1,1 @@".to_string()
            }
        );
    }

    #[test]
    fn truncated_hunk_is_an_error() {
        let raw = "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n";
        let err = DiffHunkIndex::build(raw, 1).unwrap_err();
        assert!(matches!(
            err,
            DiffParseError::TruncatedHunk { old_left: 2, new_left: 2, .. }
        ));
    }

    #[test]
    fn hunk_body_shorter_than_header_before_next_file() {
        let raw = "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\ndiff --git a/g b/g\n";
        let err = DiffHunkIndex::build(raw, 1).unwrap_err();
        assert!(matches!(err, DiffParseError::TruncatedHunk { line: 5, .. }));
    }

    #[test]
    fn hunk_without_file_is_an_error() {
        let err = DiffHunkIndex::build("@@ -1 +1 @@\n-a\n+b\n", 1).unwrap_err();
        assert_eq!(err, DiffParseError::HunkOutsideFile { line: 1 });
    }

    #[test]
    fn parse_hunk_header_ranges() {
        let h = parse_hunk_header("@@ -10,4 +12,15 @@ impl Foo").unwrap();
        assert_eq!((h.old_line, h.old_left), (10, 4));
        assert_eq!((h.new_line, h.new_left), (12, 15));

        let h = parse_hunk_header("@@ -3 +3 @@").unwrap();
        assert_eq!((h.old_left, h.new_left), (1, 1));
        assert!(parse_hunk_header("@@ -1,2 @@").is_none());
    }

    #[test]
    fn empty_diff_is_empty_index() {
        let index = DiffHunkIndex::build("", 1).unwrap();
        assert_eq!(index.files().count(), 0);
    }
}
