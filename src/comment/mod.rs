//! Comment buffering, de-duplication and posting.
//!
//! Reporters push [`FilteredDiagnostic`]s through [`CommentService::post`],
//! which only buffers. [`CommentService::flush`] lists what the backend
//! already has, drops anything already posted or outside the diff, and
//! creates the rest concurrently.

mod body;
mod error;
mod multi;
mod posted;
mod service;

pub use body::comment_body;
pub use error::{CreateFailure, FlushError};
pub use multi::MultiCommentService;
pub use posted::PostedCommentIndex;
pub use service::BufferedCommentService;

use crate::diagnostic::Severity;
use crate::filter::FilteredDiagnostic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

/// What to do with line-0 (whole-file) diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLevelPolicy {
    #[default]
    Discard,
    /// Post as a file-level comment when the file is part of the diff
    Comment,
}

impl FromStr for FileLevelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(FileLevelPolicy::Discard),
            "comment" => Ok(FileLevelPolicy::Comment),
            other => Err(format!("unknown file-level policy '{}' (discard, comment)", other)),
        }
    }
}

impl fmt::Display for FileLevelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileLevelPolicy::Discard => "discard",
            FileLevelPolicy::Comment => "comment",
        })
    }
}

/// A filtered diagnostic with its rendered body
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub result: FilteredDiagnostic,
    pub body: String,
}

impl Comment {
    pub fn new(result: FilteredDiagnostic) -> Self {
        let body = comment_body(&result.diagnostic);
        Self { result, body }
    }

    pub fn path(&self) -> &str {
        self.result.path()
    }

    pub fn line(&self) -> usize {
        self.result.line()
    }

    fn to_new_comment(&self) -> NewComment {
        let d = &self.result.diagnostic;
        NewComment {
            path: d.path.clone(),
            line: (d.line != 0).then_some(d.line),
            start_line: d
                .suggestion
                .as_ref()
                .filter(|s| s.applies_at(d.line))
                .and_then(|s| s.range_start()),
            old_path: self.result.old_path.clone(),
            old_line: self.result.old_line,
            body: self.body.clone(),
            severity: d.severity,
            link: d.code.as_ref().and_then(|c| c.url.clone()),
        }
    }
}

/// A comment that already exists on the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub path: String,
    /// 0 for file-level comments
    pub line: usize,
    pub body: String,
}

/// One page of a backend listing
#[derive(Debug, Clone, Default)]
pub struct CommentPage {
    pub comments: Vec<PostedComment>,
    /// Opaque cursor for the next page; `None` ends the listing
    pub next: Option<String>,
}

/// Payload of a single create call
#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub path: String,
    /// `None` for a file-level comment
    pub line: Option<usize>,
    /// Start of a multi-line comment ending at `line`
    pub start_line: Option<usize>,
    pub old_path: Option<String>,
    pub old_line: Option<usize>,
    pub body: String,
    pub severity: Severity,
    pub link: Option<String>,
}

/// The two primitives a review backend has to provide. The review target
/// (project, pull/merge request) is fixed when the backend is constructed.
#[async_trait]
pub trait CommentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `cursor` is `None` for the first page.
    async fn list_comments(&self, cursor: Option<&str>) -> anyhow::Result<CommentPage>;

    /// Must tolerate concurrent calls for distinct (path, line) targets.
    async fn create_comment(&self, comment: &NewComment) -> anyhow::Result<()>;
}

/// Counts from a successful flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub buffered: usize,
    pub eligible: usize,
    pub posted: usize,
    pub already_posted: usize,
    /// Outside the diff, or file-level under the discard policy
    pub skipped: usize,
    /// Exact repeats inside the buffer
    pub duplicates: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: FlushReport) {
        self.buffered += other.buffered;
        self.eligible += other.eligible;
        self.posted += other.posted;
        self.already_posted += other.already_posted;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
    }
}

#[async_trait]
pub trait CommentService: Send + Sync {
    fn name(&self) -> &str;

    /// Buffer a diagnostic. No remote side effects. Refused once `cancel`
    /// has fired.
    async fn post(
        &self,
        diagnostic: FilteredDiagnostic,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Post everything buffered that is eligible and not yet on the remote.
    async fn flush(&self, cancel: &CancellationToken) -> Result<FlushReport, FlushError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::diagnostic::Diagnostic;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory backend: serves `remote` in pages, records creates and
    /// appends them to `remote` so later listings see them.
    pub struct MockBackend {
        pub name: String,
        pub page_size: usize,
        pub remote: Mutex<Vec<PostedComment>>,
        pub created: Mutex<Vec<NewComment>>,
        pub fail_bodies: HashSet<String>,
        pub fail_list: bool,
        pub hang_on_create: bool,
        pub list_calls: AtomicUsize,
    }

    impl MockBackend {
        pub fn new(remote: Vec<PostedComment>) -> Self {
            Self {
                name: "mock".to_string(),
                page_size: 2,
                remote: Mutex::new(remote),
                created: Mutex::new(Vec::new()),
                fail_bodies: HashSet::new(),
                fail_list: false,
                hang_on_create: false,
                list_calls: AtomicUsize::new(0),
            }
        }

        pub fn created(&self) -> Vec<NewComment> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommentBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_comments(&self, cursor: Option<&str>) -> anyhow::Result<CommentPage> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                anyhow::bail!("listing is down");
            }
            let page: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let remote = self.remote.lock().unwrap();
            let start = (page * self.page_size).min(remote.len());
            let end = (start + self.page_size).min(remote.len());
            Ok(CommentPage {
                comments: remote[start..end].to_vec(),
                next: (end < remote.len()).then(|| (page + 1).to_string()),
            })
        }

        async fn create_comment(&self, comment: &NewComment) -> anyhow::Result<()> {
            if self.hang_on_create {
                std::future::pending::<()>().await;
            }
            tokio::task::yield_now().await;
            if self.fail_bodies.contains(&comment.body) {
                anyhow::bail!("server said no");
            }
            self.created.lock().unwrap().push(comment.clone());
            self.remote.lock().unwrap().push(PostedComment {
                path: comment.path.clone(),
                line: comment.line.unwrap_or(0),
                body: comment.body.clone(),
            });
            Ok(())
        }
    }

    /// Lets a test keep a handle on a backend it hands to a service.
    #[async_trait]
    impl<B: CommentBackend> CommentBackend for Arc<B> {
        fn name(&self) -> &str {
            (**self).name()
        }

        async fn list_comments(&self, cursor: Option<&str>) -> anyhow::Result<CommentPage> {
            (**self).list_comments(cursor).await
        }

        async fn create_comment(&self, comment: &NewComment) -> anyhow::Result<()> {
            (**self).create_comment(comment).await
        }
    }

    pub fn filtered(path: &str, line: usize, message: &str, in_diff: bool) -> FilteredDiagnostic {
        let mut d = Diagnostic::new(path, line, message);
        d.source = Some("lint".to_string());
        FilteredDiagnostic {
            diagnostic: d,
            in_diff,
            in_diff_file: in_diff,
            old_path: None,
            old_line: None,
        }
    }

    pub fn posted(fd: &FilteredDiagnostic) -> PostedComment {
        PostedComment {
            path: fd.path().to_string(),
            line: fd.line(),
            body: comment_body(&fd.diagnostic),
        }
    }
}
