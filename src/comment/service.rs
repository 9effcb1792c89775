use super::{
    Comment, CommentBackend, CommentService, CreateFailure, FileLevelPolicy, FlushError,
    FlushReport, PostedCommentIndex,
};
use crate::filter::FilteredDiagnostic;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffers comments for one backend and posts them on flush.
pub struct BufferedCommentService<B> {
    backend: B,
    file_level: FileLevelPolicy,
    // Held for the whole flush so posts never interleave with a dispatch.
    buffer: Mutex<Vec<Comment>>,
}

impl<B: CommentBackend> BufferedCommentService<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            file_level: FileLevelPolicy::default(),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file_level(mut self, policy: FileLevelPolicy) -> Self {
        self.file_level = policy;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn eligibility(&self, comment: &Comment, posted: &PostedCommentIndex) -> Eligibility {
        let result = &comment.result;
        let in_scope = if comment.line() == 0 {
            self.file_level == FileLevelPolicy::Comment && result.in_diff_file
        } else {
            result.in_diff
        };
        if !in_scope {
            Eligibility::Skipped
        } else if posted.is_posted(comment.path(), comment.line(), &comment.body) {
            Eligibility::AlreadyPosted
        } else {
            Eligibility::Eligible
        }
    }

    /// Apply the eligibility predicate and group what's left by (path, line).
    fn plan<'a>(&self, buffer: &'a [Comment], posted: &PostedCommentIndex) -> Plan<'a> {
        let mut plan = Plan {
            groups: Vec::new(),
            report: FlushReport {
                buffered: buffer.len(),
                ..Default::default()
            },
        };
        let mut seen: HashSet<(&str, usize, &str)> = HashSet::new();
        let mut group_of: HashMap<(&str, usize), usize> = HashMap::new();

        for comment in buffer {
            match self.eligibility(comment, posted) {
                Eligibility::Skipped => plan.report.skipped += 1,
                Eligibility::AlreadyPosted => plan.report.already_posted += 1,
                Eligibility::Eligible => {
                    if !seen.insert((comment.path(), comment.line(), comment.body.as_str())) {
                        plan.report.duplicates += 1;
                        continue;
                    }
                    plan.report.eligible += 1;
                    let key = (comment.path(), comment.line());
                    let idx = *group_of.entry(key).or_insert_with(|| {
                        plan.groups.push(Vec::new());
                        plan.groups.len() - 1
                    });
                    plan.groups[idx].push(comment);
                }
            }
        }
        plan
    }

    /// Creates one target's comments in order. Comments on the same
    /// (path, line) never race each other.
    async fn dispatch_group(&self, group: &[&Comment], cancel: &CancellationToken) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(group.len());
        for comment in group {
            if cancel.is_cancelled() {
                outcomes.push(Outcome::Cancelled);
                continue;
            }
            let payload = comment.to_new_comment();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = self.backend.create_comment(&payload) => match result {
                    Ok(()) => Outcome::Posted,
                    Err(err) => {
                        warn!(
                            backend = self.backend.name(),
                            path = comment.path(),
                            line = comment.line(),
                            error = %format!("{:#}", err),
                            "failed to create comment"
                        );
                        Outcome::Failed(CreateFailure {
                            path: comment.path().to_string(),
                            line: comment.line(),
                            message: format!("{:#}", err),
                        })
                    }
                },
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

enum Eligibility {
    Eligible,
    AlreadyPosted,
    Skipped,
}

enum Outcome {
    Posted,
    Failed(CreateFailure),
    Cancelled,
}

struct Plan<'a> {
    groups: Vec<Vec<&'a Comment>>,
    report: FlushReport,
}

#[async_trait]
impl<B: CommentBackend> CommentService for BufferedCommentService<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn post(
        &self,
        diagnostic: FilteredDiagnostic,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!("{}: cancelled before posting", self.backend.name());
        }
        let comment = Comment::new(diagnostic);
        // An empty body never shows up in a listing, so it would be re-created every run.
        if comment.body.trim().is_empty() {
            warn!(
                backend = self.backend.name(),
                path = comment.path(),
                line = comment.line(),
                "dropping diagnostic with an empty comment body"
            );
            return Ok(());
        }
        self.buffer.lock().await.push(comment);
        Ok(())
    }

    async fn flush(&self, cancel: &CancellationToken) -> Result<FlushReport, FlushError> {
        let buffer = self.buffer.lock().await;
        let backend = self.backend.name().to_string();

        // LIST
        let posted = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(backend = %backend, "cancelled while listing existing comments");
                return Err(FlushError::Cancelled {
                    backend,
                    eligible: 0,
                    posted: 0,
                    failures: Vec::new(),
                });
            }
            result = PostedCommentIndex::build(&self.backend) => {
                result.map_err(|error| FlushError::List { backend: backend.clone(), error })?
            }
        };

        // FILTER
        let plan = self.plan(&buffer, &posted);
        let mut report = plan.report;
        info!(
            backend = %backend,
            buffered = report.buffered,
            eligible = report.eligible,
            already_posted = report.already_posted,
            skipped = report.skipped,
            "posting comments"
        );

        // DISPATCH: one unit per (path, line); AGGREGATE: wait for all of them
        let outcomes = join_all(
            plan.groups
                .iter()
                .map(|group| self.dispatch_group(group, cancel)),
        )
        .await;

        let mut failures = Vec::new();
        let mut cancelled = 0;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Posted => report.posted += 1,
                Outcome::Failed(failure) => failures.push(failure),
                Outcome::Cancelled => cancelled += 1,
            }
        }
        debug!(
            backend = %backend,
            posted = report.posted,
            failed = failures.len(),
            cancelled,
            "dispatch finished"
        );

        if cancelled > 0 {
            warn!(backend = %backend, cancelled, "flush cancelled");
            return Err(FlushError::Cancelled {
                backend,
                eligible: report.eligible,
                posted: report.posted,
                failures,
            });
        }
        if !failures.is_empty() {
            return Err(FlushError::Create {
                backend,
                attempted: report.eligible,
                posted: report.posted,
                failures,
            });
        }
        Ok(report)
    }
}
