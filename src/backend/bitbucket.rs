use super::{check_status, ReviewTarget};
use crate::comment::{CommentBackend, CommentPage, NewComment, PostedComment};
use crate::diagnostic::Severity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::OnceCell;

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0";
pub const DEFAULT_REPORT_ID: &str = "diffnote";

const SUMMARY_MAX: usize = 450;
pub(super) const DETAILS_MAX: usize = 2000;

/// Bitbucket Cloud code insights: one report per commit, one annotation per comment.
pub struct BitbucketCodeInsights {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
    target: ReviewTarget,
    sha: String,
    report: ReportSettings,
    report_state: ReportState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub id: String,
    pub title: String,
    pub reporter: String,
    pub logo_url: Option<String>,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            id: DEFAULT_REPORT_ID.to_string(),
            title: "diffnote".to_string(),
            reporter: "diffnote".to_string(),
            logo_url: None,
        }
    }
}

pub(super) const REPORT_DETAILS: &str = "Diagnostics reported on lines touched by this change";

/// Outcome shown on a code insights report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ReportResult {
    Passed,
    Failed,
}

impl ReportResult {
    /// Error-severity findings fail the report.
    pub(super) fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Error => ReportResult::Failed,
            _ => ReportResult::Passed,
        }
    }
}

/// The report is written with the first annotation's result and rewritten
/// at most once more, when the first failing annotation shows up.
#[derive(Debug, Default)]
pub(super) struct ReportState {
    written: OnceCell<ReportResult>,
    failed: OnceCell<()>,
}

impl ReportState {
    pub(super) async fn ensure<F, Fut>(&self, wanted: ReportResult, put: F) -> Result<()>
    where
        F: Fn(ReportResult) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let written = *self
            .written
            .get_or_try_init(|| async {
                put(wanted).await?;
                Ok::<_, anyhow::Error>(wanted)
            })
            .await?;
        if wanted == ReportResult::Failed && written == ReportResult::Passed {
            self.failed
                .get_or_try_init(|| put(ReportResult::Failed))
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct Report<'a> {
    title: &'a str,
    details: &'a str,
    report_type: &'static str,
    reporter: &'a str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    logo_url: Option<&'a str>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Annotation<'a> {
    annotation_type: &'static str,
    summary: String,
    details: String,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<usize>,
    severity: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AnnotationPage {
    #[serde(default)]
    values: Vec<ListedAnnotation>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedAnnotation {
    path: Option<String>,
    line: Option<usize>,
    summary: Option<String>,
    details: Option<String>,
}

impl BitbucketCodeInsights {
    pub fn new(
        api_url: &str,
        token: Option<String>,
        target: ReviewTarget,
        report: ReportSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let sha = target
            .sha
            .clone()
            .filter(|s| !s.is_empty())
            .context("bitbucket code insights needs the commit SHA (--sha)")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            target,
            sha,
            report,
            report_state: ReportState::default(),
        })
    }

    fn report_url(&self) -> String {
        format!(
            "{}/repositories/{}/{}/commit/{}/reports/{}",
            self.api_url, self.target.owner, self.target.repo, self.sha, self.report.id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn put_report(&self, result: ReportResult) -> Result<()> {
        let response = self
            .authorize(self.client.put(self.report_url()))
            .json(&report(&self.report, result))
            .send()
            .await
            .context("Failed to create code insights report")?;
        check_status(response, "PUT report").await?;
        tracing::debug!(report = %self.report.id, ?result, "code insights report written");
        Ok(())
    }
}

#[async_trait]
impl CommentBackend for BitbucketCodeInsights {
    fn name(&self) -> &str {
        "bitbucket-code-insights"
    }

    async fn list_comments(&self, cursor: Option<&str>) -> Result<CommentPage> {
        let url = match cursor {
            Some(next) => next.to_string(),
            None => format!("{}/annotations?pagelen=100", self.report_url()),
        };
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .context("Failed to list code insights annotations")?;

        // no report yet means nothing was annotated
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(CommentPage::default());
        }
        let page: AnnotationPage = check_status(response, "GET annotations")
            .await?
            .json()
            .await
            .context("Failed to parse annotations JSON")?;

        Ok(CommentPage {
            comments: page.values.into_iter().filter_map(posted_comment).collect(),
            next: page.next.filter(|n| !n.is_empty()),
        })
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<()> {
        self.report_state
            .ensure(ReportResult::for_severity(comment.severity), |result| {
                self.put_report(result)
            })
            .await?;
        let id = external_id(comment);
        let response = self
            .authorize(
                self.client
                    .put(format!("{}/annotations/{}", self.report_url(), id)),
            )
            .json(&annotation(comment))
            .send()
            .await
            .context("Failed to create code insights annotation")?;
        check_status(response, "PUT annotation").await?;
        Ok(())
    }
}

fn report(settings: &ReportSettings, result: ReportResult) -> Report<'_> {
    Report {
        title: &settings.title,
        details: REPORT_DETAILS,
        report_type: "BUG",
        reporter: &settings.reporter,
        result: match result {
            ReportResult::Passed => "PASSED",
            ReportResult::Failed => "FAILED",
        },
        logo_url: settings.logo_url.as_deref(),
    }
}

fn posted_comment(a: ListedAnnotation) -> Option<PostedComment> {
    Some(PostedComment {
        path: a.path?,
        line: a.line.unwrap_or(0),
        body: a.details.or(a.summary)?,
    })
}

fn annotation(comment: &NewComment) -> Annotation<'_> {
    Annotation {
        annotation_type: "CODE_SMELL",
        summary: summary(&comment.body),
        details: truncate(&comment.body, DETAILS_MAX),
        path: &comment.path,
        line: comment.line,
        severity: severity(comment.severity),
        link: comment.link.as_deref(),
    }
}

/// Same (path, line, body) always maps to the same annotation.
pub(super) fn external_id(comment: &NewComment) -> String {
    let mut hasher = Sha256::new();
    hasher.update(comment.path.as_bytes());
    hasher.update([0u8]);
    hasher.update(comment.line.unwrap_or(0).to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(comment.body.as_bytes());
    format!("diffnote-{:x}", hasher.finalize())
}

pub(super) fn severity(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "HIGH",
        Severity::Warning => "MEDIUM",
        Severity::Info | Severity::Unknown => "LOW",
    }
}

/// First non-empty line of the body, cut to the summary limit.
fn summary(body: &str) -> String {
    let first = body
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    truncate(first, SUMMARY_MAX)
}

pub(super) fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
