use super::bitbucket::{
    external_id, severity, truncate, ReportResult, ReportSettings, ReportState, DETAILS_MAX,
    REPORT_DETAILS,
};
use super::{check_status, ReviewTarget};
use crate::comment::{CommentBackend, CommentPage, NewComment, PostedComment};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How requests to a Bitbucket Server instance are authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAuth {
    None,
    Token(String),
    Basic { user: String, password: String },
}

impl ServerAuth {
    /// An access token wins over user/password.
    pub fn from_parts(
        token: Option<String>,
        user: Option<String>,
        password: Option<String>,
    ) -> Self {
        match (token.filter(|t| !t.is_empty()), user, password) {
            (Some(token), _, _) => ServerAuth::Token(token),
            (None, Some(user), Some(password)) if !user.is_empty() => {
                ServerAuth::Basic { user, password }
            }
            _ => ServerAuth::None,
        }
    }
}

/// Bitbucket Server / Data Center code insights. `target.owner` is the
/// project key and `target.repo` the repository slug.
pub struct BitbucketServerInsights {
    client: reqwest::Client,
    base_url: String,
    auth: ServerAuth,
    target: ReviewTarget,
    sha: String,
    report: ReportSettings,
    report_state: ReportState,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Report<'a> {
    title: &'a str,
    details: &'a str,
    reporter: &'a str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    logo_url: Option<&'a str>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Annotation<'a> {
    path: &'a str,
    /// 0 puts the annotation on the file as a whole
    line: usize,
    message: String,
    severity: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AnnotationList {
    #[serde(default)]
    annotations: Vec<ListedAnnotation>,
}

#[derive(Debug, Deserialize)]
struct ListedAnnotation {
    path: Option<String>,
    line: Option<usize>,
    message: Option<String>,
}

impl BitbucketServerInsights {
    pub fn new(
        base_url: &str,
        auth: ServerAuth,
        target: ReviewTarget,
        report: ReportSettings,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            anyhow::bail!("Bitbucket Server URL must start with http:// or https://: {}", base_url);
        }
        let sha = target
            .sha
            .clone()
            .filter(|s| !s.is_empty())
            .context("bitbucket server insights needs the commit SHA (--sha)")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            auth,
            target,
            sha,
            report,
            report_state: ReportState::default(),
        })
    }

    fn report_url(&self) -> String {
        format!(
            "{}/rest/insights/1.0/projects/{}/repos/{}/commits/{}/reports/{}",
            self.base_url, self.target.owner, self.target.repo, self.sha, self.report.id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            ServerAuth::None => request,
            ServerAuth::Token(token) => request.bearer_auth(token),
            ServerAuth::Basic { user, password } => request.basic_auth(user, Some(password)),
        }
    }

    async fn put_report(&self, result: ReportResult) -> Result<()> {
        let response = self
            .authorize(self.client.put(self.report_url()))
            .json(&report(&self.report, result))
            .send()
            .await
            .context("Failed to create insights report")?;
        check_status(response, "PUT report").await?;
        tracing::debug!(report = %self.report.id, ?result, "insights report written");
        Ok(())
    }
}

#[async_trait]
impl CommentBackend for BitbucketServerInsights {
    fn name(&self) -> &str {
        "bitbucket-server-insights"
    }

    /// The server returns every annotation of a report in one response.
    async fn list_comments(&self, _cursor: Option<&str>) -> Result<CommentPage> {
        let response = self
            .authorize(self.client.get(format!("{}/annotations", self.report_url())))
            .send()
            .await
            .context("Failed to list insights annotations")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(CommentPage::default());
        }
        let list: AnnotationList = check_status(response, "GET annotations")
            .await?
            .json()
            .await
            .context("Failed to parse annotations JSON")?;

        Ok(CommentPage {
            comments: list.annotations.into_iter().filter_map(posted_comment).collect(),
            next: None,
        })
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<()> {
        self.report_state
            .ensure(ReportResult::for_severity(comment.severity), |result| {
                self.put_report(result)
            })
            .await?;
        let url = format!("{}/annotations/{}", self.report_url(), external_id(comment));
        let response = self
            .authorize(self.client.put(url))
            .json(&annotation(comment))
            .send()
            .await
            .context("Failed to create insights annotation")?;
        check_status(response, "PUT annotation").await?;
        Ok(())
    }
}

fn report(settings: &ReportSettings, result: ReportResult) -> Report<'_> {
    Report {
        title: &settings.title,
        details: REPORT_DETAILS,
        reporter: &settings.reporter,
        result: match result {
            ReportResult::Passed => "PASS",
            ReportResult::Failed => "FAIL",
        },
        logo_url: settings.logo_url.as_deref(),
    }
}

fn annotation(comment: &NewComment) -> Annotation<'_> {
    Annotation {
        path: &comment.path,
        line: comment.line.unwrap_or(0),
        message: truncate(&comment.body, DETAILS_MAX),
        severity: severity(comment.severity),
        kind: "CODE_SMELL",
        link: comment.link.as_deref(),
    }
}

fn posted_comment(a: ListedAnnotation) -> Option<PostedComment> {
    Some(PostedComment {
        path: a.path?,
        line: a.line.unwrap_or(0),
        body: a.message?,
    })
}
