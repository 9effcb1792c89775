use super::github::{next_cursor, split_response, Gh};
use super::{encode_component, ReviewTarget};
use crate::comment::{CommentBackend, CommentPage, NewComment, PostedComment};
use crate::diagnostic::Severity;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

/// Title given to whole-file annotations; GitHub always wants a line.
const FILE_LEVEL_TITLE: &str = "Whole file";

/// One GitHub check run per head commit, one annotation per comment.
///
/// The checks API only accepts GitHub App tokens, so this works where `gh`
/// is authenticated as an app installation (the Actions `GITHUB_TOKEN`).
pub struct GitHubCheck {
    gh: Gh,
    target: ReviewTarget,
    check_name: String,
    head_sha: OnceCell<String>,
    run_id: OnceCell<u64>,
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct ListedAnnotation {
    path: Option<String>,
    end_line: Option<usize>,
    title: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct NewCheckRun<'a> {
    name: &'a str,
    head_sha: &'a str,
    status: &'static str,
    conclusion: &'static str,
    output: Output<'a>,
}

#[derive(Debug, Serialize, PartialEq)]
struct CheckRunUpdate<'a> {
    output: Output<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<&'static str>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Output<'a> {
    title: &'a str,
    summary: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    annotations: Vec<Annotation<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Annotation<'a> {
    path: &'a str,
    start_line: usize,
    end_line: usize,
    annotation_level: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'static str>,
}

const SUMMARY: &str = "Diagnostics reported on lines touched by this change";

impl GitHubCheck {
    pub fn new(
        target: ReviewTarget,
        check_name: impl Into<String>,
        repo_root: Option<String>,
    ) -> Self {
        Self {
            gh: Gh::new(repo_root),
            target,
            check_name: check_name.into(),
            head_sha: OnceCell::new(),
            run_id: OnceCell::new(),
        }
    }

    async fn head_sha(&self) -> Result<&str> {
        let sha = self
            .head_sha
            .get_or_try_init(|| self.gh.head_sha(&self.target))
            .await?;
        Ok(sha)
    }

    /// Latest run with our name on the head commit, if there is one.
    async fn find_run(&self) -> Result<Option<u64>> {
        let sha = self.head_sha().await?;
        let endpoint = format!(
            "repos/{}/commits/{}/check-runs?check_name={}&filter=latest&per_page=1",
            self.target.slug(),
            sha,
            encode_component(&self.check_name)
        );
        let raw = self
            .gh
            .run(&["api".to_string(), endpoint])
            .await
            .context("Failed to look up check run")?;
        let list: CheckRunList =
            serde_json::from_str(&raw).context("Failed to parse check runs JSON")?;
        Ok(list.check_runs.first().map(|run| run.id))
    }

    async fn create_run(&self) -> Result<u64> {
        let sha = self.head_sha().await?;
        let payload = NewCheckRun {
            name: &self.check_name,
            head_sha: sha,
            status: "completed",
            conclusion: "neutral",
            output: Output {
                title: &self.check_name,
                summary: SUMMARY,
                annotations: Vec::new(),
            },
        };
        let raw = self
            .api_json("POST", format!("repos/{}/check-runs", self.target.slug()), &payload)
            .await
            .context("Failed to create check run")?;
        let run: CheckRun = serde_json::from_str(&raw).context("Failed to parse check run JSON")?;
        tracing::debug!(id = run.id, name = %self.check_name, "check run created");
        Ok(run.id)
    }

    async fn run_id(&self) -> Result<u64> {
        let id = self
            .run_id
            .get_or_try_init(|| async {
                match self.find_run().await? {
                    Some(id) => Ok::<_, anyhow::Error>(id),
                    None => self.create_run().await,
                }
            })
            .await?;
        Ok(*id)
    }

    async fn api_json<T: Serialize + Sync>(
        &self,
        method: &str,
        endpoint: String,
        body: &T,
    ) -> Result<String> {
        let input = serde_json::to_string(body).context("Failed to encode request JSON")?;
        let args = [
            "api".to_string(),
            "-X".to_string(),
            method.to_string(),
            endpoint,
            "--input".to_string(),
            "-".to_string(),
        ];
        self.gh.run_with_input(&args, Some(&input)).await
    }
}

#[async_trait]
impl CommentBackend for GitHubCheck {
    fn name(&self) -> &str {
        "github-check"
    }

    async fn list_comments(&self, cursor: Option<&str>) -> Result<CommentPage> {
        let endpoint = match cursor {
            Some(next) => next.to_string(),
            None => {
                let Some(id) = self.find_run().await? else {
                    return Ok(CommentPage::default());
                };
                // later creates append to the run we just found
                let _ = self.run_id.set(id);
                format!(
                    "repos/{}/check-runs/{}/annotations?per_page=100",
                    self.target.slug(),
                    id
                )
            }
        };
        let raw = self
            .gh
            .run(&["api".to_string(), "-i".to_string(), endpoint])
            .await
            .context("Failed to fetch check run annotations")?;
        parse_annotation_page(&raw)
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<()> {
        let id = self.run_id().await?;
        let update = run_update(&self.check_name, comment);
        self.api_json(
            "PATCH",
            format!("repos/{}/check-runs/{}", self.target.slug(), id),
            &update,
        )
        .await
        .with_context(|| format!("Failed to annotate {}", comment.path))?;
        Ok(())
    }
}

fn parse_annotation_page(raw: &str) -> Result<CommentPage> {
    let (headers, body) = split_response(raw)?;
    let listed: Vec<ListedAnnotation> =
        serde_json::from_str(body).context("Failed to parse check run annotations JSON")?;
    let comments = listed
        .into_iter()
        .filter_map(|a| {
            let line = if a.title.as_deref() == Some(FILE_LEVEL_TITLE) {
                0
            } else {
                a.end_line?
            };
            Some(PostedComment {
                path: a.path?,
                line,
                body: a.message?,
            })
        })
        .collect();
    Ok(CommentPage {
        comments,
        next: next_cursor(&headers),
    })
}

/// PATCH body appending one annotation; error findings fail the run.
fn run_update<'a>(check_name: &'a str, comment: &'a NewComment) -> CheckRunUpdate<'a> {
    let (start_line, end_line, title) = match comment.line {
        Some(line) => (comment.start_line.unwrap_or(line).min(line), line, None),
        None => (1, 1, Some(FILE_LEVEL_TITLE)),
    };
    CheckRunUpdate {
        output: Output {
            title: check_name,
            summary: SUMMARY,
            annotations: vec![Annotation {
                path: &comment.path,
                start_line,
                end_line,
                annotation_level: annotation_level(comment.severity),
                message: &comment.body,
                title,
            }],
        },
        conclusion: (comment.severity == Severity::Error).then_some("failure"),
    }
}

fn annotation_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "failure",
        Severity::Warning => "warning",
        Severity::Info | Severity::Unknown => "notice",
    }
}
