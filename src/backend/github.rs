use super::{short_body, ReviewTarget};
use crate::comment::{CommentBackend, CommentPage, NewComment, PostedComment};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// The authenticated `gh` CLI, run from the repository when known.
pub(crate) struct Gh {
    repo_root: Option<String>,
}

impl Gh {
    pub(crate) fn new(repo_root: Option<String>) -> Self {
        Self { repo_root }
    }

    pub(crate) async fn run(&self, args: &[String]) -> Result<String> {
        self.run_with_input(args, None).await
    }

    /// `input` is piped to stdin, for `gh api --input -`.
    pub(crate) async fn run_with_input(
        &self,
        args: &[String],
        input: Option<&str>,
    ) -> Result<String> {
        const MISSING: &str = "GitHub CLI (gh) is not installed. Install it: https://cli.github.com";

        let mut cmd = Command::new("gh");
        cmd.args(args);
        if let Some(dir) = &self.repo_root {
            cmd.current_dir(dir);
        }
        let output = match input {
            None => cmd.output().await.context(MISSING)?,
            Some(input) => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                let mut child = cmd.spawn().context(MISSING)?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin
                        .write_all(input.as_bytes())
                        .await
                        .context("Failed to write gh input")?;
                }
                child.wait_with_output().await.context("Failed to wait for gh")?
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            anyhow::bail!("gh {} failed: {}", args.join(" "), short_body(&detail));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Head commit of the PR: `target.sha` when given, otherwise `gh pr view`.
    pub(crate) async fn head_sha(&self, target: &ReviewTarget) -> Result<String> {
        if let Some(sha) = target.sha.as_deref().filter(|s| !s.is_empty()) {
            return Ok(sha.to_string());
        }
        let out = self
            .run(&[
                "pr".to_string(),
                "view".to_string(),
                target.pr.to_string(),
                "--repo".to_string(),
                target.slug(),
                "--json".to_string(),
                "headRefOid".to_string(),
                "--jq".to_string(),
                ".headRefOid".to_string(),
            ])
            .await
            .context("Failed to get PR head SHA")?;
        let sha = out.trim().to_string();
        if sha.is_empty() {
            anyhow::bail!("Failed to get HEAD SHA from gh pr view: empty output");
        }
        Ok(sha)
    }
}

/// GitHub pull request review comments, through the authenticated `gh` CLI.
pub struct GitHubPrReview {
    gh: Gh,
    target: ReviewTarget,
    head_sha: OnceCell<String>,
}

/// Review comment as returned by `pulls/{n}/comments`
#[derive(Debug, Deserialize)]
struct ApiComment {
    path: Option<String>,
    line: Option<usize>,
    body: Option<String>,
    subject_type: Option<String>,
}

impl GitHubPrReview {
    pub fn new(target: ReviewTarget, repo_root: Option<String>) -> Self {
        Self {
            gh: Gh::new(repo_root),
            target,
            head_sha: OnceCell::new(),
        }
    }

    /// Diff command used when none is configured
    pub fn diff_command(target: &ReviewTarget) -> String {
        format!("gh pr diff {} --repo {}", target.pr, target.slug())
    }

    async fn head_sha(&self) -> Result<&str> {
        let sha = self
            .head_sha
            .get_or_try_init(|| self.gh.head_sha(&self.target))
            .await?;
        Ok(sha)
    }
}

#[async_trait]
impl CommentBackend for GitHubPrReview {
    fn name(&self) -> &str {
        "github-pr-review"
    }

    async fn list_comments(&self, cursor: Option<&str>) -> Result<CommentPage> {
        let endpoint = match cursor {
            Some(next) => next.to_string(),
            None => format!(
                "repos/{}/pulls/{}/comments?per_page=100",
                self.target.slug(),
                self.target.pr
            ),
        };
        let raw = self
            .gh
            .run(&["api".to_string(), "-i".to_string(), endpoint])
            .await
            .context("Failed to fetch PR comments")?;
        parse_comment_page(&raw)
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<()> {
        let sha = self.head_sha().await?;
        let args = create_args(&self.target, sha, comment);
        self.gh
            .run(&args)
            .await
            .with_context(|| format!("Failed to push comment on {}", comment.path))?;
        Ok(())
    }
}

fn parse_comment_page(raw: &str) -> Result<CommentPage> {
    let (headers, body) = split_response(raw)?;
    let next = next_cursor(&headers);
    let api: Vec<ApiComment> =
        serde_json::from_str(body).context("Failed to parse PR comments JSON")?;

    let comments = api
        .into_iter()
        .filter_map(|c| {
            let line = if c.subject_type.as_deref() == Some("file") {
                0
            } else {
                // outdated comments have no line on the current head
                c.line?
            };
            Some(PostedComment {
                path: c.path?,
                line,
                body: c.body?,
            })
        })
        .collect();

    Ok(CommentPage { comments, next })
}

/// `gh api` path of the `rel="next"` page, if any
pub(crate) fn next_cursor(headers: &[(String, String)]) -> Option<String> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("link"))
        .and_then(|(_, value)| next_link(value))
        .map(|url| api_path(&url).to_string())
}

/// Split `gh api -i` output into headers and body.
pub(crate) fn split_response(raw: &str) -> Result<(Vec<(String, String)>, &str)> {
    let mut lines = raw.split_inclusive('\n');
    let status = lines.next().context("empty response from gh api")?;
    if !status.starts_with("HTTP/") {
        anyhow::bail!("unexpected gh api output: {}", short_body(status));
    }

    let mut offset = status.len();
    let mut headers = Vec::new();
    for line in lines {
        offset += line.len();
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok((headers, &raw[offset..]));
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    anyhow::bail!("gh api response has no body")
}

/// The `rel="next"` target of an RFC 8288 Link header
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (url, params) = part.split_once(';')?;
        let is_next = params.split(';').any(|p| p.trim() == "rel=\"next\"");
        is_next.then(|| {
            url.trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}

/// `gh api` wants an endpoint path relative to the API root.
fn api_path(url: &str) -> &str {
    if let Some(idx) = url.find("/api/v3/") {
        return &url[idx + "/api/v3/".len()..];
    }
    url.strip_prefix("https://api.github.com/").unwrap_or(url)
}

fn create_args(target: &ReviewTarget, sha: &str, comment: &NewComment) -> Vec<String> {
    let mut args = vec![
        "api".to_string(),
        "-X".to_string(),
        "POST".to_string(),
        format!("repos/{}/pulls/{}/comments", target.slug(), target.pr),
        "-f".to_string(),
        format!("body={}", comment.body),
        "-f".to_string(),
        format!("path={}", comment.path),
        "-f".to_string(),
        format!("commit_id={}", sha),
    ];
    match comment.line {
        Some(line) => {
            if let Some(start) = comment.start_line.filter(|s| *s < line) {
                args.push("-F".to_string());
                args.push(format!("start_line={}", start));
                args.push("-f".to_string());
                args.push("start_side=RIGHT".to_string());
            }
            args.push("-F".to_string());
            args.push(format!("line={}", line));
            args.push("-f".to_string());
            args.push("side=RIGHT".to_string());
        }
        None => {
            args.push("-f".to_string());
            args.push("subject_type=file".to_string());
        }
    }
    args
}
