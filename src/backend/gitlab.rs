use super::{check_status, encode_component, ReviewTarget};
use crate::comment::{CommentBackend, CommentPage, NewComment, PostedComment};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";
const PER_PAGE: usize = 100;

/// GitLab merge request discussions over the REST API.
pub struct GitLabMrDiscussion {
    client: reqwest::Client,
    api_url: String,
    token: String,
    target: ReviewTarget,
    diff_refs: OnceCell<DiffRefs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct DiffRefs {
    base_sha: String,
    head_sha: String,
    start_sha: String,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    diff_refs: Option<DiffRefs>,
}

#[derive(Debug, Deserialize)]
struct Discussion {
    #[serde(default)]
    notes: Vec<Note>,
}

#[derive(Debug, Deserialize)]
struct Note {
    #[serde(default)]
    body: String,
    position: Option<NotePosition>,
}

#[derive(Debug, Deserialize)]
struct NotePosition {
    new_path: Option<String>,
    new_line: Option<usize>,
    position_type: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct NewDiscussion<'a> {
    body: Cow<'a, str>,
    position: NewPosition<'a>,
}

#[derive(Debug, Serialize, PartialEq)]
struct NewPosition<'a> {
    base_sha: &'a str,
    start_sha: &'a str,
    head_sha: &'a str,
    position_type: &'static str,
    new_path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_line: Option<usize>,
}

impl GitLabMrDiscussion {
    pub fn new(
        api_url: &str,
        token: String,
        target: ReviewTarget,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            target,
            diff_refs: OnceCell::new(),
        })
    }

    fn mr_url(&self) -> String {
        format!(
            "{}/projects/{}/merge_requests/{}",
            self.api_url,
            encode_component(&self.target.slug()),
            self.target.pr
        )
    }

    async fn diff_refs(&self) -> Result<&DiffRefs> {
        self.diff_refs
            .get_or_try_init(|| async {
                let response = self
                    .client
                    .get(self.mr_url())
                    .header("PRIVATE-TOKEN", &self.token)
                    .send()
                    .await
                    .context("Failed to get merge request")?;
                let mr: MergeRequest = check_status(response, "GET merge request")
                    .await?
                    .json()
                    .await
                    .context("Failed to parse merge request JSON")?;
                mr.diff_refs
                    .context("merge request has no diff_refs yet; is it still being prepared?")
            })
            .await
    }
}

#[async_trait]
impl CommentBackend for GitLabMrDiscussion {
    fn name(&self) -> &str {
        "gitlab-mr-discussion"
    }

    async fn list_comments(&self, cursor: Option<&str>) -> Result<CommentPage> {
        let page = cursor.unwrap_or("1");
        let response = self
            .client
            .get(format!(
                "{}/discussions?per_page={}&page={}",
                self.mr_url(),
                PER_PAGE,
                page
            ))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .context("Failed to list merge request discussions")?;
        let response = check_status(response, "GET discussions").await?;

        let next = response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let discussions: Vec<Discussion> = response
            .json()
            .await
            .context("Failed to parse discussions JSON")?;

        Ok(CommentPage {
            comments: posted_comments(discussions),
            next,
        })
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<()> {
        let refs = self.diff_refs().await?;
        let head_sha = self.target.sha.as_deref().unwrap_or(&refs.head_sha);
        let payload = discussion_payload(refs, head_sha, comment);

        let response = self
            .client
            .post(format!("{}/discussions", self.mr_url()))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&payload)
            .send()
            .await
            .context("Failed to create merge request discussion")?;
        check_status(response, "POST discussion").await?;
        Ok(())
    }
}

fn posted_comments(discussions: Vec<Discussion>) -> Vec<PostedComment> {
    discussions
        .into_iter()
        .flat_map(|d| d.notes)
        .filter_map(|note| {
            let pos = note.position?;
            let line = match (pos.new_line, pos.position_type.as_deref()) {
                (Some(line), _) => line,
                (None, Some("file")) => 0,
                // removed-line notes have no new-side anchor
                (None, _) => return None,
            };
            Some(PostedComment {
                path: pos.new_path?,
                line,
                body: canonical_body(&note.body),
            })
        })
        .collect()
}

fn discussion_payload<'a>(
    refs: &'a DiffRefs,
    head_sha: &'a str,
    comment: &'a NewComment,
) -> NewDiscussion<'a> {
    let old = match (&comment.old_path, comment.old_line) {
        (Some(path), Some(line)) if line > 0 => Some((path.as_str(), line)),
        _ => None,
    };
    NewDiscussion {
        body: note_body(comment),
        position: NewPosition {
            base_sha: &refs.base_sha,
            start_sha: &refs.start_sha,
            head_sha,
            position_type: if comment.line.is_some() { "text" } else { "file" },
            new_path: &comment.path,
            new_line: comment.line,
            old_path: old.map(|(p, _)| p),
            old_line: old.map(|(_, l)| l),
        },
    }
}

/// A bare suggestion fence only replaces the anchor line on GitLab; a
/// multi-line replacement needs the `-N+0` offset.
fn note_body(comment: &NewComment) -> Cow<'_, str> {
    let above = match (comment.start_line, comment.line) {
        (Some(start), Some(line)) if start < line => line - start,
        _ => return Cow::Borrowed(&comment.body),
    };
    let mut out = String::with_capacity(comment.body.len() + 8);
    let mut done = false;
    for line in comment.body.split_inclusive('\n') {
        match fence_info(line) {
            Some((fence, "suggestion")) if !done => {
                out.push_str(&format!("{}suggestion:-{}+0", fence, above));
                if line.ends_with('\n') {
                    out.push('\n');
                }
                done = true;
            }
            _ => out.push_str(line),
        }
    }
    Cow::Owned(out)
}

/// Undo [`note_body`] so listed notes compare equal to rendered bodies.
fn canonical_body(note: &str) -> String {
    let mut out = String::with_capacity(note.len());
    for line in note.split_inclusive('\n') {
        let offset_fence = fence_info(line).and_then(|(fence, info)| {
            let above = info.strip_prefix("suggestion:-")?.strip_suffix("+0")?;
            (!above.is_empty() && above.bytes().all(|b| b.is_ascii_digit())).then_some(fence)
        });
        match offset_fence {
            Some(fence) => {
                out.push_str(fence);
                out.push_str("suggestion");
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    out
}

/// Split an opening code fence line into its backtick run and info string.
fn fence_info(line: &str) -> Option<(&str, &str)> {
    let ticks = line.bytes().take_while(|b| *b == b'`').count();
    (ticks >= 3).then(|| (&line[..ticks], line[ticks..].trim_end_matches(['\r', '\n'])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::Severity;
    use serde_json::json;

    fn refs() -> DiffRefs {
        DiffRefs {
            base_sha: "base".to_string(),
            head_sha: "head".to_string(),
            start_sha: "start".to_string(),
        }
    }

    fn comment(line: Option<usize>, old: Option<(&str, usize)>) -> NewComment {
        NewComment {
            path: "new_file.go".to_string(),
            line,
            start_line: None,
            old_path: old.map(|(p, _)| p.to_string()),
            old_line: old.map(|(_, l)| l),
            body: "**[golint]** message".to_string(),
            severity: Severity::Unknown,
            link: None,
        }
    }

    #[test]
    fn text_position_with_old_side() {
        let refs = refs();
        let c = comment(Some(14), Some(("old_file.go", 7)));
        let payload = serde_json::to_value(discussion_payload(&refs, "sha", &c)).unwrap();
        assert_eq!(
            payload,
            json!({
                "body": "**[golint]** message",
                "position": {
                    "base_sha": "base",
                    "start_sha": "start",
                    "head_sha": "sha",
                    "position_type": "text",
                    "new_path": "new_file.go",
                    "new_line": 14,
                    "old_path": "old_file.go",
                    "old_line": 7
                }
            })
        );
    }

    #[test]
    fn added_line_has_no_old_side() {
        let refs = refs();
        let c = comment(Some(3), None);
        let payload = serde_json::to_value(discussion_payload(&refs, "head", &c)).unwrap();
        assert!(payload["position"].get("old_path").is_none());
        assert!(payload["position"].get("old_line").is_none());
    }

    #[test]
    fn file_level_uses_file_position() {
        let refs = refs();
        let c = comment(None, None);
        let payload = serde_json::to_value(discussion_payload(&refs, "head", &c)).unwrap();
        assert_eq!(payload["position"]["position_type"], "file");
        assert!(payload["position"].get("new_line").is_none());
    }

    #[test]
    fn listing_keeps_only_positioned_notes() {
        let discussions: Vec<Discussion> = serde_json::from_value(json!([
            {"notes": [
                {"body": "a", "position": {"new_path": "x.go", "new_line": 3, "position_type": "text"}},
                {"body": "reply without position"}
            ]},
            {"notes": [
                {"body": "b", "position": {"new_path": "y.go", "new_line": null, "position_type": "file"}},
                {"body": "c", "position": {"new_path": "z.go", "new_line": null, "position_type": "text"}}
            ]}
        ]))
        .unwrap();
        let posted = posted_comments(discussions);
        assert_eq!(
            posted,
            vec![
                PostedComment {
                    path: "x.go".to_string(),
                    line: 3,
                    body: "a".to_string()
                },
                PostedComment {
                    path: "y.go".to_string(),
                    line: 0,
                    body: "b".to_string()
                },
            ]
        );
    }

    #[test]
    fn multi_line_suggestion_gets_line_offset() {
        let refs = refs();
        let mut c = comment(Some(5), None);
        c.start_line = Some(3);
        c.body = "**[lint]** collapse\n\n```suggestion\none_line();\n```".to_string();
        let payload = serde_json::to_value(discussion_payload(&refs, "head", &c)).unwrap();
        assert_eq!(
            payload["body"],
            "**[lint]** collapse\n\n```suggestion:-2+0\none_line();\n```"
        );
        assert_eq!(payload["position"]["new_line"], 5);

        // listing maps it back to the rendered body
        let note = payload["body"].as_str().unwrap();
        assert_eq!(canonical_body(note), c.body);
    }

    #[test]
    fn single_line_suggestion_is_sent_as_is() {
        let refs = refs();
        let mut c = comment(Some(5), None);
        c.body = "x\n\n```suggestion\ny\n```".to_string();
        let payload = serde_json::to_value(discussion_payload(&refs, "head", &c)).unwrap();
        assert_eq!(payload["body"], "x\n\n```suggestion\ny\n```");
        assert_eq!(canonical_body("```suggestion:-x+0\n"), "```suggestion:-x+0\n");
    }

    #[test]
    fn mr_url_shape() {
        let backend = GitLabMrDiscussion::new(
            "https://gitlab.example.com/api/v4/",
            "t".to_string(),
            ReviewTarget {
                owner: "group".to_string(),
                repo: "proj".to_string(),
                pr: 12,
                sha: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            backend.mr_url(),
            "https://gitlab.example.com/api/v4/projects/group%2Fproj/merge_requests/12"
        );
    }
}
