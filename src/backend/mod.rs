//! Review-platform adapters. Each one implements only the two
//! [`CommentBackend`](crate::comment::CommentBackend) primitives; buffering,
//! de-duplication and fan-out live in [`crate::comment`].

pub mod bitbucket;
pub mod bitbucket_server;
pub mod github;
pub mod github_check;
pub mod gitlab;

pub use bitbucket::BitbucketCodeInsights;
pub use bitbucket_server::{BitbucketServerInsights, ServerAuth};
pub use github::GitHubPrReview;
pub use github_check::GitHubCheck;
pub use gitlab::GitLabMrDiscussion;

/// The pull/merge request a backend comments on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewTarget {
    pub owner: String,
    pub repo: String,
    pub pr: u64,
    /// Head commit, when known up front
    pub sha: Option<String>,
}

impl ReviewTarget {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Pass successful responses through; turn anything else into an error
/// carrying the status and the start of the response body.
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), body = %body, "{} failed", what);
    anyhow::bail!("{} returned HTTP {}: {}", what, status.as_u16(), short_body(&body))
}

/// Percent-encode everything but RFC 3986 unreserved characters, for path
/// segments like GitLab's `namespace%2Fproject` ids and query values.
pub(crate) fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Trim an error body down to something readable in one log line.
pub(crate) fn short_body(body: &str) -> String {
    const MAX: usize = 300;
    let body = body.trim();
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_joins_owner_and_repo() {
        let target = ReviewTarget {
            owner: "group/sub".to_string(),
            repo: "proj".to_string(),
            pr: 3,
            sha: None,
        };
        assert_eq!(target.slug(), "group/sub/proj");
    }

    #[test]
    fn components_are_percent_encoded() {
        assert_eq!(encode_component("group/sub/proj"), "group%2Fsub%2Fproj");
        assert_eq!(encode_component("a.b-c_d"), "a.b-c_d");
        assert_eq!(encode_component("lint check"), "lint%20check");
    }

    #[test]
    fn short_body_truncates_on_char_boundary() {
        let long = "é".repeat(400);
        let short = short_body(&long);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), 303);
        assert_eq!(short_body("  ok \n"), "ok");
    }
}
