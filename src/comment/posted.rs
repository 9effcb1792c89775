use super::{CommentBackend, PostedComment};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};

/// Existing remote comments keyed by (path, line).
///
/// Built fresh from a full listing on every flush; never reused.
#[derive(Debug, Default)]
pub struct PostedCommentIndex {
    posted: HashMap<(String, usize), HashSet<String>>,
    pages: usize,
}

impl PostedCommentIndex {
    /// Walk every page of the backend's listing. Page N+1 is requested only
    /// after page N is merged; any page error fails the whole build.
    pub async fn build<B: CommentBackend + ?Sized>(backend: &B) -> Result<Self> {
        let mut index = PostedCommentIndex::default();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();

        loop {
            let page = backend
                .list_comments(cursor.as_deref())
                .await
                .with_context(|| match &cursor {
                    Some(c) => format!("listing page after cursor '{}'", c),
                    None => "listing first page".to_string(),
                })?;
            index.pages += 1;
            for comment in page.comments {
                index.insert(comment);
            }

            match page.next {
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        anyhow::bail!("pagination cursor '{}' repeated", next);
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }

        tracing::debug!(
            backend = backend.name(),
            pages = index.pages,
            comments = index.len(),
            "listed existing comments"
        );
        Ok(index)
    }

    pub fn insert(&mut self, comment: PostedComment) {
        if comment.path.is_empty() || comment.body.is_empty() {
            return;
        }
        self.posted
            .entry((comment.path, comment.line))
            .or_default()
            .insert(comment.body);
    }

    /// Exact (path, line, body) match only.
    pub fn is_posted(&self, path: &str, line: usize, body: &str) -> bool {
        self.posted
            .get(&(path.to_string(), line))
            .is_some_and(|bodies| bodies.contains(body))
    }

    pub fn len(&self) -> usize {
        self.posted.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.posted.is_empty()
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}
