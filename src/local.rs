use crate::comment::{CommentService, FlushError, FlushReport};
use crate::filter::FilteredDiagnostic;
use anyhow::Context;
use async_trait::async_trait;
use std::io::Write;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Prints in-diff diagnostics as `path:line: [tool] message`.
///
/// Writes happen on post; there is nothing to flush.
pub struct LocalCommentWriter<W> {
    out: Mutex<W>,
}

impl LocalCommentWriter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> LocalCommentWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

fn format_line(result: &FilteredDiagnostic) -> String {
    let d = &result.diagnostic;
    let mut line = format!("{}:{}:", d.path, d.line);
    if let Some(column) = d.column.filter(|c| *c > 0) {
        line.push_str(&format!("{}:", column));
    }
    line.push(' ');
    if let Some(tool) = d.source.as_deref().filter(|s| !s.is_empty()) {
        line.push_str(&format!("[{}] ", tool));
    }
    line.push_str(d.message.trim_end());
    line
}

#[async_trait]
impl<W: Write + Send> CommentService for LocalCommentWriter<W> {
    fn name(&self) -> &str {
        "local"
    }

    async fn post(
        &self,
        diagnostic: FilteredDiagnostic,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled before printing");
        }
        if !diagnostic.in_diff {
            return Ok(());
        }
        let mut out = self.out.lock().await;
        writeln!(out, "{}", format_line(&diagnostic)).context("Failed to write diagnostic")?;
        Ok(())
    }

    async fn flush(&self, _cancel: &CancellationToken) -> Result<FlushReport, FlushError> {
        // best effort: stdout going away is not a posting failure
        if let Err(e) = self.out.lock().await.flush() {
            tracing::debug!(error = %e, "failed to flush local output");
        }
        Ok(FlushReport::default())
    }
}
