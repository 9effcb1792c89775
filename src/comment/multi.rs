use super::{CommentService, FlushError, FlushReport};
use crate::filter::FilteredDiagnostic;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

/// Fans posts and flushes out to several services.
#[derive(Default)]
pub struct MultiCommentService {
    services: Vec<Box<dyn CommentService>>,
}

impl MultiCommentService {
    pub fn new(services: Vec<Box<dyn CommentService>>) -> Self {
        Self { services }
    }

    pub fn push(&mut self, service: Box<dyn CommentService>) {
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl CommentService for MultiCommentService {
    fn name(&self) -> &str {
        "multi"
    }

    /// Stops at the first service that refuses the diagnostic.
    async fn post(
        &self,
        diagnostic: FilteredDiagnostic,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for service in &self.services {
            service
                .post(diagnostic.clone(), cancel)
                .await
                .with_context(|| format!("{}: post failed", service.name()))?;
        }
        Ok(())
    }

    /// Flushes every service, even after one has failed.
    async fn flush(&self, cancel: &CancellationToken) -> Result<FlushReport, FlushError> {
        let results = join_all(self.services.iter().map(|s| s.flush(cancel))).await;

        let mut report = FlushReport::default();
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(r) => report.merge(r),
                Err(e) => errors.push(e),
            }
        }
        match FlushError::combine(errors) {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::testing::{filtered, MockBackend};
    use crate::comment::BufferedCommentService;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn mock(name: &str, fail_list: bool) -> BufferedCommentService<MockBackend> {
        let mut backend = MockBackend::new(Vec::new());
        backend.name = name.to_string();
        backend.fail_list = fail_list;
        BufferedCommentService::new(backend)
    }

    #[tokio::test]
    async fn reports_are_summed() {
        let multi = MultiCommentService::new(vec![
            Box::new(mock("one", false)),
            Box::new(mock("two", false)),
        ]);
        let cancel = CancellationToken::new();
        multi.post(filtered("a.rs", 1, "x", true), &cancel).await.unwrap();
        multi.post(filtered("a.rs", 9, "y", false), &cancel).await.unwrap();

        let report = multi.flush(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.buffered, 4);
        assert_eq!(report.posted, 2);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn failing_service_does_not_skip_others() {
        let healthy = Arc::new(MockBackend::new(Vec::new()));
        let multi = MultiCommentService::new(vec![
            Box::new(mock("down", true)),
            Box::new(BufferedCommentService::new(Arc::clone(&healthy))),
            Box::new(mock("also-down", true)),
        ]);
        multi
            .post(filtered("a.rs", 1, "x", true), &CancellationToken::new())
            .await
            .unwrap();

        let err = multi.flush(&CancellationToken::new()).await.unwrap_err();
        match &err {
            FlushError::Multiple(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        let text = err.to_string();
        assert!(text.contains("down: failed to list"));
        assert!(text.contains("also-down: failed to list"));
        assert!(!err.is_cancelled());

        assert_eq!(healthy.list_calls.load(Ordering::SeqCst), 1);
        let created = healthy.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].path, "a.rs");
    }

    #[tokio::test]
    async fn post_stops_after_cancel() {
        let first = Arc::new(MockBackend::new(Vec::new()));
        let multi = MultiCommentService::new(vec![
            Box::new(BufferedCommentService::new(Arc::clone(&first))),
            Box::new(mock("second", false)),
        ]);
        let token = CancellationToken::new();
        token.cancel();
        let err = multi.post(filtered("a.rs", 1, "x", true), &token).await.unwrap_err();
        assert!(format!("{:#}", err).contains("mock: post failed"));

        let report = multi.flush(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.buffered, 0);
    }

    #[tokio::test]
    async fn single_failure_is_not_wrapped() {
        let multi = MultiCommentService::new(vec![
            Box::new(mock("ok", false)),
            Box::new(mock("down", true)),
        ]);
        let err = multi.flush(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, FlushError::List { ref backend, .. } if backend == "down"));
    }

    #[tokio::test]
    async fn empty_multi_flushes_cleanly() {
        let multi = MultiCommentService::default();
        assert!(multi.is_empty());
        let report = multi.flush(&CancellationToken::new()).await.unwrap();
        assert_eq!(report, FlushReport::default());
    }
}
