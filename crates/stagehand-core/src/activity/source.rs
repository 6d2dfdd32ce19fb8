//! Remote activity status source trait and its type-erased wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stagehand_types::activity::ActivityStatusReport;
use stagehand_types::error::SourceError;

/// Status queries the remote management system offers for async operations.
///
/// Implemented by whatever HTTP/RPC client talks to the remote system. The
/// tracker prefers `query_window`, one request covering every outstanding id,
/// and falls back to `query_one` per id when the bulk call fails.
pub trait ActivitySource: Send + Sync {
    /// Every status record changed since `since`. `correlation_ids` lists the
    /// ids the caller cares about; implementations may use it to narrow the
    /// query or ignore it. Records for other ids are ignored by the tracker.
    fn query_window(
        &self,
        since: DateTime<Utc>,
        correlation_ids: &[String],
    ) -> impl Future<Output = Result<Vec<ActivityStatusReport>, SourceError>> + Send;

    /// Current status of a single operation.
    fn query_one(
        &self,
        correlation_id: &str,
    ) -> impl Future<Output = Result<ActivityStatusReport, SourceError>> + Send;
}

/// Object-safe version of [`ActivitySource`] with boxed futures.
pub trait ActivitySourceDyn: Send + Sync {
    fn query_window_boxed<'a>(
        &'a self,
        since: DateTime<Utc>,
        correlation_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ActivityStatusReport>, SourceError>> + Send + 'a>>;

    fn query_one_boxed<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ActivityStatusReport, SourceError>> + Send + 'a>>;
}

impl<T: ActivitySource> ActivitySourceDyn for T {
    fn query_window_boxed<'a>(
        &'a self,
        since: DateTime<Utc>,
        correlation_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ActivityStatusReport>, SourceError>> + Send + 'a>>
    {
        Box::pin(self.query_window(since, correlation_ids))
    }

    fn query_one_boxed<'a>(
        &'a self,
        correlation_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ActivityStatusReport, SourceError>> + Send + 'a>> {
        Box::pin(self.query_one(correlation_id))
    }
}

/// Type-erased activity source, shareable between the tracker's poll loop and
/// its callers.
#[derive(Clone)]
pub struct BoxActivitySource {
    inner: Arc<dyn ActivitySourceDyn>,
}

impl BoxActivitySource {
    pub fn new<T: ActivitySource + 'static>(source: T) -> Self {
        Self {
            inner: Arc::new(source),
        }
    }

    pub fn from_arc<T: ActivitySource + 'static>(source: Arc<T>) -> Self {
        Self { inner: source }
    }

    pub async fn query_window(
        &self,
        since: DateTime<Utc>,
        correlation_ids: &[String],
    ) -> Result<Vec<ActivityStatusReport>, SourceError> {
        self.inner.query_window_boxed(since, correlation_ids).await
    }

    pub async fn query_one(&self, correlation_id: &str) -> Result<ActivityStatusReport, SourceError> {
        self.inner.query_one_boxed(correlation_id).await
    }
}

impl std::fmt::Debug for BoxActivitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxActivitySource").finish_non_exhaustive()
    }
}
