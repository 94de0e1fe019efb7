//! The `active` filter.
//!
//! Every call through the filter is counted as active in the shared
//! [`StatusRegistry`] until it finishes. A call whose future is dropped
//! before completion is recorded as a failure so the active count never
//! leaks.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{Filter, Next};
use crate::invocation::Invocation;
use crate::result::RpcResult;
use crate::status::StatusRegistry;
use crate::url::Url;

pub const ACTIVE_FILTER: &str = "active";

/// Counts active calls and records their outcome in a [`StatusRegistry`].
pub struct ActiveFilter {
    status: Arc<StatusRegistry>,
}

impl ActiveFilter {
    #[must_use]
    pub const fn new(status: Arc<StatusRegistry>) -> Self {
        Self { status }
    }

    fn begin<'a>(&'a self, url: &'a Url, method: &'a str) -> Active<'a> {
        self.status.begin(url, method);
        Active {
            status: &self.status,
            url,
            method,
            start: Instant::now(),
            outcome: None,
        }
    }
}

/// One active call. Ends as failed unless [`Active::finish`] ran first.
struct Active<'a> {
    status: &'a StatusRegistry,
    url: &'a Url,
    method: &'a str,
    start: Instant,
    outcome: Option<bool>,
}

impl Active<'_> {
    fn finish(mut self, succeeded: bool) {
        self.outcome = Some(succeeded);
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.status.end(
            self.url,
            self.method,
            self.start.elapsed(),
            self.outcome.unwrap_or(false),
        );
    }
}

#[async_trait]
impl Filter for ActiveFilter {
    async fn invoke(&self, next: Next<'_>, invocation: &mut Invocation) -> RpcResult {
        let method = invocation.method().to_owned();
        let active = self.begin(next.url(), &method);
        let result = next.run(invocation).await;
        active.finish(result.is_ok());
        result
    }
}
