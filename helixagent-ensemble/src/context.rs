//! Ambient per-request context: correlation id, deadline, cancellation.
//!
//! Every suspension point in the crate (upstream calls, store calls,
//! subprocess reads, stream sends) races against the context. Deadline
//! exhaustion and cancellation both resolve to `ProviderError::Timeout` so
//! callers see a single taxonomy kind.

use crate::error::ProviderError;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellable context with an optional absolute deadline.
///
/// Cloning is cheap; children created with [`RequestContext::child`] are
/// cancelled when the parent is.
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Context with a fresh correlation id and no deadline.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Context with a caller-supplied correlation id (e.g. `x-request-id`).
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context that expires `timeout` from now. An existing earlier
    /// deadline wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            id: self.id.clone(),
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Child context cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            id: self.id.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel this context and all children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Run a fallible future under this context. Resolves to
    /// `ProviderError::Timeout` on cancellation or deadline exhaustion; the
    /// inner future is dropped, which aborts in-flight upstream work.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        if self.is_cancelled() {
            return Err(ProviderError::Timeout);
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Err(ProviderError::Timeout),
                outcome = tokio::time::timeout_at(deadline.into(), fut) => {
                    outcome.unwrap_or(Err(ProviderError::Timeout))
                }
            },
            None => tokio::select! {
                _ = self.cancel.cancelled() => Err(ProviderError::Timeout),
                outcome = fut => outcome,
            },
        }
    }

    /// Cancellation-aware sleep. Returns `Err(Timeout)` if the context ends
    /// first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ProviderError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
