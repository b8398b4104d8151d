//! # Error Handling Module
//!
//! Failure taxonomy for the HelixAgent ensemble. Every operation in the
//! crate categorizes its failures into [`ProviderError`] (upstream-facing)
//! or [`EnsembleError`] (orchestration-level); no other error kinds leak
//! to callers.
//!
//! ## Taxonomy
//!
//! - **Unauthenticated** - credential missing/invalid; fatal, never retried.
//! - **RateLimited** - upstream throttling; retried with backoff up to the
//!   chain cap. Carries the upstream `retry_after` hint when one was given.
//! - **Timeout** - deadline exceeded; the router moves to the next provider.
//! - **ProviderBusy** - 5xx/overload/circuit-open; next provider.
//! - **ContentFiltered** - upstream refused on content policy; fatal.
//! - **InvalidRequest** - malformed user input; fatal, surfaced as 4xx.
//! - **Transport** - network/DNS/subprocess failure; next provider.
//! - **Internal** - a bug; logged and surfaced as 5xx.
//!
//! Orchestration adds **NoEligibleProvider** (pool empty after filters) and
//! **NoConsensus** (rounds exhausted without any synthesis at all - the
//! usual below-threshold case is returned as a soft result instead).

use std::time::Duration;
use thiserror::Error;

/// Normalized upstream-facing errors.
///
/// Adapters translate their wire-level failures into exactly these variants;
/// the router's retry decisions are driven by [`ProviderError::is_retryable`].
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Credential missing or rejected by the upstream
    #[error("authentication failed: {message}")]
    Unauthenticated { message: String },

    /// Upstream throttling, with the retry-after hint when one was provided
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Deadline or per-call timeout exceeded
    #[error("request timed out")]
    Timeout,

    /// Upstream refused the content on policy grounds
    #[error("content filtered: {reason}")]
    ContentFiltered { reason: String },

    /// Upstream overloaded, returned 5xx, or the circuit is open
    #[error("provider busy: {message}")]
    ProviderBusy { message: String },

    /// The request itself is malformed
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Socket, DNS, or subprocess-level failure
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A bug on our side
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProviderError {
    /// Whether the fallback chain should continue past this error.
    ///
    /// `Unauthenticated`, `ContentFiltered` and `InvalidRequest` abort the
    /// chain; everything else moves on to the next provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::ProviderBusy { .. }
                | ProviderError::Transport { .. }
        )
    }

    /// Stable machine-readable kind, used in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Unauthenticated { .. } => "unauthenticated",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout => "timeout",
            ProviderError::ContentFiltered { .. } => "content_filtered",
            ProviderError::ProviderBusy { .. } => "provider_busy",
            ProviderError::InvalidRequest { .. } => "invalid_request",
            ProviderError::Transport { .. } => "transport",
            ProviderError::Internal { .. } => "internal",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() || err.is_request() {
            ProviderError::Transport {
                message: err.to_string(),
            }
        } else if err.is_decode() {
            ProviderError::Transport {
                message: format!("malformed upstream response: {err}"),
            }
        } else {
            ProviderError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Transport {
            message: format!("malformed upstream payload: {err}"),
        }
    }
}

/// Orchestration-level errors surfaced by the debate engine and router.
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// A provider error that exhausted or aborted the fallback chain
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The effective pool was empty after admissibility and capability filters
    #[error("no eligible provider: {message}")]
    NoEligibleProvider { message: String },

    /// Rounds exhausted without producing any synthesis
    #[error("no consensus reached (confidence {confidence:.2})")]
    NoConsensus { confidence: f64 },

    /// The request deadline elapsed before a result was produced
    #[error("debate timed out")]
    Timeout,

    /// A bug on our side
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EnsembleError {
    /// Stable machine-readable kind, used in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EnsembleError::Provider(e) => e.kind(),
            EnsembleError::NoEligibleProvider { .. } => "no_eligible_provider",
            EnsembleError::NoConsensus { .. } => "no_consensus",
            EnsembleError::Timeout => "timeout",
            EnsembleError::Internal { .. } => "internal",
        }
    }
}

/// Result type for ensemble operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;
