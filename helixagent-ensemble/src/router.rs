//! # Fallback Chain Execution
//!
//! Runs one logical call against an ordered provider chain. Retryable
//! failures (`RateLimited`, `Timeout`, `ProviderBusy`, `Transport`) move on
//! to the next provider; fatal failures (`Unauthenticated`,
//! `ContentFiltered`, `InvalidRequest`) abort the chain and surface
//! unchanged. Attempts are capped across the whole chain and separated by
//! jittered exponential backoff.
//!
//! Every attempt goes through the provider's circuit breaker, so an open
//! circuit is just another `ProviderBusy` hop to the next provider.

use crate::context::RequestContext;
use crate::error::ProviderError;
use crate::registry::RegisteredProvider;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Extra attempts allowed across the whole chain after the first
    pub max_retries: u32,
    #[serde(with = "crate::providers::duration_secs")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "crate::providers::duration_secs")]
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

/// A successful chain call: the value, which provider produced it, and how
/// many retries it took.
#[derive(Debug)]
pub struct ChainOutcome<T> {
    pub value: T,
    pub provider_id: String,
    pub retries: u32,
}

/// Execute `operation` against the chain under `policy` and `ctx`.
///
/// The chain is walked round-robin: after the last provider the walk wraps
/// to the first, until the attempt cap is reached. A `RateLimited` error
/// carrying a `retry_after` hint stretches the backoff to at least that
/// hint.
pub async fn call_chain<T, F>(
    chain: &[Arc<RegisteredProvider>],
    policy: &RetryPolicy,
    ctx: &RequestContext,
    operation: F,
) -> Result<ChainOutcome<T>, ProviderError>
where
    F: Fn(Arc<RegisteredProvider>) -> BoxFuture<'static, Result<T, ProviderError>>,
{
    if chain.is_empty() {
        return Err(ProviderError::Internal {
            message: "fallback chain is empty".to_string(),
        });
    }

    let max_attempts = policy.max_retries + 1;
    let mut delay = policy.initial_delay;
    let mut last_error = ProviderError::Timeout;

    for attempt in 0..max_attempts {
        if ctx.is_cancelled() {
            return Err(ProviderError::Timeout);
        }

        let provider = chain[attempt as usize % chain.len()].clone();
        let provider_id = provider.config.id.clone();
        let breaker = provider.breaker.clone();

        let call = operation(provider);
        let result = ctx.run(breaker.call(move || call)).await;

        match result {
            Ok(value) => {
                return Ok(ChainOutcome {
                    value,
                    provider_id,
                    retries: attempt,
                });
            }
            Err(error) if error.is_retryable() => {
                tracing::debug!(
                    provider = %provider_id,
                    attempt,
                    error = %error,
                    "chain attempt failed, trying next"
                );
                let hint = match &error {
                    ProviderError::RateLimited {
                        retry_after: Some(hint),
                    } => Some(*hint),
                    _ => None,
                };
                last_error = error;

                if attempt + 1 < max_attempts {
                    let mut pause = delay;
                    if let Some(hint) = hint {
                        pause = pause.max(hint);
                    }
                    pause = jitter(pause, policy.jitter).min(policy.max_delay);
                    ctx.sleep(pause).await?;
                    delay = delay.mul_f64(policy.multiplier).min(policy.max_delay);
                }
            }
            Err(fatal) => return Err(fatal),
        }
    }

    Err(last_error)
}

fn jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range(0.0..fraction);
    base + base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{registry_with, StaticAdapter};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back() {
        let primary =
            StaticAdapter::failing("primary", || ProviderError::RateLimited { retry_after: None });
        let fallback = StaticAdapter::answering("fallback", "from fallback");
        let registry = registry_with(vec![primary.clone(), fallback.clone()]).await;

        let chain = vec![
            registry.get("primary").unwrap(),
            registry.get("fallback").unwrap(),
        ];
        let ctx = RequestContext::new();
        let outcome = call_chain(&chain, &quick_policy(), &ctx, |provider| {
            Box::pin(async move {
                provider
                    .adapter
                    .complete(crate::models::ChatRequest {
                        model: "m".into(),
                        messages: vec![crate::models::Message::user("q")],
                        ..Default::default()
                    })
                    .await
            })
        })
        .await
        .unwrap();

        assert_eq!(outcome.provider_id, "fallback");
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.value.content(), "from fallback");
    }

    #[tokio::test]
    async fn content_filtered_aborts_without_fallback() {
        let primary = StaticAdapter::failing("primary", || ProviderError::ContentFiltered {
            reason: "policy".into(),
        });
        let fallback = StaticAdapter::answering("fallback", "never");
        let registry = registry_with(vec![primary, fallback.clone()]).await;

        let chain = vec![
            registry.get("primary").unwrap(),
            registry.get("fallback").unwrap(),
        ];
        let ctx = RequestContext::new();
        let err = call_chain(&chain, &quick_policy(), &ctx, |provider| {
            Box::pin(async move {
                provider
                    .adapter
                    .complete(crate::models::ChatRequest {
                        model: "m".into(),
                        messages: vec![crate::models::Message::user("q")],
                        ..Default::default()
                    })
                    .await
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::ContentFiltered { .. }));
        assert_eq!(fallback.calls.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn attempts_are_capped_across_the_chain() {
        let a = StaticAdapter::failing("a", || ProviderError::Transport { message: "x".into() });
        let b = StaticAdapter::failing("b", || ProviderError::Transport { message: "x".into() });
        let registry = registry_with(vec![a.clone(), b.clone()]).await;

        let chain = vec![registry.get("a").unwrap(), registry.get("b").unwrap()];
        let ctx = RequestContext::new();
        let err = call_chain(&chain, &quick_policy(), &ctx, |provider| {
            Box::pin(async move {
                provider
                    .adapter
                    .complete(crate::models::ChatRequest::default())
                    .await
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::Transport { .. }));
        let total = a.calls.load(std::sync::atomic::Ordering::Relaxed)
            + b.calls.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(total, 4); // max_retries + 1
    }

    #[tokio::test]
    async fn deadline_cuts_the_chain_short() {
        let slow = StaticAdapter::slow("slow", "late", Duration::from_secs(2));
        let registry = registry_with(vec![slow]).await;
        let chain = vec![registry.get("slow").unwrap()];
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(50));

        let start = std::time::Instant::now();
        let err = call_chain(&chain, &quick_policy(), &ctx, |provider| {
            Box::pin(async move {
                provider
                    .adapter
                    .complete(crate::models::ChatRequest::default())
                    .await
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::Timeout));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
