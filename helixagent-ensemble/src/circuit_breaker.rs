//! # Circuit Breaker
//!
//! Per-provider breaker guarding every upstream call. Three states:
//!
//! - **Closed** - normal operation; provider-fault failures are counted in
//!   a rolling window.
//! - **Open** - all calls short-circuit with `ProviderBusy` until the
//!   cooldown elapses.
//! - **HalfOpen** - exactly one recovery probe is allowed in flight;
//!   concurrent callers receive `ProviderBusy` immediately. Probe success
//!   closes the circuit, probe failure re-opens it and resets the cooldown.
//!
//! Only provider-fault errors (`RateLimited`, `Timeout`, `ProviderBusy`,
//! `Transport`) trip the breaker; user-input and credential errors say
//! nothing about provider health.

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the rolling window before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe
    #[serde(with = "crate::providers::duration_secs")]
    pub cooldown: Duration,
    /// Rolling window over which failures are counted
    #[serde(with = "crate::providers::duration_secs")]
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: bool,
}

/// Point-in-time view used by health snapshots.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub opened_at: Option<Instant>,
    pub recent_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

enum Permit {
    Normal,
    Probe,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: false,
            }),
        }
    }

    /// Run an operation under the breaker. The operation's own error is
    /// returned unchanged; the breaker only injects `ProviderBusy` when
    /// short-circuiting.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(&permit),
            Err(e) if counts_as_failure(e) => self.on_failure(&permit),
            // Non-fault errors release a probe without a verdict
            Err(_) => self.release_probe(&permit),
        }
        result
    }

    fn acquire(&self) -> Result<Permit, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = true;
                    tracing::info!(breaker = %self.name, "circuit half-open, probing");
                    Ok(Permit::Probe)
                } else {
                    Err(ProviderError::ProviderBusy {
                        message: format!("circuit open for {}", self.name),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight {
                    Err(ProviderError::ProviderBusy {
                        message: format!("recovery probe in flight for {}", self.name),
                    })
                } else {
                    inner.half_open_in_flight = true;
                    Ok(Permit::Probe)
                }
            }
        }
    }

    fn on_success(&self, permit: &Permit) {
        let mut inner = self.inner.lock().unwrap();
        match permit {
            Permit::Probe => {
                inner.state = CircuitState::Closed;
                inner.failures.clear();
                inner.opened_at = None;
                inner.half_open_in_flight = false;
                tracing::info!(breaker = %self.name, "circuit closed after probe");
            }
            Permit::Normal => {
                let window = self.config.failure_window;
                prune_window(&mut inner.failures, window);
            }
        }
    }

    fn on_failure(&self, permit: &Permit) {
        let mut inner = self.inner.lock().unwrap();
        match permit {
            Permit::Probe => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = false;
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
            }
            Permit::Normal => {
                inner.failures.push_back(Instant::now());
                let window = self.config.failure_window;
                prune_window(&mut inner.failures, window);
                if inner.state == CircuitState::Closed
                    && inner.failures.len() as u32 >= self.config.failure_threshold
                {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.failures.clear();
                    tracing::warn!(
                        breaker = %self.name,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
        }
    }

    fn release_probe(&self, permit: &Permit) {
        if matches!(permit, Permit::Probe) {
            let mut inner = self.inner.lock().unwrap();
            inner.half_open_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            opened_at: inner.opened_at,
            recent_failures: inner.failures.len() as u32,
        }
    }

    /// Test and admin hook.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_in_flight = false;
    }

    /// Test and admin hook.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_in_flight = false;
    }
}

fn counts_as_failure(error: &ProviderError) -> bool {
    error.is_retryable()
}

fn prune_window(failures: &mut VecDeque<Instant>, window: Duration) {
    while failures
        .front()
        .is_some_and(|t| t.elapsed() > window)
    {
        failures.pop_front();
    }
}
