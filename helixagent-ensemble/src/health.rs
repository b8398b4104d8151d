//! # Health Engine
//!
//! One cooperative probe task per registered provider, all owned by a
//! single [`HealthEngine`]. Probes run at a configurable interval (default
//! 30 s) with ±10 % jitter so a fleet of providers never probes in
//! lockstep.
//!
//! Status transitions:
//!
//! - `unknown → healthy` on the first successful probe;
//! - `healthy → degraded` when p95 latency over the 20-probe window exceeds
//!   2× the cohort median, or on the first consecutive failure;
//! - `degraded → unhealthy` after `failure_threshold` consecutive failures;
//! - anything → `healthy` after `recovery_threshold` consecutive successes.
//!
//! The engine is the only writer of health state; the router and the
//! gateway read value-copied snapshots.

use crate::scoring::ScoreInputs;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Base probe interval; each tick is jittered ±`jitter_fraction`
    #[serde(with = "crate::providers::duration_secs")]
    pub probe_interval: Duration,
    /// Fraction of the interval used as jitter amplitude
    pub jitter_fraction: f64,
    /// Per-probe timeout
    #[serde(with = "crate::providers::duration_secs")]
    pub probe_timeout: Duration,
    /// Latency window length in probes
    pub window: usize,
    /// Consecutive failures taking a degraded provider to unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes restoring a provider to healthy
    pub recovery_threshold: u32,
    /// p95 beyond this multiple of the cohort median marks degraded
    pub degraded_latency_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            jitter_fraction: 0.10,
            probe_timeout: Duration::from_secs(10),
            window: 20,
            failure_threshold: 5,
            recovery_threshold: 3,
            degraded_latency_factor: 2.0,
        }
    }
}

/// Mutable per-provider probe history. Engine-internal; external readers
/// get [`HealthSnapshot`] copies.
#[derive(Debug)]
struct ProbeHistory {
    status: HealthStatus,
    latencies: VecDeque<Duration>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_probes: u64,
    total_successes: u64,
    last_probe_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl ProbeHistory {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            latencies: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_probes: 0,
            total_successes: 0,
            last_probe_at: None,
            last_success_at: None,
        }
    }

    fn percentile(&self, p: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<Duration> = self.latencies.iter().copied().collect();
        sorted.sort();
        let rank = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn median(&self) -> Duration {
        self.percentile(0.50)
    }

    fn success_rate(&self) -> f64 {
        if self.total_probes == 0 {
            1.0
        } else {
            self.total_successes as f64 / self.total_probes as f64
        }
    }
}

/// Value-copied health view handed to the router and the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub success_rate: f64,
    /// Seconds since the last probe; `None` before the first one
    pub last_probe_age_secs: Option<u64>,
}

/// Shared health state: single writer (the engine), snapshot readers.
pub struct HealthLedger {
    entries: DashMap<String, ProbeHistory>,
    config: HealthConfig,
}

impl HealthLedger {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record one probe outcome and run the status transitions.
    pub fn apply_probe(&self, provider_id: &str, outcome: Result<Duration, ()>) -> HealthStatus {
        let cohort_median = self.cohort_median();
        let mut entry = self
            .entries
            .entry(provider_id.to_string())
            .or_insert_with(ProbeHistory::new);
        let history = entry.value_mut();

        history.total_probes += 1;
        history.last_probe_at = Some(Instant::now());

        match outcome {
            Ok(latency) => {
                history.total_successes += 1;
                history.last_success_at = Some(Instant::now());
                history.consecutive_successes += 1;
                history.consecutive_failures = 0;
                history.latencies.push_back(latency);
                while history.latencies.len() > self.config.window {
                    history.latencies.pop_front();
                }

                if history.consecutive_successes >= self.config.recovery_threshold
                    || history.status == HealthStatus::Unknown
                {
                    history.status = HealthStatus::Healthy;
                }

                // A healthy provider with an outlying p95 is degraded even
                // though its probes succeed.
                if history.status == HealthStatus::Healthy {
                    if let Some(cohort_median) = cohort_median {
                        let p95 = history.percentile(0.95);
                        let limit = cohort_median.mul_f64(self.config.degraded_latency_factor);
                        if !cohort_median.is_zero()
                            && history.latencies.len() >= self.config.window / 2
                            && p95 > limit
                        {
                            history.status = HealthStatus::Degraded;
                        }
                    }
                }
            }
            Err(()) => {
                history.consecutive_failures += 1;
                history.consecutive_successes = 0;

                match history.status {
                    HealthStatus::Healthy | HealthStatus::Unknown => {
                        history.status = HealthStatus::Degraded;
                    }
                    HealthStatus::Degraded => {
                        if history.consecutive_failures >= self.config.failure_threshold {
                            history.status = HealthStatus::Unhealthy;
                        }
                    }
                    HealthStatus::Unhealthy => {}
                }
            }
        }

        history.status
    }

    pub fn status(&self, provider_id: &str) -> HealthStatus {
        self.entries
            .get(provider_id)
            .map(|e| e.status)
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<HealthSnapshot> {
        self.entries.get(provider_id).map(|e| HealthSnapshot {
            status: e.status,
            p50_ms: e.percentile(0.50).as_millis() as u64,
            p95_ms: e.percentile(0.95).as_millis() as u64,
            p99_ms: e.percentile(0.99).as_millis() as u64,
            consecutive_failures: e.consecutive_failures,
            consecutive_successes: e.consecutive_successes,
            success_rate: e.success_rate(),
            last_probe_age_secs: e.last_probe_at.map(|t| t.elapsed().as_secs()),
        })
    }

    pub fn p50(&self, provider_id: &str) -> Duration {
        self.entries
            .get(provider_id)
            .map(|e| e.median())
            .unwrap_or(Duration::ZERO)
    }

    /// Inputs for a score refresh after a probe.
    pub fn score_inputs(
        &self,
        provider_id: &str,
        cost_per_million_tokens: f64,
        verification_overall: f64,
    ) -> ScoreInputs {
        let entry = self.entries.get(provider_id);
        ScoreInputs {
            p50_latency: entry.as_ref().map(|e| e.median()).unwrap_or(Duration::ZERO),
            success_rate: entry.as_ref().map(|e| e.success_rate()).unwrap_or(1.0),
            cost_per_million_tokens,
            verification_overall,
            since_last_success: entry
                .as_ref()
                .and_then(|e| e.last_success_at)
                .map(|t| t.elapsed()),
        }
    }

    /// Median of the cohort's per-provider median latencies.
    fn cohort_median(&self) -> Option<Duration> {
        let mut medians: Vec<Duration> = self
            .entries
            .iter()
            .filter(|e| !e.latencies.is_empty())
            .map(|e| e.median())
            .collect();
        if medians.is_empty() {
            return None;
        }
        medians.sort();
        Some(medians[medians.len() / 2])
    }
}

/// Background prober. One task per provider; all torn down through the
/// cancellation token.
pub struct HealthEngine {
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl HealthEngine {
    /// Spawn probe tasks for every provider currently in the registry.
    pub fn spawn(registry: Arc<crate::registry::ProviderRegistry>) -> Self {
        let cancel = CancellationToken::new();
        let config = registry.health_ledger().config().clone();
        let mut tasks = Vec::new();

        for provider in registry.all() {
            let registry = registry.clone();
            let cancel = cancel.child_token();
            let config = config.clone();
            let provider_id = provider.config.id.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    let interval = jittered(config.probe_interval, config.jitter_fraction);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    let Some(provider) = registry.get(&provider_id) else {
                        return; // deregistered
                    };

                    let outcome = tokio::time::timeout(
                        config.probe_timeout,
                        provider.adapter.probe(),
                    )
                    .await;

                    let ledger = registry.health_ledger();
                    let status = match outcome {
                        Ok(Ok(report)) => ledger.apply_probe(&provider_id, Ok(report.latency)),
                        Ok(Err(e)) => {
                            tracing::debug!(provider = %provider_id, error = %e, "probe failed");
                            ledger.apply_probe(&provider_id, Err(()))
                        }
                        Err(_) => {
                            tracing::debug!(provider = %provider_id, "probe timed out");
                            ledger.apply_probe(&provider_id, Err(()))
                        }
                    };
                    tracing::trace!(provider = %provider_id, ?status, "probe recorded");

                    registry.refresh_score(&provider_id);
                }
            }));
        }

        Self { tasks, cancel }
    }

    /// Stop all probe tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn jittered(base: Duration, fraction: f64) -> Duration {
    let amplitude = base.mul_f64(fraction);
    let jitter = rand::thread_rng().gen_range(0.0..=1.0) * 2.0 - 1.0;
    if jitter >= 0.0 {
        base + amplitude.mul_f64(jitter)
    } else {
        base.saturating_sub(amplitude.mul_f64(-jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> HealthLedger {
        HealthLedger::new(HealthConfig::default())
    }

    #[test]
    fn first_success_moves_unknown_to_healthy() {
        let ledger = ledger();
        assert_eq!(ledger.status("p"), HealthStatus::Unknown);
        let status = ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn single_failure_degrades_a_healthy_provider() {
        let ledger = ledger();
        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        let status = ledger.apply_probe("p", Err(()));
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn consecutive_failures_reach_unhealthy_at_threshold() {
        let ledger = ledger();
        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        let mut status = HealthStatus::Healthy;
        for _ in 0..5 {
            status = ledger.apply_probe("p", Err(()));
        }
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[test]
    fn recovery_threshold_restores_healthy() {
        let ledger = ledger();
        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        for _ in 0..5 {
            ledger.apply_probe("p", Err(()));
        }
        assert_eq!(ledger.status("p"), HealthStatus::Unhealthy);

        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        assert_eq!(ledger.status("p"), HealthStatus::Unhealthy);
        ledger.apply_probe("p", Ok(Duration::from_millis(100)));
        assert_eq!(ledger.status("p"), HealthStatus::Healthy);
    }

    #[test]
    fn latency_outlier_degrades_despite_successes() {
        let ledger = ledger();
        // Fast cohort
        for _ in 0..20 {
            ledger.apply_probe("fast-a", Ok(Duration::from_millis(50)));
            ledger.apply_probe("fast-b", Ok(Duration::from_millis(60)));
        }
        // Slow provider: succeeds, but p95 is far beyond 2× cohort median
        let mut status = HealthStatus::Unknown;
        for _ in 0..20 {
            status = ledger.apply_probe("slow", Ok(Duration::from_millis(500)));
        }
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn percentiles_come_from_the_window() {
        let ledger = ledger();
        for i in 1..=20u64 {
            ledger.apply_probe("p", Ok(Duration::from_millis(i * 10)));
        }
        let snapshot = ledger.snapshot("p").unwrap();
        assert_eq!(snapshot.p50_ms, 100);
        assert!(snapshot.p95_ms >= 180);
        assert_eq!(snapshot.p99_ms, 200);
    }

    #[test]
    fn jitter_stays_within_amplitude() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let v = jittered(base, 0.10);
            assert!(v >= Duration::from_secs(27) && v <= Duration::from_secs(33));
        }
    }
}
