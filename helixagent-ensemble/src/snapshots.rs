//! Append-only observation store.
//!
//! The core persists exactly three things: verification results, score
//! snapshots (both append-only, keyed by `(provider_id, observed_at)`), and
//! provider enabled/disabled toggles. Real deployments put a database
//! behind [`SnapshotStore`]; the in-memory implementation backs tests and
//! single-node runs.

use crate::scoring::ProviderScore;
use crate::verification::VerificationResult;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// One observation for a provider at a point in time.
#[derive(Debug, Clone)]
pub struct Observation<T> {
    pub provider_id: String,
    pub observed_at: DateTime<Utc>,
    pub value: T,
}

#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn record_verification(&self, observation: Observation<VerificationResult>);

    async fn record_score(&self, observation: Observation<ProviderScore>);

    async fn set_enabled(&self, provider_id: &str, enabled: bool);

    /// Verification history for one provider, oldest first.
    async fn verification_history(
        &self,
        provider_id: &str,
    ) -> Vec<Observation<VerificationResult>>;
}

pub type SharedSnapshotStore = Arc<dyn SnapshotStore>;

/// In-process append-only store.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    verifications: Mutex<Vec<Observation<VerificationResult>>>,
    scores: Mutex<Vec<Observation<ProviderScore>>>,
    toggles: Mutex<Vec<(String, bool, DateTime<Utc>)>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score_count(&self) -> usize {
        self.scores.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn record_verification(&self, observation: Observation<VerificationResult>) {
        self.verifications.lock().unwrap().push(observation);
    }

    async fn record_score(&self, observation: Observation<ProviderScore>) {
        self.scores.lock().unwrap().push(observation);
    }

    async fn set_enabled(&self, provider_id: &str, enabled: bool) {
        self.toggles
            .lock()
            .unwrap()
            .push((provider_id.to_string(), enabled, Utc::now()));
    }

    async fn verification_history(
        &self,
        provider_id: &str,
    ) -> Vec<Observation<VerificationResult>> {
        self.verifications
            .lock()
            .unwrap()
            .iter()
            .filter(|o| o.provider_id == provider_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn verification(overall: f64) -> VerificationResult {
        VerificationResult {
            code_visible: true,
            sub_scores: HashMap::new(),
            overall,
            verified_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn history_is_append_only_and_ordered() {
        let store = InMemorySnapshotStore::new();
        for overall in [0.5, 0.7, 0.9] {
            store
                .record_verification(Observation {
                    provider_id: "p".to_string(),
                    observed_at: Utc::now(),
                    value: verification(overall),
                })
                .await;
        }
        let history = store.verification_history("p").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].value.overall, 0.5);
        assert_eq!(history[2].value.overall, 0.9);
        assert!(store.verification_history("other").await.is_empty());
    }
}
