//! Asynchronous debate jobs.
//!
//! `POST /v1/debates` starts a debate in the background and returns a job
//! id; `GET /v1/debates/:id` and `/:id/status` poll it. Finished jobs are
//! retained in an LRU window so clients have time to collect results
//! without the store growing unboundedly.

use helixagent_ensemble::debate::session::DebateOutcome;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use uuid::Uuid;

const RETAINED_JOBS: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed { outcome: Box<DebateOutcome> },
    Failed { kind: String, message: String },
}

pub struct DebateJobs {
    jobs: Mutex<LruCache<Uuid, JobState>>,
}

impl Default for DebateJobs {
    fn default() -> Self {
        Self::new()
    }
}

impl DebateJobs {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(LruCache::new(
                NonZeroUsize::new(RETAINED_JOBS).expect("retention is non-zero"),
            )),
        }
    }

    pub fn start(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.with(|jobs| {
            jobs.put(id, JobState::Running);
        });
        id
    }

    pub fn complete(&self, id: Uuid, outcome: DebateOutcome) {
        self.with(|jobs| {
            jobs.put(
                id,
                JobState::Completed {
                    outcome: Box::new(outcome),
                },
            );
        });
    }

    pub fn fail(&self, id: Uuid, kind: &str, message: String) {
        self.with(|jobs| {
            jobs.put(
                id,
                JobState::Failed {
                    kind: kind.to_string(),
                    message,
                },
            );
        });
    }

    pub fn get(&self, id: &Uuid) -> Option<JobState> {
        self.with(|jobs| jobs.get(id).cloned())
    }

    fn with<R>(&self, f: impl FnOnce(&mut LruCache<Uuid, JobState>) -> R) -> R {
        f(&mut self.jobs.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helixagent_ensemble::debate::session::{DebatePhase, DebateStats};

    fn outcome() -> DebateOutcome {
        DebateOutcome {
            consensus: "4".to_string(),
            confidence: 0.9,
            consensus_score: 1.0,
            transcript: Vec::new(),
            stats: DebateStats::default(),
            phase: DebatePhase::Final,
            reached: true,
        }
    }

    #[test]
    fn lifecycle_running_to_completed() {
        let jobs = DebateJobs::new();
        let id = jobs.start();
        assert!(matches!(jobs.get(&id), Some(JobState::Running)));

        jobs.complete(id, outcome());
        match jobs.get(&id) {
            Some(JobState::Completed { outcome }) => assert_eq!(outcome.consensus, "4"),
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn unknown_job_is_none() {
        let jobs = DebateJobs::new();
        assert!(jobs.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn failed_jobs_carry_the_taxonomy_kind() {
        let jobs = DebateJobs::new();
        let id = jobs.start();
        jobs.fail(id, "no_eligible_provider", "pool empty".to_string());
        match jobs.get(&id) {
            Some(JobState::Failed { kind, .. }) => assert_eq!(kind, "no_eligible_provider"),
            other => panic!("unexpected state {other:?}"),
        }
    }
}
