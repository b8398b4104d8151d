//! # Capability Verification
//!
//! The admission protocol every provider must pass before the router will
//! hand it traffic. The suite opens with the code-visibility check ("do you
//! see my code?"): five small code samples are shown and the model must
//! affirmatively acknowledge each one. A provider that cannot see code, or
//! whose overall score is below the admission floor, is recorded as
//! inadmissible - recorded, not destroyed, since a later re-run may restore
//! it.
//!
//! Capability tests (function calling, vision, embeddings) are only scored
//! when the adapter declares the capability; skipped tests are excluded
//! from the overall and the remaining weights renormalized.

use crate::error::ProviderError;
use crate::models::{ChatRequest, EmbeddingInput, EmbeddingRequest, Message};
use crate::providers::ProviderAdapter;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Admission floor for the overall score.
pub const DEFAULT_MIN_OVERALL: f64 = 0.6;

/// Code samples shown during the visibility check, one per language.
const CODE_SAMPLES: [(&str, &str); 5] = [
    ("python", "def add(a, b):\n    return a + b"),
    ("go", "func Add(a, b int) int {\n\treturn a + b\n}"),
    ("javascript", "function add(a, b) {\n  return a + b;\n}"),
    (
        "java",
        "public int add(int a, int b) {\n    return a + b;\n}",
    ),
    ("csharp", "public int Add(int a, int b) => a + b;"),
];

const AFFIRMATIVE_MARKERS: [&str; 6] = [
    "yes, i can see",
    "yes i can see",
    "i can see your code",
    "i see your code",
    "code is visible",
    "visible",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// How often admitted providers are re-verified
    #[serde(with = "crate::providers::duration_secs")]
    pub refresh_interval: Duration,
    /// Admission floor for the overall score
    pub min_overall: f64,
    /// Samples that must be acknowledged (out of five)
    pub code_visibility_pass: u32,
    /// Floor for the coding-capability sub-score
    pub coding_pass: f64,
    /// Per-test timeout
    #[serde(with = "crate::providers::duration_secs")]
    pub test_timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            min_overall: DEFAULT_MIN_OVERALL,
            code_visibility_pass: 4,
            coding_pass: 0.8,
            test_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub code_visible: bool,
    /// Per-test scores in [0, 1]
    pub sub_scores: HashMap<String, f64>,
    /// Weighted mean over the tests that ran, in [0, 1]
    pub overall: f64,
    pub verified_at: DateTime<Utc>,
}

impl VerificationResult {
    /// Admission predicate: code visibility plus the overall floor.
    pub fn admissible(&self, min_overall: f64) -> bool {
        self.code_visible && self.overall >= min_overall
    }
}

/// Runs the suite against any adapter.
pub struct Verifier {
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Execute the full suite. Never fails: a provider that errors on every
    /// test simply scores zero.
    pub async fn verify(&self, adapter: &dyn ProviderAdapter) -> VerificationResult {
        let caps = adapter.capabilities();
        let mut sub_scores = HashMap::new();
        // (name, weight, score)
        let mut weighted: Vec<(&str, f64, f64)> = Vec::new();

        let existence = self.existence_test(adapter).await;
        weighted.push(("existence", 0.15, existence));

        let (code_visible, visibility_score) = self.code_visibility_test(adapter).await;
        weighted.push(("code_visibility", 0.30, visibility_score));

        let (responsiveness, latency) = self.responsiveness_test(adapter).await;
        weighted.push(("responsiveness", 0.10, responsiveness));
        weighted.push(("latency", 0.10, latency));

        if caps.streaming {
            weighted.push(("streaming", 0.05, self.streaming_test(adapter).await));
        }
        if caps.function_calling {
            weighted.push((
                "function_calling",
                0.05,
                self.function_calling_test(adapter).await,
            ));
        }
        if caps.vision {
            weighted.push(("vision", 0.05, self.vision_test(adapter).await));
        }
        if caps.embeddings {
            weighted.push(("embeddings", 0.05, self.embeddings_test(adapter).await));
        }

        weighted.push(("coding", 0.15, self.coding_test(adapter).await));
        weighted.push((
            "error_detection",
            0.05,
            self.error_detection_test(adapter).await,
        ));
        weighted.push((
            "rate_limit_detection",
            0.05,
            self.rate_limit_detection_test(adapter).await,
        ));

        let weight_sum: f64 = weighted.iter().map(|(_, w, _)| w).sum();
        let overall = if weight_sum > 0.0 {
            weighted.iter().map(|(_, w, s)| w * s).sum::<f64>() / weight_sum
        } else {
            0.0
        };

        for (name, _, score) in &weighted {
            sub_scores.insert(name.to_string(), *score);
        }

        tracing::info!(
            provider = adapter.id(),
            code_visible,
            overall,
            "verification complete"
        );

        VerificationResult {
            code_visible,
            sub_scores,
            overall,
            verified_at: Utc::now(),
        }
    }

    async fn ask(&self, adapter: &dyn ProviderAdapter, prompt: &str) -> Option<String> {
        let request = ChatRequest {
            model: "default".to_string(),
            messages: vec![Message::user(prompt)],
            max_tokens: Some(256),
            temperature: Some(0.0),
            ..Default::default()
        };
        match tokio::time::timeout(self.config.test_timeout, adapter.complete(request)).await {
            Ok(Ok(response)) => Some(response.content().to_string()),
            _ => None,
        }
    }

    /// A trivial completion must return non-empty content.
    async fn existence_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        match self.ask(adapter, "Reply with the word: ready").await {
            Some(content) if !content.trim().is_empty() => 1.0,
            _ => 0.0,
        }
    }

    /// Show five code samples; the reply must affirmatively acknowledge
    /// each one. Pass at `code_visibility_pass` of five.
    async fn code_visibility_test(&self, adapter: &dyn ProviderAdapter) -> (bool, f64) {
        let mut acknowledged = 0u32;
        for (language, sample) in CODE_SAMPLES {
            let prompt = format!(
                "Here is a {language} code sample:\n\n{sample}\n\n\
                 Can you see my code? Answer starting with yes or no."
            );
            if let Some(reply) = self.ask(adapter, &prompt).await {
                let lower = reply.to_lowercase();
                if AFFIRMATIVE_MARKERS.iter().any(|m| lower.contains(m)) {
                    acknowledged += 1;
                }
            }
        }
        let passed = acknowledged >= self.config.code_visibility_pass;
        (passed, acknowledged as f64 / CODE_SAMPLES.len() as f64)
    }

    /// Probe must answer, and quickly. Latency scored against a 5 s budget.
    async fn responsiveness_test(&self, adapter: &dyn ProviderAdapter) -> (f64, f64) {
        let start = Instant::now();
        match tokio::time::timeout(self.config.test_timeout, adapter.probe()).await {
            Ok(Ok(_)) => {
                let elapsed = start.elapsed().as_secs_f64();
                let latency_score = (1.0 - (elapsed / 5.0)).clamp(0.0, 1.0);
                (1.0, latency_score)
            }
            _ => (0.0, 0.0),
        }
    }

    /// At least one chunk must arrive over the stream.
    async fn streaming_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        let request = ChatRequest {
            model: "default".to_string(),
            messages: vec![Message::user("Count from 1 to 5.")],
            max_tokens: Some(64),
            ..Default::default()
        };
        let attempt = async {
            let mut stream = adapter.complete_stream(request).await.ok()?;
            stream.next().await.and_then(|c| c.ok())
        };
        match tokio::time::timeout(self.config.test_timeout, attempt).await {
            Ok(Some(_)) => 1.0,
            _ => 0.0,
        }
    }

    /// Declared-capable providers must at least engage with a tool-use
    /// prompt; a structured mention of the call is accepted.
    async fn function_calling_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        let prompt = "You have a function get_weather(city). \
                      Respond with the exact call you would make for Paris.";
        match self.ask(adapter, prompt).await {
            Some(reply) if reply.to_lowercase().contains("get_weather") => 1.0,
            Some(_) => 0.5,
            None => 0.0,
        }
    }

    /// Without shipping an image fixture, scored on a coherent refusal or
    /// acknowledgement of image handling.
    async fn vision_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        match self
            .ask(adapter, "Can you analyze images when they are attached?")
            .await
        {
            Some(reply) if !reply.trim().is_empty() => 1.0,
            _ => 0.0,
        }
    }

    async fn embeddings_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        let request = EmbeddingRequest {
            model: "default".to_string(),
            input: EmbeddingInput::String("verification probe".to_string()),
        };
        match tokio::time::timeout(self.config.test_timeout, adapter.embed(request)).await {
            Ok(Ok(response))
                if response
                    .data
                    .first()
                    .is_some_and(|e| !e.embedding.is_empty()) =>
            {
                1.0
            }
            _ => 0.0,
        }
    }

    /// Structured coding problem; scored on code actually appearing.
    async fn coding_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        let prompt = "Write a function that reverses a string. \
                      Reply with only the code in a fenced block.";
        let Some(reply) = self.ask(adapter, prompt).await else {
            return 0.0;
        };
        let mut score: f64 = 0.0;
        if !reply.trim().is_empty() {
            score += 0.2;
        }
        if reply.contains("```") {
            score += 0.3;
        }
        let lower = reply.to_lowercase();
        if ["fn ", "def ", "function", "func ", "public "]
            .iter()
            .any(|marker| lower.contains(marker))
        {
            score += 0.3;
        }
        if lower.contains("revers") {
            score += 0.2;
        }
        score.min(1.0)
    }

    /// An intentionally malformed request must come back as a structured
    /// taxonomy error, not a success and not a hang.
    async fn error_detection_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        let request = ChatRequest {
            model: String::new(),
            messages: vec![],
            ..Default::default()
        };
        match tokio::time::timeout(self.config.test_timeout, adapter.complete(request)).await {
            Ok(Err(
                ProviderError::InvalidRequest { .. }
                | ProviderError::Unauthenticated { .. }
                | ProviderError::ContentFiltered { .. },
            )) => 1.0,
            Ok(Err(_)) => 0.5,
            Ok(Ok(_)) => 0.0,
            Err(_) => 0.0,
        }
    }

    /// A short burst must either succeed or surface a structured
    /// `RateLimited`; any other failure kind fails the test.
    async fn rate_limit_detection_test(&self, adapter: &dyn ProviderAdapter) -> f64 {
        for _ in 0..3 {
            match tokio::time::timeout(self.config.test_timeout, adapter.probe()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(ProviderError::RateLimited { .. })) => return 1.0,
                _ => return 0.0,
            }
        }
        1.0
    }
}

/// Periodic re-verification of all registered providers (default every
/// 24 h). Sessions already in flight keep their pinned providers; only new
/// sessions see the refreshed admissibility.
pub fn spawn_refresh_task(
    registry: Arc<crate::registry::ProviderRegistry>,
    verifier: Arc<Verifier>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = verifier.config.refresh_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            for provider in registry.all() {
                let result = verifier.verify(provider.adapter.as_ref()).await;
                registry.record_verification(&provider.config.id, result);
            }
        }
    })
}
