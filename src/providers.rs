//! External-collaborator interfaces.
//!
//! Per spec §1, the embedding provider, cross-encoder, and LLM gateway are
//! out of scope — specified only at their interface. Modeled here the way
//! the reference crate models `EmbeddingModel`/`LLMProvider`: an
//! `#[async_trait]` the orchestrator depends on as an `Arc<dyn Trait>`, with
//! in-memory fakes provided for tests (see `testing` module).

use async_trait::async_trait;

/// `embed_query`/`embed_document` — unit-normalized vectors of a fixed
/// dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    async fn embed_document(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// `cross_encoder.score(pairs) -> [float]`, order-preserving.
#[async_trait]
pub trait CrossEncoderProvider: Send + Sync {
    async fn score(&self, pairs: &[(String, String)]) -> anyhow::Result<Vec<f32>>;
}

/// `llm.complete(prompt, max_tokens, timeout_ms) -> string`.
///
/// Timeout handling is the caller's responsibility (via `tokio::time::timeout`
/// around the call) so every stage applies its own budget uniformly; this
/// trait itself only distinguishes success from a hard error.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: usize) -> anyhow::Result<String>;
}

#[cfg(any(test, feature = "test-fakes"))]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Deterministic fake embedding provider: hashes text into a fixed-size
    /// vector so identical text always embeds identically, without pulling
    /// in a real model.
    pub struct FakeEmbeddingProvider {
        dimension: usize,
    }

    impl FakeEmbeddingProvider {
        pub fn new(dimension: usize) -> Self {
            Self { dimension }
        }

        fn hash_embed(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            for (i, byte) in text.bytes().enumerate() {
                v[i % self.dimension] += byte as f32;
            }
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in v.iter_mut() {
                    *x /= norm;
                }
            }
            v
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbeddingProvider {
        async fn embed_query(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.hash_embed(text))
        }

        async fn embed_document(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(self.hash_embed(text))
        }

        fn dimension(&self) -> usize {
            self.dimension
        }
    }

    /// Fake cross-encoder: scores a pair by token overlap, optionally
    /// simulating unavailability or per-call latency for timeout tests.
    pub struct FakeCrossEncoder {
        pub fail: bool,
        pub delay_ms: u64,
    }

    impl Default for FakeCrossEncoder {
        fn default() -> Self {
            Self {
                fail: false,
                delay_ms: 0,
            }
        }
    }

    #[async_trait]
    impl CrossEncoderProvider for FakeCrossEncoder {
        async fn score(&self, pairs: &[(String, String)]) -> anyhow::Result<Vec<f32>> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                anyhow::bail!("cross-encoder unavailable");
            }
            Ok(pairs
                .iter()
                .map(|(q, d)| {
                    let q_tokens: std::collections::HashSet<&str> = q.split_whitespace().collect();
                    let d_tokens: std::collections::HashSet<&str> = d.split_whitespace().collect();
                    let overlap = q_tokens.intersection(&d_tokens).count() as f32;
                    (overlap * 2.0) - 1.0
                })
                .collect())
        }
    }

    /// Fake LLM: returns canned responses keyed by a prompt substring, or
    /// echoes back a marker so rule-based fallbacks are exercised in tests
    /// that don't configure a canned response.
    pub struct FakeLlm {
        pub responses: Mutex<HashMap<String, String>>,
        pub fail: bool,
        pub delay_ms: u64,
    }

    impl FakeLlm {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                fail: false,
                delay_ms: 0,
            }
        }

        pub fn with_response(self, key_substring: &str, response: &str) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(key_substring.to_string(), response.to_string());
            self
        }
    }

    #[async_trait]
    impl LlmProvider for FakeLlm {
        async fn complete(&self, prompt: &str, _max_tokens: usize) -> anyhow::Result<String> {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                anyhow::bail!("llm unavailable");
            }
            let responses = self.responses.lock().unwrap();
            for (key, value) in responses.iter() {
                if prompt.contains(key.as_str()) {
                    return Ok(value.clone());
                }
            }
            Ok(String::new())
        }
    }
}
