//! Frozen configuration surface for the retrieval core.
//!
//! Mirrors the reference crate's `RAGConfig`: one struct per concern, built
//! once at startup, with a `validate()` and a `from_file()` loader. No
//! runtime attribute injection — every recognized option from the
//! configuration surface is a named field with a documented default.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub scope: ScopeConfig,
    pub cluster: ClusterConfig,
    pub retriever: RetrieverConfig,
    pub reranker: RerankerConfig,
    pub rewriter: RewriterConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// EMBED_DIM
    pub dimension: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// TTL_SECONDS
    pub ttl_seconds: i64,
    /// DECAY_CONSTANT
    pub decay_constant_seconds: f64,
    pub max_entities_per_session: usize,
    pub max_focus_history: usize,
    pub min_turns_for_summary: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub micro_k_min: usize,
    pub micro_k_max: usize,
    pub macro_k_min: usize,
    pub macro_k_max: usize,
    pub overview_k_min: usize,
    pub overview_k_max: usize,
    pub default_macro_k: usize,
    /// SCOPE_LLM_MIN_CONFIDENCE
    pub llm_min_confidence: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// CLUSTER_MIN_SIM
    pub min_similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrieverConfig {
    /// VECTOR_MIN_SIM
    pub vector_min_similarity: f32,
    pub candidate_multiplier: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// PRIMARY_THRESHOLD
    pub primary_threshold: f32,
    /// MAX_PRIMARY
    pub max_primary: usize,
    /// MAX_RELATED
    pub max_related: usize,
    /// CROSS_ENCODER_CACHE_TTL_S
    pub cross_encoder_cache_ttl_seconds: u64,
    pub cross_encoder_batch_size: usize,
    pub scale_factor: f32,
    pub offset: f32,
    pub max_context_boost: f32,
    pub max_memory_weight: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RewriterConfig {
    /// QUERY_REWRITE_ENABLED
    pub enabled: bool,
    /// QUERY_REWRITE_TIMEOUT_MS
    pub llm_timeout_ms: u64,
    pub rule_based_confidence_threshold: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// ORCHESTRATOR_DEADLINE_MS
    pub deadline_ms: u64,
    pub stage_c1_budget_ms: u64,
    pub stage_c2_budget_ms: u64,
    pub stage_c4_budget_ms: u64,
    pub stage_c5_budget_ms: u64,
    pub stage_c6_budget_ms: u64,
    pub stage_c7_budget_ms: u64,
    pub stage_c8_budget_ms: u64,
}

impl RetrievalConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if ![384, 768, 1536].contains(&self.embedding.dimension) {
            return Err("embedding.dimension must be one of 384, 768, 1536".into());
        }
        if self.memory.ttl_seconds <= 0 {
            return Err("memory.ttl_seconds must be > 0".into());
        }
        if self.memory.decay_constant_seconds <= 0.0 {
            return Err("memory.decay_constant_seconds must be > 0".into());
        }
        if self.scope.micro_k_min == 0 || self.scope.micro_k_max < self.scope.micro_k_min {
            return Err("scope micro k range is invalid".into());
        }
        if self.scope.macro_k_max < self.scope.macro_k_min {
            return Err("scope macro k range is invalid".into());
        }
        if self.scope.overview_k_max < self.scope.overview_k_min {
            return Err("scope overview k range is invalid".into());
        }
        if !(0.0..=1.0).contains(&self.cluster.min_similarity) {
            return Err("cluster.min_similarity must be in [0.0, 1.0]".into());
        }
        if !(0.0..=1.0).contains(&self.retriever.vector_min_similarity) {
            return Err("retriever.vector_min_similarity must be in [0.0, 1.0]".into());
        }
        if self.retriever.candidate_multiplier == 0 {
            return Err("retriever.candidate_multiplier must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.reranker.primary_threshold) {
            return Err("reranker.primary_threshold must be in [0.0, 1.0]".into());
        }
        if self.reranker.max_primary == 0 {
            return Err("reranker.max_primary must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, rejecting clearly broken configurations.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig { dimension: 384 },
            memory: MemoryConfig {
                ttl_seconds: 900,
                decay_constant_seconds: 300.0,
                max_entities_per_session: 50,
                max_focus_history: 10,
                min_turns_for_summary: 2,
            },
            scope: ScopeConfig {
                micro_k_min: 5,
                micro_k_max: 10,
                macro_k_min: 15,
                macro_k_max: 30,
                overview_k_min: 30,
                overview_k_max: 50,
                default_macro_k: 20,
                llm_min_confidence: 0.6,
            },
            cluster: ClusterConfig {
                min_similarity: 0.35,
            },
            retriever: RetrieverConfig {
                vector_min_similarity: 0.45,
                candidate_multiplier: 2,
            },
            reranker: RerankerConfig {
                primary_threshold: 0.6,
                max_primary: 4,
                max_related: 6,
                cross_encoder_cache_ttl_seconds: 300,
                cross_encoder_batch_size: 32,
                scale_factor: 1.0,
                offset: 0.0,
                max_context_boost: 0.5,
                max_memory_weight: 3.0,
            },
            rewriter: RewriterConfig {
                enabled: true,
                llm_timeout_ms: 200,
                rule_based_confidence_threshold: 0.7,
            },
            orchestrator: OrchestratorConfig {
                deadline_ms: 1500,
                stage_c1_budget_ms: 10,
                stage_c2_budget_ms: 200,
                stage_c4_budget_ms: 20,
                stage_c5_budget_ms: 50,
                stage_c6_budget_ms: 150,
                stage_c7_budget_ms: 200,
                stage_c8_budget_ms: 20,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RetrievalConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_dimension() {
        let mut cfg = RetrievalConfig::default();
        cfg.embedding.dimension = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_scope_range() {
        let mut cfg = RetrievalConfig::default();
        cfg.scope.micro_k_max = 2;
        assert!(cfg.validate().is_err());
    }
}
