//! Reranker (C7). See spec §4.7, §4.7s.
//!
//! Cross-encoder scoring (cached, batched) combined with the conversation
//! memory boost, producing the final `RankedEntity` ordering. Batching and
//! per-candidate degradation are grounded in the reference crate's
//! `CrossEncoderReranker::rerank_batch`.

use crate::config::RerankerConfig;
use crate::memory::boost_weight;
use crate::providers::CrossEncoderProvider;
use crate::retriever::RetrievedCandidate;
use crate::types::{ConversationMemory, EntityRole, RankedEntity};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CROSS_ENCODER_BATCH_SIZE: usize = 32;
const CLIP_MIN: f32 = -10.0;
const CLIP_MAX: f32 = 10.0;
const CACHE_CAPACITY: usize = 4096;

/// A candidate entity produced by either the Cluster Index or the Entity
/// Retriever, about to be reranked.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub retrieved: RetrievedCandidate,
    pub cluster_score: Option<f32>,
    pub source_cluster: Option<String>,
}

struct CachedScore {
    raw: f32,
    inserted_at: Instant,
}

/// In-memory TTL cache keyed by `(query_hash, entity_id)`, single global
/// instance per spec §5. Bounded by an LRU eviction policy (as the
/// reference crate's embedding/tokenizer caches are) with a TTL check on
/// top, since entries can go stale well before the cache fills up.
pub struct CrossEncoderCache {
    entries: Mutex<LruCache<(u64, String), CachedScore>>,
    ttl: Duration,
}

impl CrossEncoderCache {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            ttl: Duration::from_secs(ttl_seconds),
        }
    }

    fn query_hash(query: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        hasher.finish()
    }

    fn get(&self, query: &str, entity_id: &str) -> Option<f32> {
        let key = (Self::query_hash(query), entity_id.to_string());
        let mut entries = self.entries.lock();
        entries.get(&key).and_then(|cached| {
            if cached.inserted_at.elapsed() < self.ttl {
                Some(cached.raw)
            } else {
                None
            }
        })
    }

    fn put(&self, query: &str, entity_id: &str, raw: f32) {
        let key = (Self::query_hash(query), entity_id.to_string());
        self.entries.lock().insert(
            key,
            CachedScore {
                raw,
                inserted_at: Instant::now(),
            },
        );
    }
}

pub struct Reranker {
    cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
    cache: Arc<CrossEncoderCache>,
    config: RerankerConfig,
}

impl Reranker {
    pub fn new(
        cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
        cache: Arc<CrossEncoderCache>,
        config: RerankerConfig,
    ) -> Self {
        Self {
            cross_encoder,
            cache,
            config,
        }
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<Candidate>,
        memory: Option<&ConversationMemory>,
        decay_constant_seconds: f64,
    ) -> Vec<RankedEntity> {
        let raw_scores = self.score_candidates(query, &candidates).await;

        let now = chrono::Utc::now();
        let mut ranked: Vec<RankedEntity> = candidates
            .into_iter()
            .zip(raw_scores)
            .map(|(candidate, raw)| {
                let base = match raw {
                    Some(raw) => sigmoid(self.config.scale_factor * (raw - self.config.offset)),
                    None => candidate.retrieved.combined_score,
                };

                let memory_weight = memory
                    .map(|m| {
                        boost_weight(
                            &candidate.retrieved.entity.entity_id,
                            candidate.retrieved.entity.area.as_deref(),
                            &candidate.retrieved.entity.domain,
                            m,
                            now,
                            decay_constant_seconds,
                            self.config.max_memory_weight,
                        )
                    })
                    .unwrap_or(1.0);
                let context_boost = (base * (memory_weight - 1.0)).min(self.config.max_context_boost);
                let final_score = base + context_boost;

                let mut ranking_factors = HashMap::new();
                ranking_factors.insert("base_score".to_string(), base);
                ranking_factors.insert("memory_weight".to_string(), memory_weight);
                if let Some(vec_score) = candidate.retrieved.vector_score {
                    ranking_factors.insert("vector_score".to_string(), vec_score);
                }
                if let Some(text_score) = candidate.retrieved.text_score {
                    ranking_factors.insert("text_score".to_string(), text_score);
                }

                RankedEntity {
                    entity: candidate.retrieved.entity,
                    cluster_score: candidate.cluster_score,
                    vector_score: candidate.retrieved.vector_score,
                    text_score: candidate.retrieved.text_score,
                    cross_encoder_raw: raw,
                    base_score: base,
                    context_boost,
                    final_score,
                    source_cluster: candidate.source_cluster,
                    role: None,
                    ranking_factors,
                }
            })
            .collect();

        // NaN-producing candidates sort to the end; tie-break final desc,
        // base desc, entity_id asc.
        ranked.sort_by(|a, b| {
            let a_nan = a.final_score.is_nan();
            let b_nan = b.final_score.is_nan();
            match (a_nan, b_nan) {
                (true, true) => a.entity.entity_id.cmp(&b.entity.entity_id),
                (true, false) => std::cmp::Ordering::Greater,
                (false, true) => std::cmp::Ordering::Less,
                (false, false) => b
                    .final_score
                    .partial_cmp(&a.final_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        b.base_score
                            .partial_cmp(&a.base_score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.entity.entity_id.cmp(&b.entity.entity_id)),
            }
        });

        self.split_primary_related(ranked)
    }

    fn split_primary_related(&self, mut ranked: Vec<RankedEntity>) -> Vec<RankedEntity> {
        let mut primary_count = 0;
        let mut related_count = 0;
        let mut kept = Vec::with_capacity(ranked.len());

        for mut entry in ranked.drain(..) {
            if entry.final_score >= self.config.primary_threshold && primary_count < self.config.max_primary {
                entry.role = Some(EntityRole::Primary);
                primary_count += 1;
                kept.push(entry);
            } else if related_count < self.config.max_related {
                entry.role = Some(EntityRole::Related);
                related_count += 1;
                kept.push(entry);
            }
        }
        kept
    }

    /// Cross-encoder scoring, chunked into batches of 32 with cache lookups
    /// and per-batch graceful degradation (§4.7s): a batch whose score call
    /// fails demotes every candidate in it to `None` (caller falls back to
    /// `combined_score`), while other batches still score normally.
    async fn score_candidates(&self, query: &str, candidates: &[Candidate]) -> Vec<Option<f32>> {
        let Some(cross_encoder) = &self.cross_encoder else {
            return vec![None; candidates.len()];
        };

        let mut results = vec![None; candidates.len()];
        let mut to_score: Vec<usize> = Vec::new();

        for (i, candidate) in candidates.iter().enumerate() {
            if let Some(cached) = self.cache.get(query, &candidate.retrieved.entity.entity_id) {
                results[i] = Some(cached.clamp(CLIP_MIN, CLIP_MAX));
            } else {
                to_score.push(i);
            }
        }

        for chunk in to_score.chunks(CROSS_ENCODER_BATCH_SIZE) {
            let pairs: Vec<(String, String)> = chunk
                .iter()
                .map(|&i| (query.to_string(), candidates[i].retrieved.entity.text.clone()))
                .collect();

            match cross_encoder.score(&pairs).await {
                Ok(scores) if scores.len() == pairs.len() => {
                    for (&i, raw) in chunk.iter().zip(scores) {
                        let clipped = raw.clamp(CLIP_MIN, CLIP_MAX);
                        self.cache
                            .put(query, &candidates[i].retrieved.entity.entity_id, clipped);
                        results[i] = Some(clipped);
                    }
                }
                Ok(_) => {
                    tracing::warn!("cross-encoder returned mismatched batch length, falling back");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cross-encoder batch failed, falling back to combined score");
                }
            }
        }

        results
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::FakeCrossEncoder;
    use crate::retriever::RetrievedCandidate;
    use crate::types::Entity;
    use std::collections::HashSet;

    fn entity(id: &str) -> Entity {
        Entity {
            entity_id: id.to_string(),
            domain: "sensor".to_string(),
            area: Some("kitchen".to_string()),
            device_class: None,
            friendly_name: id.to_string(),
            unit: None,
            aliases: HashSet::new(),
            embedding: vec![1.0],
            text: "kitchen humidity sensor".to_string(),
            state: None,
            last_updated: chrono::Utc::now(),
        }
    }

    fn candidate(id: &str, combined: f32) -> Candidate {
        Candidate {
            retrieved: RetrievedCandidate {
                entity: entity(id),
                vector_score: Some(combined),
                text_score: Some(combined),
                combined_score: combined,
            },
            cluster_score: None,
            source_cluster: None,
        }
    }

    fn config() -> RerankerConfig {
        RerankerConfig {
            primary_threshold: 0.6,
            max_primary: 4,
            max_related: 6,
            cross_encoder_cache_ttl_seconds: 300,
            cross_encoder_batch_size: 32,
            scale_factor: 1.0,
            offset: 0.0,
            max_context_boost: 0.5,
            max_memory_weight: 3.0,
        }
    }

    #[tokio::test]
    async fn scenario_e_cross_encoder_unavailable_falls_back_to_combined() {
        let reranker = Reranker::new(
            Some(Arc::new(FakeCrossEncoder {
                fail: true,
                delay_ms: 0,
            })),
            Arc::new(CrossEncoderCache::new(300)),
            config(),
        );
        let ranked = reranker
            .rerank("humidity kitchen", vec![candidate("a", 0.8)], None, 300.0)
            .await;
        assert_eq!(ranked[0].base_score, 0.8);
        assert!(ranked[0].cross_encoder_raw.is_none());
    }

    #[tokio::test]
    async fn primary_requires_threshold_and_is_capped() {
        let mut cfg = config();
        cfg.max_primary = 1;
        let reranker = Reranker::new(None, Arc::new(CrossEncoderCache::new(300)), cfg);
        let ranked = reranker
            .rerank(
                "q",
                vec![candidate("a", 0.9), candidate("b", 0.8)],
                None,
                300.0,
            )
            .await;
        let primaries: Vec<_> = ranked
            .iter()
            .filter(|r| r.role == Some(EntityRole::Primary))
            .collect();
        assert_eq!(primaries.len(), 1);
    }

    #[tokio::test]
    async fn ordering_is_final_score_desc_then_entity_id_asc() {
        let reranker = Reranker::new(None, Arc::new(CrossEncoderCache::new(300)), config());
        let ranked = reranker
            .rerank(
                "q",
                vec![candidate("b", 0.5), candidate("a", 0.5)],
                None,
                300.0,
            )
            .await;
        assert_eq!(ranked[0].entity.entity_id, "a");
        assert_eq!(ranked[1].entity.entity_id, "b");
    }
}
