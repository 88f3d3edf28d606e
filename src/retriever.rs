//! Entity Retriever (C6). See spec §4.6.
//!
//! Hybrid vector + text search over the entity store, run concurrently and
//! merged by the rule in §4.6. Grounded in the reference crate's
//! `search::hybrid` fusion module, specialized to the spec's fixed
//! 0.7·vec + 0.3·text weighting rather than RRF.

use crate::config::RetrieverConfig;
use crate::store::EntityStore;
use crate::types::Entity;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RetrievedCandidate {
    pub entity: Entity,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
    pub combined_score: f32,
}

pub struct EntityRetriever {
    store: Arc<dyn EntityStore>,
    config: RetrieverConfig,
}

/// Which backend paths succeeded, for trace annotation + the orchestrator's
/// "both paths failed" escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalDegradation {
    None,
    VectorUnavailable,
    TextUnavailable,
}

pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievedCandidate>,
    pub degradation: RetrievalDegradation,
}

impl EntityRetriever {
    pub fn new(store: Arc<dyn EntityStore>, config: RetrieverConfig) -> Self {
        Self { store, config }
    }

    /// Runs the vector and text paths concurrently and merges them.
    /// `query_variants` (spec §4.2s) are used as additional text probes.
    pub async fn retrieve(
        &self,
        rewritten_query: &str,
        query_variants: &[String],
        query_vector: Option<&[f32]>,
        optimal_k: usize,
    ) -> anyhow::Result<RetrievalOutcome> {
        let vector_k = optimal_k * self.config.candidate_multiplier;

        let vector_fut = async {
            match query_vector {
                Some(v) => self.store.vector_search(v, vector_k).await,
                None => Ok(Vec::new()),
            }
        };
        let text_fut = async {
            let mut merged: HashMap<String, (Entity, f32)> = HashMap::new();
            let mut probes = vec![rewritten_query.to_string()];
            probes.extend(query_variants.iter().cloned());
            for probe in &probes {
                match self.store.text_search(probe, optimal_k).await {
                    Ok(hits) => {
                        for (entity, score) in hits {
                            merged
                                .entry(entity.entity_id.clone())
                                .and_modify(|(_, existing)| {
                                    if score > *existing {
                                        *existing = score;
                                    }
                                })
                                .or_insert((entity, score));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(merged.into_values().collect::<Vec<_>>())
        };

        let (vector_result, text_result) = tokio::join!(vector_fut, text_fut);

        let (vector_hits, vector_failed) = match vector_result {
            Ok(hits) => (hits, false),
            Err(e) => {
                tracing::warn!(error = %e, "vector search failed, falling through to text-only");
                (Vec::new(), true)
            }
        };
        let (text_hits, text_failed) = match text_result {
            Ok(hits) => (hits, false),
            Err(e) => {
                tracing::warn!(error = %e, "text search failed, falling through to vector-only");
                (Vec::new(), true)
            }
        };

        if vector_failed && text_failed {
            anyhow::bail!("both vector and text retrieval paths failed");
        }

        let degradation = match (vector_failed, text_failed) {
            (true, false) => RetrievalDegradation::VectorUnavailable,
            (false, true) => RetrievalDegradation::TextUnavailable,
            _ => RetrievalDegradation::None,
        };

        Ok(RetrievalOutcome {
            candidates: self.merge(
                vector_hits
                    .into_iter()
                    .filter(|(_, sim)| *sim >= self.config.vector_min_similarity)
                    .collect(),
                text_hits,
            ),
            degradation,
        })
    }

    /// Merge rule (spec §4.6): normalize vector scores to [0,1] (cosine
    /// similarity already is); `combined = 0.7*vec + 0.3*text` when both
    /// hit, `vec` alone for vector-only, `0.5*text` for text-only. Tie-break
    /// higher combined, then ascending `entity_id`.
    fn merge(
        &self,
        vector_hits: Vec<(Entity, f32)>,
        text_hits: Vec<(Entity, f32)>,
    ) -> Vec<RetrievedCandidate> {
        let mut by_id: HashMap<String, RetrievedCandidate> = HashMap::new();

        for (entity, sim) in vector_hits {
            by_id.insert(
                entity.entity_id.clone(),
                RetrievedCandidate {
                    entity,
                    vector_score: Some(sim),
                    text_score: None,
                    combined_score: sim,
                },
            );
        }

        for (entity, score) in text_hits {
            by_id
                .entry(entity.entity_id.clone())
                .and_modify(|c| {
                    c.text_score = Some(score);
                    c.combined_score = 0.7 * c.vector_score.unwrap_or(0.0) + 0.3 * score;
                })
                .or_insert_with(|| RetrievedCandidate {
                    entity,
                    vector_score: None,
                    text_score: Some(score),
                    combined_score: 0.5 * score,
                });
        }

        let mut merged: Vec<RetrievedCandidate> = by_id.into_values().collect();
        merged.sort_by(|a, b| {
            b.combined_score
                .partial_cmp(&a.combined_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity.entity_id.cmp(&b.entity.entity_id))
        });
        merged
    }
}
