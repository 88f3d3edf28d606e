//! Pipeline Orchestrator. See spec §4.9.
//!
//! Wires C1–C8, enforces per-stage budgets and the overall deadline, and
//! schedules the best-effort background memory enrichment task.

use crate::analyzer::{self, AreaAliasTable, DomainKeywordTable};
use crate::clusters::ClusterIndex;
use crate::config::RetrievalConfig;
use crate::error::{CoreError, CoreResult};
use crate::formatter;
use crate::memory::summarizer;
use crate::memory::ConversationMemoryStore;
use crate::providers::{CrossEncoderProvider, EmbeddingProvider, LlmProvider};
use crate::reranker::{Candidate, CrossEncoderCache, Reranker};
use crate::retriever::EntityRetriever;
use crate::rewriter::QueryRewriter;
use crate::scope::ScopeDetector;
use crate::store::{ClusterStore, EntityStore};
use crate::types::{
    CoreRequest, CoreResponse, EntityRole, MentionedEntity, RankedEntitySummary, RewriteSummary,
    ScopeSummary, StageRecord, StageType,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Orchestrator {
    config: RetrievalConfig,
    areas: Arc<AreaAliasTable>,
    domains: Arc<DomainKeywordTable>,
    memory_store: Arc<dyn ConversationMemoryStore>,
    entity_store: Arc<dyn EntityStore>,
    cluster_store: Arc<dyn ClusterStore>,
    embedding: Arc<dyn EmbeddingProvider>,
    cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
    llm: Option<Arc<dyn LlmProvider>>,
    cross_encoder_cache: Arc<CrossEncoderCache>,
}

impl Orchestrator {
    pub fn new(
        config: RetrievalConfig,
        memory_store: Arc<dyn ConversationMemoryStore>,
        entity_store: Arc<dyn EntityStore>,
        cluster_store: Arc<dyn ClusterStore>,
        embedding: Arc<dyn EmbeddingProvider>,
        cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let cache = Arc::new(CrossEncoderCache::new(
            config.reranker.cross_encoder_cache_ttl_seconds,
        ));
        Self {
            config,
            areas: Arc::new(AreaAliasTable::default_table()),
            domains: Arc::new(DomainKeywordTable::default_table()),
            memory_store,
            entity_store,
            cluster_store,
            embedding,
            cross_encoder,
            llm,
            cross_encoder_cache: cache,
        }
    }

    pub async fn handle(&self, request: CoreRequest) -> CoreResult<CoreResponse> {
        if request.utterance.trim().is_empty() {
            return Err(CoreError::BadRequest("utterance must not be empty".to_string()));
        }

        let deadline = Duration::from_millis(self.config.orchestrator.deadline_ms);
        match tokio::time::timeout(deadline, self.run(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("orchestrator deadline exceeded, returning empty best-effort response");
                Ok(CoreResponse {
                    ranked: Vec::new(),
                    context: "Relevant domains: , Areas: \n".to_string(),
                    scope: ScopeSummary {
                        detected: crate::types::Scope::Macro,
                        confidence: 0.0,
                        optimal_k: self.config.scope.default_macro_k,
                    },
                    rewrite: RewriteSummary {
                        original: String::new(),
                        rewritten: String::new(),
                        method: crate::types::RewriteMethod::NoRewriteNeeded,
                        confidence: 0.0,
                    },
                    trace: None,
                })
            }
        }
    }

    async fn run(&self, request: CoreRequest) -> CoreResult<CoreResponse> {
        let mut trace = crate::types::PipelineTrace::default();
        let debug = request.debug;

        let memory = self.memory_store.load(&request.session_id).await;

        let t0 = Instant::now();
        let context = analyzer::analyze(
            &request.utterance,
            &request.history,
            memory.as_ref(),
            &self.areas,
            &self.domains,
        );
        record_stage(&mut trace, debug, "analyze", StageType::Transform, 1, 1, t0, "");

        let rewriter = QueryRewriter::new(
            (*self.areas).clone(),
            self.llm.clone(),
            self.config.rewriter.enabled,
            Duration::from_millis(self.config.rewriter.llm_timeout_ms),
        );
        let t1 = Instant::now();
        let rewrite = rewriter
            .rewrite(&request.utterance, &request.history, &context, memory.as_ref())
            .await;
        record_stage(&mut trace, debug, "rewrite", StageType::Transform, 1, 1, t1, &rewrite.method_label());

        let q = rewrite.rewritten.clone();

        let scope_detector = ScopeDetector::new(
            self.config.scope,
            (*self.areas).clone(),
            self.llm.clone(),
            Duration::from_millis(self.config.rewriter.llm_timeout_ms),
        );
        let t2 = Instant::now();
        let scope = scope_detector.detect(&q).await;
        record_stage(&mut trace, debug, "scope", StageType::Transform, 1, 1, t2, &scope.reasoning);

        let query_vector = self.embedding.embed_query(&q).await.ok();

        let cluster_index = ClusterIndex::new(self.cluster_store.clone(), self.config.cluster);
        let retriever = EntityRetriever::new(self.entity_store.clone(), self.config.retriever);

        let t3 = Instant::now();
        let (cluster_hits, retrieval_outcome) = tokio::join!(
            async {
                match &query_vector {
                    Some(v) => cluster_index.search(v, scope.scope, scope.optimal_k).await,
                    None => Vec::new(),
                }
            },
            retriever.retrieve(
                &q,
                &rewrite.query_variants,
                query_vector.as_deref(),
                scope.optimal_k,
            ),
        );

        let cluster_ids: Vec<String> = cluster_hits.iter().map(|(c, _)| c.id.clone()).collect();
        let cluster_members = cluster_index.expand(&cluster_ids).await;

        let retrieval_outcome = match retrieval_outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if cluster_members.is_empty() {
                    return Err(CoreError::RetrievalUnavailable);
                }
                tracing::warn!(error = %e, "entity retriever failed, continuing with cluster-only candidates");
                crate::retriever::RetrievalOutcome {
                    candidates: Vec::new(),
                    degradation: crate::retriever::RetrievalDegradation::TextUnavailable,
                }
            }
        };
        record_stage(
            &mut trace,
            debug,
            "retrieve",
            StageType::Search,
            1,
            cluster_members.len() + retrieval_outcome.candidates.len(),
            t3,
            "",
        );

        let candidates = self
            .merge_candidates(cluster_members, retrieval_outcome.candidates, scope.optimal_k)
            .await;

        let reranker = Reranker::new(
            self.cross_encoder.clone(),
            self.cross_encoder_cache.clone(),
            self.config.reranker,
        );
        let t4 = Instant::now();
        let ranked = reranker
            .rerank(&q, candidates, memory.as_ref(), self.config.memory.decay_constant_seconds)
            .await;
        record_stage(&mut trace, debug, "rerank", StageType::Rank, 0, ranked.len(), t4, "");

        let t5 = Instant::now();
        let formatted = formatter::format(&ranked, &scope, &context);
        record_stage(&mut trace, debug, "format", StageType::Transform, ranked.len(), ranked.len(), t5, "");

        self.schedule_background(request.session_id.clone(), request.history.clone(), ranked.clone(), context.clone());

        Ok(CoreResponse {
            ranked: ranked
                .iter()
                .map(|r| RankedEntitySummary {
                    entity_id: r.entity.entity_id.clone(),
                    final_score: r.final_score,
                    role: r.role.unwrap_or(EntityRole::Related),
                    ranking_factors: r.ranking_factors.clone(),
                })
                .collect(),
            context: formatted,
            scope: ScopeSummary {
                detected: scope.scope,
                confidence: scope.confidence,
                optimal_k: scope.optimal_k,
            },
            rewrite: RewriteSummary {
                original: rewrite.original,
                rewritten: rewrite.rewritten,
                method: rewrite.method,
                confidence: rewrite.confidence,
            },
            trace: if debug { Some(trace) } else { None },
        })
    }

    /// Union of cluster-expansion entities and retriever candidates, deduped
    /// by `entity_id` keeping the best score (spec §4.9). Cluster members
    /// the retriever didn't also surface are hydrated via
    /// `EntityStore::by_id` so they still reach the reranker carrying their
    /// cluster score intact (spec §4.6 fallback policy). Falls back to
    /// retriever results filling in the remainder when the cluster path is
    /// empty or thin.
    async fn merge_candidates(
        &self,
        cluster_members: Vec<(String, String, EntityRole, f32)>,
        retrieved: Vec<crate::retriever::RetrievedCandidate>,
        optimal_k: usize,
    ) -> Vec<Candidate> {
        use std::collections::HashMap;

        let mut by_id: HashMap<String, Candidate> = HashMap::new();
        let mut retrieved_by_id: HashMap<String, crate::retriever::RetrievedCandidate> =
            retrieved.into_iter().map(|r| (r.entity.entity_id.clone(), r)).collect();

        let cluster_weak = cluster_members.len() < optimal_k / 2;

        for (entity_id, cluster_id, _role, weight) in &cluster_members {
            let candidate = if let Some(retrieved) = retrieved_by_id.remove(entity_id) {
                Candidate {
                    retrieved,
                    cluster_score: Some(*weight),
                    source_cluster: Some(cluster_id.clone()),
                }
            } else if let Some(entity) = self.entity_store.by_id(entity_id).await {
                Candidate {
                    retrieved: crate::retriever::RetrievedCandidate {
                        entity,
                        vector_score: None,
                        text_score: None,
                        combined_score: *weight,
                    },
                    cluster_score: Some(*weight),
                    source_cluster: Some(cluster_id.clone()),
                }
            } else {
                tracing::warn!(entity_id = %entity_id, "cluster member missing from entity store, dropping");
                continue;
            };
            by_id.insert(entity_id.clone(), candidate);
        }

        if cluster_weak || by_id.len() < optimal_k {
            for (id, retrieved) in retrieved_by_id {
                by_id.insert(
                    id,
                    Candidate {
                        retrieved,
                        cluster_score: None,
                        source_cluster: None,
                    },
                );
            }
        }

        by_id.into_values().collect()
    }

    /// Best-effort post-response work: synchronous-shaped memory update plus
    /// the asynchronous summarization task (spec §4.3). Scheduled after the
    /// response is assembled; never blocks the caller and never fails the
    /// request.
    fn schedule_background(
        &self,
        session_id: String,
        history: Vec<crate::types::Turn>,
        ranked: Vec<crate::types::RankedEntity>,
        context: crate::types::ConversationContext,
    ) {
        let memory_store = self.memory_store.clone();
        let llm = self.llm.clone();
        let min_turns = self.config.memory.min_turns_for_summary;
        let llm_timeout = Duration::from_millis(self.config.rewriter.llm_timeout_ms);

        tokio::spawn(async move {
            let now = chrono::Utc::now();
            let mentioned: Vec<MentionedEntity> = ranked
                .iter()
                .filter(|r| r.role.is_some())
                .map(|r| MentionedEntity {
                    entity_id: r.entity.entity_id.clone(),
                    relevance: r.final_score,
                    mentioned_at: now,
                })
                .collect();
            let areas: Vec<String> = context.areas_mentioned.iter().cloned().collect();
            let domains: Vec<String> = context.domains_mentioned.iter().cloned().collect();
            memory_store.update(&session_id, mentioned, &areas, &domains).await;

            if history.len() + 1 < min_turns {
                return;
            }
            if !memory_store.try_mark_in_flight(&session_id) {
                return;
            }

            let known_areas: Vec<String> = areas.clone();
            let known_domains: Vec<String> = domains.clone();
            let summary = summarizer::summarize(&history, &known_areas, &known_domains, llm, llm_timeout).await;
            memory_store
                .write_summary(
                    &session_id,
                    summary.topic,
                    summary.current_focus,
                    summary.intent_pattern,
                    summary.topic_domains,
                    summary.context_entities,
                    summary.confidence,
                )
                .await;
            memory_store.clear_in_flight(&session_id);
        });
    }
}

fn record_stage(
    trace: &mut crate::types::PipelineTrace,
    debug: bool,
    name: &str,
    stage_type: StageType,
    input_count: usize,
    output_count: usize,
    started_at: Instant,
    details: &str,
) {
    if !debug {
        return;
    }
    trace.push(StageRecord {
        name: name.to_string(),
        stage_type,
        input_count,
        output_count,
        duration_ms: started_at.elapsed().as_millis() as u64,
        details: details.to_string(),
    });
}

impl crate::types::QueryRewriteResult {
    fn method_label(&self) -> String {
        format!("{:?}", self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMemoryStore;
    use crate::providers::testing::{FakeCrossEncoder, FakeEmbeddingProvider};
    use crate::store::{InMemoryClusterStore, InMemoryEntityStore};
    use crate::types::Entity;
    use std::collections::HashSet;

    fn entity(id: &str, area: &str, domain: &str, text: &str) -> Entity {
        Entity {
            entity_id: id.to_string(),
            domain: domain.to_string(),
            area: Some(area.to_string()),
            device_class: None,
            friendly_name: id.to_string(),
            unit: Some("%".to_string()),
            aliases: HashSet::new(),
            embedding: vec![1.0, 0.0],
            text: text.to_string(),
            state: Some("45".to_string()),
            last_updated: chrono::Utc::now(),
        }
    }

    fn orchestrator() -> Orchestrator {
        let config = RetrievalConfig::default();
        let entity_store = Arc::new(InMemoryEntityStore::new(vec![
            entity("sensor.garden_temp", "garden", "sensor", "garden temperature sensor"),
            entity("light.kitchen", "kitchen", "light", "kitchen light"),
        ]));
        let cluster_store = Arc::new(InMemoryClusterStore::new(vec![]));
        let memory_store = Arc::new(InMemoryMemoryStore::new(config.memory));
        let embedding = Arc::new(FakeEmbeddingProvider::new(config.embedding.dimension));
        Orchestrator::new(
            config,
            memory_store,
            entity_store,
            cluster_store,
            embedding,
            Some(Arc::new(FakeCrossEncoder::default())),
            None,
        )
    }

    #[tokio::test]
    async fn rejects_empty_utterance() {
        let orchestrator = orchestrator();
        let request = CoreRequest {
            session_id: "s1".to_string(),
            utterance: "   ".to_string(),
            history: vec![],
            debug: false,
        };
        let result = orchestrator.handle(request).await;
        assert!(matches!(result, Err(CoreError::BadRequest(_))));
    }

    #[tokio::test]
    async fn scenario_b_control_ambiguous_area() {
        let orchestrator = orchestrator();
        let request = CoreRequest {
            session_id: "s1".to_string(),
            utterance: "turn on the light".to_string(),
            history: vec![],
            debug: true,
        };
        let response = orchestrator.handle(request).await.unwrap();
        assert_eq!(response.scope.detected, crate::types::Scope::Micro);
        assert!(response.scope.optimal_k <= 10);
        assert!(response.trace.is_some());
    }

    #[tokio::test]
    async fn response_respects_deadline_even_when_collaborators_are_slow() {
        let config = RetrievalConfig::default();
        let entity_store = Arc::new(InMemoryEntityStore::new(vec![entity(
            "sensor.x",
            "kitchen",
            "sensor",
            "kitchen sensor",
        )]));
        let cluster_store = Arc::new(InMemoryClusterStore::new(vec![]));
        let memory_store = Arc::new(InMemoryMemoryStore::new(config.memory));
        let embedding = Arc::new(FakeEmbeddingProvider::new(config.embedding.dimension));
        let orchestrator = Orchestrator::new(
            config,
            memory_store,
            entity_store,
            cluster_store,
            embedding,
            Some(Arc::new(FakeCrossEncoder {
                fail: false,
                delay_ms: 5000,
            })),
            None,
        );
        let request = CoreRequest {
            session_id: "s1".to_string(),
            utterance: "what is the humidity".to_string(),
            history: vec![],
            debug: false,
        };
        let started = Instant::now();
        let _ = orchestrator.handle(request).await;
        assert!(started.elapsed() < Duration::from_millis(1700));
    }

    /// A cluster's primary member that the retriever itself never surfaces
    /// (vector path forced below threshold, text path shares no tokens with
    /// the query) must still reach the ranked output, hydrated straight from
    /// the entity store via `by_id`.
    #[tokio::test]
    async fn cluster_only_primary_entity_is_hydrated_via_entity_store() {
        let mut config = RetrievalConfig::default();
        config.retriever.vector_min_similarity = 2.0;
        config.cluster.min_similarity = 0.0;

        let entity_store = Arc::new(InMemoryEntityStore::new(vec![entity(
            "sensor.garden_temp",
            "garden",
            "sensor",
            "garden temperature sensor",
        )]));
        let cluster_store = Arc::new(InMemoryClusterStore::new(vec![crate::types::Cluster {
            id: "c1".to_string(),
            cluster_type: crate::types::ClusterType::Overview,
            scope: crate::types::ClusterScope::Global,
            embedding: vec![0.0; config.embedding.dimension],
            query_patterns: vec![],
            areas: HashSet::new(),
            domains: HashSet::new(),
            members: vec![crate::types::ClusterMember {
                entity_id: "sensor.garden_temp".to_string(),
                role: EntityRole::Primary,
                weight: 0.9,
                context_boost: 0.0,
            }],
        }]));
        let memory_store = Arc::new(InMemoryMemoryStore::new(config.memory));
        let embedding = Arc::new(FakeEmbeddingProvider::new(config.embedding.dimension));
        let orchestrator = Orchestrator::new(
            config,
            memory_store,
            entity_store,
            cluster_store,
            embedding,
            Some(Arc::new(FakeCrossEncoder::default())),
            None,
        );

        let request = CoreRequest {
            session_id: "s1".to_string(),
            utterance: "show me everything in the house".to_string(),
            history: vec![],
            debug: false,
        };
        let response = orchestrator.handle(request).await.unwrap();
        assert!(response.ranked.iter().any(|r| r.entity_id == "sensor.garden_temp"));
    }
}
