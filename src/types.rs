//! Core data model: entities, clusters, conversation memory and the
//! request-scoped types produced as the pipeline runs. See spec §3.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A smart-home device or sensor, addressable by a stable id.
///
/// Entities are owned by the external ingestion path; the retrieval core
/// treats them as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub domain: String,
    pub area: Option<String>,
    pub device_class: Option<String>,
    pub friendly_name: String,
    pub unit: Option<String>,
    pub aliases: HashSet<String>,
    /// Unit-normalized embedding of dimension `EmbeddingConfig::dimension`.
    pub embedding: Vec<f32>,
    pub text: String,
    pub state: Option<String>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterType {
    Micro,
    Macro,
    Overview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterScope {
    Specific,
    AreaWide,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRole {
    Primary,
    Related,
}

/// A member entity of a cluster with its role and weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    pub entity_id: String,
    pub role: EntityRole,
    pub weight: f32,
    pub context_boost: f32,
}

/// A pre-computed semantic grouping of entities around a use case.
///
/// Invariant: every cluster has at least one `Primary` member; `weight` and
/// `context_boost` on every member are finite and non-negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub cluster_type: ClusterType,
    pub scope: ClusterScope,
    pub embedding: Vec<f32>,
    pub query_patterns: Vec<String>,
    pub areas: HashSet<String>,
    pub domains: HashSet<String>,
    pub members: Vec<ClusterMember>,
}

impl Cluster {
    /// Checks the "≥1 primary member" invariant; callers that construct
    /// clusters from ingestion data should assert this before publishing.
    pub fn has_primary_member(&self) -> bool {
        self.members.iter().any(|m| m.role == EntityRole::Primary)
    }
}

/// An entity mention recorded in a session's conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionedEntity {
    pub entity_id: String,
    pub relevance: f32,
    pub mentioned_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentPattern {
    Control,
    Monitor,
    Read,
    Unknown,
}

/// Rolling summary of a session's conversation, produced by the background
/// enrichment task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub topic: String,
    pub current_focus: Option<String>,
    pub intent_pattern: Option<IntentPattern>,
    pub topic_domains: HashSet<String>,
    pub context_entities: HashSet<String>,
    pub confidence: f32,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// One entry in a session's bounded (≤10) focus history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusHistoryEntry {
    pub area: Option<String>,
    pub domain: Option<String>,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Per-session cached conversation state, keyed by `session_id`.
///
/// Invariants: `ttl > last_updated`; after expiry the record is invisible to
/// reads; `focus_history.len() <= 10`; `entities` is deduplicated on
/// `entity_id`, keeping the latest `mentioned_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub session_id: String,
    pub entities: Vec<MentionedEntity>,
    pub areas_mentioned: HashSet<String>,
    pub domains_mentioned: HashSet<String>,
    pub query_count: u32,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    pub ttl: chrono::DateTime<chrono::Utc>,
    pub summary: Option<ConversationSummary>,
    pub focus_history: Vec<FocusHistoryEntry>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>, ttl_seconds: i64) -> Self {
        let now = chrono::Utc::now();
        Self {
            session_id: session_id.into(),
            entities: Vec::new(),
            areas_mentioned: HashSet::new(),
            domains_mentioned: HashSet::new(),
            query_count: 0,
            last_updated: now,
            ttl: now + chrono::Duration::seconds(ttl_seconds),
            summary: None,
            focus_history: Vec::new(),
        }
    }

    pub fn is_expired(&self, at: chrono::DateTime<chrono::Utc>) -> bool {
        at >= self.ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intent {
    Read,
    Control,
    Monitor,
    Unknown,
}

/// Request-scoped output of the Conversation Analyzer (C1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationContext {
    pub areas_mentioned: HashSet<String>,
    pub domains_mentioned: HashSet<String>,
    pub device_classes_mentioned: HashSet<String>,
    pub intent: Option<Intent>,
    pub is_follow_up: bool,
    pub previous_areas: HashSet<String>,
}

impl Default for Intent {
    fn default() -> Self {
        Intent::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteMethod {
    NoRewriteNeeded,
    RuleBased,
    Llm,
}

/// Output of the Query Rewriter (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRewriteResult {
    pub original: String,
    pub rewritten: String,
    pub method: RewriteMethod,
    pub confidence: f32,
    pub coreferences_resolved: HashSet<String>,
    pub reasoning: Option<String>,
    /// Internal enrichment (SPEC_FULL §4.2s): up to 3 phrasing variants of
    /// `rewritten`, used only by C6 as additional text-search probes.
    pub query_variants: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Micro,
    Macro,
    Overview,
}

/// Output of the Scope Detector (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDecision {
    pub scope: Scope,
    pub confidence: f32,
    pub optimal_k: usize,
    pub reasoning: String,
}

/// Final per-entity ranking record produced by the Reranker (C7).
///
/// Invariant: `final_score == base_score + context_boost`; the list this
/// appears in is ordered by `final_score` descending, `entity_id` ascending
/// as a tie-break.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity: Entity,
    pub cluster_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub text_score: Option<f32>,
    pub cross_encoder_raw: Option<f32>,
    pub base_score: f32,
    pub context_boost: f32,
    pub final_score: f32,
    pub source_cluster: Option<String>,
    pub role: Option<EntityRole>,
    pub ranking_factors: HashMap<String, f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageType {
    Transform,
    Search,
    Boost,
    Rank,
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub stage_type: StageType,
    pub input_count: usize,
    pub output_count: usize,
    pub duration_ms: u64,
    pub details: String,
}

/// Per-request observability record; not part of the returned result unless
/// the caller asked for `debug=true`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineTrace {
    pub stages: Vec<StageRecord>,
}

impl PipelineTrace {
    pub fn push(&mut self, record: StageRecord) {
        self.stages.push(record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: ChatRole,
    pub content: String,
}

/// Core request accepted by the orchestrator. See spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreRequest {
    pub session_id: String,
    pub utterance: String,
    pub history: Vec<Turn>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedEntitySummary {
    pub entity_id: String,
    pub final_score: f32,
    pub role: EntityRole,
    pub ranking_factors: HashMap<String, f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub detected: Scope,
    pub confidence: f32,
    pub optimal_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteSummary {
    pub original: String,
    pub rewritten: String,
    pub method: RewriteMethod,
    pub confidence: f32,
}

/// Core response returned by the orchestrator. See spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreResponse {
    pub ranked: Vec<RankedEntitySummary>,
    pub context: String,
    pub scope: ScopeSummary,
    pub rewrite: RewriteSummary,
    pub trace: Option<PipelineTrace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_expiry_is_at_or_after_ttl() {
        let mem = ConversationMemory::new("s1", 900);
        assert!(!mem.is_expired(mem.last_updated));
        assert!(mem.is_expired(mem.ttl));
    }

    #[test]
    fn cluster_primary_invariant_detects_violations() {
        let cluster = Cluster {
            id: "c1".into(),
            cluster_type: ClusterType::Macro,
            scope: ClusterScope::AreaWide,
            embedding: vec![0.0; 4],
            query_patterns: vec![],
            areas: HashSet::new(),
            domains: HashSet::new(),
            members: vec![ClusterMember {
                entity_id: "sensor.x".into(),
                role: EntityRole::Related,
                weight: 1.0,
                context_boost: 0.0,
            }],
        };
        assert!(!cluster.has_primary_member());
    }
}
