//! Conversation Memory (C3): synchronous session state plus asynchronous
//! enrichment. See spec §4.3.

pub mod summarizer;

use crate::config::MemoryConfig;
use crate::types::{ConversationMemory, FocusHistoryEntry, IntentPattern, MentionedEntity};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// `memory_store.get`/`put`, both honoring the TTL contract (spec §6).
#[async_trait::async_trait]
pub trait ConversationMemoryStore: Send + Sync {
    /// Lookup; returns `None` if missing or expired. Must complete in < 20ms.
    async fn load(&self, session_id: &str) -> Option<ConversationMemory>;

    /// Append mentioned entities (cap at `max_entities_per_session`, evicting
    /// least-recently-mentioned), union areas/domains, bump `query_count`,
    /// refresh `ttl`. Deduplicates on `entity_id` keeping the latest
    /// timestamp. Must complete in < 20ms; holds the per-session lock for
    /// the duration of the call.
    async fn update(
        &self,
        session_id: &str,
        new_entities: Vec<MentionedEntity>,
        areas: &[String],
        domains: &[String],
    );

    /// Best-effort write-back of a background-computed summary. Discarded
    /// if the record has since expired (scenario F).
    async fn write_summary(
        &self,
        session_id: &str,
        topic: String,
        current_focus: Option<String>,
        intent_pattern: Option<IntentPattern>,
        topic_domains: std::collections::HashSet<String>,
        context_entities: std::collections::HashSet<String>,
        confidence: f32,
    );

    /// True if a background summarization task is already in flight for
    /// this session; used to enforce at-most-one-pending-task-per-session.
    fn try_mark_in_flight(&self, session_id: &str) -> bool;

    fn clear_in_flight(&self, session_id: &str);
}

/// In-memory `ConversationMemoryStore`. Snapshot-isolated reads (no lock
/// held across the call), per-session lock on write, matching §5's
/// "readers are lock-free" / "per-session lock on update" requirements.
pub struct InMemoryMemoryStore {
    config: MemoryConfig,
    records: Arc<RwLock<HashMap<String, ConversationMemory>>>,
    in_flight: Arc<DashMap<String, ()>>,
}

impl InMemoryMemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            records: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    fn is_expired(memory: &ConversationMemory, now: chrono::DateTime<chrono::Utc>) -> bool {
        memory.is_expired(now)
    }
}

#[async_trait::async_trait]
impl ConversationMemoryStore for InMemoryMemoryStore {
    async fn load(&self, session_id: &str) -> Option<ConversationMemory> {
        let now = Utc::now();
        let records = self.records.read();
        match records.get(session_id) {
            Some(memory) if !Self::is_expired(memory, now) => Some(memory.clone()),
            _ => None,
        }
    }

    async fn update(
        &self,
        session_id: &str,
        new_entities: Vec<MentionedEntity>,
        areas: &[String],
        domains: &[String],
    ) {
        let now = Utc::now();
        let mut records = self.records.write();
        let memory = records
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationMemory::new(session_id, self.config.ttl_seconds));

        if Self::is_expired(memory, now) {
            *memory = ConversationMemory::new(session_id, self.config.ttl_seconds);
        }

        for entity in new_entities {
            memory.entities.retain(|e| e.entity_id != entity.entity_id);
            memory.entities.push(entity);
        }
        memory
            .entities
            .sort_by(|a, b| a.mentioned_at.cmp(&b.mentioned_at));
        let cap = self.config.max_entities_per_session;
        if memory.entities.len() > cap {
            let excess = memory.entities.len() - cap;
            memory.entities.drain(0..excess);
        }

        memory.areas_mentioned.extend(areas.iter().cloned());
        memory.domains_mentioned.extend(domains.iter().cloned());
        memory.query_count += 1;
        memory.last_updated = now;
        memory.ttl = now + chrono::Duration::seconds(self.config.ttl_seconds);

        if let (Some(area), Some(domain)) = (areas.first(), domains.first()) {
            memory.focus_history.push(FocusHistoryEntry {
                area: Some(area.clone()),
                domain: Some(domain.clone()),
                recorded_at: now,
            });
            let max = self.config.max_focus_history;
            if memory.focus_history.len() > max {
                let excess = memory.focus_history.len() - max;
                memory.focus_history.drain(0..excess);
            }
        }
    }

    async fn write_summary(
        &self,
        session_id: &str,
        topic: String,
        current_focus: Option<String>,
        intent_pattern: Option<IntentPattern>,
        topic_domains: std::collections::HashSet<String>,
        context_entities: std::collections::HashSet<String>,
        confidence: f32,
    ) {
        let now = Utc::now();
        let mut records = self.records.write();
        if let Some(memory) = records.get_mut(session_id) {
            if Self::is_expired(memory, now) {
                tracing::debug!(session_id, "discarding summary write for expired session");
                records.remove(session_id);
                return;
            }
            memory.summary = Some(crate::types::ConversationSummary {
                topic,
                current_focus,
                intent_pattern,
                topic_domains,
                context_entities,
                confidence,
                generated_at: now,
            });
        }
    }

    fn try_mark_in_flight(&self, session_id: &str) -> bool {
        self.in_flight.insert(session_id.to_string(), ()).is_none()
    }

    fn clear_in_flight(&self, session_id: &str) {
        self.in_flight.remove(session_id);
    }
}

/// Computes the C7 memory boost weight described in spec §4.3.
///
/// Bounded to `[1.0, max_weight]` (spec §4.3 invariant / §8 property 6).
pub fn boost_weight(
    entity_id: &str,
    entity_area: Option<&str>,
    entity_domain: &str,
    memory: &ConversationMemory,
    now: chrono::DateTime<chrono::Utc>,
    decay_constant_seconds: f64,
    max_weight: f32,
) -> f32 {
    let mut w = 1.0f32;

    if let Some(mention) = memory.entities.iter().find(|e| e.entity_id == entity_id) {
        let age = (now - mention.mentioned_at).num_seconds().max(0) as f64;
        let decay = (-age / decay_constant_seconds).exp() as f32;
        w *= 1.5 * decay;
    }

    if let Some(area) = entity_area {
        if memory.areas_mentioned.contains(area) {
            w *= 1.3;
        }
    }

    if memory.domains_mentioned.contains(entity_domain) {
        w *= 1.2;
    }

    if let Some(summary) = &memory.summary {
        if summary.topic_domains.contains(entity_domain) {
            w *= 1.3;
        }
        if let (Some(focus), Some(area)) = (&summary.current_focus, entity_area) {
            if focus == area {
                w *= 2.0;
            }
        }
        match summary.intent_pattern {
            Some(IntentPattern::Control) if entity_domain == "switch" || entity_domain == "light" => {
                w *= 1.2;
            }
            Some(IntentPattern::Monitor) if entity_domain == "sensor" => {
                w *= 1.2;
            }
            _ => {}
        }
    }

    w.clamp(1.0, max_weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MentionedEntity;

    fn config() -> MemoryConfig {
        MemoryConfig {
            ttl_seconds: 900,
            decay_constant_seconds: 300.0,
            max_entities_per_session: 50,
            max_focus_history: 10,
            min_turns_for_summary: 2,
        }
    }

    #[tokio::test]
    async fn load_returns_none_for_missing_session() {
        let store = InMemoryMemoryStore::new(config());
        assert!(store.load("unknown").await.is_none());
    }

    #[tokio::test]
    async fn update_then_load_round_trips() {
        let store = InMemoryMemoryStore::new(config());
        store
            .update(
                "s1",
                vec![MentionedEntity {
                    entity_id: "sensor.kitchen_humidity".into(),
                    relevance: 0.9,
                    mentioned_at: Utc::now(),
                }],
                &["kitchen".to_string()],
                &["sensor".to_string()],
            )
            .await;

        let memory = store.load("s1").await.unwrap();
        assert_eq!(memory.query_count, 1);
        assert!(memory.areas_mentioned.contains("kitchen"));
    }

    #[tokio::test]
    async fn dedup_keeps_latest_mention() {
        let store = InMemoryMemoryStore::new(config());
        let first = Utc::now() - chrono::Duration::seconds(10);
        let second = Utc::now();
        store
            .update(
                "s1",
                vec![MentionedEntity {
                    entity_id: "sensor.x".into(),
                    relevance: 0.5,
                    mentioned_at: first,
                }],
                &[],
                &[],
            )
            .await;
        store
            .update(
                "s1",
                vec![MentionedEntity {
                    entity_id: "sensor.x".into(),
                    relevance: 0.9,
                    mentioned_at: second,
                }],
                &[],
                &[],
            )
            .await;

        let memory = store.load("s1").await.unwrap();
        let mentions: Vec<_> = memory
            .entities
            .iter()
            .filter(|e| e.entity_id == "sensor.x")
            .collect();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].mentioned_at, second);
    }

    #[test]
    fn boost_weight_bounded_in_one_to_three() {
        let mut memory = ConversationMemory::new("s1", 900);
        memory.areas_mentioned.insert("kitchen".into());
        memory.domains_mentioned.insert("sensor".into());
        memory.entities.push(MentionedEntity {
            entity_id: "sensor.kitchen_humidity".into(),
            relevance: 0.9,
            mentioned_at: Utc::now(),
        });
        let w = boost_weight(
            "sensor.kitchen_humidity",
            Some("kitchen"),
            "sensor",
            &memory,
            Utc::now(),
            300.0,
            3.0,
        );
        assert!((1.0..=3.0).contains(&w));
    }

    /// A mention old enough that decay alone would drag the multiplicative
    /// weight below 1.0 (e.g. age 200s, decay ~= 0.51, 1.5*decay ~= 0.77)
    /// must still clamp up to the 1.0 floor rather than demoting the entity.
    #[test]
    fn boost_weight_floors_at_one_for_stale_mention_with_no_other_signal() {
        let mut memory = ConversationMemory::new("s1", 900);
        let mentioned_at = Utc::now() - chrono::Duration::seconds(200);
        memory.entities.push(MentionedEntity {
            entity_id: "sensor.kitchen_humidity".into(),
            relevance: 0.9,
            mentioned_at,
        });
        let w = boost_weight(
            "sensor.kitchen_humidity",
            None,
            "sensor",
            &memory,
            Utc::now(),
            300.0,
            3.0,
        );
        assert!((1.0..=3.0).contains(&w));
        assert_eq!(w, 1.0);
    }

    #[test]
    fn in_flight_flag_is_set_once() {
        let store = InMemoryMemoryStore::new(config());
        assert!(store.try_mark_in_flight("s1"));
        assert!(!store.try_mark_in_flight("s1"));
        store.clear_in_flight("s1");
        assert!(store.try_mark_in_flight("s1"));
    }
}
