//! `EntityStore`: vector + text search over entities (spec §6).
//!
//! The in-memory implementation is a fake for tests and small deployments —
//! production backends (vector DB, full-text index) implement the same
//! trait. Concurrency model per spec §5: readers never lock; writers
//! install a whole new snapshot under a `parking_lot::RwLock`.

use crate::types::Entity;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    async fn vector_search(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<(Entity, f32)>>;
    async fn text_search(&self, query: &str, k: usize) -> anyhow::Result<Vec<(Entity, f32)>>;
    async fn by_id(&self, id: &str) -> Option<Entity>;
}

pub struct InMemoryEntityStore {
    entities: Arc<RwLock<HashMap<String, Entity>>>,
}

impl InMemoryEntityStore {
    pub fn new(entities: Vec<Entity>) -> Self {
        let map = entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect();
        Self {
            entities: Arc::new(RwLock::new(map)),
        }
    }

    /// Replace the whole snapshot — the "store-native atomic swap" the spec
    /// asks for, realized with a write-lock swap of the backing map.
    pub fn replace_all(&self, entities: Vec<Entity>) {
        let map = entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect();
        *self.entities.write() = map;
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn tokenize(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

/// Simple term-overlap score over `entity.text` and `aliases`, standing in
/// for the BM25-style text index spec §4.6 describes.
fn text_score(query_tokens: &[String], entity: &Entity) -> f32 {
    let mut haystack_tokens = tokenize(&entity.text);
    for alias in &entity.aliases {
        haystack_tokens.extend(tokenize(alias));
    }
    if query_tokens.is_empty() || haystack_tokens.is_empty() {
        return 0.0;
    }
    let hits = query_tokens
        .iter()
        .filter(|t| haystack_tokens.contains(t))
        .count();
    hits as f32 / query_tokens.len() as f32
}

#[async_trait::async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn vector_search(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<(Entity, f32)>> {
        let entities = self.entities.read();
        let mut scored: Vec<(Entity, f32)> = entities
            .values()
            .map(|e| (e.clone(), cosine_similarity(vector, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entity_id.cmp(&b.0.entity_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn text_search(&self, query: &str, k: usize) -> anyhow::Result<Vec<(Entity, f32)>> {
        let query_tokens = tokenize(query);
        let entities = self.entities.read();
        let mut scored: Vec<(Entity, f32)> = entities
            .values()
            .map(|e| (e.clone(), text_score(&query_tokens, e)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.entity_id.cmp(&b.0.entity_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn by_id(&self, id: &str) -> Option<Entity> {
        self.entities.read().get(id).cloned()
    }
}
