//! `ClusterStore`: semantic cluster search + entity-membership expansion
//! (spec §4.5, §6).

use crate::types::{Cluster, ClusterMember, ClusterType, EntityRole};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait::async_trait]
pub trait ClusterStore: Send + Sync {
    async fn search(
        &self,
        vector: &[f32],
        allowed_types: &[ClusterType],
        k: usize,
        min_similarity: f32,
    ) -> Vec<(Cluster, f32)>;

    async fn expand(
        &self,
        cluster_ids: &[String],
        roles: &[EntityRole],
    ) -> Vec<(String, String, EntityRole, f32)>;
}

pub struct InMemoryClusterStore {
    clusters: Arc<RwLock<HashMap<String, Cluster>>>,
}

impl InMemoryClusterStore {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let map = clusters.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            clusters: Arc::new(RwLock::new(map)),
        }
    }

    pub fn replace_all(&self, clusters: Vec<Cluster>) {
        let map = clusters.into_iter().map(|c| (c.id.clone(), c)).collect();
        *self.clusters.write() = map;
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

#[async_trait::async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn search(
        &self,
        vector: &[f32],
        allowed_types: &[ClusterType],
        k: usize,
        min_similarity: f32,
    ) -> Vec<(Cluster, f32)> {
        let clusters = self.clusters.read();
        let mut scored: Vec<(Cluster, f32)> = clusters
            .values()
            .filter(|c| allowed_types.is_empty() || allowed_types.contains(&c.cluster_type))
            .map(|c| (c.clone(), cosine_similarity(vector, &c.embedding)))
            .filter(|(_, sim)| *sim >= min_similarity)
            .collect();

        // Deterministic given identical inputs: sort by similarity desc,
        // ties broken by lexicographic cluster id.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        scored
    }

    async fn expand(
        &self,
        cluster_ids: &[String],
        roles: &[EntityRole],
    ) -> Vec<(String, String, EntityRole, f32)> {
        let clusters = self.clusters.read();
        let mut by_entity: HashMap<String, (String, EntityRole, f32)> = HashMap::new();

        for cluster_id in cluster_ids {
            let Some(cluster) = clusters.get(cluster_id) else {
                continue;
            };
            for member in &cluster.members {
                if !roles.is_empty() && !roles.contains(&member.role) {
                    continue;
                }
                // Dedup by entity_id, keeping the highest-weight membership.
                by_entity
                    .entry(member.entity_id.clone())
                    .and_modify(|existing| {
                        if member.weight > existing.2 {
                            *existing = (cluster_id.clone(), member.role, member.weight);
                        }
                    })
                    .or_insert((cluster_id.clone(), member.role, member.weight));
            }
        }

        by_entity
            .into_iter()
            .map(|(entity_id, (cluster_id, role, weight))| (entity_id, cluster_id, role, weight))
            .collect()
    }
}

pub fn member(entity_id: &str, role: EntityRole, weight: f32, context_boost: f32) -> ClusterMember {
    ClusterMember {
        entity_id: entity_id.to_string(),
        role,
        weight,
        context_boost,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cluster(id: &str, embedding: Vec<f32>, members: Vec<ClusterMember>) -> Cluster {
        Cluster {
            id: id.to_string(),
            cluster_type: ClusterType::Macro,
            scope: crate::types::ClusterScope::AreaWide,
            embedding,
            query_patterns: vec![],
            areas: HashSet::new(),
            domains: HashSet::new(),
            members,
        }
    }

    #[tokio::test]
    async fn search_breaks_ties_by_cluster_id() {
        let store = InMemoryClusterStore::new(vec![
            cluster("z", vec![1.0, 0.0], vec![member("e1", EntityRole::Primary, 1.0, 0.0)]),
            cluster("a", vec![1.0, 0.0], vec![member("e2", EntityRole::Primary, 1.0, 0.0)]),
        ]);
        let results = store
            .search(&[1.0, 0.0], &[], 10, 0.0)
            .await;
        assert_eq!(results[0].0.id, "a");
    }

    #[tokio::test]
    async fn expand_dedups_keeping_highest_weight() {
        let store = InMemoryClusterStore::new(vec![
            cluster(
                "c1",
                vec![1.0],
                vec![member("e1", EntityRole::Related, 0.5, 0.0)],
            ),
            cluster(
                "c2",
                vec![1.0],
                vec![member("e1", EntityRole::Primary, 0.9, 0.0)],
            ),
        ]);
        let expanded = store
            .expand(&["c1".to_string(), "c2".to_string()], &[])
            .await;
        assert_eq!(expanded.len(), 1);
        assert_eq!(expanded[0].3, 0.9);
    }
}
