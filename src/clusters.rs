//! Cluster Index (C5). See spec §4.5.
//!
//! Thin orchestration layer over `ClusterStore`: the store itself already
//! implements the deterministic top-k search and role-filtered expand; this
//! module wires in the configured similarity floor and allowed-type mapping
//! from a `ScopeDecision`.

use crate::config::ClusterConfig;
use crate::store::ClusterStore;
use crate::types::{ClusterType, EntityRole, Scope};
use std::sync::Arc;

pub struct ClusterIndex {
    store: Arc<dyn ClusterStore>,
    config: ClusterConfig,
}

impl ClusterIndex {
    pub fn new(store: Arc<dyn ClusterStore>, config: ClusterConfig) -> Self {
        Self { store, config }
    }

    pub fn allowed_types_for(scope: Scope) -> Vec<ClusterType> {
        match scope {
            Scope::Micro => vec![ClusterType::Micro],
            Scope::Macro => vec![ClusterType::Micro, ClusterType::Macro],
            Scope::Overview => vec![ClusterType::Overview, ClusterType::Macro],
        }
    }

    pub async fn search(
        &self,
        query_vector: &[f32],
        scope: Scope,
        k: usize,
    ) -> Vec<(crate::types::Cluster, f32)> {
        let allowed = Self::allowed_types_for(scope);
        self.store
            .search(query_vector, &allowed, k, self.config.min_similarity)
            .await
    }

    pub async fn expand(
        &self,
        cluster_ids: &[String],
    ) -> Vec<(String, String, EntityRole, f32)> {
        self.store
            .expand(cluster_ids, &[EntityRole::Primary, EntityRole::Related])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_types_are_most_specific_first_for_micro() {
        let types = ClusterIndex::allowed_types_for(Scope::Micro);
        assert_eq!(types, vec![ClusterType::Micro]);
    }

    #[test]
    fn overview_includes_macro_as_backstop() {
        let types = ClusterIndex::allowed_types_for(Scope::Overview);
        assert!(types.contains(&ClusterType::Overview));
    }
}
