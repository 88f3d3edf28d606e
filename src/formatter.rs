//! Context Formatter (C8). See spec §4.8.
//!
//! Selects one of four layouts and renders a context block for the LLM
//! gateway. Deterministic given its input; never emits more than
//! `MAX_PRIMARY + MAX_RELATED` entities; every layout ends with a one-line
//! domains/areas footer.

use crate::types::{ConversationContext, EntityRole, RankedEntity, Scope, ScopeDecision};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Compact,
    Tldr,
    GroupedByArea,
    Detailed,
}

pub fn select_layout(ranked: &[RankedEntity], scope: &ScopeDecision, context: &ConversationContext) -> Layout {
    if ranked.len() > 8 {
        Layout::Compact
    } else if context.areas_mentioned.len() > 2 {
        Layout::Tldr
    } else if scope.scope == Scope::Macro && context.areas_mentioned.len() == 1 {
        Layout::GroupedByArea
    } else {
        Layout::Detailed
    }
}

pub fn format(ranked: &[RankedEntity], scope: &ScopeDecision, context: &ConversationContext) -> String {
    let layout = select_layout(ranked, scope, context);
    let mut out = match layout {
        Layout::Compact => format_compact(ranked),
        Layout::Tldr => format_tldr(ranked),
        Layout::GroupedByArea => format_grouped_by_area(ranked),
        Layout::Detailed => format_detailed(ranked),
    };
    out.push_str(&footer(ranked));
    out
}

fn entity_line(entity: &RankedEntity) -> String {
    let area = entity.entity.area.as_deref().unwrap_or("unknown");
    let state = entity.entity.state.as_deref().unwrap_or("unknown");
    let unit = entity.entity.unit.as_deref().unwrap_or("");
    format!("{} ({}) = {} {}", entity.entity.entity_id, area, state, unit)
}

fn format_compact(ranked: &[RankedEntity]) -> String {
    let mut out = String::new();
    for entry in ranked {
        out.push_str(&entity_line(entry));
        out.push('\n');
    }
    out
}

fn format_tldr(ranked: &[RankedEntity]) -> String {
    let mut out = String::new();
    let primaries: Vec<&RankedEntity> = ranked
        .iter()
        .filter(|e| e.role == Some(EntityRole::Primary))
        .collect();
    out.push_str(&format!("Summary: {} relevant entities found.\n", ranked.len()));
    for entry in primaries {
        out.push_str(&format!(
            "{}\n  area: {}\n  state: {} {}\n",
            entry.entity.entity_id,
            entry.entity.area.as_deref().unwrap_or("unknown"),
            entry.entity.state.as_deref().unwrap_or("unknown"),
            entry.entity.unit.as_deref().unwrap_or("")
        ));
    }
    out
}

fn format_grouped_by_area(ranked: &[RankedEntity]) -> String {
    let mut by_area: std::collections::BTreeMap<String, Vec<&RankedEntity>> = std::collections::BTreeMap::new();
    for entry in ranked {
        let area = entry.entity.area.clone().unwrap_or_else(|| "unknown".to_string());
        by_area.entry(area).or_default().push(entry);
    }
    let mut out = String::new();
    for (area, entries) in by_area {
        out.push_str(&format!("[{}]\n", area));
        for entry in entries {
            out.push_str(&format!("  {}\n", entity_line(entry)));
        }
    }
    out
}

fn format_detailed(ranked: &[RankedEntity]) -> String {
    let mut out = String::new();
    for entry in ranked {
        match entry.role {
            Some(EntityRole::Primary) => {
                out.push_str(&format!(
                    "* {} — current value: {} {}\n",
                    entry.entity.entity_id,
                    entry.entity.state.as_deref().unwrap_or("unknown"),
                    entry.entity.unit.as_deref().unwrap_or("")
                ));
            }
            _ => {
                out.push_str(&format!("  related: {}\n", entity_line(entry)));
            }
        }
    }
    out
}

fn footer(ranked: &[RankedEntity]) -> String {
    let domains: BTreeSet<&str> = ranked.iter().map(|e| e.entity.domain.as_str()).collect();
    let areas: BTreeSet<&str> = ranked
        .iter()
        .filter_map(|e| e.entity.area.as_deref())
        .collect();
    format!(
        "Relevant domains: {}, Areas: {}\n",
        domains.into_iter().collect::<Vec<_>>().join(", "),
        areas.into_iter().collect::<Vec<_>>().join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn ranked_entity(id: &str, area: &str, role: EntityRole, final_score: f32) -> RankedEntity {
        RankedEntity {
            entity: crate::types::Entity {
                entity_id: id.to_string(),
                domain: "sensor".to_string(),
                area: Some(area.to_string()),
                device_class: None,
                friendly_name: id.to_string(),
                unit: Some("%".to_string()),
                aliases: HashSet::new(),
                embedding: vec![1.0],
                text: "".to_string(),
                state: Some("45".to_string()),
                last_updated: chrono::Utc::now(),
            },
            cluster_score: None,
            vector_score: None,
            text_score: None,
            cross_encoder_raw: None,
            base_score: final_score,
            context_boost: 0.0,
            final_score,
            source_cluster: None,
            role: Some(role),
            ranking_factors: HashMap::new(),
        }
    }

    #[test]
    fn compact_chosen_for_large_result_sets() {
        let ranked: Vec<_> = (0..9)
            .map(|i| ranked_entity(&format!("e{}", i), "kitchen", EntityRole::Related, 0.5))
            .collect();
        let scope = ScopeDecision {
            scope: Scope::Macro,
            confidence: 0.8,
            optimal_k: 20,
            reasoning: "".to_string(),
        };
        let context = ConversationContext::default();
        assert_eq!(select_layout(&ranked, &scope, &context), Layout::Compact);
    }

    #[test]
    fn footer_always_present() {
        let ranked = vec![ranked_entity("e1", "kitchen", EntityRole::Primary, 0.9)];
        let scope = ScopeDecision {
            scope: Scope::Micro,
            confidence: 0.9,
            optimal_k: 5,
            reasoning: "".to_string(),
        };
        let context = ConversationContext::default();
        let out = format(&ranked, &scope, &context);
        assert!(out.contains("Relevant domains:"));
    }

    #[test]
    fn grouped_by_area_for_single_area_macro_scope() {
        let ranked = vec![
            ranked_entity("e1", "kitchen", EntityRole::Primary, 0.9),
            ranked_entity("e2", "kitchen", EntityRole::Related, 0.5),
        ];
        let scope = ScopeDecision {
            scope: Scope::Macro,
            confidence: 0.8,
            optimal_k: 20,
            reasoning: "".to_string(),
        };
        let mut context = ConversationContext::default();
        context.areas_mentioned.insert("kitchen".to_string());
        assert_eq!(select_layout(&ranked, &scope, &context), Layout::GroupedByArea);
    }
}
