//! Scope Detector (C4). See spec §4.4.
//!
//! Classifies a (rewritten) query into `micro | macro | overview` and picks
//! `optimal_k`. Rule-first, with ties resolved by specificity
//! (micro > macro > overview) — realized here as match-arm ordering, which
//! *is* the tie-break (spec §9 open question).

use crate::analyzer::AreaAliasTable;
use crate::config::ScopeConfig;
use crate::providers::LlmProvider;
use crate::types::Scope;
use crate::types::ScopeDecision;
use std::sync::Arc;
use std::time::Duration;

const CONTROL_VERBS: &[&str] = &["turn on", "turn off", "kapcsold", "set", "dim"];
const OVERVIEW_KEYWORDS: &[&str] = &["house", "everything", "summary", "mi újság", "all"];

const EXACT_KEYWORD_CONFIDENCE: f32 = 0.9;
const ALIAS_HIT_CONFIDENCE: f32 = 0.75;
const DEFAULT_CONFIDENCE: f32 = 0.5;

pub struct ScopeDetector {
    config: ScopeConfig,
    areas: AreaAliasTable,
    llm: Option<Arc<dyn LlmProvider>>,
    llm_timeout: Duration,
}

impl ScopeDetector {
    pub fn new(
        config: ScopeConfig,
        areas: AreaAliasTable,
        llm: Option<Arc<dyn LlmProvider>>,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            config,
            areas,
            llm,
            llm_timeout,
        }
    }

    pub async fn detect(&self, query: &str) -> ScopeDecision {
        let rule_based = self.detect_rule_based(query);

        if rule_based.confidence < self.config.llm_min_confidence {
            if let Some(refined) = self.refine_with_llm(query, &rule_based).await {
                return refined;
            }
        }

        rule_based
    }

    /// Tie-break: checked in order micro, macro, overview — the most
    /// specific rule that fires wins.
    fn detect_rule_based(&self, query: &str) -> ScopeDecision {
        let lower = query.to_lowercase();
        let has_control_verb = CONTROL_VERBS.iter().any(|v| lower.contains(v));
        let entity_token_count = lower.split_whitespace().count();
        let areas_hit = self.areas.matches_in(query);
        let overview_hit = OVERVIEW_KEYWORDS.iter().any(|kw| lower.contains(kw));

        if has_control_verb && entity_token_count <= 6 {
            return ScopeDecision {
                scope: Scope::Micro,
                confidence: EXACT_KEYWORD_CONFIDENCE,
                optimal_k: self.config.micro_k_min.max(5).min(self.config.micro_k_max),
                reasoning: "control verb with at most one entity-shaped token".to_string(),
            };
        }

        if !areas_hit.is_empty() {
            return ScopeDecision {
                scope: Scope::Macro,
                confidence: ALIAS_HIT_CONFIDENCE,
                optimal_k: self.config.macro_k_min.max(15).min(self.config.macro_k_max),
                reasoning: format!("area alias hit: {:?}", areas_hit),
            };
        }

        if overview_hit {
            return ScopeDecision {
                scope: Scope::Overview,
                confidence: EXACT_KEYWORD_CONFIDENCE,
                optimal_k: self.config.overview_k_min.max(30).min(self.config.overview_k_max),
                reasoning: "overview keyword hit".to_string(),
            };
        }

        ScopeDecision {
            scope: Scope::Macro,
            confidence: DEFAULT_CONFIDENCE,
            optimal_k: self.config.default_macro_k,
            reasoning: "default macro scope".to_string(),
        }
    }

    /// LLM refinement path; on any failure the rule-based result stands.
    async fn refine_with_llm(&self, query: &str, rule_based: &ScopeDecision) -> Option<ScopeDecision> {
        let llm = self.llm.as_ref()?;
        let prompt = format!(
            "Classify the scope of this smart-home query as micro, macro, or overview: {}",
            query
        );

        match tokio::time::timeout(self.llm_timeout, llm.complete(&prompt, 8)).await {
            Ok(Ok(text)) => {
                let lower = text.trim().to_lowercase();
                let scope = if lower.contains("micro") {
                    Scope::Micro
                } else if lower.contains("overview") {
                    Scope::Overview
                } else if lower.contains("macro") {
                    Scope::Macro
                } else {
                    return None;
                };
                Some(ScopeDecision {
                    scope,
                    confidence: 0.8,
                    optimal_k: rule_based.optimal_k,
                    reasoning: "llm-refined scope classification".to_string(),
                })
            }
            _ => {
                tracing::warn!("scope llm refinement timed out or failed, keeping rule-based result");
                None
            }
        }
    }
}
