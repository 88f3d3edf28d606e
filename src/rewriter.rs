//! Query Rewriter (C2). See spec §4.2, §4.2s.
//!
//! Resolves references in follow-up utterances so downstream retrieval sees
//! a standalone query. Two-stage strategy grounded in the reference crate's
//! `QueryRewriter`: rule-based first, LLM fallback on low confidence.

use crate::analyzer::AreaAliasTable;
use crate::providers::LlmProvider;
use crate::types::{ConversationContext, ConversationMemory, QueryRewriteResult, RewriteMethod, Turn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const PRONOUNS: &[&str] = &["there", "it", "that", "ott", "az"];
const LLM_CONFIDENCE_THRESHOLD: f32 = 0.7;
const MAX_VARIANTS: usize = 3;

pub struct QueryRewriter {
    areas: AreaAliasTable,
    llm: Option<Arc<dyn LlmProvider>>,
    llm_enabled: bool,
    llm_timeout: Duration,
}

impl QueryRewriter {
    pub fn new(
        areas: AreaAliasTable,
        llm: Option<Arc<dyn LlmProvider>>,
        llm_enabled: bool,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            areas,
            llm,
            llm_enabled,
            llm_timeout,
        }
    }

    fn contains_pronoun(utterance: &str) -> bool {
        let lower = utterance.to_lowercase();
        PRONOUNS
            .iter()
            .any(|p| lower.split_whitespace().any(|w| w.trim_matches('?') == *p))
    }

    /// `rewrite(utterance, history, memory) -> QueryRewriteResult`.
    pub async fn rewrite(
        &self,
        utterance: &str,
        history: &[Turn],
        context: &ConversationContext,
        _memory: Option<&ConversationMemory>,
    ) -> QueryRewriteResult {
        if !context.is_follow_up && !Self::contains_pronoun(utterance) {
            return QueryRewriteResult {
                original: utterance.to_string(),
                rewritten: utterance.to_string(),
                method: RewriteMethod::NoRewriteNeeded,
                confidence: 1.0,
                coreferences_resolved: HashSet::new(),
                reasoning: None,
                query_variants: Vec::new(),
            };
        }

        let rule_based = self.rewrite_rule_based(utterance, history);

        let result = if self.llm_enabled && rule_based.confidence < LLM_CONFIDENCE_THRESHOLD {
            match self.rewrite_with_llm(utterance, history, &rule_based).await {
                Some(llm_result) => llm_result,
                None => rule_based,
            }
        } else {
            rule_based
        };

        let rewritten = if result.rewritten.trim().is_empty() {
            utterance.to_string()
        } else {
            result.rewritten
        };

        let query_variants = expand_query(&rewritten);

        QueryRewriteResult {
            original: utterance.to_string(),
            rewritten,
            method: result.method,
            confidence: result.confidence,
            coreferences_resolved: result.coreferences_resolved,
            reasoning: result.reasoning,
            query_variants,
        }
    }

    /// Deterministic transform: if the prior turn named a domain/device
    /// query pattern and the current utterance names an area but no domain,
    /// synthesize prior-domain + current-area.
    fn rewrite_rule_based(&self, utterance: &str, history: &[Turn]) -> QueryRewriteResult {
        let prior_domain_phrase = history
            .iter()
            .rev()
            .find_map(|turn| extract_domain_phrase(&turn.content));

        let current_area = find_area_mention(&self.areas, utterance);

        match (prior_domain_phrase, current_area) {
            (Some(domain_phrase), Some(area)) if !mentions_domain_phrase(utterance, &domain_phrase) => {
                let mut resolved = HashSet::new();
                resolved.insert(area.clone());
                QueryRewriteResult {
                    original: utterance.to_string(),
                    rewritten: format!("what is the {} in the {}?", domain_phrase, area.replace('_', " ")),
                    method: RewriteMethod::RuleBased,
                    confidence: 0.85,
                    coreferences_resolved: resolved,
                    reasoning: Some(format!(
                        "carried forward '{}' from prior turn onto area '{}'",
                        domain_phrase, area
                    )),
                    query_variants: Vec::new(),
                }
            }
            _ => QueryRewriteResult {
                original: utterance.to_string(),
                rewritten: utterance.to_string(),
                method: RewriteMethod::NoRewriteNeeded,
                confidence: 0.5,
                coreferences_resolved: HashSet::new(),
                reasoning: None,
                query_variants: Vec::new(),
            },
        }
    }

    /// LLM-based rewrite with a 200ms (configurable) timeout. Falls back to
    /// `None` (caller uses the rule-based result) on timeout or error.
    async fn rewrite_with_llm(
        &self,
        utterance: &str,
        history: &[Turn],
        rule_based: &QueryRewriteResult,
    ) -> Option<QueryRewriteResult> {
        let llm = self.llm.as_ref()?;
        let recent: Vec<String> = history.iter().rev().take(4).map(|t| t.content.clone()).collect();
        let prompt = format!(
            "Rewrite this follow-up into a standalone question.\nRecent turns: {:?}\nFollow-up: {}\nStandalone:",
            recent, utterance
        );

        match tokio::time::timeout(self.llm_timeout, llm.complete(&prompt, 64)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => Some(QueryRewriteResult {
                original: utterance.to_string(),
                rewritten: text.trim().to_string(),
                method: RewriteMethod::Llm,
                confidence: 0.8,
                coreferences_resolved: rule_based.coreferences_resolved.clone(),
                reasoning: Some("llm rewrite".to_string()),
                query_variants: Vec::new(),
            }),
            _ => {
                tracing::warn!("query rewrite llm call timed out or failed, using rule-based result");
                None
            }
        }
    }
}

fn extract_domain_phrase(content: &str) -> Option<String> {
    let lower = content.to_lowercase();
    for phrase in ["temperature", "humidity", "light", "switch state"] {
        if lower.contains(phrase) {
            return Some(phrase.to_string());
        }
    }
    None
}

fn mentions_domain_phrase(utterance: &str, phrase: &str) -> bool {
    utterance.to_lowercase().contains(phrase)
}

fn find_area_mention(areas: &AreaAliasTable, utterance: &str) -> Option<String> {
    areas.matches_in(utterance).into_iter().next()
}

/// `expand_query` (spec §4.2s): up to 3 deduplicated phrasing variants for
/// C6's internal use as extra text-search probes. Pure string manipulation,
/// never blocks the rewrite's own timeout budget.
pub fn expand_query(query: &str) -> Vec<String> {
    let mut variants = Vec::new();
    let lower = query.trim().trim_end_matches('?').to_lowercase();

    let stripped: String = lower
        .split_whitespace()
        .filter(|w| !matches!(*w, "what" | "is" | "the" | "in" | "a" | "an"))
        .collect::<Vec<_>>()
        .join(" ");
    if !stripped.is_empty() && stripped != lower {
        variants.push(stripped);
    }

    let synonyms = [("temperature", "temp"), ("humidity", "moisture"), ("light", "lamp")];
    for (word, synonym) in synonyms {
        if lower.contains(word) {
            variants.push(lower.replace(word, synonym));
        }
    }

    variants.dedup();
    variants.truncate(MAX_VARIANTS);
    variants
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{analyze, DomainKeywordTable};

    fn rewriter() -> QueryRewriter {
        QueryRewriter::new(
            AreaAliasTable::default_table(),
            None,
            true,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn scenario_a_follow_up_area_switch() {
        let history = vec![
            Turn {
                role: crate::types::ChatRole::User,
                content: "what is the temperature in the living room?".to_string(),
            },
            Turn {
                role: crate::types::ChatRole::Assistant,
                content: "23 C.".to_string(),
            },
        ];
        let domains = DomainKeywordTable::default_table();
        let areas = AreaAliasTable::default_table();
        let context = analyze("and in the garden?", &history, None, &areas, &domains);
        let r = rewriter();
        let result = r.rewrite("and in the garden?", &history, &context, None).await;
        assert_eq!(result.method, RewriteMethod::RuleBased);
        assert!(result.confidence >= 0.8);
        assert!(result.rewritten.contains("garden"));
        assert!(result.rewritten.contains("temperature"));
    }

    #[tokio::test]
    async fn no_rewrite_for_standalone_query() {
        let domains = DomainKeywordTable::default_table();
        let areas = AreaAliasTable::default_table();
        let context = analyze("turn on the kitchen light", &[], None, &areas, &domains);
        let r = rewriter();
        let result = r
            .rewrite("turn on the kitchen light", &[], &context, None)
            .await;
        assert_eq!(result.method, RewriteMethod::NoRewriteNeeded);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.rewritten, "turn on the kitchen light");
    }

    #[test]
    fn rewritten_query_never_empty() {
        let variants = expand_query("");
        assert!(variants.is_empty());
    }

    #[test]
    fn expand_query_caps_at_three_variants() {
        let variants = expand_query("what is the temperature and humidity in the living room?");
        assert!(variants.len() <= 3);
    }
}
