//! Rolling summary compression for the background enrichment task.
//!
//! Grounded in the reference crate's `conversation_summarizer::compress_history`:
//! a deterministic, rule-based pass keeps the LLM prompt bounded regardless
//! of session length and gives the summarizer a fallback (spec §4.3s) when
//! the LLM call itself times out or errors.

use crate::providers::LlmProvider;
use crate::types::{ConversationSummary, IntentPattern, Turn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const VERBATIM_TAIL_TURNS: usize = 4;

/// Deterministic rolling summary of a transcript: last N turns verbatim plus
/// topics/entities/areas extracted from older turns.
pub struct CompressedHistory {
    pub recent_verbatim: Vec<Turn>,
    pub extracted_topics: Vec<String>,
    pub extracted_entities: HashSet<String>,
}

pub fn compress_history(history: &[Turn], known_areas: &[String], known_domains: &[String]) -> CompressedHistory {
    let split = history.len().saturating_sub(VERBATIM_TAIL_TURNS);
    let (older, recent) = history.split_at(split);

    let mut extracted_topics = Vec::new();
    let mut extracted_entities = HashSet::new();

    for turn in older {
        let lower = turn.content.to_lowercase();
        for area in known_areas {
            if lower.contains(&area.to_lowercase()) {
                extracted_entities.insert(area.clone());
                if !extracted_topics.contains(area) {
                    extracted_topics.push(area.clone());
                }
            }
        }
        for domain in known_domains {
            if lower.contains(&domain.to_lowercase()) && !extracted_topics.contains(domain) {
                extracted_topics.push(domain.clone());
            }
        }
    }

    CompressedHistory {
        recent_verbatim: recent.to_vec(),
        extracted_topics,
        extracted_entities,
    }
}

pub fn format_compressed_history(compressed: &CompressedHistory) -> String {
    let mut out = String::new();
    if !compressed.extracted_topics.is_empty() {
        out.push_str(&format!(
            "Earlier topics: {}\n",
            compressed.extracted_topics.join(", ")
        ));
    }
    for turn in &compressed.recent_verbatim {
        out.push_str(&format!("{:?}: {}\n", turn.role, turn.content));
    }
    out
}

/// Deterministic fallback summary derived purely from `compress_history`,
/// used when the LLM call is disabled, times out, or errors.
fn fallback_summary(compressed: &CompressedHistory) -> ConversationSummary {
    let topic = compressed
        .extracted_topics
        .first()
        .cloned()
        .unwrap_or_else(|| "general".to_string());
    ConversationSummary {
        topic,
        current_focus: compressed.extracted_topics.first().cloned(),
        intent_pattern: None,
        topic_domains: compressed.extracted_topics.iter().cloned().collect(),
        context_entities: compressed.extracted_entities.clone(),
        confidence: 0.4,
        generated_at: chrono::Utc::now(),
    }
}

/// Runs the background enrichment step: compress, then ask the LLM for
/// `topic`/`current_focus`/`intent_pattern`, falling back to the
/// deterministic summary on timeout or error. Never fails outright.
pub async fn summarize(
    history: &[Turn],
    known_areas: &[String],
    known_domains: &[String],
    llm: Option<Arc<dyn LlmProvider>>,
    llm_timeout: Duration,
) -> ConversationSummary {
    let compressed = compress_history(history, known_areas, known_domains);
    let fallback = fallback_summary(&compressed);

    let Some(llm) = llm else {
        return fallback;
    };

    let prompt = format!(
        "Summarize this conversation in one topic phrase and name the current focus area if any:\n{}",
        format_compressed_history(&compressed)
    );

    match tokio::time::timeout(llm_timeout, llm.complete(&prompt, 128)).await {
        Ok(Ok(text)) if !text.trim().is_empty() => ConversationSummary {
            topic: text.trim().to_string(),
            current_focus: compressed.extracted_topics.first().cloned(),
            intent_pattern: infer_intent_pattern(history),
            topic_domains: compressed.extracted_topics.iter().cloned().collect(),
            context_entities: compressed.extracted_entities,
            confidence: 0.75,
            generated_at: chrono::Utc::now(),
        },
        _ => {
            tracing::warn!("summarization llm call failed or timed out, using rule-based fallback");
            fallback
        }
    }
}

fn infer_intent_pattern(history: &[Turn]) -> Option<IntentPattern> {
    let last = history.last()?;
    let lower = last.content.to_lowercase();
    if lower.contains("turn on") || lower.contains("turn off") || lower.contains("kapcsold") {
        Some(IntentPattern::Control)
    } else if lower.contains("what") || lower.contains("mennyi") {
        Some(IntentPattern::Read)
    } else {
        Some(IntentPattern::Monitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatRole;

    fn turn(role: ChatRole, content: &str) -> Turn {
        Turn {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn compress_history_extracts_topics_from_older_turns() {
        let history = vec![
            turn(ChatRole::User, "what is the humidity in the kitchen?"),
            turn(ChatRole::Assistant, "45%."),
            turn(ChatRole::User, "and the living room?"),
            turn(ChatRole::Assistant, "50%."),
            turn(ChatRole::User, "turn on the light"),
        ];
        let compressed = compress_history(
            &history,
            &["kitchen".to_string(), "living room".to_string()],
            &["humidity".to_string()],
        );
        assert!(compressed.extracted_topics.contains(&"kitchen".to_string()));
        assert_eq!(compressed.recent_verbatim.len(), 4);
    }

    #[tokio::test]
    async fn summarize_falls_back_without_llm() {
        let history = vec![turn(ChatRole::User, "what is the humidity in the kitchen?")];
        let summary = summarize(
            &history,
            &["kitchen".to_string()],
            &["humidity".to_string()],
            None,
            Duration::from_millis(200),
        )
        .await;
        assert_eq!(summary.topic, "kitchen");
    }
}
