//! Conversation Analyzer (C1). See spec §4.1.
//!
//! Pure function of `(utterance, history, memory)`: areas, domains, intent,
//! follow-up detection. Never throws — a parse failure yields empty sets.

use crate::types::{ConversationContext, ConversationMemory, Intent, Turn};
use std::collections::HashSet;

const CONTINUATION_MARKERS: &[&str] = &["and", "és", "but", "is"];
const CONTROL_VERBS: &[&str] = &["turn on", "turn off", "kapcsold", "set", "dim"];
const READ_INTERROGATIVES: &[&str] = &["mennyi", "what's", "what is", "how much", "how many"];
const FOLLOW_UP_TOKEN_LIMIT: usize = 4;

/// Alias → canonical area name. Longest-alias-wins, whole-word,
/// case/diacritic-insensitive matching.
#[derive(Clone)]
pub struct AreaAliasTable {
    aliases: Vec<(String, String)>,
}

impl AreaAliasTable {
    pub fn new(aliases: Vec<(String, String)>) -> Self {
        let mut aliases = aliases;
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { aliases }
    }

    pub fn default_table() -> Self {
        Self::new(vec![
            ("kint".to_string(), "garden".to_string()),
            ("outside".to_string(), "garden".to_string()),
            ("garden".to_string(), "garden".to_string()),
            ("kitchen".to_string(), "kitchen".to_string()),
            ("living room".to_string(), "living_room".to_string()),
            ("nappali".to_string(), "living_room".to_string()),
            ("bedroom".to_string(), "bedroom".to_string()),
        ])
    }

    pub(crate) fn matches(&self, normalized: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        for (alias, canonical) in &self.aliases {
            if word_contains(normalized, &normalize(alias)) {
                found.insert(canonical.clone());
            }
        }
        found
    }

    /// Area matches against a raw (non pre-normalized) utterance; used by
    /// the query rewriter and scope detector.
    pub fn matches_in(&self, utterance: &str) -> HashSet<String> {
        self.matches(&normalize(utterance))
    }
}

/// Keyword → domain/device-class. E.g. `nedveség` → `humidity`.
#[derive(Clone)]
pub struct DomainKeywordTable {
    domains: Vec<(String, String)>,
    device_classes: Vec<(String, String)>,
}

impl DomainKeywordTable {
    pub fn new(domains: Vec<(String, String)>, device_classes: Vec<(String, String)>) -> Self {
        Self {
            domains,
            device_classes,
        }
    }

    pub fn default_table() -> Self {
        Self::new(
            vec![
                ("lámpa".to_string(), "light".to_string()),
                ("light".to_string(), "light".to_string()),
                ("switch".to_string(), "switch".to_string()),
                ("sensor".to_string(), "sensor".to_string()),
                ("climate".to_string(), "climate".to_string()),
                ("temperature".to_string(), "sensor".to_string()),
                ("humidity".to_string(), "sensor".to_string()),
                ("nedveség".to_string(), "sensor".to_string()),
            ],
            vec![
                ("temperature".to_string(), "temperature".to_string()),
                ("humidity".to_string(), "humidity".to_string()),
                ("nedveség".to_string(), "humidity".to_string()),
            ],
        )
    }

    fn matches_domains(&self, normalized: &str) -> HashSet<String> {
        self.domains
            .iter()
            .filter(|(kw, _)| word_contains(normalized, &normalize(kw)))
            .map(|(_, domain)| domain.clone())
            .collect()
    }

    fn matches_device_classes(&self, normalized: &str) -> HashSet<String> {
        self.device_classes
            .iter()
            .filter(|(kw, _)| word_contains(normalized, &normalize(kw)))
            .map(|(_, dc)| dc.clone())
            .collect()
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' | 'ö' | 'ő' => 'o',
            'ú' | 'ü' | 'ű' => 'u',
            other => other,
        })
        .collect()
}

fn word_contains(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .collect::<Vec<_>>()
        .windows(needle.split_whitespace().count().max(1))
        .any(|window| window.join(" ") == needle)
        || haystack.split_whitespace().any(|w| w == needle)
}

fn is_follow_up(utterance: &str, has_previous_turn: bool) -> bool {
    let normalized = normalize(utterance.trim());
    let starts_with_marker = CONTINUATION_MARKERS
        .iter()
        .any(|marker| normalized.starts_with(marker));
    let short_utterance = normalized.split_whitespace().count() <= FOLLOW_UP_TOKEN_LIMIT;

    starts_with_marker || (short_utterance && has_previous_turn)
}

fn classify_intent(normalized: &str, domain_hit: bool) -> Intent {
    if CONTROL_VERBS.iter().any(|v| normalized.contains(v)) {
        Intent::Control
    } else if READ_INTERROGATIVES.iter().any(|v| normalized.contains(v)) {
        Intent::Read
    } else if domain_hit {
        Intent::Monitor
    } else {
        Intent::Unknown
    }
}

/// Analyzes `utterance` given `history` and an optional prior `memory`
/// record. Must complete in ≤10ms for utterances ≤200 tokens — this is a
/// pure, allocation-light function with no I/O, so that budget is met by
/// construction.
pub fn analyze(
    utterance: &str,
    history: &[Turn],
    memory: Option<&ConversationMemory>,
    areas: &AreaAliasTable,
    domains: &DomainKeywordTable,
) -> ConversationContext {
    let normalized = normalize(utterance);

    let areas_mentioned = areas.matches(&normalized);
    let domains_mentioned = domains.matches_domains(&normalized);
    let device_classes_mentioned = domains.matches_device_classes(&normalized);
    let domain_hit = !domains_mentioned.is_empty();
    let intent = classify_intent(&normalized, domain_hit);
    let has_previous_turn = !history.is_empty();
    let is_follow_up = is_follow_up(utterance, has_previous_turn);

    let previous_areas = memory
        .map(|m| m.areas_mentioned.clone())
        .unwrap_or_default();

    ConversationContext {
        areas_mentioned,
        domains_mentioned,
        device_classes_mentioned,
        intent: Some(intent),
        is_follow_up,
        previous_areas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatRole, Turn};

    fn areas() -> AreaAliasTable {
        AreaAliasTable::default_table()
    }

    fn domains() -> DomainKeywordTable {
        DomainKeywordTable::default_table()
    }

    #[test]
    fn detects_control_intent() {
        let ctx = analyze("turn on the light", &[], None, &areas(), &domains());
        assert_eq!(ctx.intent, Some(Intent::Control));
        assert!(ctx.domains_mentioned.contains("light"));
    }

    #[test]
    fn detects_follow_up_by_continuation_marker() {
        let history = vec![Turn {
            role: ChatRole::User,
            content: "what is the temperature in the living room?".to_string(),
        }];
        let ctx = analyze("and in the garden?", &history, None, &areas(), &domains());
        assert!(ctx.is_follow_up);
        assert!(ctx.areas_mentioned.contains("garden"));
    }

    #[test]
    fn short_utterance_with_history_is_follow_up() {
        let history = vec![Turn {
            role: ChatRole::Assistant,
            content: "23C.".to_string(),
        }];
        let ctx = analyze("the garden?", &history, None, &areas(), &domains());
        assert!(ctx.is_follow_up);
    }

    #[test]
    fn no_history_no_markers_is_not_follow_up() {
        let ctx = analyze("turn on the kitchen light", &[], None, &areas(), &domains());
        assert!(!ctx.is_follow_up);
    }

    #[test]
    fn empty_utterance_never_panics() {
        let ctx = analyze("", &[], None, &areas(), &domains());
        assert_eq!(ctx.intent, Some(Intent::Unknown));
    }
}
