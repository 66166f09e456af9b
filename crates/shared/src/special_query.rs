use std::sync::LazyLock;

use regex::Regex;

/// Marker the UI replaces with its ticket / counsellor hand-off flow.
pub const RAISE_QUERY_MARKER: &str = "{{RAISE_QUERY}}";
pub const NO_PREVIOUS_QUESTION: &str = "You haven't asked any questions yet in this session.";

const MEMORY_TRIGGERS: &[&str] = &[
    "previous question",
    "last question",
    "what did i ask",
    "what was my question",
    "my previous",
    "earlier question",
];

const ESCALATION_PHRASES: &[&str] = &[
    "i want to raise a query",
    "can i raise a query",
    "can i raise a ticket",
    "can i connect to someone",
    "can i speak to the counsellor",
    "how can i track my application status",
];

const ESCALATION_PATTERNS: &[&str] = &[
    r"(raise|submit|create|open|file|log)\s+(a\s+)?(query|ticket|issue|concern|complaint|problem)",
    r"(connect|speak|talk|chat|communicate)\s+(to|with)\s+(a\s+)?(someone|counsellor|counselor|advisor|person|representative|agent|staff|support)",
    r"(need|want)\s+(to\s+)?(speak|talk|connect|chat|communicate)",
    r"is there (someone|anyone) i can (talk|speak|chat) (to|with)",
    r"(track|check|know|see|find out|get)\s+(my\s+)?(application|admission)\s+(status|progress|update)",
    r"(how|where)\s+(can|do|could|would|should|might)\s+(i|we)\s+(track|check|see|find|know)\s+(my|the)\s+(application|admission)",
    r"(where|how)\s+can\s+i\s+see\s+(the\s+)?(status|progress)\s+of\s+my\s+(application|admission)",
    r"(need|want)\s+to\s+(know|see|check)\s+(how|if)\s+my\s+(application|admission)\s+(is\s+)?(progressing|going|doing)",
];

static ESCALATION_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ESCALATION_PATTERNS
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialQuery {
    /// Hand-off to a human: answered with [`RAISE_QUERY_MARKER`].
    Escalation,
    /// Question about earlier turns: answered from session memory.
    MemoryRecall,
}

/// Lowercases, strips punctuation and collapses whitespace.
pub fn normalize_query(query: &str) -> String {
    let stripped = query
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || *ch == '_' || ch.is_whitespace())
        .collect::<String>();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn is_memory_query(query: &str) -> bool {
    let normalized = normalize_query(query);
    MEMORY_TRIGGERS
        .iter()
        .any(|trigger| normalized.contains(trigger))
}

pub fn is_escalation_query(query: &str) -> bool {
    let normalized = normalize_query(query);
    if normalized.is_empty() {
        return false;
    }

    ESCALATION_PHRASES.contains(&normalized.as_str())
        || ESCALATION_REGEXES
            .iter()
            .any(|pattern| pattern.is_match(&normalized))
}

/// Escalation wins over memory recall.
pub fn classify_special_query(query: &str) -> Option<SpecialQuery> {
    if is_escalation_query(query) {
        return Some(SpecialQuery::Escalation);
    }
    if is_memory_query(query) {
        return Some(SpecialQuery::MemoryRecall);
    }
    None
}

pub fn memory_recall_answer(previous_question: Option<&str>) -> String {
    match previous_question {
        Some(question) => format!("Your previous question was: '{question}'"),
        None => NO_PREVIOUS_QUESTION.to_string(),
    }
}
