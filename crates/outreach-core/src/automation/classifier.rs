//! Reply classification

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Intent read from a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyIntent {
    Booking,
    Rejection,
    Question,
    Unclassified,
}

impl std::fmt::Display for ReplyIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyIntent::Booking => write!(f, "booking"),
            ReplyIntent::Rejection => write!(f, "rejection"),
            ReplyIntent::Question => write!(f, "question"),
            ReplyIntent::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Pluggable reply classifier
pub trait ReplyClassifier: Send + Sync {
    fn classify(&self, text: &str) -> ReplyIntent;
}

/// Pull the reply text out of a provider payload
pub fn reply_text(payload: &serde_json::Value) -> String {
    ["body", "snippet", "text"]
        .iter()
        .filter_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A keyword rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRule {
    pub intent: ReplyIntent,
    pub pattern: String,
}

/// Keyword classifier. Rejection rules win over booking rules, which win
/// over question rules.
pub struct RuleBasedReplyClassifier {
    rules: Vec<(ReplyIntent, Regex)>,
}

impl RuleBasedReplyClassifier {
    /// Create a classifier with the built-in rules
    pub fn new() -> Self {
        let mut classifier = Self { rules: Vec::new() };

        let rejection = [
            r"not interested",
            r"no thanks",
            r"no,? thank you",
            r"unsubscribe",
            r"remove me",
            r"stop (emailing|contacting|messaging)",
            r"do not (contact|email)",
            r"don't (contact|email)",
            r"not a (good )?fit",
            r"we('re| are) all set",
            r"already (have|use|working with)",
        ];
        let booking = [
            r"book(ed)? (a|the) (call|meeting|demo|time|slot)",
            r"schedule (a|the) (call|meeting|demo|time)",
            r"calendly\.com",
            r"calendar invite",
            r"let'?s (meet|talk|chat|connect)",
            r"happy to (chat|talk|meet|connect)",
            r"(works|good) for me",
            r"send (me )?(an? )?(invite|calendar)",
            r"available (on|at|this|next)",
            r"\b(monday|tuesday|wednesday|thursday|friday)\b.*\b\d{1,2}(:\d{2})?\s*(am|pm)\b",
        ];
        let question = [
            r"\?",
            r"\b(how much|pricing|price|cost)\b",
            r"more (info|information|details)",
            r"\b(what|how|who|when|why|which)\b",
        ];

        for (intent, patterns) in [
            (ReplyIntent::Rejection, &rejection[..]),
            (ReplyIntent::Booking, &booking[..]),
            (ReplyIntent::Question, &question[..]),
        ] {
            for pattern in patterns {
                classifier.add_rule(ReplyRule {
                    intent,
                    pattern: pattern.to_string(),
                });
            }
        }

        classifier
    }

    /// Add a rule; patterns match case-insensitively
    pub fn add_rule(&mut self, rule: ReplyRule) {
        match Regex::new(&format!("(?i){}", rule.pattern)) {
            Ok(regex) => self.rules.push((rule.intent, regex)),
            Err(e) => warn!(pattern = %rule.pattern, error = %e, "Skipping invalid reply rule"),
        }
    }

    fn matches(&self, intent: ReplyIntent, text: &str) -> bool {
        self.rules
            .iter()
            .any(|(rule_intent, regex)| *rule_intent == intent && regex.is_match(text))
    }
}

impl Default for RuleBasedReplyClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyClassifier for RuleBasedReplyClassifier {
    fn classify(&self, text: &str) -> ReplyIntent {
        let text = text.trim();
        if text.is_empty() {
            return ReplyIntent::Unclassified;
        }

        let intent = [
            ReplyIntent::Rejection,
            ReplyIntent::Booking,
            ReplyIntent::Question,
        ]
        .into_iter()
        .find(|intent| self.matches(*intent, text))
        .unwrap_or(ReplyIntent::Unclassified);

        debug!(intent = %intent, "Reply classified");
        intent
    }
}
