//! Dr. Asha persona and safety policy
//!
//! Turns raw generator output into the text users see:
//! - strips diagnostic and prescriptive statements
//! - replaces out-of-scope answers with a fixed refusal
//! - flags emergencies and prepends a redirect notice
//! - settles the answer confidence and adds a disclaimer when it is low
//!
//! Everything here is pure; the policy holds only immutable configuration.

use crate::generator::{GeneratorOutput, OUT_OF_SCOPE_SENTINEL};
use crate::types::{normalize, RetrievedChunk};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// System persona sent with every generation request
pub const SYSTEM_PROMPT: &str = "You are Dr. Asha, a virtual medical assistant who provides accurate, \
evidence-based medical information.\n\n\
Your characteristics:\n\
- You are calm, empathetic, and professional\n\
- You explain medical topics clearly, using only the context provided\n\n\
Critical constraints:\n\
- You do NOT diagnose medical conditions\n\
- You do NOT prescribe medications, doses, or treatments\n\
- You do NOT provide emergency medical advice\n\
- You ALWAYS encourage consulting healthcare professionals for personal decisions";

/// Prepended to every answer flagged as a potential emergency
pub const EMERGENCY_NOTICE: &str = "🚨 If this is a medical emergency, please call emergency services \
immediately or visit the nearest hospital. I provide general medical information, not emergency assistance.";

/// Prepended to answers whose confidence falls below the threshold
pub const LOW_CONFIDENCE_NOTICE: &str = "⚠️ I have limited information on this topic. \
Please consult a healthcare professional for accurate guidance.";

/// Replaces answers to non-medical questions and diagnosis/prescription requests
pub const SAFE_REFUSAL: &str = "I'm sorry, but I can't help with that request. I share general medical \
information only: I can't diagnose conditions, prescribe treatments, or answer questions outside \
health and medicine. Please speak with a qualified healthcare professional about your situation.";

/// Statements the assistant must never make; sentences matching any are removed
const DIAGNOSTIC_MARKERS: &[&str] = &[
    r"(?i)^\s*(diagnosis|prescription|rx)\s*:",
    r"(?i)\b(my|your|the) diagnosis is\b",
    r"(?i)\bi (can |would |will )?diagnose\b",
    r"(?i)\byou (most likely|probably|definitely|clearly|certainly) have\b",
    r"(?i)\bi (would |will )?prescribe\b",
    r"(?i)\b(you should|start|begin) taking \d+(\.\d+)?\s?(mg|mcg|g|ml|units?)\b",
    r"(?i)\btake \d+(\.\d+)?\s?(mg|mcg|g|ml|units?)\b",
];

/// Requests the assistant refuses regardless of what the generator said
const SCOPE_REQUESTS: &[&str] = &[
    r"(?i)\bdiagnose me\b",
    r"(?i)\bdo i have\b",
    r"(?i)\bwhat (medication|medicine|drug|dose|dosage) should i (take|use)\b",
    r"(?i)\bhow (much|many) [a-z0-9 ]+ should i take\b",
    r"(?i)\b(prescribe|write me a prescription)\b",
];

/// Phrases too generic to count as an indicator inside generator reasoning
const REASONING_IGNORED_PHRASES: &[&str] = &["emergency"];

/// Words that cancel an indicator when they directly precede it in reasoning
const NEGATIONS: &[&str] = &["no", "not", "not a", "not an", "without", "denies", "no sign of", "no signs of"];

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn is_negated(prefix: &str) -> bool {
    let prefix = prefix.trim_end();
    NEGATIONS.iter().any(|negation| {
        prefix
            .strip_suffix(*negation)
            .is_some_and(|rest| rest.is_empty() || rest.ends_with(|c: char| !c.is_alphanumeric()))
    })
}

/// Where the final confidence value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceSource {
    /// The generator reported a usable number in [0, 1]
    GeneratorHint,
    /// Mean relevance of the retrieved chunks
    RetrievalMean,
}

/// Result of applying the policy
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    pub response_text: String,
    pub confidence: f32,
    pub emergency: bool,
    pub confidence_source: ConfidenceSource,
    pub refused: bool,
}

/// Safety policy configuration
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    emergency_phrases: Vec<String>,
    low_confidence_threshold: f32,
    diagnostic_markers: Vec<Regex>,
    scope_requests: Vec<Regex>,
}

impl SafetyPolicy {
    pub fn new(emergency_phrases: Vec<String>, low_confidence_threshold: f32) -> Self {
        Self {
            emergency_phrases: Self::normalize_phrases(emergency_phrases),
            low_confidence_threshold,
            diagnostic_markers: compile(DIAGNOSTIC_MARKERS),
            scope_requests: compile(SCOPE_REQUESTS),
        }
    }

    fn normalize_phrases(phrases: Vec<String>) -> Vec<String> {
        let mut normalized: Vec<String> = phrases
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        normalized.dedup();
        normalized
    }

    /// Copy of this policy with a different emergency phrase list
    pub fn with_emergency_phrases(&self, phrases: Vec<String>) -> Self {
        Self {
            emergency_phrases: Self::normalize_phrases(phrases),
            ..self.clone()
        }
    }

    pub fn emergency_phrases(&self) -> &[String] {
        &self.emergency_phrases
    }

    /// First configured phrase found in `text`
    ///
    /// Matching is a case-insensitive substring test after whitespace runs
    /// are collapsed on both sides.
    pub fn detect_emergency(&self, text: &str) -> Option<&str> {
        let haystack = normalize(text);
        self.emergency_phrases
            .iter()
            .find(|phrase| haystack.contains(phrase.as_str()))
            .map(String::as_str)
    }

    /// First indicator asserted by the generator's reasoning notes
    ///
    /// Generic phrases are skipped and negated mentions ("not suicidal",
    /// "no chest pain") do not count.
    pub fn detect_emergency_in_reasoning(&self, reasoning: &str) -> Option<&str> {
        let haystack = normalize(reasoning);
        self.emergency_phrases
            .iter()
            .filter(|phrase| !REASONING_IGNORED_PHRASES.contains(&phrase.as_str()))
            .find(|phrase| {
                haystack
                    .match_indices(phrase.as_str())
                    .any(|(at, _)| !is_negated(&haystack[..at]))
            })
            .map(String::as_str)
    }

    /// Whether the query asks for a diagnosis or a prescription
    pub fn is_scope_request(&self, query: &str) -> bool {
        self.scope_requests.iter().any(|re| re.is_match(query))
    }

    /// Remove sentences carrying diagnostic or prescriptive statements
    pub fn strip_diagnostic_language(&self, text: &str) -> String {
        text.lines()
            .map(|line| {
                split_sentences(line)
                    .into_iter()
                    .filter(|s| !self.diagnostic_markers.iter().any(|re| re.is_match(s)))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Confidence from the generator hint when usable, else mean chunk relevance
    pub fn resolve_confidence(
        &self,
        hint: Option<f32>,
        chunks: &[RetrievedChunk],
    ) -> (f32, ConfidenceSource) {
        match hint {
            Some(h) if h.is_finite() && (0.0..=1.0).contains(&h) => {
                (h, ConfidenceSource::GeneratorHint)
            }
            _ => {
                let mean = if chunks.is_empty() {
                    0.0
                } else {
                    chunks.iter().map(|c| c.relevance_score).sum::<f32>() / chunks.len() as f32
                };
                (mean.clamp(0.0, 1.0), ConfidenceSource::RetrievalMean)
            }
        }
    }

    /// Apply the full policy to one generator reply
    pub fn apply(
        &self,
        raw: &GeneratorOutput,
        query: &str,
        chunks: &[RetrievedChunk],
    ) -> PolicyOutcome {
        let (confidence, confidence_source) = self.resolve_confidence(raw.confidence_hint, chunks);

        let emergency = self.detect_emergency(query).is_some()
            || raw
                .reasoning
                .as_deref()
                .is_some_and(|r| self.detect_emergency_in_reasoning(r).is_some());

        let out_of_scope = raw.text.trim_start().starts_with(OUT_OF_SCOPE_SENTINEL);
        let body = if out_of_scope || self.is_scope_request(query) {
            None
        } else {
            Some(self.strip_diagnostic_language(&raw.text)).filter(|b| !b.is_empty())
        };
        let refused = body.is_none();
        let body = body.unwrap_or_else(|| SAFE_REFUSAL.to_string());

        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if emergency {
            parts.push(EMERGENCY_NOTICE);
        }
        if !refused && confidence < self.low_confidence_threshold {
            parts.push(LOW_CONFIDENCE_NOTICE);
        }
        parts.push(&body);

        PolicyOutcome {
            response_text: parts.join("\n\n"),
            confidence,
            emergency,
            confidence_source,
            refused,
        }
    }
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(crate::config::default_emergency_phrases(), 0.5)
    }
}

/// Split a line after `.`, `!` or `?` followed by whitespace
fn split_sentences(line: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = line.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(next, n)) = chars.peek() {
            if n.is_whitespace() {
                sentences.push(line[start..next].trim());
                start = next;
            }
        }
    }
    sentences.push(line[start..].trim());
    sentences.into_iter().filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(scores: &[f32]) -> Vec<RetrievedChunk> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| RetrievedChunk {
                text: format!("chunk {}", i),
                source_url: format!("https://example.org/{}", i),
                title: format!("Title {}", i),
                topic: "diabetes".to_string(),
                relevance_score: s,
            })
            .collect()
    }

    fn hinted(text: &str, hint: Option<f32>) -> GeneratorOutput {
        GeneratorOutput {
            text: text.to_string(),
            confidence_hint: hint,
            reasoning: None,
        }
    }

    #[test]
    fn test_confident_answer_passes_through() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(
            &hinted("Diabetes is a chronic condition affecting blood sugar.", Some(0.9)),
            "What is diabetes?",
            &chunks(&[0.9]),
        );
        assert_eq!(out.response_text, "Diabetes is a chronic condition affecting blood sugar.");
        assert_eq!(out.confidence, 0.9);
        assert_eq!(out.confidence_source, ConfidenceSource::GeneratorHint);
        assert!(!out.emergency);
        assert!(!out.refused);
    }

    #[test]
    fn test_confidence_falls_back_to_retrieval_mean() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(&hinted("text", None), "q", &chunks(&[0.9, 0.6, 0.6]));
        assert_eq!(out.confidence_source, ConfidenceSource::RetrievalMean);
        assert!((out.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_range_hint_is_ignored() {
        let policy = SafetyPolicy::default();
        for bad in [1.5, -0.1, f32::NAN, f32::INFINITY] {
            let (confidence, source) = policy.resolve_confidence(Some(bad), &chunks(&[0.8]));
            assert_eq!(source, ConfidenceSource::RetrievalMean);
            assert!((confidence - 0.8).abs() < 1e-6);
        }
    }

    #[test]
    fn test_no_chunks_and_no_hint_is_zero_confidence() {
        let policy = SafetyPolicy::default();
        let (confidence, source) = policy.resolve_confidence(None, &[]);
        assert_eq!(confidence, 0.0);
        assert_eq!(source, ConfidenceSource::RetrievalMean);
    }

    #[test]
    fn test_low_confidence_disclaimer() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(&hinted("Some information.", Some(0.3)), "q", &[]);
        assert!(out.response_text.starts_with(LOW_CONFIDENCE_NOTICE));
        assert!(out.response_text.ends_with("Some information."));
    }

    #[test]
    fn test_emergency_in_query_overrides_confidence() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(
            &hinted("Chest discomfort has many causes.", Some(1.0)),
            "I'm having severe CHEST   PAIN right now",
            &chunks(&[0.95]),
        );
        assert!(out.emergency);
        assert!(out.response_text.starts_with(EMERGENCY_NOTICE));
        assert!(out.response_text.contains("Chest discomfort has many causes."));
    }

    #[test]
    fn test_emergency_in_reasoning() {
        let policy = SafetyPolicy::default();
        let raw = GeneratorOutput {
            text: "Please reach out for support.".to_string(),
            confidence_hint: Some(0.9),
            reasoning: Some("The user may be suicidal.".to_string()),
        };
        let out = policy.apply(&raw, "I feel hopeless", &[]);
        assert!(out.emergency);
    }

    #[test]
    fn test_negated_or_generic_reasoning_is_not_an_emergency() {
        let policy = SafetyPolicy::default();
        for reasoning in [
            "Informational question, not an emergency.",
            "User is not suicidal; general question.",
            "No chest pain reported.",
        ] {
            let raw = GeneratorOutput {
                text: "Diabetes affects how the body uses blood sugar.".to_string(),
                confidence_hint: Some(0.9),
                reasoning: Some(reasoning.to_string()),
            };
            let out = policy.apply(&raw, "What is diabetes?", &[]);
            assert!(!out.emergency, "flagged by reasoning: {reasoning}");
            assert!(!out.response_text.starts_with(EMERGENCY_NOTICE));
        }
    }

    #[test]
    fn test_reasoning_indicator_after_negated_mention() {
        let policy = SafetyPolicy::default();
        assert_eq!(
            policy.detect_emergency_in_reasoning("Not a stroke, but possible heart attack."),
            Some("heart attack")
        );
        assert_eq!(policy.detect_emergency_in_reasoning("Knot a stroke"), Some("stroke"));
    }

    #[test]
    fn test_emergency_survives_refusal() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(&hinted("OUT_OF_SCOPE", Some(0.9)), "is this an overdose? diagnose me", &[]);
        assert!(out.emergency);
        assert!(out.refused);
        assert!(out.response_text.starts_with(EMERGENCY_NOTICE));
        assert!(out.response_text.ends_with(SAFE_REFUSAL));
    }

    #[test]
    fn test_custom_phrase_list() {
        let policy = SafetyPolicy::default().with_emergency_phrases(vec!["Anaphylaxis".to_string()]);
        assert_eq!(policy.detect_emergency("signs of anaphylaxis?"), Some("anaphylaxis"));
        assert_eq!(policy.detect_emergency("chest pain"), None);
    }

    #[test]
    fn test_out_of_scope_sentinel_is_refused() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(&hinted("OUT_OF_SCOPE", Some(0.9)), "Who won the football game?", &[]);
        assert!(out.refused);
        assert_eq!(out.response_text, SAFE_REFUSAL);
    }

    #[test]
    fn test_diagnosis_request_is_refused() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(
            &hinted("Based on this you have type 2 diabetes.", Some(0.9)),
            "Do I have diabetes? I am always thirsty",
            &[],
        );
        assert!(out.refused);
        assert_eq!(out.response_text, SAFE_REFUSAL);

        assert!(policy.is_scope_request("What medication should I take for headaches?"));
        assert!(!policy.is_scope_request("What are symptoms of diabetes?"));
    }

    #[test]
    fn test_strip_diagnostic_language() {
        let policy = SafetyPolicy::default();
        let stripped = policy.strip_diagnostic_language(
            "Thirst is a common symptom. You most likely have diabetes. Take 500 mg of metformin daily! \
            A doctor can run an A1C test.\nDiagnosis: type 2 diabetes",
        );
        assert_eq!(stripped, "Thirst is a common symptom. A doctor can run an A1C test.");
    }

    #[test]
    fn test_benign_you_have_is_kept() {
        let policy = SafetyPolicy::default();
        let text = "If you have diabetes, regular checkups help.";
        assert_eq!(policy.strip_diagnostic_language(text), text);
    }

    #[test]
    fn test_fully_stripped_answer_becomes_refusal() {
        let policy = SafetyPolicy::default();
        let out = policy.apply(&hinted("I would prescribe insulin.", Some(0.9)), "Tell me about insulin", &[]);
        assert!(out.refused);
        assert_eq!(out.response_text, SAFE_REFUSAL);
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("One. Two! Three? Four"),
            vec!["One.", "Two!", "Three?", "Four"]
        );
        assert_eq!(split_sentences("v1.5 is fine."), vec!["v1.5 is fine."]);
    }
}
