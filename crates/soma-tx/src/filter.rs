//! Ordered chain of predicate+enrichment functions.
//!
//! The engine invokes each filter in order and short-circuits on the first
//! failure; the rejecting filter's name is reported so rejections can be
//! counted per predicate. Enrichments are merged into the record's metadata
//! only when the filter passes.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::langid;

/// Result of one predicate: pass/fail plus metadata enrichment.
pub struct FilterOutcome {
    pub passed: bool,
    pub enrichment: Map<String, Value>,
}

impl FilterOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            enrichment: Map::new(),
        }
    }

    pub fn pass_with(enrichment: Map<String, Value>) -> Self {
        Self {
            passed: true,
            enrichment,
        }
    }

    pub fn reject() -> Self {
        Self {
            passed: false,
            enrichment: Map::new(),
        }
    }
}

pub trait RecordFilter: Send {
    /// Stable name used in rejection counters (`filtered_by_<name>`).
    fn name(&self) -> &str;

    fn apply(&self, text: &str, metadata: &Map<String, Value>) -> FilterOutcome;
}

/// Verdict of running a record through the whole chain.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterVerdict {
    Passed,
    /// Name of the first filter that rejected the record.
    RejectedBy(String),
}

#[derive(Default)]
pub struct FilterEngine {
    filters: Vec<Box<dyn RecordFilter>>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter<F: RecordFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the chain; on success `metadata` has every enrichment merged in.
    pub fn evaluate(&self, text: &str, metadata: &mut Map<String, Value>) -> FilterVerdict {
        for filter in &self.filters {
            let outcome = filter.apply(text, metadata);
            if !outcome.passed {
                return FilterVerdict::RejectedBy(filter.name().to_string());
            }
            for (k, v) in outcome.enrichment {
                metadata.insert(k, v);
            }
        }
        FilterVerdict::Passed
    }
}

/// Passes iff the character count reaches the threshold.
pub struct MinLengthFilter {
    pub threshold: usize,
}

impl RecordFilter for MinLengthFilter {
    fn name(&self) -> &str {
        "min_length_filter"
    }

    fn apply(&self, text: &str, _metadata: &Map<String, Value>) -> FilterOutcome {
        if text.chars().count() >= self.threshold {
            FilterOutcome::pass()
        } else {
            FilterOutcome::reject()
        }
    }
}

/// Heuristic language gate; enriches `detected_lang` and `lang_confidence`.
pub struct LangIdFilter {
    pub allowed: Vec<String>,
    pub confidence_threshold: f64,
}

impl LangIdFilter {
    pub fn somali(confidence_threshold: f64) -> Self {
        Self {
            allowed: vec!["so".to_string()],
            confidence_threshold,
        }
    }
}

impl RecordFilter for LangIdFilter {
    fn name(&self) -> &str {
        "langid_filter"
    }

    fn apply(&self, text: &str, _metadata: &Map<String, Value>) -> FilterOutcome {
        let (lang, confidence) = langid::identify(text);
        if self.allowed.iter().any(|a| a == lang) && confidence >= self.confidence_threshold {
            let mut enrichment = Map::new();
            enrichment.insert("detected_lang".into(), Value::String(lang.to_string()));
            enrichment.insert(
                "lang_confidence".into(),
                Value::from((confidence * 1000.0).round() / 1000.0),
            );
            FilterOutcome::pass_with(enrichment)
        } else {
            FilterOutcome::reject()
        }
    }
}

/// Counts lexicon matches per topic tag; writes `dialect_markers` and
/// `primary_dialect`. With `enrich_only` the filter never rejects.
pub struct TopicLexiconFilter {
    pub ruleset: BTreeMap<String, Vec<String>>,
    pub enrich_only: bool,
}

impl TopicLexiconFilter {
    pub fn new(ruleset: BTreeMap<String, Vec<String>>, enrich_only: bool) -> Self {
        Self {
            ruleset,
            enrich_only,
        }
    }
}

/// Coarse lexical markers used downstream as dialect signal. The lists are
/// rough; they only need to be stable and countable.
pub fn default_topic_ruleset() -> BTreeMap<String, Vec<String>> {
    let mut rules = BTreeMap::new();
    rules.insert(
        "northern".to_string(),
        ["waxaan", "adiga", "halkan", "sidee", "maxaad"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    rules.insert(
        "benadiri".to_string(),
        ["xamar", "shangaani", "baraawe", "reer", "banaadir"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    rules.insert(
        "maay".to_string(),
        ["maay", "baydhabo", "eelay", "reewin", "jiilaal"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    rules
}

impl RecordFilter for TopicLexiconFilter {
    fn name(&self) -> &str {
        "topic_lexicon_enrichment_filter"
    }

    fn apply(&self, text: &str, _metadata: &Map<String, Value>) -> FilterOutcome {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphabetic())
            .filter(|t| !t.is_empty())
            .collect();

        let mut markers = Map::new();
        let mut best: Option<(&str, u64)> = None;
        for (topic, words) in &self.ruleset {
            let count = tokens
                .iter()
                .filter(|t| words.iter().any(|w| w == **t))
                .count() as u64;
            markers.insert(topic.clone(), Value::from(count));
            // ties resolve to the lexicographically first topic, which the
            // BTreeMap iteration order provides
            if count > 0 && best.map_or(true, |(_, b)| count > b) {
                best = Some((topic, count));
            }
        }

        let any_match = best.is_some();
        let mut enrichment = Map::new();
        enrichment.insert("dialect_markers".into(), Value::Object(markers));
        if let Some((topic, _)) = best {
            enrichment.insert("primary_dialect".into(), Value::String(topic.to_string()));
        }

        if self.enrich_only || any_match {
            FilterOutcome::pass_with(enrichment)
        } else {
            FilterOutcome::reject()
        }
    }
}

/// Rejects records whose `title` metadata begins with a skipped namespace
/// prefix (`Talk:`, `User:`, ...). Wikipedia only.
pub struct NamespaceFilter {
    pub skip_prefixes: Vec<String>,
}

impl NamespaceFilter {
    pub fn mediawiki_default() -> Self {
        Self {
            skip_prefixes: [
                "Talk:",
                "User:",
                "User talk:",
                "Wikipedia:",
                "File:",
                "Template:",
                "Category:",
                "Help:",
                "Portal:",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RecordFilter for NamespaceFilter {
    fn name(&self) -> &str {
        "namespace_filter"
    }

    fn apply(&self, _text: &str, metadata: &Map<String, Value>) -> FilterOutcome {
        let title = metadata.get("title").and_then(Value::as_str).unwrap_or("");
        if self
            .skip_prefixes
            .iter()
            .any(|prefix| title.starts_with(prefix.as_str()))
        {
            FilterOutcome::reject()
        } else {
            FilterOutcome::pass()
        }
    }
}

/// Rejects comments that carry no alphanumeric content after cleaning
/// (emoji-only, punctuation-only, empty). Social profile only.
pub struct EmojiOnlyFilter;

impl RecordFilter for EmojiOnlyFilter {
    fn name(&self) -> &str {
        "emoji_only_filter"
    }

    fn apply(&self, text: &str, _metadata: &Map<String, Value>) -> FilterOutcome {
        if text.chars().any(char::is_alphanumeric) {
            FilterOutcome::pass()
        } else {
            FilterOutcome::reject()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn somali_text() -> &'static str {
        "Soomaaliya waa waddan ku yaal Geeska Afrika, waxaana caasimaddiisu tahay Muqdisho."
    }

    #[test]
    fn chain_short_circuits_on_first_failure() {
        let engine = FilterEngine::new()
            .with_filter(MinLengthFilter { threshold: 500 })
            .with_filter(LangIdFilter::somali(0.3));
        let mut meta = Map::new();
        let verdict = engine.evaluate(somali_text(), &mut meta);
        assert_eq!(
            verdict,
            FilterVerdict::RejectedBy("min_length_filter".to_string())
        );
        // short-circuit means no enrichment from later filters
        assert!(meta.get("detected_lang").is_none());
    }

    #[test]
    fn passing_chain_merges_enrichments() {
        let engine = FilterEngine::new()
            .with_filter(MinLengthFilter { threshold: 10 })
            .with_filter(LangIdFilter::somali(0.3))
            .with_filter(TopicLexiconFilter::new(default_topic_ruleset(), true));
        let mut meta = Map::new();
        assert_eq!(engine.evaluate(somali_text(), &mut meta), FilterVerdict::Passed);
        assert_eq!(meta.get("detected_lang").and_then(Value::as_str), Some("so"));
        assert!(meta.get("lang_confidence").and_then(Value::as_f64).unwrap() >= 0.3);
        assert!(meta.get("dialect_markers").is_some());
    }

    #[test]
    fn english_text_rejected_by_langid() {
        let engine = FilterEngine::new().with_filter(LangIdFilter::somali(0.3));
        let mut meta = Map::new();
        let verdict = engine.evaluate("The quick brown fox jumps over the lazy dog.", &mut meta);
        assert_eq!(verdict, FilterVerdict::RejectedBy("langid_filter".to_string()));
    }

    #[test]
    fn namespace_filter_skips_prefixed_titles() {
        let filter = NamespaceFilter::mediawiki_default();
        let mut meta = Map::new();
        meta.insert("title".into(), Value::String("Talk:Soomaaliya".into()));
        assert!(!filter.apply("qoraal", &meta).passed);
        meta.insert("title".into(), Value::String("Soomaaliya".into()));
        assert!(filter.apply("qoraal", &meta).passed);
    }

    #[test]
    fn topic_lexicon_counts_and_argmax() {
        let filter = TopicLexiconFilter::new(default_topic_ruleset(), true);
        let outcome = filter.apply("Reer Xamar iyo reer Baydhabo ayaa kulmay, maay maay.", &Map::new());
        assert!(outcome.passed);
        let markers = outcome.enrichment["dialect_markers"].as_object().unwrap();
        assert_eq!(markers["benadiri"], Value::from(3u64));
        assert_eq!(markers["maay"], Value::from(3u64));
        // tie between benadiri and maay resolves to the lexicographically first
        assert_eq!(
            outcome.enrichment["primary_dialect"],
            Value::String("benadiri".into())
        );
    }

    #[test]
    fn topic_lexicon_without_matches_omits_primary() {
        let filter = TopicLexiconFilter::new(default_topic_ruleset(), true);
        let outcome = filter.apply("Qoraal aan lahayn calaamado gaar ah.", &Map::new());
        assert!(outcome.passed);
        assert!(outcome.enrichment.get("primary_dialect").is_none());
    }

    #[test]
    fn emoji_only_comments_are_rejected() {
        let filter = EmojiOnlyFilter;
        assert!(!filter.apply("🔥🔥🔥 😂!!", &Map::new()).passed);
        assert!(!filter.apply("", &Map::new()).passed);
        assert!(filter.apply("waad mahadsantahay 🔥", &Map::new()).passed);
    }

    #[test]
    fn empty_text_fails_min_length_not_schema() {
        let engine = FilterEngine::new().with_filter(MinLengthFilter { threshold: 1 });
        let mut meta = Map::new();
        assert_eq!(
            engine.evaluate("", &mut meta),
            FilterVerdict::RejectedBy("min_length_filter".to_string())
        );
    }
}
