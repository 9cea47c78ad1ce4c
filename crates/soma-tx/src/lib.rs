//! # SOMA Transforms - Record Quality Stages
//!
//! CPU-bound transformations applied to every raw record between
//! acquisition and the silver writer: markup-aware text cleaning, the
//! ordered quality-filter chain, heuristic language identification, and the
//! dual-layer deduplication engine. All stages are synchronous and are
//! driven from the orchestration thread only.

/// Ordered pure text cleaning stages
pub mod clean;

/// Exact and near-duplicate detection
pub mod dedup;

/// Predicate + enrichment filter chain
pub mod filter;

/// Heuristic Somali language identification
pub mod langid;

pub use clean::TextCleaner;
pub use dedup::{DedupEngine, DedupVerdict};
pub use filter::{
    default_topic_ruleset, EmojiOnlyFilter, FilterEngine, FilterVerdict, LangIdFilter,
    MinLengthFilter, NamespaceFilter, RecordFilter, TopicLexiconFilter,
};
