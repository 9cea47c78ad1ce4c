//! Canonical record types and deterministic identity.
//!
//! A [`RawRecord`] is the transient shape an adapter yields for one unit of
//! work. After cleaning, filtering and dedup it is assembled into a
//! [`SilverRecord`], the persisted shape of the silver layer. Record ids are
//! a pure function of `(text, source)` so that re-running the pipeline over
//! identical input produces identical ids.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Frozen on-disk schema version of the silver layer.
///
/// Adding a field requires a new major version; the writer refuses records
/// of any other version.
pub const SCHEMA_VERSION: &str = "2.1";

/// Version stamp recorded in every partition manifest.
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transient, per-item in-flight record produced by a source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Opaque source text, exactly as acquired.
    pub text: String,

    /// Stable identifier of the unit, or `None` for non-URL sources.
    pub source_url: Option<String>,

    /// Free-form map of native source attributes
    /// (page title, revision id, api offset, ...).
    #[serde(default)]
    pub source_metadata: Map<String, Value>,
}

impl RawRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_url: None,
            source_metadata: Map::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.source_metadata.insert(key.to_string(), value);
        self
    }
}

/// Broad category of a source, persisted as a lowercase string column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Encyclopedia,
    News,
    Web,
    Corpus,
    Social,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Encyclopedia => "encyclopedia",
            SourceType::News => "news",
            SourceType::Web => "web",
            SourceType::Corpus => "corpus",
            SourceType::Social => "social",
        }
    }
}

/// Linguistic register of a source's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Formal,
    Informal,
    Colloquial,
}

impl Register {
    pub fn as_str(&self) -> &'static str {
        match self {
            Register::Formal => "formal",
            Register::Informal => "informal",
            Register::Colloquial => "colloquial",
        }
    }
}

/// Static description of a concrete source adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Canonical source name, e.g. `Wikipedia-Somali`. Input to the id prefix.
    pub name: String,
    /// Filesystem-safe slug used in partition file names, e.g. `wikipedia-somali`.
    pub slug: String,
    pub source_type: SourceType,
    /// SPDX-like license tag, e.g. `CC-BY-SA-4.0`.
    pub license: String,
    pub register: Register,
    /// Content domain tag, e.g. `so.wikipedia.org`.
    pub domain: String,
}

/// Persisted silver-layer record. Field order is the canonical column order
/// of the on-disk schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilverRecord {
    pub id: String,
    pub text: String,
    pub source: String,
    pub source_type: SourceType,
    pub date_accessed: NaiveDate,
    pub language: String,
    pub license: String,
    pub token_count: i64,
    pub metadata: Map<String, Value>,
    pub domain: String,
    /// Reserved column; always absent in the ingestion core.
    pub embedding: Option<String>,
    pub register: Register,
}

/// Deterministic hashing, ids and canonical record assembly.
pub struct RecordBuilder {
    descriptor: SourceDescriptor,
    date_accessed: NaiveDate,
}

impl RecordBuilder {
    pub fn new(descriptor: SourceDescriptor, date_accessed: NaiveDate) -> Self {
        Self {
            descriptor,
            date_accessed,
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    /// sha256 over the NFC-normalized text, as 64 hex characters.
    pub fn text_hash(text: &str) -> String {
        let normalized: String = text.nfc().collect();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Source name with non-alphanumerics removed, upper-cased,
    /// truncated to 4 characters.
    pub fn source_prefix(source: &str) -> String {
        source
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .take(4)
            .collect()
    }

    /// `{SOURCE_PREFIX}_{first 16 hex of sha256(text)}`.
    pub fn record_id(text: &str, source: &str) -> String {
        format!(
            "{}_{}",
            Self::source_prefix(source),
            &Self::text_hash(text)[..16]
        )
    }

    /// Count of maximal non-whitespace runs.
    pub fn token_count(text: &str) -> i64 {
        text.split_whitespace().count() as i64
    }

    /// Assemble the canonical record for cleaned text plus enrichment
    /// metadata gathered by the filter chain.
    pub fn build(&self, cleaned_text: String, metadata: Map<String, Value>) -> SilverRecord {
        let id = Self::record_id(&cleaned_text, &self.descriptor.name);
        let token_count = Self::token_count(&cleaned_text);
        let language = metadata
            .get("detected_lang")
            .and_then(Value::as_str)
            .unwrap_or("so")
            .to_string();

        SilverRecord {
            id,
            text: cleaned_text,
            source: self.descriptor.name.clone(),
            source_type: self.descriptor.source_type,
            date_accessed: self.date_accessed,
            language,
            license: self.descriptor.license.clone(),
            token_count,
            metadata,
            domain: self.descriptor.domain.clone(),
            embedding: None,
            register: self.descriptor.register,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wiki_descriptor() -> SourceDescriptor {
        SourceDescriptor {
            name: "Wikipedia-Somali".to_string(),
            slug: "wikipedia-somali".to_string(),
            source_type: SourceType::Encyclopedia,
            license: "CC-BY-SA-4.0".to_string(),
            register: Register::Formal,
            domain: "so.wikipedia.org".to_string(),
        }
    }

    #[test]
    fn source_prefix_strips_and_truncates() {
        assert_eq!(RecordBuilder::source_prefix("Wikipedia-Somali"), "WIKI");
        assert_eq!(RecordBuilder::source_prefix("BBC-Somali"), "BBCS");
        assert_eq!(RecordBuilder::source_prefix("TikTok"), "TIKT");
        assert_eq!(RecordBuilder::source_prefix("Språkbanken"), "SPRK");
        assert_eq!(RecordBuilder::source_prefix("a!b"), "AB");
    }

    #[test]
    fn id_is_prefix_plus_16_hex_of_text_hash() {
        let text = "Soomaaliya waa waddan.";
        let id = RecordBuilder::record_id(text, "Wikipedia-Somali");
        let hash = RecordBuilder::text_hash(text);
        assert_eq!(id, format!("WIKI_{}", &hash[..16]));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn id_is_deterministic() {
        let a = RecordBuilder::record_id("Muqdisho waa caasimad.", "BBC-Somali");
        let b = RecordBuilder::record_id("Muqdisho waa caasimad.", "BBC-Somali");
        assert_eq!(a, b);
    }

    #[test]
    fn token_count_counts_non_whitespace_runs() {
        assert_eq!(RecordBuilder::token_count("Soomaaliya waa waddan."), 3);
        assert_eq!(RecordBuilder::token_count("  a \t b\nc  "), 3);
        assert_eq!(RecordBuilder::token_count(""), 0);
        assert_eq!(RecordBuilder::token_count("   "), 0);
    }

    #[test]
    fn build_assembles_all_fields() {
        let builder = RecordBuilder::new(
            wiki_descriptor(),
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        );
        let mut meta = Map::new();
        meta.insert("detected_lang".into(), Value::String("so".into()));
        meta.insert("title".into(), Value::String("Soomaaliya".into()));

        let record = builder.build("Soomaaliya waa waddan.".to_string(), meta);
        assert!(record.id.starts_with("WIKI_"));
        assert_eq!(record.token_count, 3);
        assert_eq!(record.language, "so");
        assert_eq!(record.source_type, SourceType::Encyclopedia);
        assert_eq!(record.register, Register::Formal);
        assert!(record.embedding.is_none());
        assert_eq!(
            record.metadata.get("title").and_then(Value::as_str),
            Some("Soomaaliya")
        );
    }
}
