//! Source adapter registry: slug to concrete adapter.

use soma_core::{AppConfig, IngestError, RunContext, SourceAdapter};
use soma_io::{
    source_bbc::BbcAdapter, source_huggingface::HuggingFaceAdapter,
    source_sprakbanken::SprakbankenAdapter, source_tiktok::TikTokAdapter,
    source_wikipedia::WikipediaAdapter,
};

/// Canonical slugs of the shipped sources.
pub const SOURCES: &[&str] = &[
    "wikipedia-somali",
    "bbc-somali",
    "huggingface-somali",
    "sprakbanken",
    "tiktok",
];

/// Resolve a user-supplied source name to its canonical slug.
pub fn resolve_slug(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "wikipedia" | "wikipedia-somali" | "sowiki" => Some("wikipedia-somali"),
        "bbc" | "bbc-somali" => Some("bbc-somali"),
        "huggingface" | "huggingface-somali" | "hf" => Some("huggingface-somali"),
        "sprakbanken" | "språkbanken" => Some("sprakbanken"),
        "tiktok" => Some("tiktok"),
        _ => None,
    }
}

/// Construct the adapter for one source slug.
pub fn build_adapter(
    name: &str,
    cfg: &AppConfig,
    run: &RunContext,
) -> Result<Box<dyn SourceAdapter>, IngestError> {
    let slug = resolve_slug(name).ok_or_else(|| {
        IngestError::Configuration(format!(
            "unknown source `{name}`; available: {}",
            SOURCES.join(", ")
        ))
    })?;
    let build = || -> anyhow::Result<Box<dyn SourceAdapter>> {
        Ok(match slug {
            "wikipedia-somali" => Box::new(WikipediaAdapter::new(cfg, run)?),
            "bbc-somali" => Box::new(BbcAdapter::new(cfg, run)?),
            "huggingface-somali" => Box::new(HuggingFaceAdapter::new(cfg, run)?),
            "sprakbanken" => Box::new(SprakbankenAdapter::new(cfg, run)?),
            "tiktok" => Box::new(TikTokAdapter::new(cfg, run)?),
            other => anyhow::bail!("slug {other} resolved but not constructible"),
        })
    };
    build().map_err(|e| IngestError::Configuration(format!("cannot build adapter: {e}")))
}
