//! # SOMA I/O - Source Adapters, Ledger and Silver Writer
//!
//! This crate provides the I/O edges of the ingestion pipeline: the
//! persistent crawl ledger, the schema-enforced Parquet silver writer with
//! its manifest sidecar, the polite HTTP fetch layer, and the five concrete
//! source adapters.
//!
//! ## Source Adapters
//! - **Wikipedia**: bulk dump download + streamed MediaWiki parse
//! - **BBC Somali**: HTML scrape with robots, rate limiting and worker pool
//! - **Hugging Face**: dataset rows API stream
//! - **Språkbanken**: archived corpus bundles
//! - **TikTok**: third-party comments API

/// Persistent per-URL crawl state machine
pub mod ledger;

/// Partition manifest sidecar
pub mod manifest;

/// Schema-enforced Parquet silver writer
pub mod sink_silver;

/// Polite HTTP client, rate limiting, robots, canonical URLs
pub mod fetch;

/// Bulk-file adapter for the Somali Wikipedia dump
pub mod source_wikipedia;

/// Web-scraping adapter for BBC Somali
pub mod source_bbc;

/// Stream adapter for Hugging Face datasets
pub mod source_huggingface;

/// Archived-corpus adapter for Språkbanken bundles
pub mod source_sprakbanken;

/// Social comments adapter for TikTok
pub mod source_tiktok;

pub use fetch::{canonical_url, HttpFetcher};
pub use ledger::{CrawlLedger, LedgerEntry, LedgerState};
pub use manifest::Manifest;
pub use sink_silver::{silver_schema, SilverWriter};
