//! Layered, read-only run configuration.
//!
//! Settings resolve as `defaults < file < environment`; the environment wins.
//! Environment variables use the `SOMA` prefix with `__` as the section
//! separator, e.g. `SOMA_QUALITY__MIN_LENGTH=80`. The loaded value is
//! immutable and passed explicitly into constructors; tests build their own.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::IngestError;

/// Root directories and store paths for all pipeline layers.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// Root for Bronze partitions (raw payload capture).
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,
    /// Root for staging artifacts (discovery caches, partial downloads).
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Root for Silver partitions.
    #[serde(default = "default_silver_dir")]
    pub silver_dir: PathBuf,
    /// Path to the crawl ledger store.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// Directory for per-source dedup snapshots.
    #[serde(default = "default_dedup_dir")]
    pub dedup_dir: PathBuf,
    /// Directory for per-run metrics documents.
    #[serde(default = "default_metrics_dir")]
    pub metrics_dir: PathBuf,
    /// Directory for per-run quality reports.
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            raw_dir: default_raw_dir(),
            staging_dir: default_staging_dir(),
            silver_dir: default_silver_dir(),
            ledger_path: default_ledger_path(),
            dedup_dir: default_dedup_dir(),
            metrics_dir: default_metrics_dir(),
            reports_dir: default_reports_dir(),
        }
    }
}

fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("data/staging")
}
fn default_silver_dir() -> PathBuf {
    PathBuf::from("data/processed/silver")
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/ledger/crawl_ledger.sqlite")
}
fn default_dedup_dir() -> PathBuf {
    PathBuf::from("data/dedup")
}
fn default_metrics_dir() -> PathBuf {
    PathBuf::from("data/metrics")
}
fn default_reports_dir() -> PathBuf {
    PathBuf::from("data/reports")
}

/// Per-source acquisition limits and endpoints, keyed by source slug under
/// the `scraping` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// Hard cap on units emitted per run.
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Lower bound of the per-request politeness delay, in seconds.
    #[serde(default = "default_min_delay_sec")]
    pub min_delay_sec: f64,
    /// Upper bound of the per-request politeness delay, in seconds.
    #[serde(default = "default_max_delay_sec")]
    pub max_delay_sec: f64,
    /// Token-bucket size of the rolling per-hour request cap.
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    /// Retry budget for transient per-unit failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// Bounded worker pool size for adapters that fetch concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bulk-file adapters: dump or bundle URL override.
    #[serde(default)]
    pub dump_url: Option<String>,
    /// Archived-corpus adapters: local bundle directory or glob.
    #[serde(default)]
    pub bundle_dir: Option<String>,
    /// Stream adapters: dataset identifier.
    #[serde(default)]
    pub dataset: Option<String>,
    /// API adapters: base endpoint override (useful in tests).
    #[serde(default)]
    pub api_base: Option<String>,
    /// Social adapters: item ids whose comments are collected.
    #[serde(default)]
    pub item_ids: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            max_items: None,
            min_delay_sec: default_min_delay_sec(),
            max_delay_sec: default_max_delay_sec(),
            max_requests_per_hour: default_max_requests_per_hour(),
            max_attempts: default_max_attempts(),
            request_timeout_sec: default_request_timeout_sec(),
            workers: default_workers(),
            dump_url: None,
            bundle_dir: None,
            dataset: None,
            api_base: None,
            item_ids: Vec::new(),
        }
    }
}

fn default_min_delay_sec() -> f64 {
    5.0
}
fn default_max_delay_sec() -> f64 {
    10.0
}
fn default_max_requests_per_hour() -> u32 {
    300
}
fn default_max_attempts() -> u32 {
    3
}
fn default_request_timeout_sec() -> u64 {
    30
}
fn default_workers() -> usize {
    1
}

/// Quality-gate thresholds shared by the filter chain and dedup engine.
#[derive(Debug, Clone, Deserialize)]
pub struct QualityConfig {
    /// Minimum character count for `min_length_filter`.
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    /// Confidence floor for `langid_filter`.
    #[serde(default = "default_langid_confidence")]
    pub langid_confidence: f64,
    /// Near-duplicate Jaccard threshold.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Character shingle length for near-duplicate signatures.
    #[serde(default = "default_shingle_size")]
    pub shingle_size: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
            langid_confidence: default_langid_confidence(),
            similarity_threshold: default_similarity_threshold(),
            shingle_size: default_shingle_size(),
        }
    }
}

fn default_min_length() -> usize {
    50
}
fn default_langid_confidence() -> f64 {
    0.3
}
fn default_similarity_threshold() -> f64 {
    0.85
}
fn default_shingle_size() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// One of DEBUG, INFO, WARN, ERROR.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Writer flush threshold in records.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Writer flush threshold on estimated serialized bytes.
    #[serde(default = "default_buffer_soft_cap_bytes")]
    pub buffer_soft_cap_bytes: usize,
    /// Capacity of the adapter-to-orchestrator channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Consecutive failed flushes tolerated before the run aborts.
    #[serde(default = "default_max_flush_failures")]
    pub max_consecutive_flush_failures: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            buffer_soft_cap_bytes: default_buffer_soft_cap_bytes(),
            channel_capacity: default_channel_capacity(),
            max_consecutive_flush_failures: default_max_flush_failures(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_buffer_soft_cap_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_channel_capacity() -> usize {
    64
}
fn default_max_flush_failures() -> u32 {
    3
}

/// Immutable, fully-resolved application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub scraping: HashMap<String, SourceSettings>,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration, layering an optional file under environment
    /// overrides. A missing optional file falls back to defaults.
    pub fn load(file: Option<&Path>) -> Result<Self, IngestError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SOMA")
                .separator("__")
                .try_parsing(true),
        );
        let resolved = builder
            .build()
            .map_err(|e| IngestError::Configuration(e.to_string()))?;
        resolved
            .try_deserialize()
            .map_err(|e| IngestError::Configuration(e.to_string()))
    }

    /// Settings for one source slug, defaulted when the section is absent.
    pub fn source_settings(&self, slug: &str) -> SourceSettings {
        self.scraping.get(slug).cloned().unwrap_or_default()
    }
}
