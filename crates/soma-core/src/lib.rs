//! # SOMA Core - Somali Corpus Ingestion Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for
//! the SOMA ingestion pipelines. It defines the source adapter contract, the
//! channel message types that connect an adapter's extract stage to the
//! orchestrator, canonical record construction, configuration, and run-scoped
//! metrics.
//!
//! ## Key Components
//!
//! - **SourceAdapter**: discover/acquire contract plus a default extract loop
//!   that pumps raw records into a bounded channel
//! - **Ledger trait**: persistent per-URL state machine the pipeline and
//!   adapters coordinate through
//! - **RecordBuilder**: deterministic hashing and canonical silver records
//! - **MetricsCollector**: run-scoped counters, histograms and health
//!
//! The orchestrator consumes a serial stream of [`ExtractMsg`] values;
//! adapters that fetch concurrently funnel results through the same channel,
//! so cleaning, filtering, dedup and writing always see a serial stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod config;
pub mod error;
pub mod metrics;
pub mod record;
pub mod report;
pub mod run;

pub use config::{AppConfig, PipelineConfig, QualityConfig, SourceSettings};
pub use error::IngestError;
pub use metrics::{HealthStatus, MetricsCollector, PipelineType, RunSummary};
pub use record::{
    RawRecord, RecordBuilder, Register, SilverRecord, SourceDescriptor, SourceType,
    PIPELINE_VERSION, SCHEMA_VERSION,
};
pub use report::QualityReporter;
pub use run::RunContext;

/// Sender side of the adapter-to-orchestrator channel.
pub type RecordTx = mpsc::Sender<ExtractMsg>;

/// Receiver side of the adapter-to-orchestrator channel.
pub type RecordRx = mpsc::Receiver<ExtractMsg>;

/// Messages flowing from an adapter's extract stage to the orchestrator.
#[derive(Debug, Clone)]
pub enum ExtractMsg {
    /// One acquired raw record, already admitted by the ledger.
    Record(RawRecord),
    /// End-of-stream marker; no more records will be sent.
    Eos,
}

/// One candidate unit of work enumerated by `discover`, before any payload
/// is fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Stable identifier within the source (canonical URL, file segment id).
    pub id: String,
    /// Canonical URL when the unit is addressable; ledger admission only
    /// applies to URL units.
    pub url: Option<String>,
    /// Native discovery attributes (sitemap depth, api offset, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl WorkUnit {
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            url: Some(url),
            metadata: Map::new(),
        }
    }

    pub fn opaque(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: None,
            metadata: Map::new(),
        }
    }
}

/// Text-cleaning profile a source selects; the orchestrator maps it to the
/// concrete cleaning stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanProfile {
    /// Whitespace normalization only.
    Plain,
    /// HTML stripping then whitespace normalization.
    Html,
    /// Wiki markup stripping, then leftover HTML, then whitespace
    /// normalization.
    MediaWiki,
}

/// Filter-chain profile a source selects on top of the mandatory predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterProfile {
    Standard,
    /// Adds the namespace filter over page titles.
    MediaWiki,
    /// Adds the emoji-only comment filter ahead of the standard chain.
    Social,
}

/// Outcome of acquiring one unit of work.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Payload acquired; observability fields feed the ledger entry.
    Fetched {
        record: RawRecord,
        http_status: Option<u16>,
        content_length: Option<u64>,
    },
    /// The unit does not exist upstream; marked `skipped`.
    NotFound,
    /// Worth retrying with backoff; exhausted retries become permanent.
    Transient(String),
    /// Will not succeed on retry; marked `failed`, run continues.
    Permanent(String),
}

/// Persistent per-URL state machine, keyed by `(source, canonical_url)`.
///
/// Transitions are atomic and durable before the in-memory state is
/// considered advanced. All access from one run is serialized by the
/// implementation.
pub trait Ledger: Send + Sync {
    /// Insert in `discovered` state if absent; idempotent.
    fn discover(&self, source: &str, url: &str, metadata: &Value) -> Result<()>;

    /// True iff the entry is absent, `force` is set, or the entry is in a
    /// non-terminal failure state with attempts remaining.
    fn should_fetch(&self, source: &str, url: &str, force: bool) -> Result<bool>;

    fn mark_fetched(
        &self,
        source: &str,
        url: &str,
        http_status: Option<u16>,
        content_length: Option<u64>,
    ) -> Result<()>;

    /// Bind the entry to its silver identity. A filter-rejected record is
    /// still `processed`, with no silver id, to preserve the "tried" signal.
    fn mark_processed(
        &self,
        source: &str,
        url: &str,
        text_hash: &str,
        silver_id: Option<&str>,
    ) -> Result<()>;

    fn mark_failed(&self, source: &str, url: &str, reason: &str) -> Result<()>;
    fn mark_skipped(&self, source: &str, url: &str) -> Result<()>;
    fn mark_duplicate(&self, source: &str, url: &str) -> Result<()>;

    /// Requests still allowed within the rolling window, from the fetch log.
    fn quota_remaining(&self, source: &str, window: Duration, cap: u32) -> Result<i64>;

    /// Append one fetch to the rolling-quota log.
    fn record_fetch_event(&self, source: &str) -> Result<()>;
}

/// Shared context handed to an adapter's extract stage.
#[derive(Clone)]
pub struct ExtractCtx {
    /// Canonical source name (ledger key, id prefix input).
    pub source: String,
    pub ledger: Arc<dyn Ledger>,
    pub metrics: Arc<MetricsCollector>,
    pub force: bool,
    /// Hard cap on units acquired this run.
    pub max_items: Option<usize>,
    pub max_attempts: u32,
    /// Base delay of the exponential backoff between retries.
    pub retry_base: Duration,
}

/// Contract implemented by every concrete source.
///
/// `discover` enumerates candidate units without fetching payloads and must
/// be idempotent against the ledger. `acquire` produces one raw record and
/// may issue network or disk I/O. The default `extract` drives both through
/// ledger admission, retry with backoff, and the outbound channel; adapters
/// with their own I/O model (bulk dump streaming, bounded worker pools)
/// override it and keep the same message protocol.
#[async_trait]
pub trait SourceAdapter: Send {
    fn descriptor(&self) -> &SourceDescriptor;

    fn pipeline_type(&self) -> PipelineType;

    fn clean_profile(&self) -> CleanProfile {
        CleanProfile::Plain
    }

    fn filter_profile(&self) -> FilterProfile {
        FilterProfile::Standard
    }

    async fn discover(&mut self, ctx: &ExtractCtx) -> Result<Vec<WorkUnit>>;

    async fn acquire(&mut self, unit: &WorkUnit, ctx: &ExtractCtx) -> AcquireOutcome;

    /// Pump raw records into `tx` until the source is exhausted, the item cap
    /// is reached, or cancellation is observed. Always sends [`ExtractMsg::Eos`]
    /// on the way out (best-effort).
    async fn extract(
        &mut self,
        tx: RecordTx,
        ctx: ExtractCtx,
        cancel: CancellationToken,
    ) -> Result<()> {
        let units = self.discover(&ctx).await?;
        ctx.metrics.increment("urls_discovered", units.len() as u64);

        let mut acquired = 0usize;
        for unit in units {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(cap) = ctx.max_items {
                if acquired >= cap {
                    debug!(source = %ctx.source, cap, "max_items reached");
                    break;
                }
            }

            if let Some(url) = &unit.url {
                ctx.ledger
                    .discover(&ctx.source, url, &Value::Object(unit.metadata.clone()))?;
                if !ctx.ledger.should_fetch(&ctx.source, url, ctx.force)? {
                    ctx.metrics.increment("skipped_discovery_dedup", 1);
                    continue;
                }
            }

            let outcome = acquire_with_retry(self, &unit, &ctx, &cancel).await;
            acquired += 1;
            match outcome {
                AcquireOutcome::Fetched {
                    mut record,
                    http_status,
                    content_length,
                } => {
                    ctx.metrics.increment("urls_fetched", 1);
                    if let Some(status) = http_status {
                        ctx.metrics.increment_http_status(status);
                    }
                    if record.source_url.is_none() {
                        record.source_url = unit.url.clone();
                    }
                    if let Some(url) = &unit.url {
                        ctx.ledger
                            .mark_fetched(&ctx.source, url, http_status, content_length)?;
                        ctx.ledger.record_fetch_event(&ctx.source)?;
                    }
                    if tx.send(ExtractMsg::Record(record)).await.is_err() {
                        break;
                    }
                }
                AcquireOutcome::NotFound => {
                    ctx.metrics.increment("urls_fetched", 1);
                    ctx.metrics.increment("urls_skipped", 1);
                    if let Some(url) = &unit.url {
                        ctx.ledger.mark_skipped(&ctx.source, url)?;
                    }
                }
                AcquireOutcome::Permanent(reason) | AcquireOutcome::Transient(reason) => {
                    // Transient here means the retry budget is spent.
                    ctx.metrics.increment("urls_fetched", 1);
                    ctx.metrics.increment("urls_failed", 1);
                    warn!(source = %ctx.source, unit = %unit.id, %reason, "unit failed");
                    if let Some(url) = &unit.url {
                        ctx.ledger.mark_failed(&ctx.source, url, &reason)?;
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }

        let _ = tx.send(ExtractMsg::Eos).await; // best-effort
        Ok(())
    }
}

/// Drive `acquire` through the transient-retry discipline: exponential
/// backoff with jitter, up to `ctx.max_attempts` attempts. Cancellation
/// mid-unit yields a failure with reason `canceled`.
pub async fn acquire_with_retry<A: SourceAdapter + ?Sized>(
    adapter: &mut A,
    unit: &WorkUnit,
    ctx: &ExtractCtx,
    cancel: &CancellationToken,
) -> AcquireOutcome {
    let mut last_reason = String::new();
    for attempt in 1..=ctx.max_attempts {
        if cancel.is_cancelled() {
            return AcquireOutcome::Permanent("canceled".to_string());
        }
        let started = std::time::Instant::now();
        let outcome = tokio::select! {
            outcome = adapter.acquire(unit, ctx) => outcome,
            _ = cancel.cancelled() => {
                return AcquireOutcome::Permanent("canceled".to_string());
            }
        };
        ctx.metrics
            .observe("fetch_duration_secs", started.elapsed().as_secs_f64());

        match outcome {
            AcquireOutcome::Transient(reason) => {
                warn!(
                    unit = %unit.id,
                    attempt,
                    max_attempts = ctx.max_attempts,
                    %reason,
                    "transient failure"
                );
                last_reason = reason;
                if attempt < ctx.max_attempts {
                    let delay = backoff_delay(ctx.retry_base, attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return AcquireOutcome::Permanent("canceled".to_string());
                        }
                    }
                }
            }
            other => return other,
        }
    }
    AcquireOutcome::Permanent(format!(
        "retries exhausted after {} attempts: {last_reason}",
        ctx.max_attempts
    ))
}

/// Exponential backoff with uniform jitter in `[0.5, 1.5)` of the nominal
/// delay for the given 1-based attempt number.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let nominal = base.as_secs_f64() * f64::powi(2.0, attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(nominal * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_jitter_bounds() {
        let base = Duration::from_millis(100);
        for attempt in 1..=4u32 {
            let nominal = 100.0 * f64::powi(2.0, attempt as i32 - 1);
            let d = backoff_delay(base, attempt).as_secs_f64() * 1000.0;
            assert!(d >= nominal * 0.5 - 1e-6, "attempt {attempt}: {d} < {}", nominal * 0.5);
            assert!(d < nominal * 1.5 + 1e-6, "attempt {attempt}: {d} >= {}", nominal * 1.5);
        }
    }

    #[test]
    fn work_unit_constructors() {
        let u = WorkUnit::from_url("https://www.bbc.com/somali/articles/1");
        assert_eq!(u.id, "https://www.bbc.com/somali/articles/1");
        assert!(u.url.is_some());
        let o = WorkUnit::opaque("dump-segment-0");
        assert!(o.url.is_none());
    }
}
