//! # SOMA Pipeline - Ingestion Orchestrator
//!
//! Executes the five-stage workflow for one source: the adapter's extract
//! stage pumps raw records through a bounded channel; the orchestration
//! thread cleans, filters, deduplicates and buffers them; the silver writer
//! flushes batches; the crawl ledger and metrics collector are updated
//! throughout and flushed at run end together with the manifest and quality
//! report.
//!
//! Orchestration is single-threaded with respect to one source's record
//! stream, preserving the ordering of ledger transitions; concurrency lives
//! inside adapters and is funneled back through the channel.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use soma_core::{
    config::{DataConfig, PipelineConfig},
    AppConfig, CleanProfile, ExtractCtx, ExtractMsg, FilterProfile, IngestError, Ledger,
    MetricsCollector, QualityReporter, RawRecord, RecordBuilder, RunContext, RunSummary,
    SilverRecord, SourceAdapter, SCHEMA_VERSION,
};
use soma_io::ledger::CrawlLedger;
use soma_io::sink_silver::SilverWriter;
use soma_tx::{
    default_topic_ruleset, DedupEngine, DedupVerdict, EmojiOnlyFilter, FilterEngine,
    FilterVerdict, LangIdFilter, MinLengthFilter, NamespaceFilter, TextCleaner,
    TopicLexiconFilter,
};

pub mod registry;
pub mod validate;

/// Result of one pipeline invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub partition_dir: PathBuf,
    pub summary: RunSummary,
    pub records_written: u64,
    pub canceled: bool,
    /// Message of the fatal error, when the run aborted.
    pub fatal: Option<String>,
}

impl RunOutcome {
    /// CLI exit code: 0 success (including clean cancellation), 1 partial
    /// success with non-fatal errors, 2 fatal.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() {
            2
        } else if self.had_nonfatal_errors() {
            1
        } else {
            0
        }
    }

    fn had_nonfatal_errors(&self) -> bool {
        let counters = &self.summary.snapshot.counters;
        ["urls_failed", "flush_failures", "file_errors"]
            .iter()
            .any(|c| counters.get(*c).copied().unwrap_or(0) > 0)
    }
}

pub struct IngestPipeline {
    cfg: AppConfig,
    adapter: Box<dyn SourceAdapter>,
    run: RunContext,
    max_items_override: Option<usize>,
}

impl IngestPipeline {
    pub fn new(cfg: AppConfig, adapter: Box<dyn SourceAdapter>, run: RunContext) -> Self {
        Self {
            cfg,
            adapter,
            run,
            max_items_override: None,
        }
    }

    /// CLI-level cap overriding the configured per-source limit.
    pub fn with_max_items(mut self, cap: Option<usize>) -> Self {
        self.max_items_override = cap;
        self
    }

    /// Run the full workflow. Fails only on configuration or fatal errors;
    /// per-record errors are counted and skipped.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunOutcome, IngestError> {
        let span = tracing::info_span!(
            "ingest",
            run_id = %self.run.run_id,
            source = %self.adapter.descriptor().name
        );
        run_inner(self, cancel).instrument(span).await
    }
}

async fn run_inner(
    pipeline: IngestPipeline,
    cancel: CancellationToken,
) -> Result<RunOutcome, IngestError> {
    let IngestPipeline {
        cfg,
        mut adapter,
        run,
        max_items_override,
    } = pipeline;

    let descriptor = adapter.descriptor().clone();
    let settings = cfg.source_settings(&descriptor.slug);

    info!(date = %run.date_accessed, force = run.force, "run starting");

    let metrics = Arc::new(MetricsCollector::new(
        &run.run_id,
        &descriptor.name,
        adapter.pipeline_type(),
    ));
    let ledger: Arc<CrawlLedger> = Arc::new(
        CrawlLedger::open(&cfg.data.ledger_path, settings.max_attempts)
            .map_err(|e| IngestError::Fatal(format!("cannot open crawl ledger: {e}")))?,
    );

    let mut writer = SilverWriter::new(&cfg.data.silver_dir, &descriptor, &run, SCHEMA_VERSION)?;
    let snapshot_path = cfg
        .data
        .dedup_dir
        .join(format!("{}.snapshot", descriptor.slug));
    let mut dedup = DedupEngine::with_snapshot(&cfg.quality, &snapshot_path);

    let cleaner = build_cleaner(adapter.clean_profile());
    let filters = build_filter_chain(adapter.filter_profile(), &cfg);
    let builder = RecordBuilder::new(descriptor.clone(), run.date_accessed);

    let ctx = ExtractCtx {
        source: descriptor.name.clone(),
        ledger: ledger.clone() as Arc<dyn Ledger>,
        metrics: metrics.clone(),
        force: run.force,
        max_items: max_items_override.or(settings.max_items),
        max_attempts: settings.max_attempts,
        retry_base: Duration::from_secs(1),
    };

    let (tx, mut rx) = mpsc::channel(cfg.pipeline.channel_capacity);
    let extract_cancel = cancel.child_token();
    let extract_ctx = ctx.clone();
    let extract_handle =
        tokio::spawn(async move { adapter.extract(tx, extract_ctx, extract_cancel).await });

    let mut state = ConsumeState {
        buffer: Vec::new(),
        buffered_bytes: 0,
        written_ids: HashSet::new(),
        records_written: 0,
        consecutive_flush_failures: 0,
        fatal: None,
    };

    while let Some(msg) = rx.recv().await {
        match msg {
            ExtractMsg::Record(raw) => {
                metrics.increment("records_extracted", 1);
                process_record(
                    raw, &cleaner, &filters, &mut dedup, &builder, &ledger, &metrics, &mut state,
                );
                if state.buffer.len() >= cfg.pipeline.batch_size
                    || state.buffered_bytes >= cfg.pipeline.buffer_soft_cap_bytes
                {
                    flush(&cfg.pipeline, &mut writer, &metrics, &mut state);
                }
                if state.fatal.is_some() {
                    cancel.cancel();
                    break;
                }
            }
            ExtractMsg::Eos => break,
        }
    }
    // drain whatever the extract stage still delivered before stopping
    while let Ok(msg) = rx.try_recv() {
        if let ExtractMsg::Record(raw) = msg {
            metrics.increment("records_extracted", 1);
            process_record(
                raw, &cleaner, &filters, &mut dedup, &builder, &ledger, &metrics, &mut state,
            );
        }
    }
    flush(&cfg.pipeline, &mut writer, &metrics, &mut state);

    match extract_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(error = %e, "adapter extract stage failed");
            metrics.increment("fatal_errors", 1);
            if state.fatal.is_none() {
                state.fatal = Some(e.to_string());
            }
        }
        Err(e) => {
            error!(error = %e, "adapter task panicked");
            metrics.increment("fatal_errors", 1);
            if state.fatal.is_none() {
                state.fatal = Some(format!("adapter task panicked: {e}"));
            }
        }
    }

    if let Err(e) = dedup.save() {
        warn!(error = %e, "dedup snapshot not saved");
    }
    metrics.set_gauge("dedup_exact_hashes", dedup.exact_len() as f64);
    metrics.set_gauge("dedup_index_size", dedup.index_len() as f64);

    let (manifest, partition_dir) = writer.finalize()?;
    let canceled = cancel.is_cancelled() && state.fatal.is_none();
    if canceled {
        metrics.increment("canceled", 1);
    }

    let summary = metrics.finalize();
    emit_reports(&cfg.data, &summary)?;

    info!(
        records = state.records_written,
        total = manifest.total_records,
        health = summary.health.as_str(),
        "run finished"
    );

    Ok(RunOutcome {
        run_id: run.run_id,
        partition_dir,
        summary,
        records_written: state.records_written,
        canceled,
        fatal: state.fatal,
    })
}

struct ConsumeState {
    buffer: Vec<SilverRecord>,
    buffered_bytes: usize,
    written_ids: HashSet<String>,
    records_written: u64,
    consecutive_flush_failures: u32,
    fatal: Option<String>,
}

#[allow(clippy::too_many_arguments)]
fn process_record(
    raw: RawRecord,
    cleaner: &TextCleaner,
    filters: &FilterEngine,
    dedup: &mut DedupEngine,
    builder: &RecordBuilder,
    ledger: &Arc<CrawlLedger>,
    metrics: &Arc<MetricsCollector>,
    state: &mut ConsumeState,
) {
    let source = &builder.descriptor().name;
    let cleaned = cleaner.apply(&raw.text);
    metrics.observe("text_length", cleaned.chars().count() as f64);

    let mut metadata: Map<String, Value> = raw.source_metadata.clone();
    if let Some(url) = &raw.source_url {
        metadata.insert("url".into(), Value::String(url.clone()));
    }

    // filters run before dedup; a record failing both is charged to the
    // filter
    if let FilterVerdict::RejectedBy(name) = filters.evaluate(&cleaned, &mut metadata) {
        metrics.increment(&format!("filtered_by_{name}"), 1);
        metrics.increment("records_filtered", 1);
        if let Some(url) = &raw.source_url {
            // attempted but produced nothing: processed with no silver id
            let hash = RecordBuilder::text_hash(&cleaned);
            if let Err(e) = ledger.mark_processed(source, url, &hash, None) {
                warn!(url, error = %e, "ledger transition failed");
            }
            metrics.increment("urls_processed", 1);
        }
        return;
    }

    match dedup.check_and_insert(&cleaned) {
        DedupVerdict::ExactDuplicate => {
            metrics.increment("exact_duplicates", 1);
            if let Some(url) = &raw.source_url {
                if let Err(e) = ledger.mark_duplicate(source, url) {
                    warn!(url, error = %e, "ledger transition failed");
                }
            }
            return;
        }
        DedupVerdict::NearDuplicate { similarity } => {
            metrics.increment("near_duplicates", 1);
            let mut fields = Map::new();
            fields.insert("similarity".into(), Value::from(similarity));
            if let Some(url) = &raw.source_url {
                fields.insert("url".into(), Value::String(url.clone()));
                if let Err(e) = ledger.mark_duplicate(source, url) {
                    warn!(url, error = %e, "ledger transition failed");
                }
            }
            metrics.record_event("near_duplicate", fields);
            return;
        }
        DedupVerdict::Unique => {}
    }

    let record = builder.build(cleaned, metadata);
    if !state.written_ids.insert(record.id.clone()) {
        // same id within one run means same content; first seen wins
        metrics.increment("exact_duplicates", 1);
        if let Some(url) = &raw.source_url {
            if let Err(e) = ledger.mark_duplicate(source, url) {
                warn!(url, error = %e, "ledger transition failed");
            }
        }
        return;
    }

    if let Some(url) = &raw.source_url {
        let hash = RecordBuilder::text_hash(&record.text);
        if let Err(e) = ledger.mark_processed(source, url, &hash, Some(&record.id)) {
            warn!(url, error = %e, "ledger transition failed");
        }
        metrics.increment("urls_processed", 1);
    }

    state.buffered_bytes += estimate_bytes(&record);
    state.buffer.push(record);
}

/// Flush the buffer as one part file. A failed flush drops the batch and
/// trips the consecutive-failure fuse.
fn flush(
    pipeline_cfg: &PipelineConfig,
    writer: &mut SilverWriter,
    metrics: &Arc<MetricsCollector>,
    state: &mut ConsumeState,
) {
    if state.buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(&mut state.buffer);
    state.buffered_bytes = 0;
    match writer.write_batch(&batch) {
        Ok(_) => {
            state.records_written += batch.len() as u64;
            metrics.increment("records_written", batch.len() as u64);
            state.consecutive_flush_failures = 0;
        }
        Err(e) => {
            error!(error = %e, dropped = batch.len(), "flush failed");
            metrics.increment("flush_failures", 1);
            if matches!(e, IngestError::SchemaViolation { .. }) {
                metrics.increment("schema_violations", 1);
            }
            state.consecutive_flush_failures += 1;
            if state.consecutive_flush_failures > pipeline_cfg.max_consecutive_flush_failures {
                metrics.increment("fatal_errors", 1);
                state.fatal = Some(format!("repeated writer failures: {e}"));
            }
        }
    }
}

fn emit_reports(data_cfg: &DataConfig, summary: &RunSummary) -> Result<(), IngestError> {
    let write = |dir: &std::path::Path, name: String, body: String| -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(name), body)?;
        Ok(())
    };
    let json = QualityReporter::render_json(summary)
        .map_err(|e| IngestError::Fatal(format!("render metrics: {e}")))?;
    write(
        &data_cfg.metrics_dir,
        format!("{}_ingest.json", summary.snapshot.run_id),
        json,
    )
    .map_err(|e| IngestError::Fatal(format!("write metrics document: {e}")))?;
    write(
        &data_cfg.reports_dir,
        format!("{}_ingest_quality_report.md", summary.snapshot.run_id),
        QualityReporter::render_markdown(summary),
    )
    .map_err(|e| IngestError::Fatal(format!("write quality report: {e}")))?;
    Ok(())
}

/// Rough serialized size of one record, for the memory soft cap.
fn estimate_bytes(record: &SilverRecord) -> usize {
    record.text.len()
        + record.id.len()
        + Value::Object(record.metadata.clone()).to_string().len()
        + 96
}

fn build_cleaner(profile: CleanProfile) -> TextCleaner {
    match profile {
        CleanProfile::Plain => TextCleaner::plain(),
        CleanProfile::Html => TextCleaner::for_html(),
        CleanProfile::MediaWiki => TextCleaner::for_wiki(),
    }
}

fn build_filter_chain(profile: FilterProfile, cfg: &AppConfig) -> FilterEngine {
    let mut engine = FilterEngine::new();
    if profile == FilterProfile::Social {
        engine = engine.with_filter(EmojiOnlyFilter);
    }
    if profile == FilterProfile::MediaWiki {
        engine = engine.with_filter(NamespaceFilter::mediawiki_default());
    }
    engine
        .with_filter(MinLengthFilter {
            threshold: cfg.quality.min_length,
        })
        .with_filter(LangIdFilter::somali(cfg.quality.langid_confidence))
        .with_filter(TopicLexiconFilter::new(default_topic_ruleset(), true))
}
