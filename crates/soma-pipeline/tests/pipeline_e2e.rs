//! End-to-end pipeline scenarios over an in-memory source adapter.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use soma_core::{
    AcquireOutcome, AppConfig, ExtractCtx, PipelineType, RawRecord, RecordBuilder, Register,
    RunContext, SourceAdapter, SourceDescriptor, SourceType, WorkUnit,
};
use soma_io::ledger::{CrawlLedger, LedgerState};
use soma_pipeline::{validate::validate_partition, IngestPipeline};
use soma_tx::dedup::{jaccard, shingle_set};

/// Serves a fixed URL->text map through the standard adapter contract.
struct FixtureAdapter {
    descriptor: SourceDescriptor,
    items: BTreeMap<String, String>,
}

impl FixtureAdapter {
    fn new(items: &[(&str, &str)]) -> Self {
        Self {
            descriptor: SourceDescriptor {
                name: "Wikipedia-Somali".to_string(),
                slug: "wikipedia-somali".to_string(),
                source_type: SourceType::Encyclopedia,
                license: "CC-BY-SA-4.0".to_string(),
                register: Register::Formal,
                domain: "so.wikipedia.org".to_string(),
            },
            items: items
                .iter()
                .map(|(url, text)| (url.to_string(), text.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn pipeline_type(&self) -> PipelineType {
        PipelineType::WebScraping
    }

    async fn discover(&mut self, _ctx: &ExtractCtx) -> Result<Vec<WorkUnit>> {
        Ok(self
            .items
            .keys()
            .map(|url| WorkUnit::from_url(url.clone()))
            .collect())
    }

    async fn acquire(&mut self, unit: &WorkUnit, _ctx: &ExtractCtx) -> AcquireOutcome {
        match self.items.get(&unit.id) {
            Some(text) => AcquireOutcome::Fetched {
                record: RawRecord::new(text.clone()),
                http_status: Some(200),
                content_length: Some(text.len() as u64),
            },
            None => AcquireOutcome::NotFound,
        }
    }
}

fn test_config(root: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.data.raw_dir = root.join("raw");
    cfg.data.staging_dir = root.join("staging");
    cfg.data.silver_dir = root.join("silver");
    cfg.data.ledger_path = root.join("ledger/crawl_ledger.sqlite");
    cfg.data.dedup_dir = root.join("dedup");
    cfg.data.metrics_dir = root.join("metrics");
    cfg.data.reports_dir = root.join("reports");
    cfg.quality.min_length = 10;
    cfg
}

async fn run_once(
    cfg: &AppConfig,
    items: &[(&str, &str)],
    force: bool,
) -> soma_pipeline::RunOutcome {
    let run = RunContext::new(
        "wikipedia-somali",
        chrono::NaiveDate::from_ymd_opt(2026, 8, 1),
        force,
    );
    let adapter = Box::new(FixtureAdapter::new(items));
    IngestPipeline::new(cfg.clone(), adapter, run)
        .run(CancellationToken::new())
        .await
        .unwrap()
}

const SOMALI_URL: &str = "https://so.wikipedia.org/wiki/Soomaaliya";
const SOMALI_TEXT: &str = "Soomaaliya waa waddan.";

#[tokio::test]
async fn exact_duplicate_across_runs_writes_once() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let items = [(SOMALI_URL, SOMALI_TEXT)];

    // run 1 writes exactly one record with the deterministic id
    let outcome = run_once(&cfg, &items, false).await;
    assert_eq!(outcome.records_written, 1);
    assert_eq!(outcome.exit_code(), 0);

    let expected_id = RecordBuilder::record_id(SOMALI_TEXT, "Wikipedia-Somali");
    assert!(expected_id.starts_with("WIKI_"));
    assert_eq!(expected_id.len(), "WIKI_".len() + 16);

    let ledger = CrawlLedger::open(&cfg.data.ledger_path, 3).unwrap();
    let entry = ledger
        .entry("Wikipedia-Somali", SOMALI_URL)
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, LedgerState::Processed);
    assert_eq!(entry.silver_id.as_deref(), Some(expected_id.as_str()));
    assert_eq!(
        entry.text_hash.as_deref(),
        Some(RecordBuilder::text_hash(SOMALI_TEXT).as_str())
    );
    drop(ledger);

    let report = validate_partition(&outcome.partition_dir).unwrap();
    assert!(report.passed(), "problems: {:?}", report.problems);
    assert_eq!(report.records_checked, 1);

    // run 2 with identical config: zero new records, skip counted at
    // discovery, ledger unchanged
    let outcome2 = run_once(&cfg, &items, false).await;
    assert_eq!(outcome2.records_written, 0);
    assert_eq!(
        outcome2
            .summary
            .snapshot
            .counters
            .get("skipped_discovery_dedup"),
        Some(&1)
    );
    let ledger = CrawlLedger::open(&cfg.data.ledger_path, 3).unwrap();
    let entry = ledger
        .entry("Wikipedia-Somali", SOMALI_URL)
        .unwrap()
        .unwrap();
    assert_eq!(entry.state, LedgerState::Processed);
    assert_eq!(entry.silver_id.as_deref(), Some(expected_id.as_str()));
}

#[tokio::test]
async fn force_reprocesses_terminal_entries() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let items = [(SOMALI_URL, SOMALI_TEXT)];

    run_once(&cfg, &items, false).await;
    let outcome = run_once(&cfg, &items, true).await;
    // re-fetched, but the dedup snapshot still recognizes the content
    assert_eq!(outcome.records_written, 0);
    assert_eq!(
        outcome.summary.snapshot.counters.get("exact_duplicates"),
        Some(&1)
    );
}

#[tokio::test]
async fn english_text_is_rejected_by_langid_and_marked_processed() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let url = "https://so.wikipedia.org/wiki/English_test";
    let items = [(url, "The quick brown fox jumps over the lazy dog.")];

    let outcome = run_once(&cfg, &items, false).await;
    assert_eq!(outcome.records_written, 0);
    assert_eq!(
        outcome
            .summary
            .snapshot
            .counters
            .get("filtered_by_langid_filter"),
        Some(&1)
    );

    // rejection preserves the "tried" signal: processed with no silver id
    let ledger = CrawlLedger::open(&cfg.data.ledger_path, 3).unwrap();
    let entry = ledger.entry("Wikipedia-Somali", url).unwrap().unwrap();
    assert_eq!(entry.state, LedgerState::Processed);
    assert!(entry.silver_id.is_none());
}

#[tokio::test]
async fn near_duplicate_decision_matches_direct_jaccard() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let a = "Muqdisho waa caasimadda Soomaaliya.";
    let b = "Muqdisho waa caasimadda dalka Soomaaliya.";
    let items = [
        ("https://so.wikipedia.org/wiki/A", a),
        ("https://so.wikipedia.org/wiki/B", b),
    ];

    let outcome = run_once(&cfg, &items, false).await;
    let direct = jaccard(
        &shingle_set(a, cfg.quality.shingle_size),
        &shingle_set(b, cfg.quality.shingle_size),
    );
    let near_dups = outcome
        .summary
        .snapshot
        .counters
        .get("near_duplicates")
        .copied()
        .unwrap_or(0);
    if direct >= cfg.quality.similarity_threshold {
        assert_eq!(near_dups, 1);
        assert_eq!(outcome.records_written, 1);
    } else {
        assert_eq!(near_dups, 0);
        assert_eq!(outcome.records_written, 2);
    }
}

#[tokio::test]
async fn reports_and_metrics_are_emitted() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let outcome = run_once(&cfg, &[(SOMALI_URL, SOMALI_TEXT)], false).await;

    let metrics_path = cfg
        .data
        .metrics_dir
        .join(format!("{}_ingest.json", outcome.run_id));
    let report_path = cfg
        .data
        .reports_dir
        .join(format!("{}_ingest_quality_report.md", outcome.run_id));
    assert!(metrics_path.exists());
    assert!(report_path.exists());

    let report = std::fs::read_to_string(report_path).unwrap();
    assert!(report.contains("# Quality Report: Wikipedia-Somali"));
    assert!(report.contains(outcome.summary.health.as_str()));
}

#[tokio::test]
async fn canceled_run_flushes_partial_state() {
    let dir = TempDir::new().unwrap();
    let cfg = test_config(dir.path());
    let cancel = CancellationToken::new();
    cancel.cancel(); // canceled before dispatching any unit

    let run = RunContext::new(
        "wikipedia-somali",
        chrono::NaiveDate::from_ymd_opt(2026, 8, 1),
        false,
    );
    let adapter = Box::new(FixtureAdapter::new(&[(SOMALI_URL, SOMALI_TEXT)]));
    let outcome = IngestPipeline::new(cfg.clone(), adapter, run)
        .run(cancel)
        .await
        .unwrap();

    assert!(outcome.canceled);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.records_written, 0);
    // the quality report still names the run health
    assert!(cfg
        .data
        .reports_dir
        .join(format!("{}_ingest_quality_report.md", outcome.run_id))
        .exists());
}
