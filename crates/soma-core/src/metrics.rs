//! Run-scoped metrics collection.
//!
//! One [`MetricsCollector`] is instantiated per `(run_id, source)` and shared
//! across the extract stage and the orchestrator. Increments are
//! lock-protected so a bounded worker pool inside an adapter can record
//! outcomes concurrently. At finalization the collector computes
//! pipeline-type-aware success rates and a health classification; rendering
//! is left to the quality reporter.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Shape of the pipeline, selecting which success-rate formulas apply.
///
/// A single formula historically misreported non-URL pipelines as unhealthy;
/// the split below keeps each adapter family honest about what "success"
/// means for its I/O model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    WebScraping,
    FileProcessing,
    StreamProcessing,
}

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::WebScraping => "web_scraping",
            PipelineType::FileProcessing => "file_processing",
            PipelineType::StreamProcessing => "stream_processing",
        }
    }
}

/// Overall health verdict for a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Timestamped structured event, kept verbatim in the metrics document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub name: String,
    pub at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

/// Summary statistics over one histogram's observations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

/// Serializable snapshot of everything a run recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub run_id: String,
    pub source: String,
    pub pipeline_type: PipelineType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
    pub events: Vec<MetricEvent>,
}

/// Finalized run metrics: the raw snapshot plus derived rates and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub snapshot: MetricsSnapshot,
    pub rates: BTreeMap<String, f64>,
    pub health: HealthStatus,
}

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Vec<f64>>,
    events: Vec<MetricEvent>,
}

pub struct MetricsCollector {
    run_id: String,
    source: String,
    pipeline_type: PipelineType,
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new(run_id: &str, source: &str, pipeline_type: PipelineType) -> Self {
        Self {
            run_id: run_id.to_string(),
            source: source.to_string(),
            pipeline_type,
            started_at: Utc::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn increment(&self, counter: &str, n: u64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        *inner.counters.entry(counter.to_string()).or_insert(0) += n;
    }

    /// Counter for one observed HTTP status, e.g. `http_status_200`.
    pub fn increment_http_status(&self, status: u16) {
        self.increment(&format!("http_status_{status}"), 1);
    }

    pub fn observe(&self, histogram: &str, value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner
            .histograms
            .entry(histogram.to_string())
            .or_default()
            .push(value);
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn record_event(&self, name: &str, fields: Map<String, Value>) {
        let mut inner = self.inner.lock().expect("metrics lock");
        inner.events.push(MetricEvent {
            name: name.to_string(),
            at: Utc::now(),
            fields,
        });
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("metrics lock");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    fn has_counter(&self, name: &str) -> bool {
        let inner = self.inner.lock().expect("metrics lock");
        inner.counters.contains_key(name)
    }

    /// Freeze the collected state into a serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished_at = Utc::now();
        let inner = self.inner.lock().expect("metrics lock");
        let histograms = inner
            .histograms
            .iter()
            .map(|(name, values)| (name.clone(), summarize(values)))
            .collect();
        MetricsSnapshot {
            run_id: self.run_id.clone(),
            source: self.source.clone(),
            pipeline_type: self.pipeline_type,
            started_at: self.started_at,
            finished_at,
            duration_secs: (finished_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms,
            events: inner.events.clone(),
        }
    }

    /// Compute derived rates and health, consuming nothing: the collector
    /// stays usable for late increments, which will not be reflected in the
    /// returned summary.
    pub fn finalize(&self) -> RunSummary {
        let mut rates = BTreeMap::new();
        let written = self.counter("records_written");
        let extracted = self.counter("records_extracted");

        match self.pipeline_type {
            PipelineType::WebScraping => {
                let fetched = self.counter("urls_fetched");
                let failed = self.counter("urls_failed");
                let processed = self.counter("urls_processed");
                rates.insert(
                    "http_success".to_string(),
                    rate(fetched.saturating_sub(failed), fetched, written > 0),
                );
                rates.insert(
                    "extraction_success".to_string(),
                    rate(processed, fetched, written > 0),
                );
            }
            PipelineType::FileProcessing => {
                let discovered = self.counter("files_discovered");
                let processed = self.counter("files_processed");
                rates.insert(
                    "file_extraction_success".to_string(),
                    rate(processed, discovered, extracted > 0),
                );
                let parsing = if self.has_counter("records_attempted") {
                    rate(extracted, self.counter("records_attempted"), extracted > 0)
                } else if extracted > 0 {
                    1.0
                } else {
                    0.0
                };
                rates.insert("record_parsing_success".to_string(), parsing);
            }
            PipelineType::StreamProcessing => {
                let opened = self.counter("datasets_opened");
                rates.insert(
                    "stream_connection_success".to_string(),
                    if opened > 0 { 1.0 } else { 0.0 },
                );
                let fetched_ok = self.counter("records_fetched_ok");
                let retrieval = if self.has_counter("records_requested") {
                    rate(fetched_ok, self.counter("records_requested"), fetched_ok > 0)
                } else if fetched_ok > 0 {
                    1.0
                } else {
                    0.0
                };
                rates.insert("record_retrieval_success".to_string(), retrieval);
            }
        }

        // 1.0 when nothing was extracted and nothing was expected; units
        // skipped at discovery (already ingested in a prior run) are not
        // expected to produce anything.
        let expected = (self.counter("urls_discovered")
            + self.counter("files_discovered")
            + self.counter("records_requested"))
        .saturating_sub(self.counter("skipped_discovery_dedup"));
        rates.insert(
            "quality_filter_pass_rate".to_string(),
            if extracted > 0 {
                clamp01(written as f64 / extracted as f64)
            } else if written > 0 || expected == 0 {
                1.0
            } else {
                0.0
            },
        );

        let health = self.classify(&rates);
        RunSummary {
            snapshot: self.snapshot(),
            rates,
            health,
        }
    }

    fn classify(&self, rates: &BTreeMap<String, f64>) -> HealthStatus {
        if self.pipeline_type == PipelineType::StreamProcessing
            && rates.get("stream_connection_success") == Some(&0.0)
        {
            return HealthStatus::Unhealthy;
        }
        if rates.values().any(|r| *r < 0.5) {
            return HealthStatus::Unhealthy;
        }
        if rates.values().any(|r| *r < 0.95) {
            return HealthStatus::Degraded;
        }
        if self.counter("fatal_errors") > 0 {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Ratio with the zero-denominator convention of the reporting contract:
/// produced output counts as success, silence counts as failure.
fn rate(num: u64, den: u64, produced: bool) -> f64 {
    if den > 0 {
        clamp01(num as f64 / den as f64)
    } else if produced || num > 0 {
        1.0
    } else {
        0.0
    }
}

/// Interpolated percentile over an unsorted sample.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("non-NaN observation"));
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }
}

fn summarize(values: &[f64]) -> HistogramSummary {
    if values.is_empty() {
        return HistogramSummary {
            count: 0,
            mean: 0.0,
            median: 0.0,
            p95: 0.0,
            p99: 0.0,
            min: 0.0,
            max: 0.0,
        };
    }
    let sum: f64 = values.iter().sum();
    HistogramSummary {
        count: values.len(),
        mean: sum / values.len() as f64,
        median: percentile(values, 50.0),
        p95: percentile(values, 95.0),
        p99: percentile(values, 99.0),
        min: values.iter().cloned().fold(f64::INFINITY, f64::min),
        max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn web_scraping_rates() {
        let m = MetricsCollector::new("run", "BBC-Somali", PipelineType::WebScraping);
        m.increment("urls_fetched", 10);
        m.increment("urls_failed", 1);
        m.increment("urls_processed", 9);
        m.increment("records_extracted", 9);
        m.increment("records_written", 9);
        let summary = m.finalize();
        assert_eq!(summary.rates["http_success"], 0.9);
        assert_eq!(summary.rates["extraction_success"], 0.9);
        assert_eq!(summary.rates["quality_filter_pass_rate"], 1.0);
        assert_eq!(summary.health, HealthStatus::Degraded);
    }

    #[test]
    fn file_processing_without_attempted_counter() {
        let m = MetricsCollector::new("run", "Wikipedia-Somali", PipelineType::FileProcessing);
        m.increment("files_discovered", 1);
        m.increment("files_processed", 1);
        m.increment("records_extracted", 100);
        m.increment("records_written", 97);
        let summary = m.finalize();
        assert_eq!(summary.rates["file_extraction_success"], 1.0);
        assert_eq!(summary.rates["record_parsing_success"], 1.0);
        assert_eq!(summary.rates["quality_filter_pass_rate"], 0.97);
        assert_eq!(summary.health, HealthStatus::Healthy);
    }

    #[test]
    fn stream_connection_failure_is_unhealthy() {
        let m = MetricsCollector::new("run", "TikTok", PipelineType::StreamProcessing);
        m.increment("records_requested", 10);
        let summary = m.finalize();
        assert_eq!(summary.rates["stream_connection_success"], 0.0);
        assert_eq!(summary.health, HealthStatus::Unhealthy);
    }

    #[test]
    fn zero_denominator_with_output_counts_as_success() {
        let m = MetricsCollector::new("run", "HuggingFace-Somali", PipelineType::StreamProcessing);
        m.increment("datasets_opened", 1);
        m.increment("records_fetched_ok", 5);
        m.increment("records_extracted", 5);
        m.increment("records_written", 5);
        let summary = m.finalize();
        assert_eq!(summary.rates["record_retrieval_success"], 1.0);
        assert_eq!(summary.health, HealthStatus::Healthy);
    }

    #[test]
    fn idle_run_reports_pass_rate_one() {
        let m = MetricsCollector::new("run", "BBC-Somali", PipelineType::WebScraping);
        let summary = m.finalize();
        assert_eq!(summary.rates["quality_filter_pass_rate"], 1.0);
    }

    #[test]
    fn percentiles_interpolate() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 50.0), 50.5);
        assert!((percentile(&values, 95.0) - 95.05).abs() < 1e-9);
        assert_eq!(percentile(&values, 100.0), 100.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn events_and_gauges_survive_snapshot() {
        let m = MetricsCollector::new("run", "BBC-Somali", PipelineType::WebScraping);
        m.set_gauge("dedup_index_size", 42.0);
        let mut fields = Map::new();
        fields.insert("url".into(), Value::String("https://bbc.com/somali/1".into()));
        m.record_event("robots_disallowed", fields);
        m.increment_http_status(200);
        let snap = m.snapshot();
        assert_eq!(snap.gauges["dedup_index_size"], 42.0);
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.counters["http_status_200"], 1);
    }
}
