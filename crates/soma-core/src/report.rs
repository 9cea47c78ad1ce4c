//! Quality report rendering.
//!
//! Turns a finalized [`RunSummary`] into the per-run markdown report and the
//! JSON metrics document. The markdown is written for a human reviewing the
//! crawl the next morning: header, executive summary, processing statistics,
//! latency percentiles, HTTP status distribution, dedup counts, text-length
//! distribution, and recommendations keyed to detected anomalies.

use std::fmt::Write as _;

use crate::metrics::{HealthStatus, PipelineType, RunSummary};

pub struct QualityReporter;

impl QualityReporter {
    /// JSON metrics document for `data/metrics/<run_id>_<phase>.json`.
    pub fn render_json(summary: &RunSummary) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(summary)?)
    }

    /// Markdown report for `data/reports/<run_id>_<phase>_quality_report.md`.
    pub fn render_markdown(summary: &RunSummary) -> String {
        let snap = &summary.snapshot;
        let mut out = String::new();

        let _ = writeln!(out, "# Quality Report: {}", snap.source);
        let _ = writeln!(out);
        let _ = writeln!(out, "- **Run**: `{}`", snap.run_id);
        let _ = writeln!(out, "- **Pipeline type**: {}", snap.pipeline_type.as_str());
        let _ = writeln!(out, "- **Started**: {}", snap.started_at.to_rfc3339());
        let _ = writeln!(out, "- **Finished**: {}", snap.finished_at.to_rfc3339());
        let _ = writeln!(out, "- **Duration**: {:.1}s", snap.duration_secs);
        let _ = writeln!(out, "- **Health**: **{}**", summary.health.as_str());
        let _ = writeln!(out);

        let _ = writeln!(out, "## Executive summary");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} records written from {} extracted ({} discovered units).",
            counter(summary, "records_written"),
            counter(summary, "records_extracted"),
            discovered(summary),
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "| Rate | Value |");
        let _ = writeln!(out, "|---|---|");
        for (name, value) in &summary.rates {
            let _ = writeln!(out, "| {} | {:.1}% |", name, value * 100.0);
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "## Processing statistics");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Counter | Value |");
        let _ = writeln!(out, "|---|---|");
        for (name, value) in &snap.counters {
            if !name.starts_with("http_status_") {
                let _ = writeln!(out, "| {name} | {value} |");
            }
        }
        let _ = writeln!(out);

        let durations: Vec<&str> = snap
            .histograms
            .keys()
            .filter(|k| k.ends_with("_duration_secs"))
            .map(String::as_str)
            .collect();
        if !durations.is_empty() {
            let _ = writeln!(out, "## Performance percentiles");
            let _ = writeln!(out);
            let _ = writeln!(out, "| Histogram | n | mean | median | p95 | p99 | min | max |");
            let _ = writeln!(out, "|---|---|---|---|---|---|---|---|");
            for name in durations {
                let h = &snap.histograms[name];
                let _ = writeln!(
                    out,
                    "| {} | {} | {:.3}s | {:.3}s | {:.3}s | {:.3}s | {:.3}s | {:.3}s |",
                    name, h.count, h.mean, h.median, h.p95, h.p99, h.min, h.max
                );
            }
            let _ = writeln!(out);
        }

        let statuses: Vec<(&String, &u64)> = snap
            .counters
            .iter()
            .filter(|(k, _)| k.starts_with("http_status_"))
            .collect();
        if !statuses.is_empty() {
            let _ = writeln!(out, "## HTTP status distribution");
            let _ = writeln!(out);
            let _ = writeln!(out, "| Status | Count |");
            let _ = writeln!(out, "|---|---|");
            for (name, value) in statuses {
                let _ = writeln!(out, "| {} | {} |", name.trim_start_matches("http_status_"), value);
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "## Deduplication");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Kind | Count |");
        let _ = writeln!(out, "|---|---|");
        let _ = writeln!(out, "| skipped at discovery | {} |", counter(summary, "skipped_discovery_dedup"));
        let _ = writeln!(out, "| exact duplicates | {} |", counter(summary, "exact_duplicates"));
        let _ = writeln!(out, "| near duplicates | {} |", counter(summary, "near_duplicates"));
        let _ = writeln!(out);

        if let Some(h) = snap.histograms.get("text_length") {
            let _ = writeln!(out, "## Text length distribution");
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "{} texts, mean {:.0} chars, median {:.0}, p95 {:.0}, range {:.0}–{:.0}.",
                h.count, h.mean, h.median, h.p95, h.min, h.max
            );
            let _ = writeln!(out);
        }

        let recommendations = Self::recommendations(summary);
        let _ = writeln!(out, "## Recommendations");
        let _ = writeln!(out);
        if recommendations.is_empty() {
            let _ = writeln!(out, "No anomalies detected.");
        } else {
            for r in recommendations {
                let _ = writeln!(out, "- {r}");
            }
        }

        out
    }

    /// Rule-based recommendations keyed to detected anomalies.
    fn recommendations(summary: &RunSummary) -> Vec<String> {
        let snap = &summary.snapshot;
        let mut out = Vec::new();

        if let Some(h) = snap.histograms.get("fetch_duration_secs") {
            if h.p95 > 10.0 {
                out.push(format!(
                    "Fetches are slow (p95 {:.1}s); consider connection pooling or lowering per-request delay bounds.",
                    h.p95
                ));
            }
        }
        if let Some(rate) = summary.rates.get("quality_filter_pass_rate") {
            if *rate < 0.5 && counter(summary, "records_extracted") > 0 {
                out.push(
                    "Low quality filter pass rate; review filter configurations and thresholds."
                        .to_string(),
                );
            }
        }
        let written = counter(summary, "records_written");
        let dup = counter(summary, "exact_duplicates") + counter(summary, "near_duplicates");
        if dup > 0 && dup >= written {
            out.push(
                "Duplicates outnumber new records; the source may be exhausted for this configuration."
                    .to_string(),
            );
        }
        if counter(summary, "records_extracted") == 0 && discovered(summary) > 0 {
            out.push(
                "Units were discovered but nothing was extracted; check selectors, parsers and credentials."
                    .to_string(),
            );
        }
        if counter(summary, "urls_failed") > 0
            && summary.rates.get("http_success").copied().unwrap_or(1.0) < 0.95
        {
            out.push(
                "Elevated fetch failure rate; inspect the HTTP status distribution and retry budget."
                    .to_string(),
            );
        }
        if summary.health == HealthStatus::Unhealthy
            && snap.pipeline_type == PipelineType::StreamProcessing
        {
            out.push("Stream never connected; verify dataset id and API availability.".to_string());
        }

        out
    }
}

fn counter(summary: &RunSummary, name: &str) -> u64 {
    summary.snapshot.counters.get(name).copied().unwrap_or(0)
}

fn discovered(summary: &RunSummary) -> u64 {
    counter(summary, "urls_discovered")
        + counter(summary, "files_discovered")
        + counter(summary, "records_requested")
}
