//! Silver partition validation: schema, manifest integrity and record
//! invariants, re-read from disk.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, Int32Array, StringArray};
use datafusion::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::info;
use unicode_normalization::UnicodeNormalization;

use soma_core::{RecordBuilder, SCHEMA_VERSION};
use soma_io::manifest::Manifest;
use soma_io::sink_silver::silver_schema;

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub manifests_checked: usize,
    pub files_checked: usize,
    pub records_checked: u64,
    pub problems: Vec<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Validate one partition directory: every manifest sidecar's checksums,
/// every part file's schema, and the per-record invariants (unique
/// well-formed ids, trimmed NFC text, token counts).
pub fn validate_partition(dir: &Path) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut manifest_files: Vec<String> = Vec::new();
    let mut parquet_files: Vec<String> = Vec::new();

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("read partition dir {}", dir.display()))?
    {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.ends_with("_silver_metadata.json") {
            manifest_files.push(name);
        } else if name.ends_with(".parquet") {
            parquet_files.push(name);
        }
    }
    manifest_files.sort();
    parquet_files.sort();

    if manifest_files.is_empty() {
        report.problems.push("no manifest sidecar found".to_string());
    }

    let mut referenced: HashSet<String> = HashSet::new();
    for name in &manifest_files {
        report.manifests_checked += 1;
        let manifest = match Manifest::load(&dir.join(name)) {
            Ok(m) => m,
            Err(e) => {
                report.problems.push(format!("{name}: unreadable ({e})"));
                continue;
            }
        };
        if manifest.schema_version != SCHEMA_VERSION {
            report.problems.push(format!(
                "{name}: schema version {} != {SCHEMA_VERSION}",
                manifest.schema_version
            ));
        }
        report.problems.extend(manifest.verify(dir)?);
        referenced.extend(manifest.partitions.iter().map(|p| p.file_name.clone()));

        let declared: u64 = manifest.partitions.iter().map(|p| p.record_count).sum();
        if declared != manifest.total_records {
            report.problems.push(format!(
                "{name}: total_records {} != sum of parts {declared}",
                manifest.total_records
            ));
        }
    }

    for name in &parquet_files {
        if !referenced.contains(name) {
            report
                .problems
                .push(format!("{name}: not referenced by any manifest"));
        }
    }

    let expected_schema = silver_schema();
    let mut seen_ids: HashSet<String> = HashSet::new();
    for name in &parquet_files {
        report.files_checked += 1;
        let file = std::fs::File::open(dir.join(name))?;
        let reader = match ParquetRecordBatchReaderBuilder::try_new(file) {
            Ok(builder) => {
                if builder.schema().fields() != expected_schema.fields() {
                    report
                        .problems
                        .push(format!("{name}: schema does not match silver 2.1"));
                    continue;
                }
                builder.build()?
            }
            Err(e) => {
                report.problems.push(format!("{name}: unreadable ({e})"));
                continue;
            }
        };

        for batch in reader {
            let batch = batch?;
            let ids = column_str(&batch, 0);
            let texts = column_str(&batch, 1);
            let sources = column_str(&batch, 2);
            let token_counts = batch
                .column(7)
                .as_any()
                .downcast_ref::<Int32Array>()
                .context("token_count column type")?;

            for row in 0..batch.num_rows() {
                report.records_checked += 1;
                let id = ids.value(row);
                let text = texts.value(row);
                let source = sources.value(row);

                if !seen_ids.insert(id.to_string()) {
                    report.problems.push(format!("{name}: duplicate id {id}"));
                }
                if id != RecordBuilder::record_id(text, source) {
                    report
                        .problems
                        .push(format!("{name}: id {id} does not match its text hash"));
                }
                if text.trim() != text {
                    report
                        .problems
                        .push(format!("{name}: id {id} has untrimmed text"));
                }
                if text.nfc().collect::<String>() != text {
                    report
                        .problems
                        .push(format!("{name}: id {id} text is not NFC"));
                }
                if token_counts.value(row) as i64 != RecordBuilder::token_count(text) {
                    report
                        .problems
                        .push(format!("{name}: id {id} token_count mismatch"));
                }
            }
        }
    }

    info!(
        manifests = report.manifests_checked,
        files = report.files_checked,
        records = report.records_checked,
        problems = report.problems.len(),
        "partition validated"
    );
    Ok(report)
}

fn column_str<'a>(
    batch: &'a datafusion::arrow::array::RecordBatch,
    index: usize,
) -> &'a StringArray {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("schema was checked before reading")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::{Map, Value};
    use soma_core::{Register, RunContext, SourceDescriptor, SourceType};
    use soma_io::sink_silver::SilverWriter;

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor {
            name: "Wikipedia-Somali".into(),
            slug: "wikipedia-somali".into(),
            source_type: SourceType::Encyclopedia,
            license: "CC-BY-SA-4.0".into(),
            register: Register::Formal,
            domain: "so.wikipedia.org".into(),
        }
    }

    fn write_partition(root: &Path) -> std::path::PathBuf {
        let run = RunContext::new(
            "wikipedia-somali",
            NaiveDate::from_ymd_opt(2026, 8, 1),
            false,
        );
        let builder = RecordBuilder::new(descriptor(), run.date_accessed);
        let mut writer = SilverWriter::new(root, &descriptor(), &run, SCHEMA_VERSION).unwrap();
        let mut meta = Map::new();
        meta.insert("title".into(), Value::String("Soomaaliya".into()));
        writer
            .write_batch(&[
                builder.build("Soomaaliya waa waddan ku yaal Geeska Afrika.".into(), meta),
                builder.build("Muqdisho waa caasimadda Soomaaliya.".into(), Map::new()),
            ])
            .unwrap();
        let (_, dir) = writer.finalize().unwrap();
        dir
    }

    #[test]
    fn freshly_written_partition_passes() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_partition(root.path());
        let report = validate_partition(&dir).unwrap();
        assert!(report.passed(), "problems: {:?}", report.problems);
        assert_eq!(report.files_checked, 1);
        assert_eq!(report.records_checked, 2);
    }

    #[test]
    fn tampered_part_file_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let dir = write_partition(root.path());
        let part = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "parquet"))
            .unwrap();
        std::fs::write(&part, b"garbage").unwrap();
        let report = validate_partition(&dir).unwrap();
        assert!(!report.passed());
        assert!(report
            .problems
            .iter()
            .any(|p| p.contains("checksum mismatch")));
    }

    #[test]
    fn empty_directory_reports_missing_manifest() {
        let root = tempfile::tempdir().unwrap();
        let report = validate_partition(root.path()).unwrap();
        assert!(!report.passed());
    }
}
