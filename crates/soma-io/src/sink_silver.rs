//! Schema-enforced batched silver writer.
//!
//! Accepts batches of canonical records, validates every field against the
//! frozen 2.1 schema, and writes snappy-compressed Parquet part files into
//! `source=<S>/date_accessed=<YYYY-MM-DD>/`. Files are written to a
//! `.tmp-<random>` name and renamed into place, so a reader never observes a
//! half-written part. Each flush extends the manifest sidecar.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use datafusion::arrow::array::{ArrayRef, Date32Array, Int32Array, RecordBatch, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::parquet::arrow::arrow_writer::ArrowWriter;
use datafusion::parquet::basic::Compression;
use datafusion::parquet::file::properties::WriterProperties;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use soma_core::{IngestError, RunContext, SilverRecord, SourceDescriptor, SCHEMA_VERSION};

use crate::manifest::{Manifest, PartitionFile};

/// Canonical column order of the silver layer, schema version 2.1.
pub fn silver_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("source", DataType::Utf8, false),
        Field::new("source_type", DataType::Utf8, false),
        Field::new("date_accessed", DataType::Date32, false),
        Field::new("language", DataType::Utf8, false),
        Field::new("license", DataType::Utf8, false),
        Field::new("token_count", DataType::Int32, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new("domain", DataType::Utf8, false),
        Field::new("embedding", DataType::Utf8, true),
        Field::new("register", DataType::Utf8, false),
    ]))
}

const SOURCE_TYPES: &[&str] = &["encyclopedia", "news", "web", "corpus", "social"];
const REGISTERS: &[&str] = &["formal", "informal", "colloquial"];

/// Dynamic row representation of one record, used for validation and by the
/// partition validator.
pub fn record_row(record: &SilverRecord) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("id".into(), Value::String(record.id.clone()));
    row.insert("text".into(), Value::String(record.text.clone()));
    row.insert("source".into(), Value::String(record.source.clone()));
    row.insert(
        "source_type".into(),
        Value::String(record.source_type.as_str().to_string()),
    );
    row.insert(
        "date_accessed".into(),
        Value::String(record.date_accessed.format("%Y-%m-%d").to_string()),
    );
    row.insert("language".into(), Value::String(record.language.clone()));
    row.insert("license".into(), Value::String(record.license.clone()));
    row.insert("token_count".into(), Value::from(record.token_count));
    row.insert("metadata".into(), Value::Object(record.metadata.clone()));
    row.insert("domain".into(), Value::String(record.domain.clone()));
    row.insert(
        "embedding".into(),
        record
            .embedding
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    row.insert(
        "register".into(),
        Value::String(record.register.as_str().to_string()),
    );
    row
}

fn violation(row: &Map<String, Value>, field: &str, message: &str) -> IngestError {
    let record_id = row
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<invalid>")
        .to_string();
    IngestError::SchemaViolation {
        field: field.to_string(),
        record_id,
        message: message.to_string(),
    }
}

fn require_string(row: &Map<String, Value>, field: &str) -> Result<(), IngestError> {
    match row.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(violation(row, field, "must not be empty")),
        Some(_) => Err(violation(row, field, "expected string")),
        None => Err(violation(row, field, "missing")),
    }
}

/// Validate one dynamic row against schema 2.1. Any type or null violation
/// fails with the offending field and record id.
pub fn validate_row(row: &Map<String, Value>) -> Result<(), IngestError> {
    for field in ["id", "text", "source", "language", "license", "domain"] {
        require_string(row, field)?;
    }

    match row.get("source_type").and_then(Value::as_str) {
        Some(v) if SOURCE_TYPES.contains(&v) => {}
        Some(v) => return Err(violation(row, "source_type", &format!("unknown value `{v}`"))),
        None => return Err(violation(row, "source_type", "expected string")),
    }
    match row.get("register").and_then(Value::as_str) {
        Some(v) if REGISTERS.contains(&v) => {}
        Some(v) => return Err(violation(row, "register", &format!("unknown value `{v}`"))),
        None => return Err(violation(row, "register", "expected string")),
    }

    match row.get("date_accessed").and_then(Value::as_str) {
        Some(v) if NaiveDate::parse_from_str(v, "%Y-%m-%d").is_ok() => {}
        Some(v) => {
            return Err(violation(
                row,
                "date_accessed",
                &format!("`{v}` is not a calendar date"),
            ))
        }
        None => return Err(violation(row, "date_accessed", "expected date string")),
    }

    match row.get("token_count") {
        Some(v) if v.is_i64() || v.is_u64() => {
            let n = v.as_i64().unwrap_or(i64::MAX);
            if n < 0 || n > i32::MAX as i64 {
                return Err(violation(row, "token_count", "out of 32-bit integer range"));
            }
        }
        Some(_) => return Err(violation(row, "token_count", "expected 32-bit integer")),
        None => return Err(violation(row, "token_count", "missing")),
    }

    match row.get("metadata") {
        Some(Value::Object(_)) => {}
        Some(_) => return Err(violation(row, "metadata", "expected JSON object")),
        None => return Err(violation(row, "metadata", "missing")),
    }

    match row.get("embedding") {
        Some(Value::Null) | Some(Value::String(_)) | None => {}
        Some(_) => return Err(violation(row, "embedding", "expected string or null")),
    }

    Ok(())
}

fn date32(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
    (date - epoch).num_days() as i32
}

#[derive(Debug)]
pub struct SilverWriter {
    partition_dir: PathBuf,
    slug: String,
    run_id: String,
    schema: SchemaRef,
    part_index: u32,
    manifest: Manifest,
}

impl SilverWriter {
    /// Acquire the partition directory for `(source, date_accessed)`. An
    /// unwritable silver root is fatal.
    pub fn new(
        silver_root: &Path,
        descriptor: &SourceDescriptor,
        run: &RunContext,
        schema_version: &str,
    ) -> Result<Self, IngestError> {
        if schema_version != SCHEMA_VERSION {
            return Err(IngestError::Fatal(format!(
                "silver writer speaks schema {SCHEMA_VERSION}, refusing records of schema {schema_version}"
            )));
        }
        let partition_dir = silver_root
            .join(format!("source={}", descriptor.name))
            .join(run.date_partition());
        std::fs::create_dir_all(&partition_dir).map_err(|e| {
            IngestError::Fatal(format!(
                "cannot create silver partition {}: {e}",
                partition_dir.display()
            ))
        })?;
        Ok(Self {
            partition_dir,
            slug: descriptor.slug.clone(),
            run_id: run.run_id.clone(),
            schema: silver_schema(),
            part_index: 0,
            manifest: Manifest::new(
                &run.run_id,
                &descriptor.name,
                schema_version,
                run.date_accessed,
            ),
        })
    }

    pub fn partition_dir(&self) -> &Path {
        &self.partition_dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Validate and flush one batch as the next part file. The batch is
    /// rejected atomically: on any violation no file is produced.
    pub fn write_batch(&mut self, records: &[SilverRecord]) -> Result<Option<PathBuf>, IngestError> {
        if records.is_empty() {
            return Ok(None);
        }
        for record in records {
            validate_row(&record_row(record))?;
        }

        let batch = self.to_arrow(records)?;
        let file_name = format!(
            "{}_{}_silver_part-{:04}.parquet",
            self.slug, self.run_id, self.part_index
        );
        let tmp_path = self
            .partition_dir
            .join(format!(".tmp-{}", Uuid::new_v4().simple()));
        let final_path = self.partition_dir.join(&file_name);

        let write = || -> anyhow::Result<()> {
            let file = std::fs::File::create(&tmp_path)?;
            let props = WriterProperties::builder()
                .set_compression(Compression::SNAPPY)
                .build();
            let mut writer = ArrowWriter::try_new(file, self.schema.clone(), Some(props))?;
            writer.write(&batch)?;
            let file = writer.into_inner()?;
            file.sync_all()?; // durable before rename
            Ok(())
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(IngestError::Fatal(format!("silver flush failed: {e}")));
        }

        let bytes = std::fs::read(&tmp_path)
            .map_err(|e| IngestError::Fatal(format!("re-read flushed part: {e}")))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| IngestError::Fatal(format!("finalize part file: {e}")))?;

        info!(
            file = %final_path.display(),
            records = records.len(),
            "silver part written"
        );

        let token_counts: Vec<i64> = records.iter().map(|r| r.token_count).collect();
        self.manifest.add_partition(
            PartitionFile {
                file_name,
                sha256: hex::encode(Sha256::digest(&bytes)),
                size_bytes: bytes.len() as u64,
                record_count: records.len() as u64,
            },
            &token_counts,
        );
        self.manifest
            .write_atomic(&self.partition_dir, &self.slug)
            .map_err(|e| IngestError::Fatal(format!("write manifest: {e}")))?;

        self.part_index += 1;
        Ok(Some(final_path))
    }

    /// Write the final manifest state and hand back the partition location.
    pub fn finalize(self) -> Result<(Manifest, PathBuf), IngestError> {
        self.manifest
            .write_atomic(&self.partition_dir, &self.slug)
            .map_err(|e| IngestError::Fatal(format!("write manifest: {e}")))?;
        Ok((self.manifest, self.partition_dir))
    }

    fn to_arrow(&self, records: &[SilverRecord]) -> Result<RecordBatch, IngestError> {
        let metadata_json: Vec<String> = records
            .iter()
            .map(|r| Value::Object(r.metadata.clone()).to_string())
            .collect();

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| &r.id))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| &r.text))),
            Arc::new(StringArray::from_iter_values(records.iter().map(|r| &r.source))),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.source_type.as_str()),
            )),
            Arc::new(Date32Array::from_iter_values(
                records.iter().map(|r| date32(r.date_accessed)),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.language),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.license),
            )),
            Arc::new(Int32Array::from_iter_values(
                records.iter().map(|r| r.token_count as i32),
            )),
            Arc::new(StringArray::from_iter_values(metadata_json.iter())),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| &r.domain),
            )),
            Arc::new(StringArray::from(
                records
                    .iter()
                    .map(|r| r.embedding.as_deref())
                    .collect::<Vec<Option<&str>>>(),
            )),
            Arc::new(StringArray::from_iter_values(
                records.iter().map(|r| r.register.as_str()),
            )),
        ];

        RecordBatch::try_new(self.schema.clone(), columns)
            .map_err(|e| IngestError::Fatal(format!("assemble arrow batch: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use soma_core::{RecordBuilder, Register, SourceType};

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

    fn record(text: &str) -> SilverRecord {
        let builder = RecordBuilder::new(
            descriptor(),
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        );
        let mut meta = Map::new();
        meta.insert("title".into(), Value::String("Soomaaliya".into()));
        builder.build(text.to_string(), meta)
    }

    #[test]
    fn writes_parts_with_incrementing_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new("wikipedia-somali", NaiveDate::from_ymd_opt(2026, 8, 1), false);
        let mut writer =
            SilverWriter::new(dir.path(), &descriptor(), &run, SCHEMA_VERSION).unwrap();

        let first = writer
            .write_batch(&[record("Soomaaliya waa waddan ku yaal Geeska Afrika.")])
            .unwrap()
            .unwrap();
        let second = writer
            .write_batch(&[record("Muqdisho waa caasimadda Soomaaliya.")])
            .unwrap()
            .unwrap();
        assert!(first.to_string_lossy().contains("silver_part-0000.parquet"));
        assert!(second.to_string_lossy().contains("silver_part-0001.parquet"));

        let (manifest, partition_dir) = writer.finalize().unwrap();
        assert_eq!(manifest.total_records, 2);
        assert_eq!(manifest.partitions.len(), 2);
        assert!(manifest.verify(&partition_dir).unwrap().is_empty());
        // no temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(&partition_dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".tmp-")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn invalid_record_rejects_whole_batch_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new("wikipedia-somali", None, false);
        let mut writer =
            SilverWriter::new(dir.path(), &descriptor(), &run, SCHEMA_VERSION).unwrap();

        let good = record("Soomaaliya waa waddan ku yaal Geeska Afrika.");
        let mut bad = record("Muqdisho waa caasimadda Soomaaliya.");
        bad.token_count = -1;

        let err = writer.write_batch(&[good, bad]).unwrap_err();
        match err {
            IngestError::SchemaViolation { field, record_id, .. } => {
                assert_eq!(field, "token_count");
                assert!(record_id.starts_with("WIKI_"));
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
        // the failed flush produced no part file
        let parquet_files: Vec<_> = std::fs::read_dir(writer.partition_dir())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".parquet")
            })
            .collect();
        assert!(parquet_files.is_empty());

        // the writer keeps accepting subsequent batches
        let ok = writer
            .write_batch(&[record("Hargeysa waa magaalada labaad ee ugu weyn.")])
            .unwrap();
        assert!(ok.is_some());
    }

    #[test]
    fn float_token_count_names_the_field() {
        let mut row = record_row(&record("Soomaaliya waa waddan."));
        row.insert("token_count".into(), json!(3.5));
        let err = validate_row(&row).unwrap_err();
        match err {
            IngestError::SchemaViolation { field, message, .. } => {
                assert_eq!(field, "token_count");
                assert!(message.contains("32-bit integer"));
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }

    #[test]
    fn wrong_schema_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunContext::new("wikipedia-somali", None, false);
        let err = SilverWriter::new(dir.path(), &descriptor(), &run, "3.0").unwrap_err();
        assert!(matches!(err, IngestError::Fatal(_)));
    }

    #[test]
    fn validate_row_covers_enum_and_null_violations() {
        let mut row = record_row(&record("Soomaaliya waa waddan."));
        row.insert("source_type".into(), Value::String("blog".into()));
        assert!(matches!(
            validate_row(&row),
            Err(IngestError::SchemaViolation { ref field, .. }) if field == "source_type"
        ));

        let mut row = record_row(&record("Soomaaliya waa waddan."));
        row.insert("text".into(), Value::String(String::new()));
        assert!(matches!(
            validate_row(&row),
            Err(IngestError::SchemaViolation { ref field, .. }) if field == "text"
        ));

        let mut row = record_row(&record("Soomaaliya waa waddan."));
        row.insert("embedding".into(), json!(42));
        assert!(matches!(
            validate_row(&row),
            Err(IngestError::SchemaViolation { ref field, .. }) if field == "embedding"
        ));
    }
}
