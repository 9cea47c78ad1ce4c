//! Partition manifest sidecar.
//!
//! Every silver partition carries a `<slug>_<run_id>_silver_metadata.json`
//! sidecar listing the part files with checksums and a statistics roll-up.
//! The manifest is extended after every flush and rewritten atomically, so a
//! reader never observes a sidecar that references a half-written part.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionFile {
    pub file_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub record_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestStatistics {
    pub min_token_count: Option<i64>,
    pub max_token_count: Option<i64>,
    pub avg_token_count: Option<f64>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub source: String,
    pub pipeline_version: String,
    pub schema_version: String,
    pub date_accessed: NaiveDate,
    pub date_processed: DateTime<Utc>,
    pub total_records: u64,
    pub partitions: Vec<PartitionFile>,
    pub statistics: ManifestStatistics,

    #[serde(skip)]
    token_sum: i64,
}

impl Manifest {
    pub fn new(run_id: &str, source: &str, schema_version: &str, date_accessed: NaiveDate) -> Self {
        Self {
            run_id: run_id.to_string(),
            source: source.to_string(),
            pipeline_version: soma_core::PIPELINE_VERSION.to_string(),
            schema_version: schema_version.to_string(),
            date_accessed,
            date_processed: Utc::now(),
            total_records: 0,
            partitions: Vec::new(),
            statistics: ManifestStatistics::default(),
            token_sum: 0,
        }
    }

    /// Register one flushed part file and fold its token counts into the
    /// roll-up statistics.
    pub fn add_partition(&mut self, file: PartitionFile, token_counts: &[i64]) {
        self.total_records += file.record_count;
        self.statistics.total_bytes += file.size_bytes;
        for &count in token_counts {
            self.token_sum += count;
            self.statistics.min_token_count = Some(
                self.statistics
                    .min_token_count
                    .map_or(count, |m| m.min(count)),
            );
            self.statistics.max_token_count = Some(
                self.statistics
                    .max_token_count
                    .map_or(count, |m| m.max(count)),
            );
        }
        if self.total_records > 0 {
            self.statistics.avg_token_count =
                Some(self.token_sum as f64 / self.total_records as f64);
        }
        self.partitions.push(file);
        self.date_processed = Utc::now();
    }

    pub fn file_name(slug: &str, run_id: &str) -> String {
        format!("{slug}_{run_id}_silver_metadata.json")
    }

    /// Atomically (re)write the sidecar into the partition directory.
    pub fn write_atomic(&self, partition_dir: &Path, slug: &str) -> Result<()> {
        let path = partition_dir.join(Self::file_name(slug, &self.run_id));
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(partition_dir)
            .context("create manifest temp file")?;
        tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| anyhow::anyhow!("persist manifest: {e}"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-hash every referenced part file and compare against the recorded
    /// checksums and sizes. Returns a list of human-readable problems.
    pub fn verify(&self, partition_dir: &Path) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        for part in &self.partitions {
            let path = partition_dir.join(&part.file_name);
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => {
                    problems.push(format!("{}: unreadable ({e})", part.file_name));
                    continue;
                }
            };
            if bytes.len() as u64 != part.size_bytes {
                problems.push(format!(
                    "{}: size {} != recorded {}",
                    part.file_name,
                    bytes.len(),
                    part.size_bytes
                ));
            }
            let digest = hex::encode(Sha256::digest(&bytes));
            if digest != part.sha256 {
                problems.push(format!("{}: checksum mismatch", part.file_name));
            }
        }
        Ok(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest::new(
            "20260801_120000_bbc-somali_deadbeef",
            "BBC-Somali",
            soma_core::SCHEMA_VERSION,
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
        )
    }

    #[test]
    fn statistics_roll_up_across_flushes() {
        let mut m = manifest();
        m.add_partition(
            PartitionFile {
                file_name: "part-0000.parquet".into(),
                sha256: "00".into(),
                size_bytes: 100,
                record_count: 2,
            },
            &[10, 30],
        );
        m.add_partition(
            PartitionFile {
                file_name: "part-0001.parquet".into(),
                sha256: "01".into(),
                size_bytes: 50,
                record_count: 1,
            },
            &[5],
        );
        assert_eq!(m.total_records, 3);
        assert_eq!(m.statistics.total_bytes, 150);
        assert_eq!(m.statistics.min_token_count, Some(5));
        assert_eq!(m.statistics.max_token_count, Some(30));
        assert_eq!(m.statistics.avg_token_count, Some(15.0));
    }

    #[test]
    fn write_load_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let part_bytes = b"parquet bytes stand-in";
        std::fs::write(dir.path().join("part-0000.parquet"), part_bytes).unwrap();

        let mut m = manifest();
        m.add_partition(
            PartitionFile {
                file_name: "part-0000.parquet".into(),
                sha256: hex::encode(Sha256::digest(part_bytes)),
                size_bytes: part_bytes.len() as u64,
                record_count: 1,
            },
            &[4],
        );
        m.write_atomic(dir.path(), "bbc-somali").unwrap();

        let loaded = Manifest::load(
            &dir.path()
                .join(Manifest::file_name("bbc-somali", &m.run_id)),
        )
        .unwrap();
        assert_eq!(loaded.total_records, 1);
        assert_eq!(loaded.schema_version, soma_core::SCHEMA_VERSION);
        assert!(loaded.verify(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn verify_reports_tampered_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part-0000.parquet"), b"original").unwrap();
        let mut m = manifest();
        m.add_partition(
            PartitionFile {
                file_name: "part-0000.parquet".into(),
                sha256: hex::encode(Sha256::digest(b"original")),
                size_bytes: 8,
                record_count: 1,
            },
            &[4],
        );
        std::fs::write(dir.path().join("part-0000.parquet"), b"tampered").unwrap();
        let problems = m.verify(dir.path()).unwrap();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("checksum mismatch"));
    }
}
