//! Run-scoped identity and context.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a single pipeline invocation.
///
/// The run id has the shape `YYYYMMDD_HHMMSS_<source-slug>_<8-hex>` and is
/// embedded in every partition file name, manifest, metrics document and
/// quality report the run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    /// Source slug the run is scoped to.
    pub slug: String,
    /// Partition date; defaults to the run's UTC start date.
    pub date_accessed: NaiveDate,
    pub started_at: DateTime<Utc>,
    /// Re-open terminal ledger states and re-fetch.
    pub force: bool,
}

impl RunContext {
    pub fn new(slug: &str, date_override: Option<NaiveDate>, force: bool) -> Self {
        let started_at = Utc::now();
        let date_accessed = date_override.unwrap_or_else(|| started_at.date_naive());
        let suffix = Uuid::new_v4().simple().to_string();
        let run_id = format!(
            "{}_{}_{}",
            started_at.format("%Y%m%d_%H%M%S"),
            slug,
            &suffix[..8]
        );
        Self {
            run_id,
            slug: slug.to_string(),
            date_accessed,
            started_at,
            force,
        }
    }

    /// Partition directory segment for this run, `date_accessed=YYYY-MM-DD`.
    pub fn date_partition(&self) -> String {
        format!("date_accessed={}", self.date_accessed.format("%Y-%m-%d"))
    }
}
