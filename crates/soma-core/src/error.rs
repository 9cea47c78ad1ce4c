//! Error taxonomy for ingestion runs.
//!
//! The variants mirror how failures are handled: configuration and fatal
//! errors abort the run, adapter errors are charged against a single unit of
//! work, schema violations reject one writer batch, and cancellation is a
//! clean partial outcome.

/// Error types for SOMA pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Invalid or unusable configuration; the run never starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable pipeline error (unwritable silver directory,
    /// repeated flush failures, adapter protocol misuse).
    #[error("fatal ingestion error: {0}")]
    Fatal(String),

    /// A record in a writer batch does not match the frozen silver schema.
    /// The whole batch is rejected; the run continues with the next batch.
    #[error("schema violation in field `{field}` (record {record_id}): {message}")]
    SchemaViolation {
        field: String,
        record_id: String,
        message: String,
    },

    /// Per-unit adapter failure that will not succeed on retry.
    #[error("permanent adapter error: {0}")]
    AdapterPermanent(String),

    /// Per-unit adapter failure worth retrying with backoff.
    #[error("transient adapter error: {0}")]
    AdapterTransient(String),

    /// External cancellation; in-flight work is drained and state flushed.
    #[error("run canceled")]
    Canceled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    /// Process exit code for the CLI surface.
    ///
    /// 0 success (including cancellation), 1 partial success,
    /// 2 fatal error, 3 configuration error. Partial success is decided by
    /// the run outcome, not by an error value, so it never appears here.
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::Configuration(_) => 3,
            IngestError::Canceled => 0,
            _ => 2,
        }
    }

    /// True when the orchestrator must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::Configuration(_) | IngestError::Fatal(_) | IngestError::Other(_)
        )
    }
}
