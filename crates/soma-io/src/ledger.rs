//! Persistent crawl ledger.
//!
//! A SQLite-backed state store keyed by `(source, canonical_url)`. Every
//! discovered unit of work gets one row that walks the state machine
//! `discovered -> fetched -> processed` with terminal branches `failed`,
//! `skipped` and `duplicate`. Transitions are single SQL statements inside
//! the connection's implicit transaction, so state is durable before the
//! caller proceeds. A separate fetch log feeds rolling per-source quotas.
//!
//! The connection is wrapped in a mutex: one pipeline run is serialized
//! through it, including transitions issued by an adapter's worker pool.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use soma_core::Ledger;

/// States of one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    Discovered,
    Fetched,
    Processed,
    Failed,
    Skipped,
    Duplicate,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerState::Discovered => "discovered",
            LedgerState::Fetched => "fetched",
            LedgerState::Processed => "processed",
            LedgerState::Failed => "failed",
            LedgerState::Skipped => "skipped",
            LedgerState::Duplicate => "duplicate",
        }
    }

    /// Terminal states can be re-opened only under the explicit force flag.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LedgerState::Processed | LedgerState::Skipped | LedgerState::Duplicate
        )
    }
}

impl FromStr for LedgerState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "discovered" => LedgerState::Discovered,
            "fetched" => LedgerState::Fetched,
            "processed" => LedgerState::Processed,
            "failed" => LedgerState::Failed,
            "skipped" => LedgerState::Skipped,
            "duplicate" => LedgerState::Duplicate,
            other => bail!("unknown ledger state: {other}"),
        })
    }
}

/// Full row of one ledger entry, for inspection and tests.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub source: String,
    pub url: String,
    pub state: LedgerState,
    pub first_seen_at: DateTime<Utc>,
    pub last_transitioned_at: DateTime<Utc>,
    pub http_status: Option<u16>,
    pub content_length: Option<u64>,
    pub text_hash: Option<String>,
    pub silver_id: Option<String>,
    pub attempt_count: u32,
    pub failure_reason: Option<String>,
}

pub struct CrawlLedger {
    conn: Mutex<Connection>,
    max_attempts: u32,
}

impl CrawlLedger {
    /// Open (and migrate) the ledger store at `path`.
    pub fn open(path: &Path, max_attempts: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open ledger at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_attempts,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(max_attempts: u32) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_attempts,
        })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS crawl_ledger (
                source TEXT NOT NULL,
                url TEXT NOT NULL,
                state TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                last_transitioned_at TEXT NOT NULL,
                http_status INTEGER,
                content_length INTEGER,
                text_hash TEXT,
                silver_id TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                failure_reason TEXT,
                discovery_metadata TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (source, url)
            );
            CREATE INDEX IF NOT EXISTS idx_crawl_ledger_state
                ON crawl_ledger (source, state);
            CREATE TABLE IF NOT EXISTS fetch_log (
                source TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fetch_log_source_time
                ON fetch_log (source, fetched_at);
            "#,
        )?;
        Ok(())
    }

    /// Read one entry back; `None` when the URL was never discovered.
    pub fn entry(&self, source: &str, url: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock().expect("ledger lock");
        let row = conn
            .query_row(
                "SELECT source, url, state, first_seen_at, last_transitioned_at,
                        http_status, content_length, text_hash, silver_id,
                        attempt_count, failure_reason
                 FROM crawl_ledger WHERE source = ?1 AND url = ?2",
                params![source, url],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<u16>>(5)?,
                        row.get::<_, Option<u64>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, u32>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;
        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(LedgerEntry {
            source: r.0,
            url: r.1,
            state: r.2.parse()?,
            first_seen_at: r.3.parse::<DateTime<Utc>>()?,
            last_transitioned_at: r.4.parse::<DateTime<Utc>>()?,
            http_status: r.5,
            content_length: r.6,
            text_hash: r.7,
            silver_id: r.8,
            attempt_count: r.9,
            failure_reason: r.10,
        }))
    }

    /// Number of entries for one source in one state.
    pub fn count_in_state(&self, source: &str, state: LedgerState) -> Result<u64> {
        let conn = self.conn.lock().expect("ledger lock");
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM crawl_ledger WHERE source = ?1 AND state = ?2",
            params![source, state.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn current_state(conn: &Connection, source: &str, url: &str) -> Result<Option<(LedgerState, u32)>> {
        let row = conn
            .query_row(
                "SELECT state, attempt_count FROM crawl_ledger WHERE source = ?1 AND url = ?2",
                params![source, url],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)),
            )
            .optional()?;
        match row {
            Some((state, attempts)) => Ok(Some((state.parse()?, attempts))),
            None => Ok(None),
        }
    }

    /// Legal transitions of the entry state machine. `fetched -> duplicate`
    /// is included for content-level dedup, which runs after acquisition.
    fn legal(from: LedgerState, to: LedgerState) -> bool {
        use LedgerState::*;
        matches!(
            (from, to),
            (Discovered, Fetched)
                | (Discovered, Failed)
                | (Discovered, Skipped)
                | (Discovered, Duplicate)
                | (Fetched, Processed)
                | (Fetched, Failed)
                | (Fetched, Duplicate)
                | (Failed, Fetched)
                | (Failed, Failed)
        )
    }

    fn transition(
        &self,
        source: &str,
        url: &str,
        to: LedgerState,
        apply: impl FnOnce(&Connection) -> rusqlite::Result<usize>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("ledger lock");
        let Some((from, _)) = Self::current_state(&conn, source, url)? else {
            bail!("transition to {} for unknown entry {source} {url}", to.as_str());
        };
        if !Self::legal(from, to) {
            bail!(
                "illegal ledger transition {} -> {} for {source} {url}",
                from.as_str(),
                to.as_str()
            );
        }
        let changed = apply(&conn)?;
        debug_assert_eq!(changed, 1);
        debug!(source, url, from = from.as_str(), to = to.as_str(), "ledger transition");
        Ok(())
    }
}

impl Ledger for CrawlLedger {
    fn discover(&self, source: &str, url: &str, metadata: &Value) -> Result<()> {
        let conn = self.conn.lock().expect("ledger lock");
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO crawl_ledger
                 (source, url, state, first_seen_at, last_transitioned_at, discovery_metadata)
             VALUES (?1, ?2, 'discovered', ?3, ?3, ?4)
             ON CONFLICT (source, url) DO NOTHING",
            params![source, url, now, metadata.to_string()],
        )?;
        Ok(())
    }

    fn should_fetch(&self, source: &str, url: &str, force: bool) -> Result<bool> {
        let conn = self.conn.lock().expect("ledger lock");
        let Some((state, attempts)) = Self::current_state(&conn, source, url)? else {
            return Ok(true);
        };
        if force {
            // Explicit re-open: terminal entries drop back to `discovered`
            // with a fresh attempt budget.
            if state != LedgerState::Discovered {
                conn.execute(
                    "UPDATE crawl_ledger
                     SET state = 'discovered', attempt_count = 0,
                         failure_reason = NULL, last_transitioned_at = ?3
                     WHERE source = ?1 AND url = ?2",
                    params![source, url, Utc::now().to_rfc3339()],
                )?;
            }
            return Ok(true);
        }
        Ok(match state {
            LedgerState::Discovered => true,
            LedgerState::Failed => attempts < self.max_attempts,
            _ => false,
        })
    }

    fn mark_fetched(
        &self,
        source: &str,
        url: &str,
        http_status: Option<u16>,
        content_length: Option<u64>,
    ) -> Result<()> {
        self.transition(source, url, LedgerState::Fetched, |conn| {
            conn.execute(
                "UPDATE crawl_ledger
                 SET state = 'fetched', http_status = ?3, content_length = ?4,
                     attempt_count = attempt_count + 1, last_transitioned_at = ?5
                 WHERE source = ?1 AND url = ?2",
                params![source, url, http_status, content_length, Utc::now().to_rfc3339()],
            )
        })
    }

    fn mark_processed(
        &self,
        source: &str,
        url: &str,
        text_hash: &str,
        silver_id: Option<&str>,
    ) -> Result<()> {
        self.transition(source, url, LedgerState::Processed, |conn| {
            conn.execute(
                "UPDATE crawl_ledger
                 SET state = 'processed', text_hash = ?3, silver_id = ?4,
                     last_transitioned_at = ?5
                 WHERE source = ?1 AND url = ?2",
                params![source, url, text_hash, silver_id, Utc::now().to_rfc3339()],
            )
        })
    }

    fn mark_failed(&self, source: &str, url: &str, reason: &str) -> Result<()> {
        self.transition(source, url, LedgerState::Failed, |conn| {
            conn.execute(
                "UPDATE crawl_ledger
                 SET state = 'failed', failure_reason = ?3,
                     attempt_count = attempt_count + 1, last_transitioned_at = ?4
                 WHERE source = ?1 AND url = ?2",
                params![source, url, reason, Utc::now().to_rfc3339()],
            )
        })
    }

    fn mark_skipped(&self, source: &str, url: &str) -> Result<()> {
        self.transition(source, url, LedgerState::Skipped, |conn| {
            conn.execute(
                "UPDATE crawl_ledger
                 SET state = 'skipped', last_transitioned_at = ?3
                 WHERE source = ?1 AND url = ?2",
                params![source, url, Utc::now().to_rfc3339()],
            )
        })
    }

    fn mark_duplicate(&self, source: &str, url: &str) -> Result<()> {
        self.transition(source, url, LedgerState::Duplicate, |conn| {
            conn.execute(
                "UPDATE crawl_ledger
                 SET state = 'duplicate', last_transitioned_at = ?3
                 WHERE source = ?1 AND url = ?2",
                params![source, url, Utc::now().to_rfc3339()],
            )
        })
    }

    fn quota_remaining(&self, source: &str, window: Duration, cap: u32) -> Result<i64> {
        let conn = self.conn.lock().expect("ledger lock");
        let cutoff = Utc::now() - chrono::Duration::from_std(window)?;
        let used: i64 = conn.query_row(
            "SELECT COUNT(*) FROM fetch_log WHERE source = ?1 AND fetched_at > ?2",
            params![source, cutoff.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(cap as i64 - used)
    }

    fn record_fetch_event(&self, source: &str) -> Result<()> {
        let conn = self.conn.lock().expect("ledger lock");
        conn.execute(
            "INSERT INTO fetch_log (source, fetched_at) VALUES (?1, ?2)",
            params![source, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "BBC-Somali";
    const URL: &str = "https://www.bbc.com/somali/articles/c0000000001o";

    fn ledger() -> CrawlLedger {
        CrawlLedger::open_in_memory(3).unwrap()
    }

    #[test]
    fn discover_is_idempotent() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        l.discover(SRC, URL, &Value::Null).unwrap();
        let entry = l.entry(SRC, URL).unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Discovered);
        assert_eq!(entry.attempt_count, 0);
    }

    #[test]
    fn happy_path_walks_to_processed() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        assert!(l.should_fetch(SRC, URL, false).unwrap());
        l.mark_fetched(SRC, URL, Some(200), Some(4096)).unwrap();
        l.mark_processed(SRC, URL, "abc123", Some("BBCS_0123456789abcdef"))
            .unwrap();
        let entry = l.entry(SRC, URL).unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Processed);
        assert_eq!(entry.http_status, Some(200));
        assert_eq!(entry.silver_id.as_deref(), Some("BBCS_0123456789abcdef"));
        assert_eq!(entry.attempt_count, 1);
        // terminal without force
        assert!(!l.should_fetch(SRC, URL, false).unwrap());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        // processed requires a prior fetch
        assert!(l.mark_processed(SRC, URL, "x", None).is_err());
    }

    #[test]
    fn failed_entries_are_retried_until_attempts_exhausted() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        l.mark_failed(SRC, URL, "timeout after 30s").unwrap();
        assert!(l.should_fetch(SRC, URL, false).unwrap());
        l.mark_failed(SRC, URL, "timeout after 30s").unwrap();
        l.mark_failed(SRC, URL, "timeout after 30s").unwrap();
        assert!(!l.should_fetch(SRC, URL, false).unwrap());
        let entry = l.entry(SRC, URL).unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Failed);
        assert_eq!(entry.attempt_count, 3);
        assert!(entry.failure_reason.unwrap().contains("timeout"));
    }

    #[test]
    fn force_reopens_terminal_entries() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        l.mark_fetched(SRC, URL, Some(200), None).unwrap();
        l.mark_processed(SRC, URL, "hash", Some("id")).unwrap();
        assert!(!l.should_fetch(SRC, URL, false).unwrap());
        assert!(l.should_fetch(SRC, URL, true).unwrap());
        let entry = l.entry(SRC, URL).unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Discovered);
        assert_eq!(entry.attempt_count, 0);
        // the re-opened entry can be fetched again
        l.mark_fetched(SRC, URL, Some(200), None).unwrap();
    }

    #[test]
    fn duplicate_after_fetch_is_legal() {
        let l = ledger();
        l.discover(SRC, URL, &Value::Null).unwrap();
        l.mark_fetched(SRC, URL, Some(200), None).unwrap();
        l.mark_duplicate(SRC, URL).unwrap();
        assert_eq!(
            l.entry(SRC, URL).unwrap().unwrap().state,
            LedgerState::Duplicate
        );
    }

    #[test]
    fn quota_counts_recent_fetches_only() {
        let l = ledger();
        assert_eq!(
            l.quota_remaining(SRC, Duration::from_secs(3600), 60).unwrap(),
            60
        );
        for _ in 0..3 {
            l.record_fetch_event(SRC).unwrap();
        }
        assert_eq!(
            l.quota_remaining(SRC, Duration::from_secs(3600), 60).unwrap(),
            57
        );
        // a different source has its own budget
        assert_eq!(
            l.quota_remaining("TikTok", Duration::from_secs(3600), 10).unwrap(),
            10
        );
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger").join("crawl_ledger.sqlite");
        {
            let l = CrawlLedger::open(&path, 3).unwrap();
            l.discover(SRC, URL, &Value::Null).unwrap();
            l.mark_fetched(SRC, URL, Some(200), Some(10)).unwrap();
            l.mark_processed(SRC, URL, "hash", Some("id")).unwrap();
        }
        let l = CrawlLedger::open(&path, 3).unwrap();
        let entry = l.entry(SRC, URL).unwrap().unwrap();
        assert_eq!(entry.state, LedgerState::Processed);
        assert_eq!(l.count_in_state(SRC, LedgerState::Processed).unwrap(), 1);
    }
}
