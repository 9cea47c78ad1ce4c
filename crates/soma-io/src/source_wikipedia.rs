//! Bulk-file adapter: Somali Wikipedia dump.
//!
//! Downloads the compressed pages-articles dump once per date partition
//! (resuming a partial download by byte offset), then streams it through a
//! MediaWiki-aware XML parser, yielding one record per main-namespace page.
//! Pages above the in-memory cap are truncated and counted.

use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use soma_core::{
    AcquireOutcome, AppConfig, CleanProfile, ExtractCtx, ExtractMsg, FilterProfile, PipelineType,
    RawRecord, RecordTx, Register, RunContext, SourceAdapter, SourceDescriptor, SourceType,
    WorkUnit,
};

/// Hard cap on one page's wikitext held in memory.
const MAX_PAGE_BYTES: usize = 10 * 1024 * 1024;

const DEFAULT_DUMP_URL: &str =
    "https://dumps.wikimedia.org/sowiki/latest/sowiki-latest-pages-articles.xml.gz";

pub fn wikipedia_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        name: "Wikipedia-Somali".to_string(),
        slug: "wikipedia-somali".to_string(),
        source_type: SourceType::Encyclopedia,
        license: "CC-BY-SA-4.0".to_string(),
        register: Register::Formal,
        domain: "so.wikipedia.org".to_string(),
    }
}

pub struct WikipediaAdapter {
    descriptor: SourceDescriptor,
    settings: soma_core::SourceSettings,
    bronze_dir: PathBuf,
    run: RunContext,
    client: reqwest::Client,
}

impl WikipediaAdapter {
    pub fn new(cfg: &AppConfig, run: &RunContext) -> Result<Self> {
        let descriptor = wikipedia_descriptor();
        let settings = cfg.source_settings(&descriptor.slug);
        let bronze_dir = cfg
            .data
            .raw_dir
            .join(format!("source={}", descriptor.name))
            .join(run.date_partition());
        let client = reqwest::Client::builder()
            .user_agent(crate::fetch::USER_AGENT)
            .timeout(std::time::Duration::from_secs(
                settings.request_timeout_sec.max(300),
            ))
            .build()?;
        Ok(Self {
            descriptor,
            settings,
            bronze_dir,
            run: run.clone(),
            client,
        })
    }

    fn dump_url(&self) -> String {
        self.settings
            .dump_url
            .clone()
            .unwrap_or_else(|| DEFAULT_DUMP_URL.to_string())
    }

    /// Reuse a dump already captured for this date partition, or download it
    /// (resuming a partial file by byte offset).
    async fn ensure_dump(&self, ctx: &ExtractCtx) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.bronze_dir)
            .with_context(|| format!("create bronze dir {}", self.bronze_dir.display()))?;

        // Any prior run of this date partition left a complete dump behind.
        for entry in std::fs::read_dir(&self.bronze_dir)? {
            let path = entry?.path();
            let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
            if name.contains("_raw_pages-articles") && !name.ends_with(".partial") {
                info!(dump = %path.display(), "reusing dump from this date partition");
                return Ok(path);
            }
        }

        let url = self.dump_url();
        if let Some(local) = url.strip_prefix("file://") {
            return Ok(PathBuf::from(local));
        }

        let ext = if url.ends_with(".gz") { "xml.gz" } else { "xml" };
        let final_path = self.bronze_dir.join(format!(
            "{}_{}_raw_pages-articles.{ext}",
            self.descriptor.slug, self.run.run_id
        ));
        let partial_path = final_path.with_extension(format!("{ext}.partial"));

        let mut offset = std::fs::metadata(&partial_path).map(|m| m.len()).unwrap_or(0);
        let mut request = self.client.get(&url);
        if offset > 0 {
            info!(offset, "resuming dump download");
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.context("dump request")?;
        let status = response.status();
        ctx.metrics.increment_http_status(status.as_u16());
        if !status.is_success() {
            anyhow::bail!("dump download failed with status {status}");
        }
        if status.as_u16() != 206 {
            // server ignored the range; restart from scratch
            offset = 0;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&partial_path)?;
        file.set_len(offset)?;
        if offset > 0 {
            use std::io::Seek;
            file.seek(std::io::SeekFrom::End(0))?;
        }

        let mut response = response;
        while let Some(chunk) = response.chunk().await.context("dump body")? {
            file.write_all(&chunk)?;
        }
        file.sync_all()?;
        drop(file);
        std::fs::rename(&partial_path, &final_path)?;
        info!(dump = %final_path.display(), "dump downloaded");
        Ok(final_path)
    }

    fn open_dump(path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open dump {}", path.display()))?;
        if path.extension().is_some_and(|e| e == "gz") {
            Ok(Box::new(GzDecoder::new(BufReader::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

#[derive(Default)]
struct PageBuilder {
    title: String,
    ns: Option<i64>,
    page_id: Option<i64>,
    revision_id: Option<i64>,
    text: String,
    truncated: bool,
}

impl PageBuilder {
    fn page_url(&self) -> String {
        format!(
            "https://so.wikipedia.org/wiki/{}",
            self.title.replace(' ', "_")
        )
    }

    fn into_record(self) -> RawRecord {
        let url = self.page_url();
        let mut record = RawRecord::new(self.text).with_url(url);
        record = record.with_meta("title", Value::String(self.title));
        if let Some(id) = self.page_id {
            record = record.with_meta("page_id", Value::from(id));
        }
        if let Some(id) = self.revision_id {
            record = record.with_meta("revision_id", Value::from(id));
        }
        if self.truncated {
            record = record.with_meta("truncated", Value::Bool(true));
        }
        record
    }
}

#[async_trait]
impl SourceAdapter for WikipediaAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn pipeline_type(&self) -> PipelineType {
        PipelineType::FileProcessing
    }

    fn clean_profile(&self) -> CleanProfile {
        CleanProfile::MediaWiki
    }

    fn filter_profile(&self) -> FilterProfile {
        FilterProfile::MediaWiki
    }

    async fn discover(&mut self, _ctx: &ExtractCtx) -> Result<Vec<WorkUnit>> {
        Ok(vec![WorkUnit::opaque(self.dump_url())])
    }

    async fn acquire(&mut self, _unit: &WorkUnit, _ctx: &ExtractCtx) -> AcquireOutcome {
        AcquireOutcome::Permanent(
            "bulk dump pages are acquired by the streaming extract stage".to_string(),
        )
    }

    /// Stream the dump, emitting one record per main-namespace page.
    async fn extract(
        &mut self,
        tx: RecordTx,
        ctx: ExtractCtx,
        cancel: CancellationToken,
    ) -> Result<()> {
        ctx.metrics.increment("files_discovered", 1);
        let dump_path = self.ensure_dump(&ctx).await?;

        let mut reader = Reader::from_reader(BufReader::new(Self::open_dump(&dump_path)?));
        let mut buf = Vec::new();
        let mut path: Vec<String> = Vec::new();
        let mut page: Option<PageBuilder> = None;
        let mut emitted = 0usize;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(cap) = ctx.max_items {
                if emitted >= cap {
                    info!(cap, "max_items reached, stopping dump scan");
                    ctx.metrics.increment("files_processed", 1);
                    break;
                }
            }

            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(start)) => {
                    let name = String::from_utf8_lossy(start.name().as_ref()).to_string();
                    if name == "page" {
                        page = Some(PageBuilder::default());
                    }
                    path.push(name);
                }
                Ok(Event::Text(text)) => {
                    if let Some(builder) = page.as_mut() {
                        let value = text.unescape().unwrap_or_default();
                        match element_path(&path) {
                            ("page", "title") => builder.title.push_str(&value),
                            ("page", "ns") => builder.ns = value.trim().parse().ok(),
                            ("page", "id") => builder.page_id = value.trim().parse().ok(),
                            ("revision", "id") => builder.revision_id = value.trim().parse().ok(),
                            ("revision", "text") => {
                                if builder.text.len() < MAX_PAGE_BYTES {
                                    let room = MAX_PAGE_BYTES - builder.text.len();
                                    if value.len() > room {
                                        let cut = truncation_boundary(&value, room);
                                        builder.text.push_str(&value[..cut]);
                                        builder.truncated = true;
                                    } else {
                                        builder.text.push_str(&value);
                                    }
                                } else {
                                    builder.truncated = true;
                                }
                            }
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(end)) => {
                    let name = String::from_utf8_lossy(end.name().as_ref()).to_string();
                    path.pop();
                    if name == "page" {
                        let Some(builder) = page.take() else { continue };
                        ctx.metrics.increment("pages_scanned", 1);
                        if builder.ns != Some(0) {
                            ctx.metrics.increment("non_main_namespace_skipped", 1);
                            continue;
                        }
                        if builder.truncated {
                            ctx.metrics.increment("oversized_skipped", 1);
                            warn!(title = %builder.title, "page truncated at size cap");
                        }

                        let url = builder.page_url();
                        ctx.ledger.discover(&ctx.source, &url, &Value::Null)?;
                        if !ctx.ledger.should_fetch(&ctx.source, &url, ctx.force)? {
                            ctx.metrics.increment("skipped_discovery_dedup", 1);
                            continue;
                        }
                        ctx.ledger.mark_fetched(
                            &ctx.source,
                            &url,
                            None,
                            Some(builder.text.len() as u64),
                        )?;

                        emitted += 1;
                        if tx.send(ExtractMsg::Record(builder.into_record())).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Event::Eof) => {
                    ctx.metrics.increment("files_processed", 1);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "dump parse error, stopping scan");
                    ctx.metrics.increment("file_errors", 1);
                    break;
                }
            }
            buf.clear();
        }

        let _ = tx.send(ExtractMsg::Eos).await;
        Ok(())
    }
}

/// `(parent-ish, leaf)` view of the element path, distinguishing the page id
/// from the revision id.
fn element_path(path: &[String]) -> (&str, &str) {
    let leaf = path.last().map(String::as_str).unwrap_or("");
    let parent = if path.iter().any(|p| p == "revision") {
        "revision"
    } else if path.iter().any(|p| p == "page") {
        "page"
    } else {
        ""
    };
    (parent, leaf)
}

/// Largest char boundary at or below `max_bytes`.
fn truncation_boundary(text: &str, max_bytes: usize) -> usize {
    let mut cut = max_bytes.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}
