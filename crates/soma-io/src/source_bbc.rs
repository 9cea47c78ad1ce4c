//! Web-scraping adapter: BBC Somali.
//!
//! Discovery merges homepage links, sitemap traversal (bounded depth) and
//! topic-index pages, deduplicated by canonical URL and cached with the
//! parameters used to obtain the list. Acquisition honors robots.txt, a
//! per-host token bucket and a uniform politeness delay; a bounded worker
//! pool issues fetches concurrently and funnels results into the pipeline
//! channel in arrival order.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use soma_core::{
    backoff_delay, AcquireOutcome, AppConfig, CleanProfile, ExtractCtx, ExtractMsg, PipelineType,
    RawRecord, RecordTx, Register, RunContext, SourceAdapter, SourceDescriptor, SourceSettings,
    SourceType, WorkUnit,
};

use crate::fetch::{canonical_url, dedup_canonical, FetchResult, HttpFetcher};

const DEFAULT_BASE_URL: &str = "https://www.bbc.com";
const SITEMAP_MAX_DEPTH: usize = 2;
const TOPIC_PAGE_CAP: usize = 5;

pub fn bbc_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        name: "BBC-Somali".to_string(),
        slug: "bbc-somali".to_string(),
        source_type: SourceType::News,
        license: "Copyright-BBC".to_string(),
        register: Register::Formal,
        domain: "bbc.com/somali".to_string(),
    }
}

/// Discovery cache: the URL list plus the parameters used to obtain it.
/// Reused on later runs iff the parameters match.
#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryCache {
    max_items: Option<usize>,
    urls: Vec<String>,
}

/// Shared between the feeding loop and the worker pool. The fetcher
/// serializes rate-limit access itself.
struct BbcShared {
    fetcher: HttpFetcher,
    base_url: String,
    bronze_dir: PathBuf,
    slug: String,
    run_id: String,
    hourly_cap: u32,
}

pub struct BbcAdapter {
    descriptor: SourceDescriptor,
    settings: SourceSettings,
    shared: Arc<BbcShared>,
    cache_path: PathBuf,
    _run: RunContext,
}

impl BbcAdapter {
    pub fn new(cfg: &AppConfig, run: &RunContext) -> Result<Self> {
        let descriptor = bbc_descriptor();
        let settings = cfg.source_settings(&descriptor.slug);
        let base_url = settings
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let bronze_dir = cfg
            .data
            .raw_dir
            .join(format!("source={}", descriptor.name))
            .join(run.date_partition());
        let cache_path = cfg
            .data
            .staging_dir
            .join(format!("source={}", descriptor.name))
            .join("discovery_cache.json");
        let shared = Arc::new(BbcShared {
            fetcher: HttpFetcher::new(&settings)?,
            base_url,
            bronze_dir,
            slug: descriptor.slug.clone(),
            run_id: run.run_id.clone(),
            hourly_cap: settings.max_requests_per_hour,
        });
        Ok(Self {
            descriptor,
            settings,
            shared,
            cache_path,
            _run: run.clone(),
        })
    }

    fn load_cache(&self) -> Option<Vec<String>> {
        let bytes = std::fs::read(&self.cache_path).ok()?;
        let cache: DiscoveryCache = serde_json::from_slice(&bytes).ok()?;
        if cache.max_items == self.settings.max_items {
            Some(cache.urls)
        } else {
            debug!("discovery cache parameters changed, invalidating");
            None
        }
    }

    fn save_cache(&self, urls: &[String]) -> Result<()> {
        let parent = self.cache_path.parent().context("cache parent")?;
        std::fs::create_dir_all(parent)?;
        let cache = DiscoveryCache {
            max_items: self.settings.max_items,
            urls: urls.to_vec(),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent)?;
        tmp.write_all(&serde_json::to_vec_pretty(&cache)?)?;
        tmp.persist(&self.cache_path)
            .map_err(|e| anyhow::anyhow!("persist discovery cache: {e}"))?;
        Ok(())
    }

    /// True for paths that look like BBC Somali article pages rather than
    /// section fronts.
    fn is_article_url(url: &str) -> bool {
        let Some(path) = url::Url::parse(url).ok().map(|u| u.path().to_string()) else {
            return false;
        };
        if !path.starts_with("/somali/") {
            return false;
        }
        let last = path.rsplit('/').next().unwrap_or("");
        path.contains("/articles/") || last.chars().any(|c| c.is_ascii_digit())
    }

    fn extract_links(&self, html: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let anchor = Selector::parse("a[href]").expect("static selector");
        document
            .select(&anchor)
            .filter_map(|a| a.value().attr("href"))
            .map(|href| {
                if href.starts_with('/') {
                    format!("{}{href}", self.shared.base_url)
                } else {
                    href.to_string()
                }
            })
            .collect()
    }

    async fn fetch_page(&self, url: &str, ctx: &ExtractCtx) -> Option<String> {
        match self.shared.fetcher.fetch_text(url).await {
            FetchResult::Ok { body, status, .. } => {
                ctx.metrics.increment_http_status(status);
                Some(body)
            }
            other => {
                debug!(url, ?other, "discovery fetch failed");
                None
            }
        }
    }

    /// Sitemap traversal with bounded depth; nested sitemap indexes are
    /// followed, article locs are collected.
    async fn crawl_sitemap(&self, url: &str, depth: usize, ctx: &ExtractCtx, out: &mut Vec<String>) {
        if depth > SITEMAP_MAX_DEPTH {
            return;
        }
        let Some(body) = self.fetch_page(url, ctx).await else {
            return;
        };
        let mut reader = Reader::from_reader(body.as_bytes());
        let mut buf = Vec::new();
        let mut in_loc = false;
        let mut locs = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(start)) => {
                    in_loc = start.name().as_ref() == b"loc";
                }
                Ok(Event::Text(text)) if in_loc => {
                    locs.push(text.unescape().unwrap_or_default().trim().to_string());
                }
                Ok(Event::End(_)) => in_loc = false,
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(url, error = %e, "sitemap parse error");
                    break;
                }
            }
            buf.clear();
        }
        for loc in locs {
            if loc.ends_with(".xml") {
                Box::pin(self.crawl_sitemap(&loc, depth + 1, ctx, out)).await;
            } else if Self::is_article_url(&loc) {
                out.push(loc);
            }
        }
    }
}

impl BbcShared {
    /// Acquire one article URL: robots gate, polite fetch, body extraction,
    /// bronze capture.
    async fn acquire_article(&self, url: &str, ctx: &ExtractCtx) -> AcquireOutcome {
        if !self.fetcher.robots_allow(url) {
            ctx.metrics.increment("robots_disallowed", 1);
            return AcquireOutcome::Permanent("robots.txt disallows this path".to_string());
        }

        // rolling cross-run quota from the ledger fetch log; the in-process
        // token bucket only paces this run
        match ctx.ledger.quota_remaining(
            &ctx.source,
            std::time::Duration::from_secs(3600),
            self.hourly_cap,
        ) {
            Ok(remaining) if remaining <= 0 => {
                ctx.metrics.increment("quota_deferred", 1);
                return AcquireOutcome::Transient("hourly request quota exhausted".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                return AcquireOutcome::Transient(format!("quota lookup failed: {e}"));
            }
        }

        match self.fetcher.fetch_text(url).await {
            FetchResult::Ok {
                body,
                status,
                content_length,
            } => {
                if let Err(e) = self.capture_bronze(url, &body) {
                    warn!(url, error = %e, "bronze capture failed");
                }
                match parse_article(&body) {
                    Some((title, text)) => {
                        let mut record = RawRecord::new(text).with_url(url.to_string());
                        record = record.with_meta("title", Value::String(title));
                        AcquireOutcome::Fetched {
                            record,
                            http_status: Some(status),
                            content_length: Some(content_length),
                        }
                    }
                    None => AcquireOutcome::Permanent("no article body found".to_string()),
                }
            }
            FetchResult::NotFound => AcquireOutcome::NotFound,
            FetchResult::Transient(reason) => AcquireOutcome::Transient(reason),
            FetchResult::Permanent(reason) => AcquireOutcome::Permanent(reason),
        }
    }

    /// Retry wrapper mirroring the transient-failure discipline of the
    /// default extract loop.
    async fn acquire_with_retry(
        &self,
        url: &str,
        ctx: &ExtractCtx,
        cancel: &CancellationToken,
    ) -> AcquireOutcome {
        let mut last_reason = String::new();
        for attempt in 1..=ctx.max_attempts {
            if cancel.is_cancelled() {
                return AcquireOutcome::Permanent("canceled".to_string());
            }
            let started = std::time::Instant::now();
            let outcome = tokio::select! {
                outcome = self.acquire_article(url, ctx) => outcome,
                _ = cancel.cancelled() => return AcquireOutcome::Permanent("canceled".to_string()),
            };
            ctx.metrics
                .observe("fetch_duration_secs", started.elapsed().as_secs_f64());
            match outcome {
                AcquireOutcome::Transient(reason) => {
                    warn!(url, attempt, %reason, "transient fetch failure");
                    last_reason = reason;
                    if attempt < ctx.max_attempts {
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_delay(ctx.retry_base, attempt)) => {}
                            _ = cancel.cancelled() => {
                                return AcquireOutcome::Permanent("canceled".to_string());
                            }
                        }
                    }
                }
                other => return other,
            }
        }
        AcquireOutcome::Permanent(format!(
            "retries exhausted after {} attempts: {last_reason}",
            ctx.max_attempts
        ))
    }

    fn capture_bronze(&self, url: &str, html: &str) -> Result<()> {
        std::fs::create_dir_all(&self.bronze_dir)?;
        let digest = hex::encode(&Sha256::digest(url.as_bytes())[..8]);
        let path = self.bronze_dir.join(format!(
            "{}_{}_raw_{digest}.html",
            self.slug, self.run_id
        ));
        std::fs::write(path, html)?;
        Ok(())
    }

    /// Outcome bookkeeping shared by every worker: metrics, ledger
    /// transition, channel hand-off.
    async fn settle(
        &self,
        url: &str,
        outcome: AcquireOutcome,
        ctx: &ExtractCtx,
        tx: &RecordTx,
    ) -> Result<bool> {
        match outcome {
            AcquireOutcome::Fetched {
                record,
                http_status,
                content_length,
            } => {
                ctx.metrics.increment("urls_fetched", 1);
                ctx.ledger
                    .mark_fetched(&ctx.source, url, http_status, content_length)?;
                ctx.ledger.record_fetch_event(&ctx.source)?;
                Ok(tx.send(ExtractMsg::Record(record)).await.is_ok())
            }
            AcquireOutcome::NotFound => {
                ctx.metrics.increment("urls_fetched", 1);
                ctx.metrics.increment("urls_skipped", 1);
                ctx.ledger.mark_skipped(&ctx.source, url)?;
                Ok(true)
            }
            AcquireOutcome::Permanent(reason) | AcquireOutcome::Transient(reason) => {
                ctx.metrics.increment("urls_fetched", 1);
                ctx.metrics.increment("urls_failed", 1);
                warn!(url, %reason, "article failed");
                ctx.ledger.mark_failed(&ctx.source, url, &reason)?;
                Ok(true)
            }
        }
    }
}

/// Pull the headline and body paragraphs out of an article page.
fn parse_article(html: &str) -> Option<(String, String)> {
    let document = Html::parse_document(html);
    let h1 = Selector::parse("h1").expect("static selector");
    let title = document
        .select(&h1)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let mut body = String::new();
    for selector in ["main article p", "article p", "main p"] {
        let sel = Selector::parse(selector).expect("static selector");
        let paragraphs: Vec<String> = document
            .select(&sel)
            .map(|p| p.text().collect::<String>().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !paragraphs.is_empty() {
            body = paragraphs.join("\n\n");
            break;
        }
    }
    if body.is_empty() {
        return None;
    }
    let text = if title.is_empty() {
        body
    } else {
        format!("{title}\n\n{body}")
    };
    Some((title, text))
}

#[async_trait]
impl SourceAdapter for BbcAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn pipeline_type(&self) -> PipelineType {
        PipelineType::WebScraping
    }

    fn clean_profile(&self) -> CleanProfile {
        CleanProfile::Plain // scraper already extracted plain paragraph text
    }

    async fn discover(&mut self, ctx: &ExtractCtx) -> Result<Vec<WorkUnit>> {
        if let Some(urls) = self.load_cache() {
            info!(urls = urls.len(), "reusing cached discovery list");
            ctx.metrics.increment("discovery_cache_hit", 1);
            return Ok(urls.into_iter().map(WorkUnit::from_url).collect());
        }

        self.shared
            .fetcher
            .load_robots(&self.shared.base_url)
            .await?;

        let mut found: Vec<String> = Vec::new();

        // homepage
        let home = format!("{}/somali", self.shared.base_url);
        if let Some(body) = self.fetch_page(&home, ctx).await {
            let links = self.extract_links(&body);
            let topics: BTreeSet<String> = links
                .iter()
                .filter(|l| l.contains("/somali/topics/"))
                .filter_map(|l| canonical_url(l))
                .take(TOPIC_PAGE_CAP)
                .collect();
            found.extend(links.iter().filter(|l| Self::is_article_url(l)).cloned());

            // topic index pages
            for topic in topics {
                if let Some(topic_body) = self.fetch_page(&topic, ctx).await {
                    found.extend(
                        self.extract_links(&topic_body)
                            .into_iter()
                            .filter(|l| Self::is_article_url(l)),
                    );
                }
            }
        }

        // sitemap traversal
        let sitemap = format!("{}/somali/sitemap.xml", self.shared.base_url);
        let mut sitemap_urls = Vec::new();
        self.crawl_sitemap(&sitemap, 0, ctx, &mut sitemap_urls).await;
        found.extend(sitemap_urls);

        let mut urls = dedup_canonical(found);
        if let Some(cap) = self.settings.max_items {
            urls.truncate(cap);
        }
        info!(urls = urls.len(), "discovery complete");
        if let Err(e) = self.save_cache(&urls) {
            warn!(error = %e, "could not persist discovery cache");
        }
        Ok(urls.into_iter().map(WorkUnit::from_url).collect())
    }

    async fn acquire(&mut self, unit: &WorkUnit, ctx: &ExtractCtx) -> AcquireOutcome {
        match &unit.url {
            Some(url) => self.shared.acquire_article(url, ctx).await,
            None => AcquireOutcome::Permanent("bbc units are always URLs".to_string()),
        }
    }

    /// Bounded worker pool over the discovered URL list. Admission and the
    /// ledger `discovered` insert happen in the feeding loop; workers own
    /// fetch, retry and terminal bookkeeping; the channel serializes results.
    async fn extract(
        &mut self,
        tx: RecordTx,
        ctx: ExtractCtx,
        cancel: CancellationToken,
    ) -> Result<()> {
        let units = self.discover(&ctx).await?;
        ctx.metrics.increment("urls_discovered", units.len() as u64);

        let workers = self.settings.workers.max(1);
        let mut pool: JoinSet<Result<bool>> = JoinSet::new();
        let mut dispatched = 0usize;

        for unit in units {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(cap) = ctx.max_items {
                if dispatched >= cap {
                    break;
                }
            }
            let Some(url) = unit.url.clone() else { continue };

            ctx.ledger
                .discover(&ctx.source, &url, &Value::Object(unit.metadata.clone()))?;
            if !ctx.ledger.should_fetch(&ctx.source, &url, ctx.force)? {
                ctx.metrics.increment("skipped_discovery_dedup", 1);
                continue;
            }

            while pool.len() >= workers {
                if let Some(result) = pool.join_next().await {
                    result.context("bbc worker panicked")??;
                }
            }

            dispatched += 1;
            let shared = self.shared.clone();
            let worker_ctx = ctx.clone();
            let worker_tx = tx.clone();
            let worker_cancel = cancel.clone();
            pool.spawn(async move {
                let outcome = shared
                    .acquire_with_retry(&url, &worker_ctx, &worker_cancel)
                    .await;
                shared.settle(&url, outcome, &worker_ctx, &worker_tx).await
            });
        }

        while let Some(result) = pool.join_next().await {
            result.context("bbc worker panicked")??;
        }

        let _ = tx.send(ExtractMsg::Eos).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn article_urls_are_distinguished_from_fronts() {
        assert!(BbcAdapter::is_article_url(
            "https://www.bbc.com/somali/articles/c3gq2kxe0q1o"
        ));
        assert!(BbcAdapter::is_article_url("https://www.bbc.com/somali/war-64231765"));
        assert!(!BbcAdapter::is_article_url("https://www.bbc.com/somali"));
        assert!(!BbcAdapter::is_article_url("https://www.bbc.com/somali/topics/cxy"));
        assert!(!BbcAdapter::is_article_url("https://www.bbc.com/news/world-12345678"));
    }

    #[test]
    fn article_parsing_joins_paragraphs() {
        let html = r#"<html><body>
            <main><article>
              <h1> Doorashada Soomaaliya </h1>
              <p>Dadka reer Soomaaliya ayaa sugaya doorashada.</p>
              <p>Ururada siyaasadda ayaa diyaar garow ku jira.</p>
              <p>  </p>
            </article></main>
        </body></html>"#;
        let (title, text) = parse_article(html).unwrap();
        assert_eq!(title, "Doorashada Soomaaliya");
        assert!(text.starts_with("Doorashada Soomaaliya\n\n"));
        assert!(text.contains("sugaya doorashada.\n\nUrurada"));
    }

    #[test]
    fn pages_without_paragraphs_yield_nothing() {
        assert!(parse_article("<html><body><div>menu</div></body></html>").is_none());
    }

    #[test]
    fn discovery_cache_round_trips_and_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.data.staging_dir = dir.path().join("staging");
        cfg.data.raw_dir = dir.path().join("raw");
        let mut settings = SourceSettings::default();
        settings.max_items = Some(10);
        cfg.scraping.insert("bbc-somali".to_string(), settings);

        let run = RunContext::new("bbc-somali", None, false);
        let adapter = BbcAdapter::new(&cfg, &run).unwrap();
        let urls = vec!["https://www.bbc.com/somali/articles/c1".to_string()];
        adapter.save_cache(&urls).unwrap();
        assert_eq!(adapter.load_cache().unwrap(), urls);

        // same paths, different parameters: cache is invalidated
        let mut cfg2 = cfg.clone();
        cfg2.scraping.get_mut("bbc-somali").unwrap().max_items = Some(99);
        let adapter2 = BbcAdapter::new(&cfg2, &run).unwrap();
        assert!(adapter2.load_cache().is_none());
    }
}
