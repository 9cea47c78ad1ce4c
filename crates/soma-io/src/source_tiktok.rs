//! Social comments adapter: TikTok comments via a third-party API.
//!
//! Comments are short and often emoji-only; the social filter profile puts
//! an emoji-only rejection ahead of the standard chain. A stream connection
//! failure on the very first request is terminal for the run and yields an
//! unhealthy report.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use soma_core::{
    backoff_delay, AcquireOutcome, AppConfig, ExtractCtx, ExtractMsg, FilterProfile, PipelineType,
    RawRecord, RecordTx, Register, RunContext, SourceAdapter, SourceDescriptor, SourceSettings,
    SourceType, WorkUnit,
};

const DEFAULT_API_BASE: &str = "https://tikwm.com";
const PAGE_SIZE: usize = 50;

pub fn tiktok_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        name: "TikTok".to_string(),
        slug: "tiktok".to_string(),
        source_type: SourceType::Social,
        license: "Terms-Restricted".to_string(),
        register: Register::Colloquial,
        domain: "tiktok.com".to_string(),
    }
}

pub struct TikTokAdapter {
    descriptor: SourceDescriptor,
    settings: SourceSettings,
    client: reqwest::Client,
    api_base: String,
    _run: RunContext,
}

impl TikTokAdapter {
    pub fn new(cfg: &AppConfig, run: &RunContext) -> Result<Self> {
        let descriptor = tiktok_descriptor();
        let settings = cfg.source_settings(&descriptor.slug);
        let client = reqwest::Client::builder()
            .user_agent(crate::fetch::USER_AGENT)
            .timeout(std::time::Duration::from_secs(settings.request_timeout_sec))
            .build()?;
        Ok(Self {
            descriptor,
            api_base: settings
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            settings,
            client,
            _run: run.clone(),
        })
    }

    fn comments_url(&self, video_id: &str, cursor: u64) -> String {
        format!(
            "{}/api/comment/list?url={video_id}&cursor={cursor}&count={PAGE_SIZE}",
            self.api_base
        )
    }

    async fn fetch_comments(&self, video_id: &str, cursor: u64, ctx: &ExtractCtx) -> Result<Value> {
        let url = self.comments_url(video_id, cursor);
        let mut last_err = None;
        for attempt in 1..=ctx.max_attempts {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    ctx.metrics.increment_http_status(resp.status().as_u16());
                    if resp.status().is_success() {
                        return Ok(resp.json::<Value>().await?);
                    }
                    last_err = Some(anyhow::anyhow!("http status {}", resp.status()));
                }
                Err(e) => {
                    last_err = Some(if e.is_timeout() {
                        anyhow::anyhow!("timeout: {e}")
                    } else {
                        anyhow::anyhow!(e)
                    });
                }
            }
            if attempt < ctx.max_attempts {
                tokio::time::sleep(backoff_delay(ctx.retry_base, attempt)).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("comment request failed")))
    }
}

#[async_trait]
impl SourceAdapter for TikTokAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn pipeline_type(&self) -> PipelineType {
        PipelineType::StreamProcessing
    }

    fn filter_profile(&self) -> FilterProfile {
        FilterProfile::Social
    }

    async fn discover(&mut self, _ctx: &ExtractCtx) -> Result<Vec<WorkUnit>> {
        Ok(self
            .settings
            .item_ids
            .iter()
            .map(|id| WorkUnit::opaque(id.clone()))
            .collect())
    }

    async fn acquire(&mut self, _unit: &WorkUnit, _ctx: &ExtractCtx) -> AcquireOutcome {
        AcquireOutcome::Permanent("comment pages are acquired by the extract stage".to_string())
    }

    async fn extract(
        &mut self,
        tx: RecordTx,
        ctx: ExtractCtx,
        cancel: CancellationToken,
    ) -> Result<()> {
        let videos = self.discover(&ctx).await?;
        if videos.is_empty() {
            warn!("no video ids configured for comment collection");
            let _ = tx.send(ExtractMsg::Eos).await;
            return Ok(());
        }

        let mut opened = false;
        let mut emitted = 0usize;

        'videos: for video in &videos {
            let mut cursor = 0u64;
            loop {
                if cancel.is_cancelled() {
                    break 'videos;
                }
                if let Some(cap) = ctx.max_items {
                    if emitted >= cap {
                        info!(emitted, "comment quota reached");
                        break 'videos;
                    }
                }

                let page = match self.fetch_comments(&video.id, cursor, &ctx).await {
                    Ok(page) => page,
                    Err(e) if !opened => {
                        // nothing ever connected; terminal for the run
                        let _ = tx.send(ExtractMsg::Eos).await;
                        return Err(anyhow::anyhow!(
                            "comment stream never connected: {e}"
                        ));
                    }
                    Err(e) => {
                        warn!(video = %video.id, error = %e, "comment page failed, moving on");
                        break;
                    }
                };
                if !opened {
                    opened = true;
                    ctx.metrics.increment("datasets_opened", 1);
                }

                let comments = page
                    .pointer("/data/comments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                ctx.metrics
                    .increment("records_requested", comments.len() as u64);
                if comments.is_empty() {
                    break;
                }

                for comment in &comments {
                    let text = comment
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if text.is_empty() {
                        ctx.metrics.increment("comments_without_text", 1);
                        continue;
                    }
                    ctx.metrics.increment("records_fetched_ok", 1);

                    let mut record = RawRecord::new(text)
                        .with_meta("video_id", Value::String(video.id.clone()));
                    if let Some(cid) = comment.get("id").and_then(Value::as_str) {
                        record = record.with_meta("comment_id", Value::String(cid.to_string()));
                    }
                    if let Some(likes) = comment.get("digg_count").and_then(Value::as_i64) {
                        record = record.with_meta("likes", Value::from(likes));
                    }
                    emitted += 1;
                    if tx.send(ExtractMsg::Record(record)).await.is_err() {
                        break 'videos;
                    }
                    if let Some(cap) = ctx.max_items {
                        if emitted >= cap {
                            break;
                        }
                    }
                }

                let has_more = page
                    .pointer("/data/has_more")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !has_more {
                    break;
                }
                cursor = page
                    .pointer("/data/cursor")
                    .and_then(Value::as_u64)
                    .unwrap_or(cursor + comments.len() as u64);
            }
        }

        let _ = tx.send(ExtractMsg::Eos).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_url_carries_cursor_and_count() {
        let mut cfg = AppConfig::default();
        let mut settings = SourceSettings::default();
        settings.item_ids = vec!["7301234567890123456".to_string()];
        cfg.scraping.insert("tiktok".to_string(), settings);
        let run = RunContext::new("tiktok", None, false);
        let adapter = TikTokAdapter::new(&cfg, &run).unwrap();
        let url = adapter.comments_url("7301234567890123456", 100);
        assert!(url.contains("cursor=100"));
        assert!(url.contains("count=50"));
    }

    #[tokio::test]
    async fn no_configured_videos_is_a_clean_empty_stream() {
        let cfg = AppConfig::default();
        let run = RunContext::new("tiktok", None, false);
        let mut adapter = TikTokAdapter::new(&cfg, &run).unwrap();
        let ctx = ExtractCtx {
            source: "TikTok".to_string(),
            ledger: std::sync::Arc::new(crate::ledger::CrawlLedger::open_in_memory(3).unwrap()),
            metrics: std::sync::Arc::new(soma_core::MetricsCollector::new(
                "run",
                "TikTok",
                PipelineType::StreamProcessing,
            )),
            force: false,
            max_items: None,
            max_attempts: 1,
            retry_base: std::time::Duration::from_millis(1),
        };
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        adapter
            .extract(tx, ctx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ExtractMsg::Eos)));
    }

    #[test]
    fn social_profile_selects_emoji_filtering() {
        let cfg = AppConfig::default();
        let run = RunContext::new("tiktok", None, false);
        let adapter = TikTokAdapter::new(&cfg, &run).unwrap();
        assert_eq!(adapter.filter_profile(), FilterProfile::Social);
    }
}
