//! Archived-corpus adapter: Språkbanken Somali bundles.
//!
//! Reads a local bundle of corpus files (Språkbanken-style sentence XML or
//! plain text), emitting one record per sentence or paragraph as the format
//! dictates. `files_discovered`, `files_processed` and `records_extracted`
//! feed the file-processing success rates.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use glob::glob;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use soma_core::{
    AcquireOutcome, AppConfig, ExtractCtx, ExtractMsg, PipelineType, RawRecord, RecordTx,
    Register, RunContext, SourceAdapter, SourceDescriptor, SourceSettings, SourceType, WorkUnit,
};

const DEFAULT_BUNDLE_GLOB: &str = "data/external/sprakbanken/*";

pub fn sprakbanken_descriptor() -> SourceDescriptor {
    SourceDescriptor {
        name: "Språkbanken".to_string(),
        slug: "sprakbanken".to_string(),
        source_type: SourceType::Corpus,
        license: "CC-BY-4.0".to_string(),
        register: Register::Formal,
        domain: "sprakbanken.gu.se".to_string(),
    }
}

pub struct SprakbankenAdapter {
    descriptor: SourceDescriptor,
    settings: SourceSettings,
    _run: RunContext,
}

impl SprakbankenAdapter {
    pub fn new(cfg: &AppConfig, run: &RunContext) -> Result<Self> {
        let descriptor = sprakbanken_descriptor();
        let settings = cfg.source_settings(&descriptor.slug);
        Ok(Self {
            descriptor,
            settings,
            _run: run.clone(),
        })
    }

    fn bundle_glob(&self) -> String {
        match &self.settings.bundle_dir {
            Some(dir) if dir.contains('*') => dir.clone(),
            Some(dir) => format!("{}/*", dir.trim_end_matches('/')),
            None => DEFAULT_BUNDLE_GLOB.to_string(),
        }
    }

    fn open_file(path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("open corpus file {}", path.display()))?;
        if path.extension().is_some_and(|e| e == "gz") {
            Ok(Box::new(GzDecoder::new(BufReader::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    fn is_xml(path: &Path) -> bool {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        name.ends_with(".xml") || name.ends_with(".xml.gz")
    }

    /// Sentences from Språkbanken-style XML: `<sentence>` elements whose
    /// `<w>` children carry the tokens.
    fn parse_sentences(reader: impl Read) -> Result<Vec<String>> {
        let mut xml = Reader::from_reader(BufReader::new(reader));
        let mut buf = Vec::new();
        let mut sentences = Vec::new();
        let mut current: Option<Vec<String>> = None;
        let mut in_word = false;
        loop {
            match xml.read_event_into(&mut buf) {
                Ok(Event::Start(start)) => match start.name().as_ref() {
                    b"sentence" => current = Some(Vec::new()),
                    b"w" => in_word = true,
                    _ => {}
                },
                Ok(Event::Text(text)) => {
                    if in_word {
                        if let Some(words) = current.as_mut() {
                            let token = text.unescape().unwrap_or_default().trim().to_string();
                            if !token.is_empty() {
                                words.push(token);
                            }
                        }
                    }
                }
                Ok(Event::End(end)) => match end.name().as_ref() {
                    b"sentence" => {
                        if let Some(words) = current.take() {
                            if !words.is_empty() {
                                sentences.push(words.join(" "));
                            }
                        }
                    }
                    b"w" => in_word = false,
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => anyhow::bail!("corpus xml parse error: {e}"),
            }
            buf.clear();
        }
        Ok(sentences)
    }

    /// Paragraphs from plain text: blank-line-separated blocks.
    fn parse_paragraphs(mut reader: impl Read) -> Result<Vec<String>> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        Ok(content
            .split("\n\n")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for SprakbankenAdapter {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn pipeline_type(&self) -> PipelineType {
        PipelineType::FileProcessing
    }

    async fn discover(&mut self, _ctx: &ExtractCtx) -> Result<Vec<WorkUnit>> {
        let mut units = Vec::new();
        for entry in glob(&self.bundle_glob()).context("glob")? {
            let path = entry?;
            if path.is_file() {
                units.push(WorkUnit::opaque(path.display().to_string()));
            }
        }
        Ok(units)
    }

    async fn acquire(&mut self, _unit: &WorkUnit, _ctx: &ExtractCtx) -> AcquireOutcome {
        AcquireOutcome::Permanent(
            "corpus files are expanded into records by the extract stage".to_string(),
        )
    }

    async fn extract(
        &mut self,
        tx: RecordTx,
        ctx: ExtractCtx,
        cancel: CancellationToken,
    ) -> Result<()> {
        let units = self.discover(&ctx).await?;
        ctx.metrics.increment("files_discovered", units.len() as u64);
        if units.is_empty() {
            warn!(pattern = %self.bundle_glob(), "no corpus files matched");
        }

        let mut emitted = 0usize;
        'files: for unit in units {
            if cancel.is_cancelled() {
                break;
            }
            let path = PathBuf::from(&unit.id);
            let file_name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            let segments = Self::open_file(&path).and_then(|reader| {
                if Self::is_xml(&path) {
                    Self::parse_sentences(reader)
                } else {
                    Self::parse_paragraphs(reader)
                }
            });
            let segments = match segments {
                Ok(segments) => segments,
                Err(e) => {
                    warn!(file = %file_name, error = %e, "corpus file unreadable");
                    ctx.metrics.increment("file_errors", 1);
                    continue;
                }
            };

            ctx.metrics
                .increment("records_attempted", segments.len() as u64);
            for (index, text) in segments.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    break 'files;
                }
                if let Some(cap) = ctx.max_items {
                    if emitted >= cap {
                        info!(emitted, "max_items reached");
                        break 'files;
                    }
                }
                let record = RawRecord::new(text)
                    .with_meta("file", Value::String(file_name.clone()))
                    .with_meta("segment_index", Value::from(index as i64));
                emitted += 1;
                if tx.send(ExtractMsg::Record(record)).await.is_err() {
                    break 'files;
                }
            }
            ctx.metrics.increment("files_processed", 1);
        }

        let _ = tx.send(ExtractMsg::Eos).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use soma_core::MetricsCollector;

    const CORPUS_XML: &str = r#"<corpus>
  <sentence id="s1"><w>Soomaaliya</w><w>waa</w><w>waddan</w><w>.</w></sentence>
  <sentence id="s2"><w>Muqdisho</w><w>waa</w><w>caasimad</w><w>.</w></sentence>
  <sentence id="s3"></sentence>
</corpus>"#;

    fn test_ctx() -> ExtractCtx {
        ExtractCtx {
            source: "Språkbanken".to_string(),
            ledger: Arc::new(crate::ledger::CrawlLedger::open_in_memory(3).unwrap()),
            metrics: Arc::new(MetricsCollector::new(
                "run",
                "Språkbanken",
                PipelineType::FileProcessing,
            )),
            force: false,
            max_items: None,
            max_attempts: 3,
            retry_base: std::time::Duration::from_millis(10),
        }
    }

    #[test]
    fn xml_sentences_join_word_tokens() {
        let sentences = SprakbankenAdapter::parse_sentences(CORPUS_XML.as_bytes()).unwrap();
        assert_eq!(
            sentences,
            vec![
                "Soomaaliya waa waddan .".to_string(),
                "Muqdisho waa caasimad .".to_string(),
            ]
        );
    }

    #[test]
    fn plaintext_splits_on_blank_lines() {
        let text = "Cutub kowaad oo dheer.\n\nCutub labaad.\n\n\n\nCutub saddexaad.";
        let paragraphs = SprakbankenAdapter::parse_paragraphs(text.as_bytes()).unwrap();
        assert_eq!(paragraphs.len(), 3);
        assert_eq!(paragraphs[1], "Cutub labaad.");
    }

    #[tokio::test]
    async fn bundle_extract_counts_files_and_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bundle1.xml"), CORPUS_XML).unwrap();
        std::fs::write(
            dir.path().join("bundle2.txt"),
            "Qormo kowaad.\n\nQormo labaad.",
        )
        .unwrap();

        let mut cfg = AppConfig::default();
        let mut settings = SourceSettings::default();
        settings.bundle_dir = Some(dir.path().display().to_string());
        cfg.scraping.insert("sprakbanken".to_string(), settings);

        let run = RunContext::new("sprakbanken", None, false);
        let mut adapter = SprakbankenAdapter::new(&cfg, &run).unwrap();
        let ctx = test_ctx();
        let metrics = ctx.metrics.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        adapter
            .extract(tx, ctx, CancellationToken::new())
            .await
            .unwrap();

        let mut records = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                ExtractMsg::Record(r) => records.push(r),
                ExtractMsg::Eos => break,
            }
        }
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.source_url.is_none()));
        assert_eq!(metrics.counter("files_discovered"), 2);
        assert_eq!(metrics.counter("files_processed"), 2);
        assert_eq!(metrics.counter("records_attempted"), 4);
    }
}
