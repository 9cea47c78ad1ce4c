//! Polite HTTP acquisition: shared client, token-bucket rate limiting,
//! per-request politeness jitter, robots.txt, URL canonicalization.
//!
//! The fetcher is the only shared mutable state between an adapter's
//! workers besides the ledger; the token bucket serializes its own access
//! behind a mutex.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use soma_core::SourceSettings;

/// Research-identifying user agent sent with every request.
pub const USER_AGENT: &str =
    "soma-research-crawler/2.1 (Somali corpus research; +https://github.com/soma-project/soma)";

/// Query parameters pruned during canonicalization.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
    "ocid",
    "at_medium",
    "at_campaign",
];

/// Canonical form of a URL: fragment removed, scheme and host lower-cased,
/// tracking query parameters pruned. `None` when the input does not parse.
pub fn canonical_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw).ok()?;
    url.set_fragment(None);
    // Url lower-cases scheme and host on parse; rebuild the query without
    // tracking parameters.
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let query: String = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(Some(&query));
    }
    Some(url.to_string())
}

/// Token bucket refilled at `cap` tokens per hour with a one-minute burst
/// allowance, so requests pace out instead of front-loading the hour.
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_hour(cap: u32) -> Self {
        let capacity = f64::max(1.0, cap as f64 / 60.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: cap as f64 / 3600.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take one token; on failure returns how long to wait before
    /// retrying.
    fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Minimal robots.txt policy: the `*` and our own user-agent groups'
/// `Disallow` prefixes. Fetched and cached once per run; a missing or
/// unreadable file is permissive.
#[derive(Debug, Default, Clone)]
pub struct RobotsPolicy {
    disallow: Vec<String>,
}

impl RobotsPolicy {
    pub fn parse(body: &str) -> Self {
        let mut disallow = Vec::new();
        let mut group_applies = false;
        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    group_applies = value == "*"
                        || USER_AGENT
                            .to_ascii_lowercase()
                            .starts_with(&value.to_ascii_lowercase());
                }
                "disallow" if group_applies && !value.is_empty() => {
                    disallow.push(value.to_string());
                }
                _ => {}
            }
        }
        Self { disallow }
    }

    pub fn allows(&self, url: &str) -> bool {
        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        !self.disallow.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// Outcome of one fetch, already classified for retry handling.
#[derive(Debug)]
pub enum FetchResult {
    Ok {
        body: String,
        status: u16,
        content_length: u64,
    },
    NotFound,
    Transient(String),
    Permanent(String),
}

pub struct HttpFetcher {
    client: Client,
    bucket: Mutex<TokenBucket>,
    min_delay: Duration,
    max_delay: Duration,
    robots: std::sync::Mutex<Option<RobotsPolicy>>,
}

impl HttpFetcher {
    pub fn new(settings: &SourceSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_sec))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            bucket: Mutex::new(TokenBucket::per_hour(settings.max_requests_per_hour)),
            min_delay: Duration::from_secs_f64(settings.min_delay_sec),
            max_delay: Duration::from_secs_f64(settings.max_delay_sec.max(settings.min_delay_sec)),
            robots: std::sync::Mutex::new(None),
        })
    }

    /// Fetch and cache the host's robots.txt. Failure leaves the policy
    /// permissive.
    pub async fn load_robots(&self, base_url: &str) -> Result<()> {
        let robots_url = {
            let mut url = Url::parse(base_url).context("parse robots base url")?;
            url.set_path("/robots.txt");
            url.set_query(None);
            url
        };
        let policy = match self.client.get(robots_url.as_str()).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => RobotsPolicy::parse(&body),
                Err(e) => {
                    warn!(error = %e, "robots.txt body unreadable, staying permissive");
                    RobotsPolicy::default()
                }
            },
            Ok(resp) => {
                debug!(status = %resp.status(), "no robots.txt, staying permissive");
                RobotsPolicy::default()
            }
            Err(e) => {
                warn!(error = %e, "robots.txt fetch failed, staying permissive");
                RobotsPolicy::default()
            }
        };
        *self.robots.lock().expect("robots lock") = Some(policy);
        Ok(())
    }

    pub fn robots_allow(&self, url: &str) -> bool {
        self.robots
            .lock()
            .expect("robots lock")
            .as_ref()
            .map_or(true, |p| p.allows(url))
    }

    /// Wait for a rate-limit token, apply the politeness delay, then GET the
    /// URL as text.
    pub async fn fetch_text(&self, url: &str) -> FetchResult {
        self.acquire_slot().await;

        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                return if e.is_timeout() {
                    FetchResult::Transient(format!("timeout after {e}"))
                } else if e.is_connect() {
                    FetchResult::Transient(format!("connect error: {e}"))
                } else {
                    FetchResult::Permanent(format!("request error: {e}"))
                };
            }
        };

        let status = response.status();
        match status.as_u16() {
            200..=299 => match response.text().await {
                Ok(body) => FetchResult::Ok {
                    content_length: body.len() as u64,
                    status: status.as_u16(),
                    body,
                },
                Err(e) => FetchResult::Transient(format!("body read error: {e}")),
            },
            404 | 410 => FetchResult::NotFound,
            429 | 500..=599 => FetchResult::Transient(format!("http status {status}")),
            _ => FetchResult::Permanent(format!("http status {status}")),
        }
    }

    /// Block until the token bucket admits one request, then sleep the
    /// uniform politeness delay.
    async fn acquire_slot(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire() {
                    Ok(()) => break,
                    Err(wait) => wait,
                }
            };
            tokio::time::sleep(wait).await;
        }
        let delay = {
            let mut rng = rand::thread_rng();
            rng.gen_range(self.min_delay.as_secs_f64()..=self.max_delay.as_secs_f64())
        };
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }
}

/// Dedup a discovered URL list by canonical form, preserving first-seen
/// order.
pub fn dedup_canonical(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        if let Some(canonical) = canonical_url(&url) {
            if seen.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    out
}
