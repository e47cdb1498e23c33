// Keystone Tool Server — Web Research
// Domain-tiered search and allowlisted fetch. Trusted domains rank first
// in results; fetch refuses anything outside the trusted + reliable tiers.
// Both capabilities run behind sliding-hour rate limits with structured
// errors, and fetched pages are text-extracted and size-capped.

use crate::atoms::config::WebResearchConfig;
use crate::atoms::constants::{WEB_FETCH_MAX_BYTES, WEB_FETCH_TIMEOUT_SECS, WEB_SEARCH_MAX_RESULTS};
use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use url::Url;

// ── Domain tiering ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTier {
    Trusted,
    Reliable,
    Blocked,
    Unknown,
}

pub fn classify_domain(url: &str, cfg: &WebResearchConfig) -> DomainTier {
    let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_lowercase)) else {
        return DomainTier::Unknown;
    };
    let matches = |domains: &[String]| {
        domains
            .iter()
            .any(|d| host == d.to_lowercase() || host.ends_with(&format!(".{}", d.to_lowercase())))
    };
    if matches(&cfg.blocked_domains) {
        DomainTier::Blocked
    } else if matches(&cfg.trusted_domains) {
        DomainTier::Trusted
    } else if matches(&cfg.reliable_domains) {
        DomainTier::Reliable
    } else {
        DomainTier::Unknown
    }
}

// ── Rate limiting ──────────────────────────────────────────────────────────

/// Sliding-hour counter per key.
pub struct HourlyRateLimiter {
    limit: u32,
    events: Mutex<HashMap<String, Vec<Instant>>>,
}

impl HourlyRateLimiter {
    pub fn new(limit: u32) -> Self {
        HourlyRateLimiter { limit, events: Mutex::new(HashMap::new()) }
    }

    /// Record one use; error when the hour's budget is spent.
    pub fn check(&self, key: &str) -> EngineResult<()> {
        let mut events = self.events.lock();
        let window = events.entry(key.to_string()).or_default();
        let hour_ago = Instant::now() - Duration::from_secs(3600);
        window.retain(|t| *t > hour_ago);
        if window.len() as u32 >= self.limit {
            return Err(EngineError::Security(format!(
                "{key} rate limit reached ({}/hour)",
                self.limit
            )));
        }
        window.push(Instant::now());
        Ok(())
    }
}

// ── Search ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub tier: DomainTier,
}

/// Search transport, injectable for tests. The HTTP implementation scrapes
/// an HTML results page with the same extractor the fetch path uses.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> EngineResult<Vec<SearchResult>>;
}

pub struct HtmlSearchProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HtmlSearchProvider {
    pub fn new() -> Self {
        HtmlSearchProvider {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(WEB_FETCH_TIMEOUT_SECS))
                .user_agent("keystone-tools/0.1")
                .build()
                .unwrap_or_default(),
            endpoint: "https://html.duckduckgo.com/html/".to_string(),
        }
    }
}

impl Default for HtmlSearchProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchProvider for HtmlSearchProvider {
    async fn search(&self, query: &str, max_results: usize) -> EngineResult<Vec<SearchResult>> {
        let url = format!("{}?q={}", self.endpoint, urlencoding::encode(query));
        let body = self.client.get(&url).send().await?.text().await?;
        let doc = Html::parse_document(&body);
        let result_sel = Selector::parse("div.result").expect("static selector");
        let link_sel = Selector::parse("a.result__a").expect("static selector");
        let snippet_sel = Selector::parse("a.result__snippet").expect("static selector");

        let mut results = Vec::new();
        for element in doc.select(&result_sel).take(max_results * 2) {
            let Some(link) = element.select(&link_sel).next() else { continue };
            let Some(href) = link.value().attr("href") else { continue };
            let title = link.text().collect::<String>().trim().to_string();
            let snippet = element
                .select(&snippet_sel)
                .next()
                .map(|s| s.text().collect::<String>().trim().to_string())
                .unwrap_or_default();
            results.push(SearchResult {
                title,
                url: href.to_string(),
                snippet,
                tier: DomainTier::Unknown,
            });
        }
        Ok(results)
    }
}

/// Tier, filter, and rank raw results: blocked dropped, trusted first,
/// reliable second, unknown last, capped to the schema maximum.
pub fn rank_results(
    mut results: Vec<SearchResult>,
    cfg: &WebResearchConfig,
    max_results: usize,
) -> Vec<SearchResult> {
    for r in &mut results {
        r.tier = classify_domain(&r.url, cfg);
    }
    results.retain(|r| r.tier != DomainTier::Blocked);
    let rank = |t: DomainTier| match t {
        DomainTier::Trusted => 0,
        DomainTier::Reliable => 1,
        DomainTier::Unknown => 2,
        DomainTier::Blocked => 3,
    };
    results.sort_by_key(|r| rank(r.tier));
    results.truncate(max_results.clamp(1, WEB_SEARCH_MAX_RESULTS));
    results
}

// ── Fetch ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct FetchedPage {
    pub url: String,
    pub text: String,
    pub truncated: bool,
}

/// Extract readable text from an HTML document. Content elements are
/// collected first (paragraphs, headings, list items, blockquotes,
/// preformatted blocks, table cells); pages with none of those fall back
/// to a full walk that skips script, style, and noscript subtrees.
pub fn extract_text(html: &str) -> String {
    let doc = Html::parse_document(html);

    let mut paragraphs: Vec<String> = Vec::new();
    for sel_str in &["p", "h1", "h2", "h3", "h4", "h5", "h6", "li", "blockquote", "pre", "td"] {
        let sel = Selector::parse(sel_str).expect("static selector");
        for element in doc.select(&sel) {
            let text = element_text(&element);
            if !text.is_empty() {
                paragraphs.push(text);
            }
        }
    }
    if !paragraphs.is_empty() {
        paragraphs.dedup();
        return paragraphs.join("\n");
    }

    text_skipping_noise(&doc)
}

/// Joined, whitespace-normalized text of one element.
fn element_text(element: &scraper::ElementRef) -> String {
    let mut out = String::new();
    for node in element.text() {
        let trimmed = node.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out
}

/// Last-resort extraction for documents without content elements: every
/// text node except those under a noise tag.
fn text_skipping_noise(doc: &Html) -> String {
    let mut out = String::new();
    for node in doc.root_element().descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let in_noise = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|e| matches!(e.name(), "script" | "style" | "noscript"))
                .unwrap_or(false)
        });
        if in_noise {
            continue;
        }
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(trimmed);
    }
    out
}

pub async fn web_fetch(
    client: &reqwest::Client,
    url: &str,
    cfg: &WebResearchConfig,
) -> EngineResult<FetchedPage> {
    match classify_domain(url, cfg) {
        DomainTier::Trusted | DomainTier::Reliable => {}
        tier => {
            return Err(EngineError::Security(format!(
                "fetch refused: {url} is {tier:?}, only trusted/reliable domains are fetchable"
            )));
        }
    }
    let response = client
        .get(url)
        .timeout(Duration::from_secs(WEB_FETCH_TIMEOUT_SECS))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(EngineError::tool("web_fetch", format!("HTTP {}", response.status().as_u16())));
    }
    let bytes = response.bytes().await?;
    let truncated = bytes.len() > WEB_FETCH_MAX_BYTES;
    let slice = &bytes[..bytes.len().min(WEB_FETCH_MAX_BYTES)];
    let text = extract_text(&String::from_utf8_lossy(slice));
    info!("[tools] web_fetch {} ({} bytes, truncated={})", url, slice.len(), truncated);
    Ok(FetchedPage { url: url.to_string(), text, truncated })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> WebResearchConfig {
        WebResearchConfig::default()
    }

    #[test]
    fn test_domain_tiers() {
        let cfg = cfg();
        assert_eq!(classify_domain("https://en.wikipedia.org/wiki/Raven", &cfg), DomainTier::Trusted);
        assert_eq!(classify_domain("https://github.com/x/y", &cfg), DomainTier::Reliable);
        assert_eq!(
            classify_domain("https://example-content-farm.com/seo", &cfg),
            DomainTier::Blocked
        );
        assert_eq!(classify_domain("https://random-blog.net/post", &cfg), DomainTier::Unknown);
        assert_eq!(classify_domain("not a url", &cfg), DomainTier::Unknown);
    }

    #[test]
    fn test_rank_orders_and_drops_blocked() {
        let raw = vec![
            SearchResult { title: "farm".into(), url: "https://example-content-farm.com/a".into(), snippet: String::new(), tier: DomainTier::Unknown },
            SearchResult { title: "blog".into(), url: "https://random-blog.net/a".into(), snippet: String::new(), tier: DomainTier::Unknown },
            SearchResult { title: "wiki".into(), url: "https://en.wikipedia.org/a".into(), snippet: String::new(), tier: DomainTier::Unknown },
            SearchResult { title: "gh".into(), url: "https://github.com/a".into(), snippet: String::new(), tier: DomainTier::Unknown },
        ];
        let ranked = rank_results(raw, &cfg(), 10);
        let titles: Vec<&str> = ranked.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["wiki", "gh", "blog"]);
    }

    #[test]
    fn test_rank_caps_results() {
        let raw: Vec<SearchResult> = (0..30)
            .map(|i| SearchResult {
                title: format!("r{i}"),
                url: format!("https://en.wikipedia.org/{i}"),
                snippet: String::new(),
                tier: DomainTier::Unknown,
            })
            .collect();
        assert_eq!(rank_results(raw.clone(), &cfg(), 5).len(), 5);
        // max_results beyond the schema cap clamps to 10
        assert_eq!(rank_results(raw, &cfg(), 50).len(), 10);
    }

    #[test]
    fn test_rate_limiter() {
        let limiter = HourlyRateLimiter::new(3);
        for _ in 0..3 {
            limiter.check("web_search").unwrap();
        }
        assert!(limiter.check("web_search").is_err());
        // Separate keys have separate budgets
        limiter.check("web_fetch").unwrap();
    }

    #[test]
    fn test_extract_text_strips_markup() {
        let html = "<html><head><style>body{}</style></head><body><h1>Title</h1><p>Once upon a midnight dreary</p><script>var x=1;</script></body></html>";
        let text = extract_text(html);
        assert!(text.contains("Once upon a midnight dreary"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("body{}"));
    }

    #[test]
    fn test_extract_text_fallback_skips_noise_subtrees() {
        // No content elements at all: the fallback walk must still drop
        // script/style text while keeping bare body text.
        let html = "<html><body>plain words here<script>var hidden=1;</script><style>.x{}</style><noscript>enable js</noscript></body></html>";
        let text = extract_text(html);
        assert!(text.contains("plain words here"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains(".x{}"));
        assert!(!text.contains("enable js"));
    }

    #[tokio::test]
    async fn test_fetch_refuses_unknown_domain() {
        let client = reqwest::Client::new();
        let err = web_fetch(&client, "https://random-blog.net/post", &cfg()).await.unwrap_err();
        assert!(matches!(err, EngineError::Security(_)));
    }
}
