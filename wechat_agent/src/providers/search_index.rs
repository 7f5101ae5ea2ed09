use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::debug;
use url::Url;

use super::{DiscoveryProvider, SEARCH_INDEX_CHANNEL};
use crate::http_client::HTML_ACCEPT;
use crate::schemas::DiscoveredArticleRef;
use crate::types::{ErrorKind, ProviderError};
use crate::utils::html_text::{strip_tags, unescape_entities};

/// Generic web engines tried in fixed order. The html endpoints render
/// results server-side, which keeps extraction to plain anchor scanning.
const SEARCH_ENGINES: [&str; 3] = [
    "https://duckduckgo.com/html/?q=",
    "https://html.duckduckgo.com/html/?q=",
    "https://www.bing.com/search?q=",
];

const INTER_REQUEST_DELAY_MS: u64 = 400;
const ANTI_BOT_MARKERS: [&str; 4] = ["antispider", "captcha", "too many requests", "rate limit"];

static ANCHOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<a[^>]+href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#).unwrap());
static EMBEDDED_MP_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://mp\.weixin\.qq\.com/s\?[^\s"'<>\\]+"#).unwrap());

/// Searches external web indexes for per-article links of one subscription
/// and day.
pub struct SearchIndexProvider {
    client: Client,
}

/// Canonicalize a result href to the platform's `mp.weixin.qq.com/s?...`
/// form, or reject it.
pub(crate) fn normalize_mp_link(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let mut href = unescape_entities(raw.trim()).trim().to_string();
    if href.starts_with("//") {
        href = format!("https:{href}");
    }
    if href.starts_with("/l/?") {
        // DuckDuckGo redirector: the real target rides in the uddg parameter.
        let wrapped = format!("https://duckduckgo.com{href}");
        if let Ok(parsed) = Url::parse(&wrapped) {
            if let Some((_, target)) = parsed.query_pairs().find(|(k, _)| k == "uddg") {
                href = target.into_owned();
            }
        }
    }
    href = href
        .trim_end_matches(['.', ',', ';', ')', '\'', '"', '。', '，', '）', '】'])
        .to_string();

    let parsed = Url::parse(&href).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    if !parsed
        .host_str()
        .is_some_and(|h| h.eq_ignore_ascii_case("mp.weixin.qq.com"))
    {
        return None;
    }
    if !parsed.path().starts_with("/s") {
        return None;
    }
    Some(href)
}

fn looks_anti_bot(body: &str) -> bool {
    let lowered = body.to_lowercase();
    ANTI_BOT_MARKERS.iter().any(|m| lowered.contains(m))
}

impl SearchIndexProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Engines are tried until one yields links; anti-bot interstitials skip
    /// to the next engine.
    pub async fn search_by_query(
        &self,
        query: &str,
        limit: usize,
        confidence_factor: f64,
    ) -> Result<Vec<DiscoveredArticleRef>, ProviderError> {
        let encoded = urlencoding::encode(query);
        let mut last_error: Option<ProviderError> = None;

        for (engine_idx, engine) in SEARCH_ENGINES.iter().enumerate() {
            if engine_idx > 0 {
                tokio::time::sleep(Duration::from_millis(INTER_REQUEST_DELAY_MS)).await;
            }
            let url = format!("{engine}{encoded}");
            let response = match self.client.get(&url).header(ACCEPT, HTML_ACCEPT).send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = Some(ProviderError::from_reqwest(&err));
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = Some(ProviderError::from_http_status(
                    response.status().as_u16(),
                    format!("search engine returned {}", response.status()),
                ));
                continue;
            }
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    last_error = Some(ProviderError::from_reqwest(&err));
                    continue;
                }
            };
            if looks_anti_bot(&body) {
                debug!("engine {engine} served an anti-bot page, skipping");
                last_error = Some(ProviderError::new(
                    ErrorKind::FetchBlocked,
                    "search engine served an anti-bot interstitial",
                ));
                continue;
            }

            let refs = self.extract_refs(&body, limit, confidence_factor);
            if !refs.is_empty() {
                return Ok(refs);
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    fn extract_refs(
        &self,
        body: &str,
        limit: usize,
        confidence_factor: f64,
    ) -> Vec<DiscoveredArticleRef> {
        let mut refs: Vec<DiscoveredArticleRef> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let mut rank = 0usize;
        for captures in ANCHOR_RE.captures_iter(body) {
            rank += 1;
            let Some(normalized) = normalize_mp_link(&captures[1]) else {
                continue;
            };
            if !seen.insert(normalized.clone()) {
                continue;
            }
            let title = strip_tags(&unescape_entities(&captures[2]))
                .trim()
                .to_string();
            let confidence =
                (1.0 - (rank.saturating_sub(1) as f64) * 0.1).max(0.2) * confidence_factor;
            refs.push(DiscoveredArticleRef {
                url: normalized,
                title_hint: (!title.is_empty()).then_some(title),
                published_at_hint: None,
                channel: SEARCH_INDEX_CHANNEL.to_string(),
                confidence,
            });
            if refs.len() >= limit {
                return refs;
            }
        }

        if refs.is_empty() {
            // Some engines inline results into scripts/JSON instead of
            // anchors; fall back to scanning for embedded platform links.
            let unescaped = body.replace("\\/", "/");
            for (idx, m) in EMBEDDED_MP_LINK_RE.find_iter(&unescaped).enumerate() {
                let Some(normalized) = normalize_mp_link(m.as_str()) else {
                    continue;
                };
                if !seen.insert(normalized.clone()) {
                    continue;
                }
                let confidence = (1.0 - (idx as f64) * 0.1).max(0.2) * confidence_factor * 0.9;
                refs.push(DiscoveredArticleRef {
                    url: normalized,
                    title_hint: None,
                    published_at_hint: None,
                    channel: SEARCH_INDEX_CHANNEL.to_string(),
                    confidence,
                });
                if refs.len() >= limit {
                    break;
                }
            }
        }

        refs
    }
}

#[async_trait]
impl DiscoveryProvider for SearchIndexProvider {
    fn name(&self) -> &'static str {
        SEARCH_INDEX_CHANNEL
    }

    async fn search(
        &self,
        subscription_name: &str,
        target_date: NaiveDate,
        extra_keywords: &[String],
        _session_token: Option<&str>,
    ) -> Result<Vec<DiscoveredArticleRef>, ProviderError> {
        let date = target_date.format("%Y-%m-%d");

        // Specific query first; a relaxed one only if it found nothing, with
        // correspondingly lower confidence.
        let mut attempts: Vec<(String, f64)> = Vec::new();
        if !extra_keywords.is_empty() {
            attempts.push((
                format!(
                    "site:mp.weixin.qq.com \"{subscription_name}\" {} {date}",
                    extra_keywords.join(" ")
                ),
                1.0,
            ));
            attempts.push((
                format!("site:mp.weixin.qq.com \"{subscription_name}\" {date}"),
                0.85,
            ));
        } else {
            attempts.push((
                format!("site:mp.weixin.qq.com \"{subscription_name}\" {date}"),
                1.0,
            ));
        }

        let mut last_error: Option<ProviderError> = None;
        for (query, factor) in attempts {
            match self.search_by_query(&query, 8, factor).await {
                Ok(refs) if !refs.is_empty() => {
                    let hint = target_date
                        .and_time(NaiveTime::MIN)
                        .and_utc();
                    return Ok(refs
                        .into_iter()
                        .map(|mut r| {
                            r.published_at_hint = Some(hint);
                            r
                        })
                        .collect());
                }
                Ok(_) => {}
                Err(err) => last_error = Some(err),
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rejects_foreign_hosts() {
        assert!(normalize_mp_link("https://example.com/s?x=1").is_none());
        assert!(normalize_mp_link("ftp://mp.weixin.qq.com/s?x=1").is_none());
        assert!(normalize_mp_link("https://mp.weixin.qq.com/about").is_none());
    }

    #[test]
    fn test_normalize_unwraps_redirector() {
        let wrapped = "/l/?kh=-1&uddg=https%3A%2F%2Fmp.weixin.qq.com%2Fs%3F__biz%3DabcD%26mid%3D1";
        let normalized = normalize_mp_link(wrapped).unwrap();
        assert!(normalized.starts_with("https://mp.weixin.qq.com/s?"));
        assert!(normalized.contains("__biz=abcD"));
    }

    #[test]
    fn test_normalize_fixes_protocol_relative_and_entities() {
        let link = "//mp.weixin.qq.com/s?__biz=x&amp;mid=2";
        let normalized = normalize_mp_link(link).unwrap();
        assert_eq!(normalized, "https://mp.weixin.qq.com/s?__biz=x&mid=2");
    }

    #[test]
    fn test_anchor_extraction_ranks_confidence() {
        let provider = SearchIndexProvider::new(Client::new());
        let body = r#"
            <a href="https://mp.weixin.qq.com/s?__biz=a&mid=1">first</a>
            <a href="https://other.example/x">noise</a>
            <a href="https://mp.weixin.qq.com/s?__biz=a&mid=2">second</a>
        "#;
        let refs = provider.extract_refs(body, 8, 1.0);
        assert_eq!(refs.len(), 2);
        assert!(refs[0].confidence > refs[1].confidence);
        assert_eq!(refs[0].title_hint.as_deref(), Some("first"));
    }

    #[test]
    fn test_embedded_link_fallback() {
        let provider = SearchIndexProvider::new(Client::new());
        let body = r#"<script>var data = {"u":"https:\/\/mp.weixin.qq.com\/s?__biz=z&mid=9"};</script>"#;
        let refs = provider.extract_refs(body, 8, 1.0);
        assert_eq!(refs.len(), 1);
        assert!(refs[0].url.contains("__biz=z"));
    }

    #[test]
    fn test_anti_bot_detection() {
        assert!(looks_anti_bot("<html>please solve this CAPTCHA</html>"));
        assert!(looks_anti_bot("Too Many Requests"));
        assert!(!looks_anti_bot("<html>normal results</html>"));
    }
}
