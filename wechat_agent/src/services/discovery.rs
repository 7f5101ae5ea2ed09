use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use color_eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use reqwest::header::ACCEPT;
use sha1::{Digest, Sha1};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use super::vault::VaultSessions;
use crate::http_client::HTML_ACCEPT;
use crate::providers::{
    DiscoveryProvider, HISTORY_BACKTRACK_CHANNEL, SEARCH_INDEX_CHANNEL, SearchIndexProvider,
};
use crate::repository::{Subscription, SyncRepository};
use crate::schemas::{DiscoveredArticleRef, DiscoveryOutcome, RawArticle};
use crate::time_utils::shift_midnight_publish_time;
use crate::types::{DiscoveryStatus, ErrorKind, ProviderError};
use crate::utils::html_text::{
    collapse_whitespace, extract_element_text, strip_script_blocks, strip_tags, unescape_entities,
};

const HISTORY_REF_LIMIT: i64 = 30;
const HISTORY_QUERY_LIMIT: usize = 3;
const HISTORY_CONFIDENCE_CAP: f64 = 0.55;
const EXCERPT_CAP: usize = 2000;

static TITLE_META_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+property=["']og:title["'][^>]+content=["']([^"']+)["']"#).unwrap()
});
static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static CT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bct\s*=\s*"?(\d{10})"?"#).unwrap());
static PUBLISH_TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""publish_time"\s*:\s*"([^"]+)""#).unwrap());

/// Chains discovery providers for per-article links, backtracks through
/// historical refs when every provider comes up empty, and materializes the
/// discovered URLs into full articles.
pub struct DiscoveryOrchestrator {
    providers: Vec<Arc<dyn DiscoveryProvider>>,
    search_index: Arc<SearchIndexProvider>,
    sessions: Arc<VaultSessions>,
    session_provider: String,
    sync_repo: SyncRepository,
    client: Client,
    midnight_shift_days: i64,
    // The vault is touched at most once per run per provider name.
    session_cache: Mutex<HashMap<String, Option<String>>>,
}

impl DiscoveryOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: Vec<Arc<dyn DiscoveryProvider>>,
        search_index: Arc<SearchIndexProvider>,
        sessions: Arc<VaultSessions>,
        session_provider: impl Into<String>,
        sync_repo: SyncRepository,
        client: Client,
        midnight_shift_days: i64,
    ) -> Self {
        Self {
            providers,
            search_index,
            sessions,
            session_provider: session_provider.into(),
            sync_repo,
            client,
            midnight_shift_days,
            session_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Called once at the start of each sync run.
    pub async fn reset_session_cache(&self) {
        self.session_cache.lock().await.clear();
    }

    async fn session_token(&self) -> Result<Option<String>> {
        let mut cache = self.session_cache.lock().await;
        if let Some(cached) = cache.get(&self.session_provider) {
            return Ok(cached.clone());
        }
        let token = self.sessions.get_active(&self.session_provider).await?;
        cache.insert(self.session_provider.clone(), token.clone());
        Ok(token)
    }

    pub async fn discover(
        &self,
        sub: &Subscription,
        target_date: NaiveDate,
        _since: DateTime<Utc>,
    ) -> Result<DiscoveryOutcome> {
        let started = Instant::now();
        let mut last_error_kind = ErrorKind::SearchEmpty;
        let mut last_error_message = "no article links discovered".to_string();
        let mut all_refs: Vec<DiscoveredArticleRef> = Vec::new();
        let mut provider_notes: Vec<String> = Vec::new();

        for provider in &self.providers {
            let refs = match self.search_with_provider(provider, sub, target_date).await {
                Ok(refs) => refs,
                Err(error) => {
                    last_error_kind = error.kind;
                    last_error_message = error.message.clone();
                    provider_notes.push(format!("{}=error({})", provider.name(), error.kind));
                    continue;
                }
            };
            let filtered: Vec<DiscoveredArticleRef> =
                refs.into_iter().filter(|r| !r.url.is_empty()).collect();
            provider_notes.push(format!("{}={}", provider.name(), filtered.len()));
            if !filtered.is_empty() {
                all_refs = filtered;
                break;
            }
        }

        if all_refs.is_empty() {
            let history_refs = self.history_backtrack_refs(sub, target_date).await?;
            provider_notes.push(format!("history_backtrack={}", history_refs.len()));
            all_refs = history_refs;
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        if all_refs.is_empty() {
            let notes = provider_notes.join(", ");
            let error_message = if notes.is_empty() {
                last_error_message
            } else {
                format!("{last_error_message} ({notes})")
            };
            return Ok(DiscoveryOutcome {
                ok: false,
                refs: Vec::new(),
                channel_used: None,
                status: DiscoveryStatus::Failed,
                error_kind: Some(last_error_kind),
                error_message: Some(error_message),
                latency_ms,
            });
        }

        let mut dedup: HashMap<String, DiscoveredArticleRef> = HashMap::new();
        for article_ref in &all_refs {
            self.sync_repo.upsert_ref(sub.id, article_ref).await?;
            match dedup.get(&article_ref.url) {
                Some(previous) if article_ref.confidence <= previous.confidence => {}
                _ => {
                    dedup.insert(article_ref.url.clone(), article_ref.clone());
                }
            }
        }

        let mut refs: Vec<DiscoveredArticleRef> = dedup.into_values().collect();
        refs.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let channel_used = refs.first().map(|r| r.channel.clone());
        Ok(DiscoveryOutcome {
            ok: true,
            refs,
            channel_used,
            status: DiscoveryStatus::Success,
            error_kind: None,
            error_message: None,
            latency_ms,
        })
    }

    async fn search_with_provider(
        &self,
        provider: &Arc<dyn DiscoveryProvider>,
        sub: &Subscription,
        target_date: NaiveDate,
    ) -> std::result::Result<Vec<DiscoveredArticleRef>, ProviderError> {
        let token = if provider.needs_session() {
            match self.session_token().await {
                Ok(token) => token,
                Err(err) => {
                    return Err(ProviderError::new(ErrorKind::Unknown, err.to_string()));
                }
            }
        } else {
            None
        };

        let mut extra_keywords: Vec<String> = Vec::new();
        if provider.name() == SEARCH_INDEX_CHANNEL {
            let wechat_id = sub.wechat_id.trim();
            if !wechat_id.is_empty() && !wechat_id.starts_with("auto_") {
                extra_keywords.push(wechat_id.to_string());
            }
        }

        provider
            .search(&sub.name, target_date, &extra_keywords, token.as_deref())
            .await
    }

    /// Re-query the search index with channel identifiers mined from this
    /// subscription's previously discovered refs.
    async fn history_backtrack_refs(
        &self,
        sub: &Subscription,
        target_date: NaiveDate,
    ) -> Result<Vec<DiscoveredArticleRef>> {
        let urls = self.sync_repo.recent_ref_urls(sub.id, HISTORY_REF_LIMIT).await?;
        let mut biz_values: HashSet<String> = HashSet::new();
        for raw in &urls {
            let Ok(parsed) = Url::parse(raw) else { continue };
            if let Some((_, biz)) = parsed.query_pairs().find(|(k, _)| k == "__biz") {
                let biz = biz.trim().to_string();
                if !biz.is_empty() {
                    biz_values.insert(biz);
                }
            }
        }
        if biz_values.is_empty() {
            return Ok(Vec::new());
        }

        let mut sorted: Vec<String> = biz_values.into_iter().collect();
        sorted.sort();

        let mut refs: Vec<DiscoveredArticleRef> = Vec::new();
        for biz in sorted {
            let query = format!(
                "site:mp.weixin.qq.com __biz={biz} {}",
                target_date.format("%Y-%m-%d")
            );
            match self
                .search_index
                .search_by_query(&query, HISTORY_QUERY_LIMIT, 1.0)
                .await
            {
                Ok(found) => refs.extend(found),
                Err(err) => {
                    debug!("history backtrack query failed for {biz}: {err}");
                    continue;
                }
            }
        }
        for item in refs.iter_mut() {
            item.channel = HISTORY_BACKTRACK_CHANNEL.to_string();
            item.confidence = item.confidence.min(HISTORY_CONFIDENCE_CAP);
        }
        Ok(refs)
    }

    /// Fetch each discovered URL and turn it into a full article record.
    /// Unreachable or pre-`since` articles are dropped.
    pub async fn materialize(
        &self,
        refs: &[DiscoveredArticleRef],
        since: DateTime<Utc>,
    ) -> Vec<RawArticle> {
        let mut result = Vec::with_capacity(refs.len());
        for article_ref in refs {
            let Some(mut article) = self
                .fetch_article(&article_ref.url, article_ref.title_hint.as_deref())
                .await
            else {
                continue;
            };
            article.published_at = shift_midnight_publish_time(
                article.published_at,
                article.is_midnight_publish,
                self.midnight_shift_days,
            );
            if article.published_at < since {
                continue;
            }
            result.push(article);
        }
        result
    }

    async fn fetch_article(&self, url: &str, title_hint: Option<&str>) -> Option<RawArticle> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, HTML_ACCEPT)
            .send()
            .await
            .ok()?;
        let response = response.error_for_status().ok()?;
        let body = response.text().await.ok()?;

        let title = extract_title(&body, title_hint.unwrap_or("Untitled"));
        let (published_at, is_midnight) = extract_publish_time(&body);
        let excerpt = extract_excerpt(&body);
        let external_id = external_id_from_url(url);
        let raw_hash = crate::feed_parser::content_hash(&title, url, &excerpt);

        Some(RawArticle {
            external_id,
            title,
            url: url.to_string(),
            published_at,
            content_excerpt: excerpt,
            raw_hash,
            source_name: None,
            is_midnight_publish: is_midnight,
        })
    }
}

fn extract_title(html: &str, fallback: &str) -> String {
    if let Some(captures) = TITLE_META_RE.captures(html) {
        let title = unescape_entities(captures[1].trim());
        if !title.is_empty() {
            return title;
        }
    }
    if let Some(captures) = TITLE_RE.captures(html) {
        let title = collapse_whitespace(&unescape_entities(&captures[1]));
        let title = title
            .replace(" - 微信公众号", "")
            .replace("_微信公众平台", "")
            .trim()
            .to_string();
        if !title.is_empty() {
            return title;
        }
    }
    fallback.to_string()
}

/// Publish time from the page: the numeric `ct=` epoch when present, else the
/// textual `"publish_time"` field, else now. Also reports whether the local
/// wall-clock time is exactly midnight (the "unknown time" sentinel).
fn extract_publish_time(html: &str) -> (DateTime<Utc>, bool) {
    if let Some(captures) = CT_RE.captures(html) {
        if let Ok(timestamp) = captures[1].parse::<i64>() {
            if let Some(dt) = Utc.timestamp_opt(timestamp, 0).single() {
                let local_time = dt.with_timezone(&Local).format("%H:%M:%S").to_string();
                return (dt, local_time == "00:00:00");
            }
        }
    }
    if let Some(captures) = PUBLISH_TIME_RE.captures(html) {
        let raw = captures[1].trim();
        for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
                let is_midnight = naive.format("%H:%M:%S").to_string() == "00:00:00";
                let local = match Local.from_local_datetime(&naive) {
                    chrono::LocalResult::Single(dt) => dt,
                    chrono::LocalResult::Ambiguous(earliest, _) => earliest,
                    chrono::LocalResult::None => {
                        return (DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc), is_midnight);
                    }
                };
                return (local.with_timezone(&Utc), is_midnight);
            }
        }
    }
    (Utc::now(), false)
}

fn extract_excerpt(html: &str) -> String {
    let text = strip_script_blocks(html);
    let mut excerpt = extract_element_text(&text, Some("js_content"), None);
    if excerpt.is_empty() {
        excerpt = extract_element_text(&text, None, Some("article"));
    }
    if excerpt.is_empty() {
        excerpt = strip_tags(&text);
    }
    let cleaned = collapse_whitespace(&unescape_entities(&excerpt));
    cleaned.chars().take(EXCERPT_CAP).collect()
}

/// External id from the platform's query parameters, else a digest of the
/// URL itself.
fn external_id_from_url(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in parsed.query_pairs() {
            params.insert(key.into_owned(), value.into_owned());
        }
        let token = [
            params.get("__biz"),
            params.get("mid"),
            params.get("idx"),
            params.get("sn"),
        ]
        .iter()
        .map(|v| v.map(String::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join("|");
        let trimmed = token.trim_matches('|');
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_title_prefers_og_meta() {
        let html = r#"<head><meta property="og:title" content="元标题" />
                      <title>页面标题_微信公众平台</title></head>"#;
        assert_eq!(extract_title(html, "fallback"), "元标题");

        let html = "<head><title>页面标题_微信公众平台</title></head>";
        assert_eq!(extract_title(html, "fallback"), "页面标题");

        assert_eq!(extract_title("<p>no title</p>", "fallback"), "fallback");
    }

    #[test]
    fn test_extract_publish_time_from_ct_epoch() {
        let html = r#"<script>var ct = "1704103200";</script>"#;
        let (published, _midnight) = extract_publish_time(html);
        assert_eq!(published.timestamp(), 1_704_103_200);
    }

    #[test]
    fn test_extract_publish_time_textual() {
        let html = r#"{"publish_time": "2024-01-05 08:30:00"}"#;
        let (published, midnight) = extract_publish_time(html);
        assert!(!midnight);
        // The naive value is interpreted in the operator's zone.
        let local = published.with_timezone(&Local);
        assert_eq!(local.format("%H:%M:%S").to_string(), "08:30:00");
    }

    #[test]
    fn test_textual_midnight_flagged() {
        let html = r#"{"publish_time": "2024-01-05 00:00:00"}"#;
        let (_published, midnight) = extract_publish_time(html);
        assert!(midnight);
    }

    #[test]
    fn test_excerpt_prefers_js_content() {
        let html = r#"<body><div id="js_content"><p>正文第一段</p><p>第二段</p></div>
                      <article>别的内容</article></body>"#;
        assert_eq!(extract_excerpt(html), "正文第一段 第二段");

        let html = "<body><article><p>文章内容</p></article></body>";
        assert_eq!(extract_excerpt(html), "文章内容");
    }

    #[test]
    fn test_external_id_from_platform_params() {
        let url = "https://mp.weixin.qq.com/s?__biz=MzA3&mid=22&idx=1&sn=abc&chksm=x";
        assert_eq!(external_id_from_url(url), "MzA3|22|1|abc");

        let plain = "https://mp.weixin.qq.com/s/shortlink";
        let id = external_id_from_url(plain);
        assert_eq!(id.len(), 40);
        assert_eq!(id, external_id_from_url(plain));
    }
}
