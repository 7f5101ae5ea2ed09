use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use reqwest::header::ACCEPT;
use tracing::debug;
use url::Url;

use super::{DIRECTORY_INDEX_PROVIDER, FeedClient, SourceProvider};
use crate::http_client::HTML_ACCEPT;
use crate::repository::Subscription;
use crate::schemas::{ProbeResult, RawArticle, SourceCandidate};
use crate::types::ProviderError;
use crate::utils::html_text::unescape_entities;

pub const DIRECTORY_MIN_SCORE: i64 = 6;

static ANCHOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<a href="(?P<url>https://wechat2rss\.xlab\.app/feed/[^"]+\.xml)"[^>]*>(?P<name>.*?)</a>"#)
        .unwrap()
});
static VITEPRESS_HASH_MAP_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)window\.__VP_HASH_MAP__=JSON\.parse\("(?P<data>.*?)"\);"#).unwrap()
});
static NON_NAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^0-9a-z一-鿿]").unwrap());
static ASCII_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]{3,}").unwrap());

#[derive(Debug, Clone)]
struct DirectoryItem {
    name: String,
    url: String,
    normalized_name: String,
}

/// Matches subscriptions against a cached external anchor-link index of
/// mirror feeds.
pub struct DirectoryIndexProvider {
    index_url: Option<String>,
    client: Client,
    feed: FeedClient,
    cache: Cache<String, Vec<DirectoryItem>>,
}

pub(crate) fn normalize_name(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    let no_ws: String = lowered.chars().filter(|c| !c.is_whitespace()).collect();
    NON_NAME_CHARS.replace_all(&no_ws, "").into_owned()
}

pub(crate) fn extract_ascii_tokens(value: &str) -> Vec<String> {
    let normalized = normalize_name(value);
    ASCII_TOKEN_RE
        .find_iter(&normalized)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn char_len(value: &str) -> i64 {
    value.chars().count() as i64
}

fn match_score(a: &str, b: &str) -> i64 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    if a == b {
        return 100;
    }
    if b.contains(a) || a.contains(b) {
        return char_len(a).min(char_len(b));
    }
    0
}

fn candidate_score(normalized_name: &str, normalized_id: &str, item_name: &str) -> i64 {
    let id_score = match_score(normalized_id, item_name);
    let name_score = match_score(normalized_name, item_name);

    // Subscriptions with an explicit identifier demand stronger matching to
    // avoid false positives.
    if !normalized_id.is_empty() && char_len(normalized_id) >= 4 && id_score < 4 {
        return 0;
    }
    if id_score.max(name_score) < DIRECTORY_MIN_SCORE {
        return 0;
    }
    id_score.max(name_score)
}

impl DirectoryIndexProvider {
    pub fn new(
        index_url: Option<String>,
        client: Client,
        feed: FeedClient,
        cache_ttl_seconds: u64,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(4)
            .time_to_live(Duration::from_secs(cache_ttl_seconds.max(60)))
            .build();
        Self {
            index_url,
            client,
            feed,
            cache,
        }
    }

    async fn load_items(&self, index_url: &str) -> Result<Vec<DirectoryItem>> {
        let owned_url = index_url.to_string();
        let client = self.client.clone();
        self.cache
            .try_get_with(owned_url.clone(), async move {
                fetch_items(&client, &owned_url).await
            })
            .await
            .map_err(|e| color_eyre::eyre::eyre!("directory index load failed: {e}"))
    }
}

async fn fetch_items(client: &Client, index_url: &str) -> Result<Vec<DirectoryItem>> {
    let body = client
        .get(index_url)
        .header(ACCEPT, HTML_ACCEPT)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;

    let mut items = extract_items(&body);
    if items.is_empty() {
        // VitePress renders the listing client-side; the anchors live in a
        // hashed asset module instead.
        for asset_url in extract_assets(index_url, &body) {
            let Ok(response) = client.get(&asset_url).send().await else {
                continue;
            };
            let Ok(response) = response.error_for_status() else {
                continue;
            };
            let Ok(asset_body) = response.text().await else {
                continue;
            };
            items = extract_items(&asset_body);
            if !items.is_empty() {
                break;
            }
        }
    }
    debug!("directory index yielded {} entries", items.len());
    Ok(items)
}

fn extract_items(text: &str) -> Vec<DirectoryItem> {
    let mut dedup: std::collections::HashMap<String, DirectoryItem> = std::collections::HashMap::new();
    for captures in ANCHOR_PATTERN.captures_iter(text) {
        let raw_name = unescape_entities(captures["name"].trim());
        let url = captures["url"].trim().to_string();
        if raw_name.is_empty() {
            continue;
        }
        let normalized = normalize_name(&raw_name);
        if normalized.is_empty() {
            continue;
        }
        dedup.insert(
            url.clone(),
            DirectoryItem {
                name: raw_name,
                url,
                normalized_name: normalized,
            },
        );
    }
    dedup.into_values().collect()
}

fn extract_assets(index_url: &str, index_html: &str) -> Vec<String> {
    let Some(captures) = VITEPRESS_HASH_MAP_PATTERN.captures(index_html) else {
        return Vec::new();
    };
    let escaped = &captures["data"];
    let Ok(decoded) = serde_json::from_str::<String>(&format!("\"{escaped}\"")) else {
        return Vec::new();
    };
    let Ok(hash_map) = serde_json::from_str::<serde_json::Value>(&decoded) else {
        return Vec::new();
    };
    let Some(hash) = hash_map.get("list_all.md").and_then(|v| v.as_str()) else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(index_url) else {
        return Vec::new();
    };
    ["js", "lean.js"]
        .iter()
        .filter_map(|suffix| {
            base.join(&format!("/assets/list_all.md.{hash}.{suffix}"))
                .ok()
                .map(String::from)
        })
        .collect()
}

#[async_trait]
impl SourceProvider for DirectoryIndexProvider {
    fn name(&self) -> &'static str {
        DIRECTORY_INDEX_PROVIDER
    }

    async fn discover(&self, sub: &Subscription) -> Result<Vec<SourceCandidate>> {
        let Some(index_url) = self.index_url.as_deref() else {
            return Ok(Vec::new());
        };
        let items = match self.load_items(index_url).await {
            Ok(items) => items,
            Err(err) => {
                debug!("directory discover skipped: {err}");
                return Ok(Vec::new());
            }
        };
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let normalized_name = normalize_name(&sub.name);
        let normalized_id = normalize_name(&sub.wechat_id);
        let mut ascii_tokens: Vec<String> = extract_ascii_tokens(&sub.name);
        ascii_tokens.extend(extract_ascii_tokens(&sub.wechat_id));
        ascii_tokens.sort();
        ascii_tokens.dedup();

        let mut ranked: Vec<(i64, &DirectoryItem)> = Vec::new();
        for item in &items {
            // Latin tokens are conjunctive: a candidate missing any of them
            // is never a match, however similar the CJK part looks.
            if !ascii_tokens.is_empty()
                && !ascii_tokens.iter().all(|t| item.normalized_name.contains(t))
            {
                continue;
            }
            let score = candidate_score(&normalized_name, &normalized_id, &item.normalized_name);
            if score <= 0 {
                continue;
            }
            ranked.push((score, item));
        }
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let now = Utc::now();
        let candidates = ranked
            .into_iter()
            .take(3)
            .enumerate()
            .map(|(idx, (score, item))| SourceCandidate {
                subscription_id: sub.id,
                provider: DIRECTORY_INDEX_PROVIDER.to_string(),
                url: item.url.clone(),
                priority: 60 + idx as i64,
                is_pinned: false,
                confidence: (score as f64 / 100.0).clamp(0.2, 0.95),
                discovered_at: Some(now),
                metadata_json: serde_json::to_string(
                    &serde_json::json!({ "name": item.name, "score": score }),
                )
                .ok(),
            })
            .collect();
        Ok(candidates)
    }

    async fn probe(&self, candidate: &SourceCandidate) -> ProbeResult {
        let (ok, latency_ms, error) = self.feed.probe(&candidate.url).await;
        if ok {
            return ProbeResult::ok(latency_ms);
        }
        let error = error.unwrap_or_else(|| ProviderError::from_message(""));
        ProbeResult {
            ok: false,
            latency_ms,
            error_kind: Some(error.kind),
            error_message: Some(error.message),
            http_code: error.http_code,
        }
    }

    async fn fetch(
        &self,
        candidate: &SourceCandidate,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError> {
        self.feed.fetch(&candidate.url, since).await
    }
}
