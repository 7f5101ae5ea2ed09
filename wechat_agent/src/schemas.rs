use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DiscoveryStatus, ErrorKind};

/// A normalized article as produced by any acquisition path, before it is
/// persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArticle {
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub content_excerpt: String,
    pub raw_hash: String,
    pub source_name: Option<String>,
    pub is_midnight_publish: bool,
}

/// A (provider, url) pair believed to yield a subscription's feed.
#[derive(Debug, Clone)]
pub struct SourceCandidate {
    pub subscription_id: i64,
    pub provider: String,
    pub url: String,
    pub priority: i64,
    pub is_pinned: bool,
    pub confidence: f64,
    pub discovered_at: Option<DateTime<Utc>>,
    pub metadata_json: Option<String>,
}

/// Result of probing a candidate without fetching its full feed.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub http_code: Option<u16>,
}

impl ProbeResult {
    pub fn ok(latency_ms: i64) -> Self {
        Self {
            ok: true,
            latency_ms,
            error_kind: None,
            error_message: None,
            http_code: None,
        }
    }
}

/// Result of a failover fetch through the source gateway.
#[derive(Debug, Clone)]
pub struct SourceFetchResult {
    pub ok: bool,
    pub candidate: SourceCandidate,
    pub articles: Vec<RawArticle>,
    pub latency_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// A discovered per-article URL with hint metadata, produced before the full
/// article is fetched.
#[derive(Debug, Clone)]
pub struct DiscoveredArticleRef {
    pub url: String,
    pub title_hint: Option<String>,
    pub published_at_hint: Option<DateTime<Utc>>,
    pub channel: String,
    pub confidence: f64,
}

/// Outcome of the discovery orchestrator for one subscription.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    pub ok: bool,
    pub refs: Vec<DiscoveredArticleRef>,
    pub channel_used: Option<String>,
    pub status: DiscoveryStatus,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub latency_ms: i64,
}

/// Summary text plus the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutcome {
    pub summary_text: String,
    pub model: String,
    pub used_fallback: bool,
}

/// Mean embedding of recently read articles.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub vector: Vec<f64>,
    pub sample_size: usize,
}

/// Final recommendation score with its breakdown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecommendationScore {
    pub score: f64,
    pub topic_score: f64,
    pub freshness_score: f64,
}

/// Per-day acquisition coverage totals.
#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub date: NaiveDate,
    pub total_subs: i64,
    pub success_subs: i64,
    pub delayed_subs: i64,
    pub fail_subs: i64,
    pub coverage_ratio: f64,
    pub detail_json: String,
}

/// Per-subscription line inside a coverage report detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageDetail {
    pub name: String,
    pub wechat_id: String,
    pub status: String,
    pub error_kind: String,
}

/// One row of the day-scoped reader view.
#[derive(Debug, Clone)]
pub struct ArticleViewItem {
    pub article_id: i64,
    pub day_id: i64,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub is_read: bool,
    pub score: Option<f64>,
}
