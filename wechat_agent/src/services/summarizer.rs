use std::time::Duration;

use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::debug;

use crate::ai_client::AiClient;
use crate::schemas::{RawArticle, SummaryOutcome};
use crate::utils::html_text::{strip_script_blocks, strip_tags};

const FALLBACK_MODEL: &str = "fallback";
const MAX_SUMMARY_CHARS: usize = 50;
const MIN_SUMMARY_CHARS: usize = 30;
const SUPPLEMENT: &str = "建议阅读全文了解细节";
const DEFAULT_BASIS: &str = "文章信息较少，建议打开原文查看完整内容。";
const BODY_CACHE_TTL_SECS: u64 = 600;

static SUMMARY_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(摘要|概要|总结)\s*[:：]\s*").unwrap());
static SENTENCE_ENDS: [char; 4] = ['。', '！', '？', '；'];

/// Produces the ≤50-char Chinese summary for an article. Never fails: any
/// transport or model problem degrades to the excerpt-based fallback.
pub struct Summarizer {
    ai: Option<AiClient>,
    chat_model: String,
    client: Client,
    source_char_limit: usize,
    body_cache: Cache<String, String>,
}

impl Summarizer {
    pub fn new(
        ai: Option<AiClient>,
        chat_model: impl Into<String>,
        client: Client,
        source_char_limit: usize,
    ) -> Self {
        Self {
            ai,
            chat_model: chat_model.into(),
            client,
            source_char_limit,
            body_cache: Cache::builder()
                .max_capacity(256)
                .time_to_live(Duration::from_secs(BODY_CACHE_TTL_SECS))
                .build(),
        }
    }

    pub async fn summarize(&self, article: &RawArticle) -> SummaryOutcome {
        let Some(ai) = &self.ai else {
            return self.fallback(article);
        };

        let body = self.article_body(article).await;
        let capped: String = body.chars().take(self.source_char_limit).collect();
        let prompt = format!(
            "请将以下文章信息总结为30-50字中文短摘要，仅输出摘要本身。\n标题：{}\n正文：{}",
            article.title, capped
        );

        match ai
            .chat(&self.chat_model, "你是精炼的信息摘要助手。", &prompt, 120)
            .await
        {
            Ok(text) if !text.trim().is_empty() => SummaryOutcome {
                summary_text: normalize_summary(&text, &article.title),
                model: self.chat_model.clone(),
                used_fallback: false,
            },
            Ok(_) => self.fallback(article),
            Err(err) => {
                debug!("summary request degraded to fallback: {err}");
                self.fallback(article)
            }
        }
    }

    fn fallback(&self, article: &RawArticle) -> SummaryOutcome {
        let basis = if !article.content_excerpt.trim().is_empty() {
            article.content_excerpt.clone()
        } else if !article.title.trim().is_empty() {
            article.title.clone()
        } else {
            DEFAULT_BASIS.to_string()
        };
        SummaryOutcome {
            summary_text: normalize_summary(&basis, &article.title),
            model: FALLBACK_MODEL.to_string(),
            used_fallback: true,
        }
    }

    /// Full article text, cached per URL so the refresh pass does not
    /// re-download.
    async fn article_body(&self, article: &RawArticle) -> String {
        if article.url.is_empty() {
            return article.content_excerpt.clone();
        }
        if let Some(cached) = self.body_cache.get(&article.url).await {
            return cached;
        }
        let body = match self.fetch_body(&article.url).await {
            Some(text) if !text.trim().is_empty() => text,
            _ => article.content_excerpt.clone(),
        };
        self.body_cache.insert(article.url.clone(), body.clone()).await;
        body
    }

    async fn fetch_body(&self, url: &str) -> Option<String> {
        let response = self.client.get(url).send().await.ok()?;
        let response = response.error_for_status().ok()?;
        let html = response.text().await.ok()?;
        let text = strip_tags(&strip_script_blocks(&html));
        Some(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// Strip tags, quotes and summary-prefix markers, collapse whitespace, and
/// truncate at a sentence boundary when one lands close enough to the cap.
pub fn normalize_summary(text: &str, title: &str) -> String {
    let mut cleaned = compact(text);
    if cleaned.is_empty() {
        cleaned = compact(title);
    }
    if cleaned.is_empty() {
        cleaned = compact(DEFAULT_BASIS);
    }

    let chars: Vec<char> = cleaned.chars().collect();
    if chars.len() > MAX_SUMMARY_CHARS {
        let head: Vec<char> = chars[..MAX_SUMMARY_CHARS].to_vec();
        // Prefer ending on a sentence boundary instead of mid-clause.
        let cut = head
            .iter()
            .rposition(|c| SENTENCE_ENDS.contains(c))
            .filter(|idx| *idx + 1 >= MIN_SUMMARY_CHARS)
            .map(|idx| idx + 1)
            .unwrap_or(MAX_SUMMARY_CHARS);
        return head[..cut].iter().collect();
    }

    if chars.len() >= MIN_SUMMARY_CHARS {
        return cleaned;
    }

    let mut merged = cleaned;
    while merged.chars().count() < MIN_SUMMARY_CHARS {
        merged.push_str(SUPPLEMENT);
    }
    merged.chars().take(MAX_SUMMARY_CHARS).collect()
}

fn compact(text: &str) -> String {
    let no_tags = strip_tags(text);
    let no_angles: String = no_tags.chars().filter(|c| *c != '<' && *c != '>').collect();
    let no_quotes: String = no_angles
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’' | '「' | '」'))
        .collect();
    let trimmed = no_quotes.trim();
    let unprefixed = SUMMARY_PREFIX_RE.replace(trimmed, "");
    unprefixed.chars().filter(|c| !c.is_whitespace()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn article(excerpt: &str) -> RawArticle {
        RawArticle {
            external_id: "e1".to_string(),
            title: "测试标题".to_string(),
            url: String::new(),
            published_at: Utc::now(),
            content_excerpt: excerpt.to_string(),
            raw_hash: "h".to_string(),
            source_name: None,
            is_midnight_publish: false,
        }
    }

    fn summarizer() -> Summarizer {
        Summarizer::new(None, "fallback", Client::new(), 6000)
    }

    #[tokio::test]
    async fn test_fallback_when_no_model_configured() {
        let s = summarizer();
        let outcome = s
            .summarize(&article("这是一段足够长的正文内容，覆盖了本次更新的主要变化和背景说明，方便读者快速了解。"))
            .await;
        assert!(outcome.used_fallback);
        assert_eq!(outcome.model, "fallback");
        let len = outcome.summary_text.chars().count();
        assert!(len <= 50 && len >= 30, "unexpected length {len}");
    }

    #[tokio::test]
    async fn test_summary_has_no_markup_or_prefix() {
        let s = summarizer();
        let outcome = s
            .summarize(&article("摘要：<p>这段内容带着 标签 和 前缀，但应当在规整后消失，只保留干净的正文要点。</p>"))
            .await;
        assert!(!outcome.summary_text.contains('<'));
        assert!(!outcome.summary_text.contains('>'));
        assert!(!outcome.summary_text.starts_with("摘要"));
        assert!(!outcome.summary_text.is_empty());
    }

    #[test]
    fn test_normalize_truncates_at_sentence_boundary() {
        let long = "第一句话说明了背景情况并且相当长。第二句话补充了一些细节内容。第三句话继续展开论述并且一直写到超过五十个字符的位置去了";
        let normalized = normalize_summary(long, "t");
        assert!(normalized.chars().count() <= 50);
        assert!(normalized.ends_with('。'));
    }

    #[test]
    fn test_normalize_pads_short_text() {
        let normalized = normalize_summary("很短", "t");
        assert!(normalized.chars().count() >= 30);
        assert!(normalized.starts_with("很短"));
    }

    #[test]
    fn test_normalize_empty_falls_back_to_title() {
        let normalized = normalize_summary("", "标题内容");
        assert!(normalized.starts_with("标题内容"));
        assert!(!normalized.is_empty());
    }
}
