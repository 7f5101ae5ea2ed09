use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::schemas::RawArticle;
use crate::utils::html_text::{collapse_whitespace, strip_tags, unescape_entities};

// feed_rs normalizes structured dates but drops the original text, and may
// synthesize entry ids. Both the midnight marker and the external id depend
// on the source document, so item blocks are scanned in document order and
// paired with parsed entries by index.
static ENTRY_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:item|entry)[\s>].*?</(?:item|entry)\s*>").unwrap());
static DATE_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:pubDate|published|updated|dc:date)[^>]*>\s*(.*?)\s*</(?:pubDate|published|updated|dc:date)\s*>")
        .unwrap()
});
static ID_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:guid|id)[^>]*>\s*(.*?)\s*</(?:guid|id)\s*>").unwrap()
});
static MIDNIGHT_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)00:00(?::00)?(?:\s|$)").unwrap());

#[derive(Debug, Default, Clone)]
struct RawEntryHints {
    date_text: Option<String>,
    external_id: Option<String>,
}

/// Decode a feed document into normalized article records.
///
/// Unparseable input yields an empty sequence; the caller treats that as
/// PARSE_EMPTY.
pub fn parse_feed(content: &str, source_url: &str, source_name: Option<&str>) -> Vec<RawArticle> {
    let feed = match feed_rs::parser::parse(content.as_bytes()) {
        Ok(feed) => feed,
        Err(err) => {
            tracing::debug!("feed parse failed for {}: {}", source_url, err);
            return Vec::new();
        }
    };

    let hints = extract_raw_hints(content, feed.entries.len());

    let mut results = Vec::with_capacity(feed.entries.len());
    for (idx, entry) in feed.entries.into_iter().enumerate() {
        let hint = hints.get(idx).cloned().unwrap_or_default();

        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        let url = entry
            .links
            .first()
            .map(|l| l.href.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| source_url.to_string());

        let published_at = entry
            .published
            .or(entry.updated)
            .or_else(|| hint.date_text.as_deref().and_then(parse_loose_datetime))
            .unwrap_or_else(Utc::now);

        let is_midnight_publish = hint
            .date_text
            .as_deref()
            .is_some_and(|text| MIDNIGHT_TEXT_RE.is_match(text));

        let excerpt = entry_excerpt(&entry);

        let external_id = hint
            .external_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{url}#{}", published_at.to_rfc3339()));

        let raw_hash = content_hash(&title, &url, &excerpt);

        results.push(RawArticle {
            external_id,
            title,
            url,
            published_at,
            content_excerpt: excerpt,
            raw_hash,
            source_name: source_name.map(str::to_string),
            is_midnight_publish,
        });
    }

    results
}

pub fn content_hash(title: &str, url: &str, excerpt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{title}|{url}|{excerpt}").as_bytes());
    hex::encode(hasher.finalize())
}

fn extract_raw_hints(content: &str, expected: usize) -> Vec<RawEntryHints> {
    let blocks: Vec<&str> = ENTRY_BLOCK_RE
        .find_iter(content)
        .map(|m| m.as_str())
        .collect();
    if blocks.len() != expected {
        return Vec::new();
    }
    blocks
        .into_iter()
        .map(|block| RawEntryHints {
            date_text: DATE_TAG_RE
                .captures(block)
                .map(|c| unescape_entities(c[1].trim())),
            external_id: ID_TAG_RE
                .captures(block)
                .map(|c| unescape_entities(strip_tags(c[1].trim()).trim()))
                .map(|id| id.trim().to_string()),
        })
        .collect()
}

/// Lenient date parsing for feeds whose timestamps feed_rs rejects.
/// Offset-less values are treated as UTC.
fn parse_loose_datetime(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, layout) {
            return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

fn entry_excerpt(entry: &feed_rs::model::Entry) -> String {
    let raw = entry
        .content
        .as_ref()
        .and_then(|c| c.body.as_deref())
        .filter(|body| !body.trim().is_empty())
        .map(str::to_string)
        .or_else(|| {
            entry
                .summary
                .as_ref()
                .map(|s| s.content.clone())
                .filter(|s| !s.trim().is_empty())
        })
        .unwrap_or_default();
    if raw.is_empty() {
        return raw;
    }
    collapse_whitespace(&strip_tags(&unescape_entities(&raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rss_doc(items: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>demo</title>{items}</channel></rss>"
        )
    }

    #[test]
    fn test_parse_basic_entry() {
        let doc = rss_doc(
            "<item><guid>guid-1</guid><title>标题一</title>\
             <link>https://mp.weixin.qq.com/s/abc</link>\
             <pubDate>Mon, 01 Jan 2024 08:30:00 +0000</pubDate>\
             <description>&lt;p&gt;正文 片段&lt;/p&gt;</description></item>",
        );
        let articles = parse_feed(&doc, "https://example.com/feed", Some("demo"));
        assert_eq!(articles.len(), 1);
        let article = &articles[0];
        assert_eq!(article.external_id, "guid-1");
        assert_eq!(article.title, "标题一");
        assert_eq!(article.url, "https://mp.weixin.qq.com/s/abc");
        assert_eq!(
            article.published_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 8, 30, 0).unwrap()
        );
        assert_eq!(article.content_excerpt, "正文 片段");
        assert!(!article.is_midnight_publish);
        assert_eq!(article.raw_hash.len(), 64);
    }

    #[test]
    fn test_midnight_marker_detected_from_raw_text() {
        let doc = rss_doc(
            "<item><title>t</title><link>https://example.com/a</link>\
             <pubDate>2024-01-01 00:00:00</pubDate></item>",
        );
        let articles = parse_feed(&doc, "https://example.com/feed", None);
        assert_eq!(articles.len(), 1);
        assert!(articles[0].is_midnight_publish);
        assert_eq!(
            articles[0].published_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_guid_falls_back_to_url_and_published() {
        let doc = rss_doc(
            "<item><title>t</title><link>https://example.com/a</link>\
             <pubDate>Mon, 01 Jan 2024 08:30:00 +0000</pubDate></item>",
        );
        let articles = parse_feed(&doc, "https://example.com/feed", None);
        assert_eq!(articles.len(), 1);
        assert_eq!(
            articles[0].external_id,
            format!(
                "https://example.com/a#{}",
                articles[0].published_at.to_rfc3339()
            )
        );
    }

    #[test]
    fn test_unparseable_input_yields_empty() {
        assert!(parse_feed("not xml at all", "https://example.com/feed", None).is_empty());
        assert!(parse_feed("", "https://example.com/feed", None).is_empty());
    }

    #[test]
    fn test_identical_content_hashes_match() {
        let doc = rss_doc(
            "<item><guid>g</guid><title>t</title><link>https://example.com/a</link>\
             <pubDate>Mon, 01 Jan 2024 08:30:00 +0000</pubDate><description>x</description></item>",
        );
        let first = parse_feed(&doc, "https://example.com/feed", None);
        let second = parse_feed(&doc, "https://example.com/feed", None);
        assert_eq!(first[0].raw_hash, second[0].raw_hash);
        assert_eq!(first[0].external_id, second[0].external_id);
    }
}
