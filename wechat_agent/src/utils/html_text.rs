use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static SCRIPT_STYLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|noscript)[^>]*>.*?</(script|style|noscript)>").unwrap());
static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static NUMERIC_ENTITY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"&#(x?[0-9a-fA-F]+);").unwrap());

/// Replace every tag with a space so adjacent text nodes stay separated.
pub fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, " ").into_owned()
}

/// Drop script/style/noscript blocks wholesale.
pub fn strip_script_blocks(html: &str) -> String {
    SCRIPT_STYLE_RE.replace_all(html, " ").into_owned()
}

pub fn collapse_whitespace(text: &str) -> String {
    WS_RE.replace_all(text.trim(), " ").into_owned()
}

/// Decode the named entities that actually occur in feeds and article pages,
/// plus numeric references.
pub fn unescape_entities(text: &str) -> String {
    let mut out = NUMERIC_ENTITY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let body = &caps[1];
            let parsed = if let Some(hex) = body.strip_prefix('x').or_else(|| body.strip_prefix('X')) {
                u32::from_str_radix(hex, 16).ok()
            } else {
                body.parse::<u32>().ok()
            };
            parsed
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();
    for (entity, replacement) in [
        ("&nbsp;", " "),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
        ("&amp;", "&"),
    ] {
        out = out.replace(entity, replacement);
    }
    out
}

/// Text content of the first element matching `target_id` or `target_tag`,
/// via a depth-counting scan over the tag stream.
pub fn extract_element_text(html: &str, target_id: Option<&str>, target_tag: Option<&str>) -> String {
    let target_id = target_id.map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty());
    let target_tag = target_tag.map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty());
    if target_id.is_none() && target_tag.is_none() {
        return String::new();
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut capture_depth: i32 = 0;
    let mut cursor = 0usize;

    for tag in TAG_RE.find_iter(html) {
        if capture_depth > 0 {
            let text = &html[cursor..tag.start()];
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
        }
        cursor = tag.end();

        let token = tag.as_str();
        let inner = token.trim_start_matches('<').trim_end_matches('>').trim();
        if inner.starts_with('!') || inner.starts_with('?') {
            continue;
        }
        let is_closing = inner.starts_with('/');
        let is_self_closing = inner.ends_with('/');

        if is_closing {
            if capture_depth > 0 {
                capture_depth -= 1;
                if capture_depth == 0 {
                    break;
                }
            }
            continue;
        }
        if is_self_closing {
            continue;
        }

        let name = inner
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        if is_void_element(&name) {
            continue;
        }

        if capture_depth > 0 {
            capture_depth += 1;
            continue;
        }

        let hit_by_id = target_id
            .as_deref()
            .is_some_and(|id| tag_id_attr(inner).as_deref() == Some(id));
        let hit_by_tag = target_tag.as_deref() == Some(name.as_str());
        if hit_by_id || hit_by_tag {
            capture_depth = 1;
        }
    }

    chunks.join(" ").trim().to_string()
}

fn tag_id_attr(tag_inner: &str) -> Option<String> {
    static ID_ATTR_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"(?i)\bid\s*=\s*["']?([^"'\s>]+)"#).unwrap());
    ID_ATTR_RE
        .captures(tag_inner)
        .map(|c| c[1].trim().to_ascii_lowercase())
}

fn is_void_element(name: &str) -> bool {
    matches!(
        name,
        "br" | "img" | "hr" | "input" | "meta" | "link" | "source" | "area" | "base" | "col"
            | "embed" | "track" | "wbr"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_by_id() {
        let html = r#"<html><body><div id="js_content"><p>first</p><p>second <b>bold</b></p></div><div>other</div></body></html>"#;
        let text = extract_element_text(html, Some("js_content"), None);
        assert_eq!(text, "first second bold");
    }

    #[test]
    fn test_extract_by_tag_when_id_missing() {
        let html = "<body><article><p>story text</p></article><footer>ignored</footer></body>";
        let text = extract_element_text(html, Some("js_content"), None);
        assert_eq!(text, "");
        let text = extract_element_text(html, None, Some("article"));
        assert_eq!(text, "story text");
    }

    #[test]
    fn test_void_elements_do_not_unbalance_depth() {
        let html = r#"<div id="js_content">line one<br>line two<img src="x.png">end</div>"#;
        let text = extract_element_text(html, Some("js_content"), None);
        assert_eq!(text, "line one line two end");
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(unescape_entities("a &amp; b &#38; c"), "a & b & c");
        assert_eq!(unescape_entities("&lt;tag&gt;"), "<tag>");
        assert_eq!(unescape_entities("&#x4e2d;"), "中");
    }

    #[test]
    fn test_strip_script_blocks() {
        let html = "before<script>var x = '<p>not text</p>';</script>after";
        let cleaned = strip_script_blocks(html);
        assert!(!cleaned.contains("not text"));
        assert!(cleaned.contains("before"));
        assert!(cleaned.contains("after"));
    }
}
