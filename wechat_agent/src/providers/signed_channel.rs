use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use reqwest::header::{ACCEPT, COOKIE, REFERER};
use serde_json::Value;

use super::{DiscoveryProvider, SIGNED_CHANNEL};
use crate::schemas::DiscoveredArticleRef;
use crate::types::{ErrorKind, ProviderError};

const SEARCH_URL: &str = "https://weread.qq.com/web/search/global";
const RESULT_LIMIT: usize = 6;

/// Searches the signed-in reading service. Results there link straight to
/// platform articles, which makes them the highest-confidence channel.
pub struct SignedChannelProvider {
    client: Client,
}

impl SignedChannelProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Accepts either a raw cookie string or a `{"cookie": ...}` JSON blob as
    /// pasted by the operator.
    pub fn parse_token_from_input(raw: &str) -> String {
        let text = raw.trim();
        if text.is_empty() {
            return String::new();
        }
        if text.starts_with('{') && text.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                if let Some(cookie) = value.get("cookie").and_then(|c| c.as_str()) {
                    let cookie = cookie.trim();
                    if !cookie.is_empty() {
                        return cookie.to_string();
                    }
                }
            }
        }
        text.to_string()
    }

    fn extract_mp_refs(&self, payload: &Value, limit: usize) -> Vec<DiscoveredArticleRef> {
        let mut refs: Vec<DiscoveredArticleRef> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        self.walk(payload, limit, &mut refs, &mut seen, false);
        refs
    }

    fn walk(
        &self,
        node: &Value,
        limit: usize,
        refs: &mut Vec<DiscoveredArticleRef>,
        seen: &mut std::collections::HashSet<String>,
        _keyed: bool,
    ) {
        if refs.len() >= limit {
            return;
        }
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    let lowered = key.to_lowercase();
                    if matches!(lowered.as_str(), "url" | "link" | "href") {
                        if let Value::String(s) = value {
                            self.push_ref(s, 0.85, refs, seen, limit);
                            continue;
                        }
                    }
                    self.walk(value, limit, refs, seen, false);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, limit, refs, seen, false);
                }
            }
            Value::String(s) => {
                self.push_ref(s, 0.75, refs, seen, limit);
            }
            _ => {}
        }
    }

    fn push_ref(
        &self,
        raw: &str,
        confidence: f64,
        refs: &mut Vec<DiscoveredArticleRef>,
        seen: &mut std::collections::HashSet<String>,
        limit: usize,
    ) {
        if refs.len() >= limit || !raw.contains("mp.weixin.qq.com/s") {
            return;
        }
        if !seen.insert(raw.to_string()) {
            return;
        }
        refs.push(DiscoveredArticleRef {
            url: raw.to_string(),
            title_hint: None,
            published_at_hint: None,
            channel: SIGNED_CHANNEL.to_string(),
            confidence,
        });
    }
}

#[async_trait]
impl DiscoveryProvider for SignedChannelProvider {
    fn name(&self) -> &'static str {
        SIGNED_CHANNEL
    }

    fn needs_session(&self) -> bool {
        true
    }

    async fn search(
        &self,
        subscription_name: &str,
        _target_date: NaiveDate,
        _extra_keywords: &[String],
        session_token: Option<&str>,
    ) -> Result<Vec<DiscoveredArticleRef>, ProviderError> {
        let Some(token) = session_token.filter(|t| !t.trim().is_empty()) else {
            return Err(ProviderError::new(
                ErrorKind::AuthExpired,
                "signed-in channel session is missing",
            ));
        };

        let url = format!(
            "{SEARCH_URL}?keyword={}",
            urlencoding::encode(subscription_name)
        );
        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json,text/plain,*/*")
            .header(COOKIE, token)
            .header(REFERER, "https://weread.qq.com/")
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ProviderError::with_code(
                ErrorKind::AuthExpired,
                status.as_u16(),
                "signed-in channel rejected the session",
            ));
        }
        if !status.is_success() {
            return Err(ProviderError::from_http_status(
                status.as_u16(),
                format!("signed-in channel search returned {status}"),
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        Ok(self.extract_mp_refs(&payload, RESULT_LIMIT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_from_json_blob() {
        assert_eq!(
            SignedChannelProvider::parse_token_from_input("{\"cookie\": \"wr_vid=1; wr_skey=2\"}"),
            "wr_vid=1; wr_skey=2"
        );
        assert_eq!(
            SignedChannelProvider::parse_token_from_input("  raw-cookie  "),
            "raw-cookie"
        );
        assert_eq!(SignedChannelProvider::parse_token_from_input(""), "");
    }

    #[test]
    fn test_extract_refs_from_nested_payload() {
        let provider = SignedChannelProvider::new(Client::new());
        let payload = serde_json::json!({
            "results": [
                {"title": "a", "url": "https://mp.weixin.qq.com/s?__biz=1"},
                {"nested": {"link": "https://mp.weixin.qq.com/s?__biz=2"}},
                {"other": "https://mp.weixin.qq.com/s?__biz=3"},
                {"noise": "https://example.com/x"},
            ]
        });
        let refs = provider.extract_mp_refs(&payload, 6);
        assert_eq!(refs.len(), 3);
        // Keyed url/link fields carry more confidence than bare strings.
        assert!((refs[0].confidence - 0.85).abs() < f64::EPSILON);
        assert!((refs[2].confidence - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_missing_session_is_auth_expired() {
        let provider = SignedChannelProvider::new(Client::new());
        let err = provider
            .search("号A", chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), &[], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
    }
}
