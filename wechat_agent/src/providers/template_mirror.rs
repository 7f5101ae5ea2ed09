use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use super::{FeedClient, SourceProvider, TEMPLATE_MIRROR_PROVIDER};
use crate::repository::Subscription;
use crate::schemas::{ProbeResult, RawArticle, SourceCandidate};
use crate::types::ProviderError;

/// One candidate per configured mirror template, `{wechat_id}` substituted,
/// ascending priority in template order.
pub struct TemplateMirrorProvider {
    templates: Vec<String>,
    feed: FeedClient,
}

impl TemplateMirrorProvider {
    pub fn new(templates: Vec<String>, feed: FeedClient) -> Self {
        Self { templates, feed }
    }
}

#[async_trait]
impl SourceProvider for TemplateMirrorProvider {
    fn name(&self) -> &'static str {
        TEMPLATE_MIRROR_PROVIDER
    }

    async fn discover(&self, sub: &Subscription) -> Result<Vec<SourceCandidate>> {
        let now = Utc::now();
        let candidates = self
            .templates
            .iter()
            .filter(|template| template.contains("{wechat_id}"))
            .enumerate()
            .map(|(idx, template)| {
                let url = template.replace("{wechat_id}", &sub.wechat_id);
                SourceCandidate {
                    subscription_id: sub.id,
                    provider: TEMPLATE_MIRROR_PROVIDER.to_string(),
                    url,
                    priority: 20 + idx as i64,
                    is_pinned: false,
                    confidence: 0.55,
                    discovered_at: Some(now),
                    metadata_json: serde_json::to_string(
                        &serde_json::json!({ "template": template }),
                    )
                    .ok(),
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{SubscriptionRepository, connect, migrate};
    use crate::types::SourceMode;

    #[tokio::test]
    async fn test_discover_substitutes_wechat_id() {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let subs = SubscriptionRepository::new(pool);
        let sub = subs
            .create("测试号", "gh_abc", SourceMode::Auto, None)
            .await
            .unwrap();

        let client = crate::http_client::build_client(5).unwrap();
        let provider = TemplateMirrorProvider::new(
            vec![
                "https://mirror-a.example/wechat/{wechat_id}".to_string(),
                "https://mirror-b.example/feeds/{wechat_id}.xml".to_string(),
                "https://broken.example/static".to_string(),
            ],
            FeedClient::new(client, 2),
        );

        let candidates = provider.discover(&sub).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].url, "https://mirror-a.example/wechat/gh_abc");
        assert_eq!(candidates[0].priority, 20);
        assert_eq!(candidates[1].priority, 21);
        assert!((candidates[0].confidence - 0.55).abs() < f64::EPSILON);
        assert!(!candidates[0].is_pinned);
    }
}
