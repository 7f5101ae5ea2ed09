use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;

use super::{FeedClient, MANUAL_PROVIDER, SourceProvider};
use crate::repository::{SourceRepository, Subscription};
use crate::schemas::{ProbeResult, RawArticle, SourceCandidate};
use crate::types::{ProviderError, SourceMode};

/// Candidates the operator stored explicitly. In auto mode the subscription's
/// stand-alone `source_url` is ignored so legacy pins cannot resurrect; only
/// manual-mode subscriptions resurface it as a pinned candidate.
pub struct ManualSourceProvider {
    source_repo: SourceRepository,
    feed: FeedClient,
}

impl ManualSourceProvider {
    pub fn new(source_repo: SourceRepository, feed: FeedClient) -> Self {
        Self { source_repo, feed }
    }
}

#[async_trait]
impl SourceProvider for ManualSourceProvider {
    fn name(&self) -> &'static str {
        MANUAL_PROVIDER
    }

    async fn discover(&self, sub: &Subscription) -> Result<Vec<SourceCandidate>> {
        let rows = self
            .source_repo
            .list_active_by_provider(sub.id, MANUAL_PROVIDER)
            .await?;
        let mut candidates: Vec<SourceCandidate> = rows.iter().map(|r| r.as_candidate()).collect();

        if let Some(source_url) = sub.source_url.as_deref() {
            if sub.source_mode == SourceMode::Manual
                && !candidates.iter().any(|c| c.url == source_url)
            {
                candidates.push(SourceCandidate {
                    subscription_id: sub.id,
                    provider: MANUAL_PROVIDER.to_string(),
                    url: source_url.to_string(),
                    priority: 0,
                    is_pinned: true,
                    confidence: 1.0,
                    discovered_at: Some(Utc::now()),
                    metadata_json: Some("{\"legacy\":true}".to_string()),
                });
            }
        }

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
