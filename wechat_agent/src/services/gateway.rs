use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use tracing::{debug, info};

use super::health::SourceHealthService;
use super::router::SourceRouter;
use crate::providers::{
    DIRECTORY_INDEX_PROVIDER, DIRECTORY_MIN_SCORE, MANUAL_PROVIDER, SourceProvider,
};
use crate::repository::{SourceRepository, Subscription};
use crate::schemas::{RawArticle, SourceCandidate, SourceFetchResult};
use crate::types::{ErrorKind, FetchStatus, ProviderError};

/// Composes providers, router and health into a failover fetch. Provider
/// failures are classified and recorded; they never escape as raw errors.
pub struct SourceGateway {
    providers: Vec<Arc<dyn SourceProvider>>,
    router: SourceRouter,
    health: Arc<SourceHealthService>,
    source_repo: SourceRepository,
    max_candidates: usize,
    retry_backoff_ms: u64,
}

impl SourceGateway {
    pub fn new(
        providers: Vec<Arc<dyn SourceProvider>>,
        router: SourceRouter,
        health: Arc<SourceHealthService>,
        source_repo: SourceRepository,
        max_candidates: usize,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            providers,
            router,
            health,
            source_repo,
            max_candidates: max_candidates.max(1),
            retry_backoff_ms,
        }
    }

    fn provider_by_name(&self, name: &str) -> Option<&Arc<dyn SourceProvider>> {
        self.providers.iter().find(|p| p.name() == name)
    }

    /// Discover through every provider, persist the candidates, merge in the
    /// stored active rows, and return them ranked.
    pub async fn discover_candidates(&self, sub: &Subscription) -> Result<Vec<SourceCandidate>> {
        self.source_repo
            .demote_legacy_manual(sub.id, MANUAL_PROVIDER)
            .await?;
        self.source_repo
            .deactivate_weak_directory_rows(sub.id, DIRECTORY_INDEX_PROVIDER, DIRECTORY_MIN_SCORE)
            .await?;

        let now = Utc::now();
        let mut dedup: HashMap<(String, String), SourceCandidate> = HashMap::new();
        for provider in &self.providers {
            for candidate in provider.discover(sub).await? {
                let key = (candidate.provider.clone(), candidate.url.clone());
                self.source_repo.upsert_candidate(&candidate, now).await?;
                match dedup.get(&key) {
                    Some(previous) if candidate.priority >= previous.priority => {}
                    _ => {
                        dedup.insert(key, candidate);
                    }
                }
            }
        }

        for row in self.source_repo.list_active(sub.id).await? {
            let key = (row.provider.clone(), row.source_url.clone());
            dedup.entry(key).or_insert_with(|| row.as_candidate());
        }

        let health = self.health.load_health_map(sub.id).await?;
        Ok(self.router.rank(sub, dedup.into_values().collect(), &health))
    }

    pub async fn fetch_with_failover(
        &self,
        sync_run_id: i64,
        sub: &Subscription,
        since: DateTime<Utc>,
    ) -> Result<SourceFetchResult> {
        let candidates = self.discover_candidates(sub).await?;
        if candidates.is_empty() {
            let placeholder = SourceCandidate {
                subscription_id: sub.id,
                provider: "none".to_string(),
                url: String::new(),
                priority: 999,
                is_pinned: false,
                confidence: 0.0,
                discovered_at: Some(Utc::now()),
                metadata_json: None,
            };
            return Ok(SourceFetchResult {
                ok: false,
                candidate: placeholder,
                articles: Vec::new(),
                latency_ms: 0,
                error_kind: Some(ErrorKind::NotFound),
                error_message: Some("no usable source candidates discovered".to_string()),
            });
        }

        let mut attempts = 0usize;
        let mut last_error_kind = ErrorKind::Unknown;
        let mut last_error_message = "unknown error".to_string();

        for candidate in &candidates {
            if attempts >= self.max_candidates {
                break;
            }
            attempts += 1;
            let Some(provider) = self.provider_by_name(&candidate.provider) else {
                continue;
            };

            if self
                .health
                .should_skip_for_circuit(candidate, Utc::now())
                .await?
            {
                self.health
                    .record_attempt(
                        sync_run_id,
                        candidate,
                        FetchStatus::Skipped,
                        0,
                        Some(ErrorKind::CircuitOpen),
                        Some("source circuit is cooling down"),
                        None,
                    )
                    .await?;
                continue;
            }

            let probe = provider.probe(candidate).await;
            if !probe.ok {
                last_error_kind = probe.error_kind.unwrap_or(ErrorKind::Unknown);
                last_error_message = probe
                    .error_message
                    .unwrap_or_else(|| "source probe failed".to_string());
                self.health
                    .record_attempt(
                        sync_run_id,
                        candidate,
                        FetchStatus::Failed,
                        probe.latency_ms,
                        Some(last_error_kind),
                        Some(&last_error_message),
                        probe.http_code.map(i64::from),
                    )
                    .await?;
                continue;
            }

            match self.fetch_with_retry(provider, candidate, since).await {
                Ok((articles, latency_ms)) => {
                    info!(
                        "fetched {} articles for {} via {} ({}ms)",
                        articles.len(),
                        sub.wechat_id,
                        candidate.provider,
                        latency_ms
                    );
                    self.health
                        .record_attempt(
                            sync_run_id,
                            candidate,
                            FetchStatus::Success,
                            latency_ms,
                            None,
                            None,
                            None,
                        )
                        .await?;
                    return Ok(SourceFetchResult {
                        ok: true,
                        candidate: candidate.clone(),
                        articles,
                        latency_ms,
                        error_kind: None,
                        error_message: None,
                    });
                }
                Err((error, latency_ms)) => {
                    last_error_kind = error.kind;
                    last_error_message = if error.message.is_empty() {
                        "fetch failed".to_string()
                    } else {
                        error.message.clone()
                    };
                    self.health
                        .record_attempt(
                            sync_run_id,
                            candidate,
                            FetchStatus::Failed,
                            latency_ms,
                            Some(error.kind),
                            Some(&last_error_message),
                            error.http_code.map(i64::from),
                        )
                        .await?;
                }
            }
        }

        Ok(SourceFetchResult {
            ok: false,
            candidate: candidates[0].clone(),
            articles: Vec::new(),
            latency_ms: 0,
            error_kind: Some(last_error_kind),
            error_message: Some(last_error_message),
        })
    }

    /// One bounded retry, and only for kinds where a second attempt can
    /// plausibly differ.
    async fn fetch_with_retry(
        &self,
        provider: &Arc<dyn SourceProvider>,
        candidate: &SourceCandidate,
        since: DateTime<Utc>,
    ) -> std::result::Result<(Vec<RawArticle>, i64), (ProviderError, i64)> {
        let started = Instant::now();
        for attempt in 0..2 {
            match provider.fetch(candidate, since).await {
                Ok(articles) => {
                    return Ok((articles, started.elapsed().as_millis() as i64));
                }
                Err(error) => {
                    let should_retry = error.kind.is_retryable() && attempt == 0;
                    if should_retry && self.retry_backoff_ms > 0 {
                        debug!(
                            "retrying {} after {:?}: {}",
                            candidate.url, error.kind, error.message
                        );
                        tokio::time::sleep(Duration::from_millis(self.retry_backoff_ms)).await;
                        continue;
                    }
                    return Err((error, started.elapsed().as_millis() as i64));
                }
            }
        }
        Err((
            ProviderError::new(ErrorKind::Unknown, "fetch failed"),
            started.elapsed().as_millis() as i64,
        ))
    }
}
