use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use color_eyre::Result;
use futures::StreamExt;
use futures::stream;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::discovery::DiscoveryOrchestrator;
use super::gateway::SourceGateway;
use super::recommender::Recommender;
use super::summarizer::Summarizer;
use crate::repository::{
    Article, ArticleRepository, SubscriptionRepository, SyncRepository, SyncRun, Subscription,
};
use crate::schemas::{DiscoveryOutcome, RawArticle, SourceFetchResult};
use crate::time_utils::local_day_bounds_utc;
use crate::types::{DiscoveryStatus, ErrorKind, SyncItemStatus};

static DATE_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());
const NOISE_TOKENS: [&str; 4] = ["关注前沿科技", "原创", "发布于", "发表于"];
const WEAK_TAIL_CHARS: [char; 6] = ['…', '，', '、', '；', '：', ':'];
const STRONG_TERMINATORS: [char; 6] = ['。', '！', '？', '!', '?', '.'];

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub incremental_sync_enabled: bool,
    pub sync_overlap_seconds: i64,
    pub max_concurrency: usize,
    pub discovery_v2_enabled: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            incremental_sync_enabled: true,
            sync_overlap_seconds: 120,
            max_concurrency: 5,
            discovery_v2_enabled: false,
        }
    }
}

enum Acquired {
    Gateway(SourceFetchResult),
    Discovery {
        outcome: DiscoveryOutcome,
        articles: Vec<RawArticle>,
    },
    Error(String),
}

struct SubOutcome {
    sub: Subscription,
    acquired: Acquired,
}

/// Per-day incremental orchestration across all subscriptions. Acquisition
/// runs with bounded concurrency; persistence is applied in subscription-id
/// order on the shared connection.
pub struct SyncEngine {
    subs: SubscriptionRepository,
    articles: ArticleRepository,
    sync_repo: SyncRepository,
    gateway: Arc<SourceGateway>,
    orchestrator: Option<Arc<DiscoveryOrchestrator>>,
    summarizer: Arc<Summarizer>,
    recommender: Arc<Recommender>,
    options: SyncOptions,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subs: SubscriptionRepository,
        articles: ArticleRepository,
        sync_repo: SyncRepository,
        gateway: Arc<SourceGateway>,
        orchestrator: Option<Arc<DiscoveryOrchestrator>>,
        summarizer: Arc<Summarizer>,
        recommender: Arc<Recommender>,
        options: SyncOptions,
    ) -> Self {
        Self {
            subs,
            articles,
            sync_repo,
            gateway,
            orchestrator,
            summarizer,
            recommender,
            options,
        }
    }

    pub async fn sync(
        &self,
        target_date: NaiveDate,
        trigger: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<SyncRun> {
        let run = self.sync_repo.create_run(trigger).await?;
        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let use_discovery = self.options.discovery_v2_enabled && self.orchestrator.is_some();

        if use_discovery {
            if let Some(orchestrator) = &self.orchestrator {
                orchestrator.reset_session_cache().await;
            }
        }

        let subscriptions = self.subs.list_by_id().await?;
        info!(
            "sync run {} started: {} subscriptions, target {}",
            run.id,
            subscriptions.len(),
            target_date
        );

        // Acquisition is network-bound and runs up to max_concurrency wide;
        // `buffered` keeps completion in input (subscription-id) order so the
        // bookkeeping below stays deterministic.
        let mut outcomes = stream::iter(subscriptions.into_iter().map(|sub| {
            let run_id = run.id;
            async move {
                let since = match self.since_for(sub.id, day_start).await {
                    Ok(since) => since,
                    Err(err) => return SubOutcome {
                        sub,
                        acquired: Acquired::Error(err.to_string()),
                    },
                };
                let acquired = if use_discovery {
                    self.acquire_via_discovery(&sub, target_date, since).await
                } else {
                    self.acquire_via_gateway(run_id, &sub, since).await
                };
                SubOutcome { sub, acquired }
            }
        }))
        .buffered(self.options.max_concurrency.max(1));

        let mut new_article_ids: Vec<i64> = Vec::new();
        let mut cancelled = false;
        while let Some(outcome) = outcomes.next().await {
            if cancel.is_some_and(|token| token.is_cancelled()) {
                cancelled = true;
                break;
            }
            let inserted = self
                .persist_outcome(run.id, outcome, day_start, day_end)
                .await?;
            new_article_ids.extend(inserted);
        }
        drop(outcomes);

        if cancelled {
            // Committed work stays; the run is left unfinished and marked.
            warn!("sync run {} cancelled", run.id);
            self.sync_repo
                .set_trigger(run.id, &format!("{trigger}:cancelled"))
                .await?;
            return self.sync_repo.get_run(run.id).await;
        }

        self.refresh_low_quality_summaries(&new_article_ids).await?;
        self.recommender.recompute_scores_for_date(target_date).await?;

        self.sync_repo.finish_run(run.id).await?;
        self.sync_repo.get_run(run.id).await
    }

    /// Incremental lower bound: never before the day start, overlapping the
    /// previous successful run to absorb clock skew between feeds.
    async fn since_for(&self, subscription_id: i64, day_start: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if !self.options.incremental_sync_enabled {
            return Ok(day_start);
        }
        let Some(last_finished) = self.sync_repo.last_success_finished_at(subscription_id).await?
        else {
            return Ok(day_start);
        };
        let overlapped = last_finished - Duration::seconds(self.options.sync_overlap_seconds);
        Ok(overlapped.max(day_start))
    }

    async fn acquire_via_gateway(
        &self,
        run_id: i64,
        sub: &Subscription,
        since: DateTime<Utc>,
    ) -> Acquired {
        match self.gateway.fetch_with_failover(run_id, sub, since).await {
            Ok(result) => Acquired::Gateway(result),
            Err(err) => Acquired::Error(err.to_string()),
        }
    }

    async fn acquire_via_discovery(
        &self,
        sub: &Subscription,
        target_date: NaiveDate,
        since: DateTime<Utc>,
    ) -> Acquired {
        let Some(orchestrator) = &self.orchestrator else {
            return Acquired::Error("discovery orchestrator not configured".to_string());
        };
        match orchestrator.discover(sub, target_date, since).await {
            Ok(outcome) if outcome.ok => {
                let articles = orchestrator.materialize(&outcome.refs, since).await;
                Acquired::Discovery { outcome, articles }
            }
            Ok(outcome) => Acquired::Discovery {
                outcome,
                articles: Vec::new(),
            },
            Err(err) => Acquired::Error(err.to_string()),
        }
    }

    async fn persist_outcome(
        &self,
        run_id: i64,
        outcome: SubOutcome,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        match outcome.acquired {
            Acquired::Gateway(result) => {
                self.persist_gateway_result(run_id, &outcome.sub, result).await
            }
            Acquired::Discovery { outcome: discovery, articles } => {
                self.persist_discovery_result(
                    run_id,
                    &outcome.sub,
                    discovery,
                    articles,
                    day_start,
                    day_end,
                )
                .await
            }
            Acquired::Error(message) => {
                // Per-subscription infrastructure failure; the run proceeds.
                warn!("subscription {} failed: {message}", outcome.sub.wechat_id);
                self.subs.mark_match_failed(outcome.sub.id, &message).await?;
                self.sync_repo
                    .insert_item(run_id, outcome.sub.id, SyncItemStatus::Failed, 0, Some(&message))
                    .await?;
                self.sync_repo.add_counts(run_id, 0, 1).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn persist_gateway_result(
        &self,
        run_id: i64,
        sub: &Subscription,
        result: SourceFetchResult,
    ) -> Result<Vec<i64>> {
        if !result.ok {
            let kind = result.error_kind.unwrap_or(ErrorKind::Unknown);
            let message = format!(
                "{kind}: {}",
                result.error_message.as_deref().unwrap_or("unknown error")
            );
            self.subs.mark_match_failed(sub.id, &message).await?;
            self.sync_repo
                .insert_item(run_id, sub.id, SyncItemStatus::Failed, 0, Some(&message))
                .await?;
            self.sync_repo.add_counts(run_id, 0, 1).await?;
            return Ok(Vec::new());
        }

        self.subs
            .mark_active(sub.id, &result.candidate.url, &result.candidate.provider)
            .await?;

        let mut inserted = Vec::new();
        for raw in &result.articles {
            if let Some(article_id) = self.upsert_article(sub.id, raw).await? {
                inserted.push(article_id);
            }
        }
        self.sync_repo
            .insert_item(run_id, sub.id, SyncItemStatus::Success, inserted.len() as i64, None)
            .await?;
        self.sync_repo.add_counts(run_id, 1, 0).await?;
        Ok(inserted)
    }

    async fn persist_discovery_result(
        &self,
        run_id: i64,
        sub: &Subscription,
        outcome: DiscoveryOutcome,
        articles: Vec<RawArticle>,
        day_start: DateTime<Utc>,
        day_end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if outcome.ok {
            let mut inserted = Vec::new();
            for raw in &articles {
                if let Some(article_id) = self.upsert_article(sub.id, raw).await? {
                    inserted.push(article_id);
                }
            }
            self.sync_repo
                .insert_discovery_run(
                    run_id,
                    sub.id,
                    outcome.channel_used.as_deref(),
                    DiscoveryStatus::Success,
                    outcome.refs.len() as i64,
                    None,
                    None,
                    outcome.latency_ms,
                )
                .await?;
            self.subs
                .set_discovery_status(sub.id, DiscoveryStatus::Success)
                .await?;
            self.sync_repo
                .insert_item(run_id, sub.id, SyncItemStatus::Success, inserted.len() as i64, None)
                .await?;
            self.sync_repo.add_counts(run_id, 1, 0).await?;
            return Ok(inserted);
        }

        // Nothing discovered today. If the day view can still be served from
        // already-acquired articles the subscription is merely delayed.
        let cached = self
            .articles
            .count_in_window(sub.id, day_start, day_end)
            .await?;
        let status = if cached > 0 {
            DiscoveryStatus::Delayed
        } else {
            DiscoveryStatus::Failed
        };
        let message = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "no article links discovered".to_string());

        self.sync_repo
            .insert_discovery_run(
                run_id,
                sub.id,
                outcome.channel_used.as_deref(),
                status,
                0,
                outcome.error_kind,
                Some(&message),
                outcome.latency_ms,
            )
            .await?;
        self.subs.set_discovery_status(sub.id, status).await?;
        self.sync_repo
            .insert_item(run_id, sub.id, SyncItemStatus::Failed, 0, Some(&message))
            .await?;
        self.sync_repo.add_counts(run_id, 0, 1).await?;
        Ok(Vec::new())
    }

    /// Insert-once semantics on (subscription, external_id): re-observations
    /// update mutable fields only and never produce a new row.
    async fn upsert_article(&self, subscription_id: i64, raw: &RawArticle) -> Result<Option<i64>> {
        if let Some(existing) = self
            .articles
            .get_by_external_id(subscription_id, &raw.external_id)
            .await?
        {
            self.articles.update_mutable_fields(&existing, raw).await?;
            return Ok(None);
        }

        let article_id = self.articles.insert(subscription_id, raw).await?;

        let summary = self.summarizer.summarize(raw).await;
        self.articles
            .upsert_summary(article_id, &summary.summary_text, &summary.model)
            .await?;

        let embedding_text = format!(
            "{}\n{}\n{}",
            raw.title, summary.summary_text, raw.content_excerpt
        )
        .trim()
        .to_string();
        self.recommender
            .ensure_article_embedding(article_id, &embedding_text)
            .await?;

        Ok(Some(article_id))
    }

    /// Re-summarize freshly-inserted articles whose summaries fail the
    /// quality tests.
    async fn refresh_low_quality_summaries(&self, article_ids: &[i64]) -> Result<()> {
        for &article_id in article_ids {
            let Some(article) = self.articles.get(article_id).await? else {
                continue;
            };
            let summary = self.articles.get_summary(article_id).await?;
            let keep = summary
                .as_ref()
                .is_some_and(|s| !needs_refresh(&s.summary_text, &s.model));
            if keep {
                continue;
            }

            let raw = raw_from_article(&article);
            let refreshed = self.summarizer.summarize(&raw).await;
            self.articles
                .upsert_summary(article_id, &refreshed.summary_text, &refreshed.model)
                .await?;
        }
        Ok(())
    }
}

fn raw_from_article(article: &Article) -> RawArticle {
    RawArticle {
        external_id: article.external_id.clone(),
        title: article.title.clone(),
        url: article.url.clone(),
        published_at: article.published_at,
        content_excerpt: article.content_excerpt.clone().unwrap_or_default(),
        raw_hash: article
            .raw_hash
            .clone()
            .unwrap_or_else(|| article.external_id.clone()),
        source_name: None,
        is_midnight_publish: false,
    }
}

/// Quality tests for stored summaries; any hit forces a re-summarize.
pub fn needs_refresh(summary_text: &str, model: &str) -> bool {
    let compact: String = summary_text.chars().filter(|c| !c.is_whitespace()).collect();
    let compact_len = compact.chars().count();
    if compact_len < 24 {
        return true;
    }
    if summary_text.contains('<') || summary_text.contains('>') {
        return true;
    }
    if DATE_TOKEN_RE.is_match(summary_text) && compact_len < 40 {
        return true;
    }
    if NOISE_TOKENS.iter().any(|t| summary_text.contains(t)) {
        return true;
    }
    let trimmed = summary_text.trim_end();
    if trimmed.ends_with("...")
        || trimmed
            .chars()
            .last()
            .is_some_and(|c| WEAK_TAIL_CHARS.contains(&c))
    {
        return true;
    }
    if model == "fallback" && compact_len >= 48 {
        let strong_ending = compact
            .chars()
            .last()
            .is_some_and(|c| STRONG_TERMINATORS.contains(&c));
        if !strong_ending {
            return true;
        }
    }
    false
}
