use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use color_eyre::Result;

use crate::repository::{ArticleRepository, SubscriptionRepository, SyncRepository};
use crate::schemas::ArticleViewItem;
use crate::time_utils::local_day_bounds_utc;
use crate::types::{DiscoveryStatus, SyncItemStatus, ViewMode};

/// Deterministic bijection between small integers and one day's articles:
/// publish time descending, id ascending, enumerated from 1. Rebuilt on
/// demand; never persisted.
pub struct DayIndex {
    articles: ArticleRepository,
}

impl DayIndex {
    pub fn new(articles: ArticleRepository) -> Self {
        Self { articles }
    }

    pub async fn build_maps(
        &self,
        target_date: NaiveDate,
    ) -> Result<(HashMap<i64, i64>, HashMap<i64, i64>)> {
        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let ids = self.articles.day_ordered_ids(day_start, day_end).await?;
        let mut by_article_pk = HashMap::with_capacity(ids.len());
        let mut by_day_id = HashMap::with_capacity(ids.len());
        for (idx, article_id) in ids.into_iter().enumerate() {
            let day_id = idx as i64 + 1;
            by_article_pk.insert(article_id, day_id);
            by_day_id.insert(day_id, article_id);
        }
        Ok((by_article_pk, by_day_id))
    }

    pub async fn resolve(&self, target_date: NaiveDate, day_id: i64) -> Result<Option<i64>> {
        if day_id <= 0 {
            return Ok(None);
        }
        let (_, by_day_id) = self.build_maps(target_date).await?;
        Ok(by_day_id.get(&day_id).copied())
    }

    pub async fn resolve_many(
        &self,
        target_date: NaiveDate,
        day_ids: &[i64],
    ) -> Result<HashMap<i64, i64>> {
        let (_, by_day_id) = self.build_maps(target_date).await?;
        Ok(day_ids
            .iter()
            .filter_map(|day_id| by_day_id.get(day_id).map(|pk| (*day_id, *pk)))
            .collect())
    }

    /// Day-scoped reader rows in the requested ordering.
    pub async fn query_items(
        &self,
        target_date: NaiveDate,
        mode: ViewMode,
    ) -> Result<Vec<ArticleViewItem>> {
        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let rows = self.articles.view_rows(day_start, day_end).await?;
        let (by_article_pk, _) = self.build_maps(target_date).await?;

        let mut items: Vec<ArticleViewItem> = rows
            .into_iter()
            .map(|row| ArticleViewItem {
                article_id: row.id,
                day_id: by_article_pk.get(&row.id).copied().unwrap_or(0),
                source_name: row.source_name,
                published_at: row.published_at,
                title: row.title,
                url: row.url,
                summary: row.summary_text.unwrap_or_default(),
                is_read: row.is_read.unwrap_or(false),
                score: row.score,
            })
            .collect();

        match mode {
            ViewMode::Time => {}
            ViewMode::Recommend => {
                items.sort_by(|a, b| {
                    let sa = a.score.unwrap_or(f64::MIN);
                    let sb = b.score.unwrap_or(f64::MIN);
                    sb.partial_cmp(&sa)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.published_at.cmp(&a.published_at))
                });
            }
            ViewMode::Source => {
                items = round_robin_by_source(items);
            }
        }
        Ok(items)
    }
}

/// Interleave sources so one prolific channel cannot monopolize the top of
/// the view. Sources keep first-seen order; articles keep their order within
/// a source.
fn round_robin_by_source(items: Vec<ArticleViewItem>) -> Vec<ArticleViewItem> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, std::collections::VecDeque<ArticleViewItem>> = HashMap::new();
    for item in items {
        if !buckets.contains_key(&item.source_name) {
            order.push(item.source_name.clone());
        }
        buckets
            .entry(item.source_name.clone())
            .or_default()
            .push_back(item);
    }

    let mut result = Vec::new();
    loop {
        let mut emitted = false;
        for source in &order {
            if let Some(bucket) = buckets.get_mut(source) {
                if let Some(item) = bucket.pop_front() {
                    result.push(item);
                    emitted = true;
                }
            }
        }
        if !emitted {
            break;
        }
    }
    result
}

/// Per-run acquisition metrics for the status surface. Runs that used v2
/// discovery report `discover_*`; gateway runs report live/stale splits
/// derived from the items plus cached-article presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMetrics {
    Discovery {
        ok: i64,
        delayed: i64,
        failed: i64,
    },
    Live {
        ok: i64,
        failed: i64,
        stale_used: i64,
    },
}

pub struct RunStatus {
    articles: ArticleRepository,
    subs: SubscriptionRepository,
    sync_repo: SyncRepository,
}

impl RunStatus {
    pub fn new(
        articles: ArticleRepository,
        subs: SubscriptionRepository,
        sync_repo: SyncRepository,
    ) -> Self {
        Self {
            articles,
            subs,
            sync_repo,
        }
    }

    pub async fn run_metrics(&self, run_id: i64, target_date: NaiveDate) -> Result<RunMetrics> {
        let discovery_rows = self.sync_repo.discovery_runs_for(run_id).await?;
        if !discovery_rows.is_empty() {
            let mut ok = 0;
            let mut delayed = 0;
            let mut failed = 0;
            for row in discovery_rows {
                match row.status {
                    DiscoveryStatus::Success => ok += 1,
                    DiscoveryStatus::Delayed => delayed += 1,
                    _ => failed += 1,
                }
            }
            return Ok(RunMetrics::Discovery { ok, delayed, failed });
        }

        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let mut ok = 0;
        let mut failed = 0;
        let mut stale_used = 0;
        for item in self.sync_repo.items_for_run(run_id).await? {
            if item.status == SyncItemStatus::Success {
                ok += 1;
                continue;
            }
            failed += 1;
            let cached = self
                .articles
                .count_in_window(item.subscription_id, day_start, day_end)
                .await?;
            if cached > 0 {
                stale_used += 1;
            }
        }
        Ok(RunMetrics::Live {
            ok,
            failed,
            stale_used,
        })
    }

    /// New-article totals plus the successful subscriptions that produced
    /// nothing new.
    pub async fn new_article_stats(&self, run_id: i64) -> Result<(i64, Vec<String>)> {
        let items = self.sync_repo.items_for_run(run_id).await?;
        let mut new_total = 0;
        let mut quiet_sources = Vec::new();
        for item in items {
            new_total += item.new_count;
            if item.status == SyncItemStatus::Success && item.new_count == 0 {
                let sub = self.subs.get(item.subscription_id).await?;
                quiet_sources.push(sub.name);
            }
        }
        quiet_sources.sort();
        Ok((new_total, quiet_sources))
    }
}

/// Freshness lag of the newest article per subscription, in whole hours.
pub fn stale_hours(last_ok_at: Option<chrono::DateTime<Utc>>, now: chrono::DateTime<Utc>) -> Option<i64> {
    let last = last_ok_at?;
    Some(((now - last).num_seconds() / 3600).max(0))
}
