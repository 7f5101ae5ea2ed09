use std::collections::HashMap;

use chrono::NaiveDate;
use color_eyre::Result;

use crate::repository::{CoverageRepository, SubscriptionRepository, SyncRepository};
use crate::schemas::{CoverageDetail, CoverageReport};
use crate::time_utils::local_day_bounds_utc;
use crate::types::DiscoveryStatus;

/// Computes per-day acquisition coverage from the most recent run's
/// discovery rows and persists the daily aggregate.
pub struct CoverageService {
    subs: SubscriptionRepository,
    sync_repo: SyncRepository,
    coverage_repo: CoverageRepository,
}

impl CoverageService {
    pub fn new(
        subs: SubscriptionRepository,
        sync_repo: SyncRepository,
        coverage_repo: CoverageRepository,
    ) -> Self {
        Self {
            subs,
            sync_repo,
            coverage_repo,
        }
    }

    pub async fn compute(&self, target_date: NaiveDate) -> Result<CoverageReport> {
        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let run = match self
            .sync_repo
            .latest_run_started_in(day_start, day_end)
            .await?
        {
            Some(run) => Some(run),
            None => self.sync_repo.latest_run().await?,
        };

        let subscriptions = self.subs.list_by_name().await?;
        let total = subscriptions.len() as i64;

        let mut status_by_sub: HashMap<i64, DiscoveryStatus> = HashMap::new();
        let mut error_kind_by_sub: HashMap<i64, String> = HashMap::new();
        if let Some(run) = &run {
            for row in self.sync_repo.discovery_runs_for(run.id).await? {
                status_by_sub.insert(row.subscription_id, row.status);
                if let Some(kind) = row.error_kind {
                    error_kind_by_sub.insert(row.subscription_id, kind.to_string());
                }
            }
        }

        let mut success_subs = 0i64;
        let mut delayed_subs = 0i64;
        let mut fail_subs = 0i64;
        let mut details: Vec<CoverageDetail> = Vec::with_capacity(subscriptions.len());
        let mut error_kind_counts: HashMap<String, i64> = HashMap::new();

        for sub in &subscriptions {
            // Subscriptions the run never reached count as failed.
            let status = status_by_sub
                .get(&sub.id)
                .copied()
                .unwrap_or(DiscoveryStatus::Failed);
            match status {
                DiscoveryStatus::Success => success_subs += 1,
                DiscoveryStatus::Delayed => delayed_subs += 1,
                _ => fail_subs += 1,
            }
            let error_kind = error_kind_by_sub.get(&sub.id).cloned().unwrap_or_default();
            if !error_kind.is_empty() {
                *error_kind_counts.entry(error_kind.clone()).or_insert(0) += 1;
            }
            details.push(CoverageDetail {
                name: sub.name.clone(),
                wechat_id: sub.wechat_id.clone(),
                status: status.to_string(),
                error_kind,
            });
        }

        let coverage_ratio = if total > 0 {
            (success_subs + delayed_subs) as f64 / total as f64
        } else {
            1.0
        };

        let detail_json = serde_json::json!({
            "subscriptions": details,
            "error_kind_counts": error_kind_counts,
        })
        .to_string();

        let report = CoverageReport {
            date: target_date,
            total_subs: total,
            success_subs,
            delayed_subs,
            fail_subs,
            coverage_ratio,
            detail_json,
        };
        self.coverage_repo.upsert_daily(&report).await?;
        Ok(report)
    }
}
