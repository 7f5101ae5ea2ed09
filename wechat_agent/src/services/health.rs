use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::repository::{SourceHealth, SourceRepository};
use crate::schemas::SourceCandidate;
use crate::types::{ErrorKind, FetchStatus, HealthState};

/// Weight split of the rolling health score. The defaults are the tested
/// values.
#[derive(Debug, Clone, Copy)]
pub struct HealthWeights {
    pub success_rate: f64,
    pub latency: f64,
    pub freshness: f64,
    pub coverage: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            success_rate: 0.45,
            latency: 0.25,
            freshness: 0.20,
            coverage: 0.10,
        }
    }
}

/// Per-candidate circuit breaker backed by the fetch-attempt log.
///
/// When consecutive failures reach the threshold the circuit opens and the
/// candidate is skipped until the cooldown elapses; the next caller then
/// moves it to half-open and gets one probe through.
pub struct SourceHealthService {
    repo: SourceRepository,
    fail_threshold: i64,
    cooldown_minutes: i64,
    weights: HealthWeights,
    // Circuit checks and attempt bookkeeping share this lock so threshold
    // arithmetic cannot interleave across concurrent subscriptions.
    lock: Mutex<()>,
}

impl SourceHealthService {
    pub fn new(repo: SourceRepository, fail_threshold: i64, cooldown_minutes: i64) -> Self {
        Self::with_weights(repo, fail_threshold, cooldown_minutes, HealthWeights::default())
    }

    pub fn with_weights(
        repo: SourceRepository,
        fail_threshold: i64,
        cooldown_minutes: i64,
        weights: HealthWeights,
    ) -> Self {
        Self {
            repo,
            fail_threshold: fail_threshold.max(1),
            cooldown_minutes: cooldown_minutes.max(1),
            weights,
            lock: Mutex::new(()),
        }
    }

    pub async fn load_health_map(
        &self,
        subscription_id: i64,
    ) -> Result<HashMap<(String, String), SourceHealth>> {
        let rows = self.repo.load_health_map(subscription_id).await?;
        Ok(rows
            .into_iter()
            .map(|row| ((row.provider.clone(), row.source_url.clone()), row))
            .collect())
    }

    /// True while the circuit is open and cooling down. Once the cooldown has
    /// elapsed the state moves to half-open and the caller proceeds with one
    /// probe, without extra I/O here.
    pub async fn should_skip_for_circuit(
        &self,
        candidate: &SourceCandidate,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let Some(mut health) = self
            .repo
            .get_health(candidate.subscription_id, &candidate.provider, &candidate.url)
            .await?
        else {
            return Ok(false);
        };
        if health.state != HealthState::Open {
            return Ok(false);
        }
        if health.cooldown_until.is_some_and(|until| until > now) {
            return Ok(true);
        }
        debug!(
            "circuit for {} {} entering half-open after cooldown",
            candidate.provider, candidate.url
        );
        health.state = HealthState::HalfOpen;
        health.updated_at = now;
        self.repo.save_health(&health).await?;
        Ok(false)
    }

    /// Append a fetch attempt and update the health row atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_attempt(
        &self,
        sync_run_id: i64,
        candidate: &SourceCandidate,
        status: FetchStatus,
        latency_ms: i64,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
        http_code: Option<i64>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        self.repo
            .insert_attempt(
                sync_run_id,
                candidate,
                status,
                http_code,
                latency_ms,
                error_kind,
                error_message,
                now,
            )
            .await?;

        let mut health = self.repo.get_or_create_health(candidate, now).await?;
        match status {
            FetchStatus::Success => {
                health.consecutive_failures = 0;
                health.state = HealthState::Closed;
                health.cooldown_until = None;
                health.last_ok_at = Some(now);
                health.last_error = None;
            }
            FetchStatus::Failed => {
                health.consecutive_failures += 1;
                health.last_error = error_message.map(str::to_string);
                if health.consecutive_failures >= self.fail_threshold {
                    health.state = HealthState::Open;
                    health.cooldown_until = Some(now + Duration::minutes(self.cooldown_minutes));
                    warn!(
                        "circuit opened for {} {} after {} consecutive failures",
                        candidate.provider, candidate.url, health.consecutive_failures
                    );
                } else if health.state == HealthState::Open {
                    health.state = HealthState::HalfOpen;
                }
            }
            FetchStatus::Skipped => {}
        }
        health.updated_at = now;

        self.refresh_metrics(&mut health, now).await?;
        self.repo.save_health(&health).await?;
        Ok(())
    }

    /// Rolling 24 h metrics from the attempt log for this triple.
    async fn refresh_metrics(&self, health: &mut SourceHealth, now: DateTime<Utc>) -> Result<()> {
        let lower = now - Duration::hours(24);
        let samples = self
            .repo
            .window_attempts(health.subscription_id, &health.provider, &health.source_url, lower)
            .await?;

        if samples.is_empty() {
            health.success_rate_24h = 0.0;
            health.avg_latency_ms = 0.0;
            health.score = health.score.clamp(0.0, 100.0);
            return Ok(());
        }

        let total = samples.len() as f64;
        let success = samples
            .iter()
            .filter(|s| s.status == FetchStatus::Success)
            .count() as f64;
        let avg_latency =
            samples.iter().map(|s| s.latency_ms.max(0) as f64).sum::<f64>() / total;
        let success_rate = success / total;

        let freshness = match health.last_ok_at {
            None => 0.0,
            Some(last_ok) => {
                let age_hours = ((now - last_ok).num_seconds() as f64 / 3600.0).max(0.0);
                (1.0 - age_hours / 24.0).clamp(0.0, 1.0)
            }
        };
        let latency_norm = (avg_latency / 5000.0).clamp(0.0, 1.0);
        let coverage = (total / 7.0).clamp(0.0, 1.0);

        let score = 100.0
            * (self.weights.success_rate * success_rate
                + self.weights.latency * (1.0 - latency_norm)
                + self.weights.freshness * freshness
                + self.weights.coverage * coverage);

        health.success_rate_24h = success_rate;
        health.avg_latency_ms = avg_latency;
        health.score = score.clamp(0.0, 100.0);
        Ok(())
    }
}
