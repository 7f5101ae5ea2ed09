use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::SqlitePool;

use crate::schemas::SourceCandidate;
use crate::types::{ErrorKind, FetchStatus, HealthState};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionSource {
    pub id: i64,
    pub subscription_id: i64,
    pub provider: String,
    pub source_url: String,
    pub priority: i64,
    pub is_pinned: bool,
    pub is_active: bool,
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
    pub metadata_json: Option<String>,
}

impl SubscriptionSource {
    pub fn as_candidate(&self) -> SourceCandidate {
        SourceCandidate {
            subscription_id: self.subscription_id,
            provider: self.provider.clone(),
            url: self.source_url.clone(),
            priority: self.priority,
            is_pinned: self.is_pinned,
            confidence: self.confidence,
            discovered_at: Some(self.discovered_at),
            metadata_json: self.metadata_json.clone(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SourceHealth {
    pub id: i64,
    pub subscription_id: i64,
    pub provider: String,
    pub source_url: String,
    pub state: HealthState,
    pub score: f64,
    pub success_rate_24h: f64,
    pub avg_latency_ms: f64,
    pub consecutive_failures: i64,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FetchAttempt {
    pub id: i64,
    pub sync_run_id: i64,
    pub subscription_id: i64,
    pub provider: String,
    pub source_url: String,
    pub status: FetchStatus,
    pub http_code: Option<i64>,
    pub latency_ms: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttemptSample {
    pub status: FetchStatus,
    pub latency_ms: i64,
}

#[derive(Clone)]
pub struct SourceRepository {
    pool: SqlitePool,
}

impl SourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // --- subscription_sources ---

    pub async fn upsert_candidate(&self, candidate: &SourceCandidate, now: DateTime<Utc>) -> Result<()> {
        let existing = sqlx::query_as::<_, SubscriptionSource>(
            r#"SELECT * FROM subscription_sources
               WHERE subscription_id = ? AND provider = ? AND source_url = ?"#,
        )
        .bind(candidate.subscription_id)
        .bind(&candidate.provider)
        .bind(&candidate.url)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"INSERT INTO subscription_sources
                           (subscription_id, provider, source_url, priority, is_pinned,
                            is_active, confidence, discovered_at, metadata_json)
                       VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)"#,
                )
                .bind(candidate.subscription_id)
                .bind(&candidate.provider)
                .bind(&candidate.url)
                .bind(candidate.priority)
                .bind(candidate.is_pinned)
                .bind(candidate.confidence)
                .bind(candidate.discovered_at.unwrap_or(now))
                .bind(&candidate.metadata_json)
                .execute(&self.pool)
                .await?;
            }
            Some(row) => {
                // Reactivate; pins are only ever strengthened here, and
                // metadata/discovered_at keep their last known value when the
                // candidate carries none.
                sqlx::query(
                    r#"UPDATE subscription_sources
                       SET priority = ?, is_active = 1, confidence = ?,
                           is_pinned = ?, metadata_json = ?, discovered_at = ?
                       WHERE id = ?"#,
                )
                .bind(candidate.priority)
                .bind(candidate.confidence)
                .bind(row.is_pinned || candidate.is_pinned)
                .bind(candidate.metadata_json.clone().or(row.metadata_json))
                .bind(candidate.discovered_at.unwrap_or(row.discovered_at))
                .bind(row.id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn list_active(&self, subscription_id: i64) -> Result<Vec<SubscriptionSource>> {
        Ok(sqlx::query_as::<_, SubscriptionSource>(
            r#"SELECT * FROM subscription_sources
               WHERE subscription_id = ? AND is_active = 1"#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_active_by_provider(
        &self,
        subscription_id: i64,
        provider: &str,
    ) -> Result<Vec<SubscriptionSource>> {
        Ok(sqlx::query_as::<_, SubscriptionSource>(
            r#"SELECT * FROM subscription_sources
               WHERE subscription_id = ? AND provider = ? AND is_active = 1"#,
        )
        .bind(subscription_id)
        .bind(provider)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn list_by_provider(
        &self,
        subscription_id: i64,
        provider: &str,
    ) -> Result<Vec<SubscriptionSource>> {
        Ok(sqlx::query_as::<_, SubscriptionSource>(
            r#"SELECT * FROM subscription_sources
               WHERE subscription_id = ? AND provider = ?"#,
        )
        .bind(subscription_id)
        .bind(provider)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Legacy manual pins (metadata `{"legacy":true}`) must not resurrect:
    /// unpin, deactivate, and push the priority out of contention.
    pub async fn demote_legacy_manual(&self, subscription_id: i64, provider: &str) -> Result<()> {
        let rows = self.list_by_provider(subscription_id, provider).await?;
        for row in rows {
            let metadata = row.metadata_json.as_deref().unwrap_or("");
            if !metadata.replace(' ', "").contains("\"legacy\":true") {
                continue;
            }
            sqlx::query(
                r#"UPDATE subscription_sources
                   SET is_pinned = 0, is_active = 0, priority = MAX(priority, 95)
                   WHERE id = ?"#,
            )
            .bind(row.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn deactivate_weak_directory_rows(
        &self,
        subscription_id: i64,
        provider: &str,
        min_score: i64,
    ) -> Result<()> {
        let rows = self.list_active_by_provider(subscription_id, provider).await?;
        for row in rows {
            let score = row
                .metadata_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|value| value.get("score").and_then(|s| s.as_i64()))
                .unwrap_or(0);
            if score < min_score {
                sqlx::query("UPDATE subscription_sources SET is_active = 0 WHERE id = ?")
                    .bind(row.id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    // --- source_health ---

    pub async fn get_health(
        &self,
        subscription_id: i64,
        provider: &str,
        source_url: &str,
    ) -> Result<Option<SourceHealth>> {
        Ok(sqlx::query_as::<_, SourceHealth>(
            r#"SELECT * FROM source_health
               WHERE subscription_id = ? AND provider = ? AND source_url = ?"#,
        )
        .bind(subscription_id)
        .bind(provider)
        .bind(source_url)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn get_or_create_health(
        &self,
        candidate: &SourceCandidate,
        now: DateTime<Utc>,
    ) -> Result<SourceHealth> {
        if let Some(existing) = self
            .get_health(candidate.subscription_id, &candidate.provider, &candidate.url)
            .await?
        {
            return Ok(existing);
        }
        sqlx::query(
            r#"INSERT INTO source_health
                   (subscription_id, provider, source_url, state, score, updated_at)
               VALUES (?, ?, ?, 'CLOSED', ?, ?)"#,
        )
        .bind(candidate.subscription_id)
        .bind(&candidate.provider)
        .bind(&candidate.url)
        .bind(candidate.confidence * 100.0)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let created = self
            .get_health(candidate.subscription_id, &candidate.provider, &candidate.url)
            .await?;
        created.ok_or_else(|| color_eyre::eyre::eyre!("source_health row vanished after insert"))
    }

    pub async fn save_health(&self, health: &SourceHealth) -> Result<()> {
        sqlx::query(
            r#"UPDATE source_health
               SET state = ?, score = ?, success_rate_24h = ?, avg_latency_ms = ?,
                   consecutive_failures = ?, cooldown_until = ?, last_ok_at = ?,
                   last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(health.state)
        .bind(health.score)
        .bind(health.success_rate_24h)
        .bind(health.avg_latency_ms)
        .bind(health.consecutive_failures)
        .bind(health.cooldown_until)
        .bind(health.last_ok_at)
        .bind(&health.last_error)
        .bind(health.updated_at)
        .bind(health.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_health_map(&self, subscription_id: i64) -> Result<Vec<SourceHealth>> {
        Ok(sqlx::query_as::<_, SourceHealth>(
            "SELECT * FROM source_health WHERE subscription_id = ?",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // --- fetch_attempts ---

    pub async fn insert_attempt(
        &self,
        sync_run_id: i64,
        candidate: &SourceCandidate,
        status: FetchStatus,
        http_code: Option<i64>,
        latency_ms: i64,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO fetch_attempts
                   (sync_run_id, subscription_id, provider, source_url, status,
                    http_code, latency_ms, error_kind, error_message, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(sync_run_id)
        .bind(candidate.subscription_id)
        .bind(&candidate.provider)
        .bind(&candidate.url)
        .bind(status)
        .bind(http_code)
        .bind(latency_ms.max(0))
        .bind(error_kind)
        .bind(error_message)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts for one candidate inside the rolling window, oldest first.
    pub async fn window_attempts(
        &self,
        subscription_id: i64,
        provider: &str,
        source_url: &str,
        lower: DateTime<Utc>,
    ) -> Result<Vec<AttemptSample>> {
        Ok(sqlx::query_as::<_, AttemptSample>(
            r#"SELECT status, latency_ms FROM fetch_attempts
               WHERE subscription_id = ? AND provider = ? AND source_url = ?
                 AND created_at >= ?
               ORDER BY id ASC"#,
        )
        .bind(subscription_id)
        .bind(provider)
        .bind(source_url)
        .bind(lower)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn attempts_for_run(&self, sync_run_id: i64) -> Result<Vec<FetchAttempt>> {
        Ok(sqlx::query_as::<_, FetchAttempt>(
            "SELECT * FROM fetch_attempts WHERE sync_run_id = ? ORDER BY id ASC",
        )
        .bind(sync_run_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
