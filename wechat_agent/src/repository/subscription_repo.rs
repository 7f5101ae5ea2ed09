use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::SqlitePool;

use crate::types::{DiscoveryStatus, SourceMode, SourceStatus};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub name: String,
    pub wechat_id: String,
    pub source_url: Option<String>,
    pub source_status: SourceStatus,
    pub discovery_status: DiscoveryStatus,
    pub preferred_provider: Option<String>,
    pub source_mode: SourceMode,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        wechat_id: &str,
        source_mode: SourceMode,
        source_url: Option<&str>,
    ) -> Result<Subscription> {
        let now = Utc::now();
        let id = sqlx::query(
            r#"INSERT INTO subscriptions
                    (name, wechat_id, source_url, source_status, discovery_status,
                     source_mode, created_at, updated_at)
               VALUES (?, ?, ?, 'PENDING', 'PENDING', ?, ?, ?)
            "#,
        )
        .bind(name)
        .bind(wechat_id)
        .bind(source_url)
        .bind(source_mode)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get(id).await
    }

    pub async fn get(&self, id: i64) -> Result<Subscription> {
        Ok(
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn get_by_wechat_id(&self, wechat_id: &str) -> Result<Option<Subscription>> {
        Ok(
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE wechat_id = ?")
                .bind(wechat_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Deterministic processing order for sync runs.
    pub async fn list_by_id(&self) -> Result<Vec<Subscription>> {
        Ok(
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn list_by_name(&self) -> Result<Vec<Subscription>> {
        Ok(
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions ORDER BY name ASC")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn mark_active(
        &self,
        id: i64,
        source_url: &str,
        preferred_provider: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE subscriptions
               SET source_url = ?, preferred_provider = ?, source_status = 'ACTIVE',
                   last_error = NULL, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(source_url)
        .bind(preferred_provider)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_match_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"UPDATE subscriptions
               SET source_status = 'MATCH_FAILED', last_error = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_discovery_status(&self, id: i64, status: DiscoveryStatus) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET discovery_status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cascade removes sources, health rows, refs, articles and per-article
    /// children.
    pub async fn delete_by_wechat_id(&self, wechat_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE wechat_id = ?")
            .bind(wechat_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
