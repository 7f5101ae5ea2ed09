use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::SqlitePool;

use crate::schemas::DiscoveredArticleRef;
use crate::types::{DiscoveryStatus, ErrorKind, SyncItemStatus};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncRun {
    pub id: i64,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success_count: i64,
    pub fail_count: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SyncRunItem {
    pub id: i64,
    pub sync_run_id: i64,
    pub subscription_id: i64,
    pub status: SyncItemStatus,
    pub new_count: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DiscoveryRun {
    pub id: i64,
    pub sync_run_id: i64,
    pub subscription_id: i64,
    pub channel: Option<String>,
    pub status: DiscoveryStatus,
    pub ref_count: i64,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleRef {
    pub id: i64,
    pub subscription_id: i64,
    pub url: String,
    pub title_hint: Option<String>,
    pub published_at_hint: Option<DateTime<Utc>>,
    pub channel: String,
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SyncRepository {
    pool: SqlitePool,
}

impl SyncRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // --- sync runs ---

    pub async fn create_run(&self, trigger: &str) -> Result<SyncRun> {
        let id = sqlx::query(
            r#"INSERT INTO sync_runs ("trigger", started_at, success_count, fail_count)
               VALUES (?, ?, 0, 0)"#,
        )
        .bind(trigger)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.get_run(id).await
    }

    pub async fn get_run(&self, id: i64) -> Result<SyncRun> {
        Ok(
            sqlx::query_as::<_, SyncRun>("SELECT * FROM sync_runs WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn finish_run(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE sync_runs SET finished_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Counters only ever grow within a run.
    pub async fn add_counts(&self, id: i64, success: i64, fail: i64) -> Result<()> {
        sqlx::query(
            r#"UPDATE sync_runs
               SET success_count = success_count + ?, fail_count = fail_count + ?
               WHERE id = ?"#,
        )
        .bind(success)
        .bind(fail)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_trigger(&self, id: i64, trigger: &str) -> Result<()> {
        sqlx::query(r#"UPDATE sync_runs SET "trigger" = ? WHERE id = ?"#)
            .bind(trigger)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_run_started_in(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<SyncRun>> {
        Ok(sqlx::query_as::<_, SyncRun>(
            r#"SELECT * FROM sync_runs
               WHERE started_at >= ? AND started_at < ?
               ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn latest_run(&self) -> Result<Option<SyncRun>> {
        Ok(
            sqlx::query_as::<_, SyncRun>("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // --- run items ---

    pub async fn insert_item(
        &self,
        sync_run_id: i64,
        subscription_id: i64,
        status: SyncItemStatus,
        new_count: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sync_run_items
                   (sync_run_id, subscription_id, status, new_count, error_message)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(sync_run_id)
        .bind(subscription_id)
        .bind(status)
        .bind(new_count)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn items_for_run(&self, sync_run_id: i64) -> Result<Vec<SyncRunItem>> {
        Ok(sqlx::query_as::<_, SyncRunItem>(
            "SELECT * FROM sync_run_items WHERE sync_run_id = ? ORDER BY id ASC",
        )
        .bind(sync_run_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Finish instant of the most recent run in which this subscription
    /// succeeded. Drives the incremental `since` computation.
    pub async fn last_success_finished_at(
        &self,
        subscription_id: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"SELECT r.finished_at
               FROM sync_run_items i
               JOIN sync_runs r ON r.id = i.sync_run_id
               WHERE i.subscription_id = ? AND i.status = 'SUCCESS'
               ORDER BY r.started_at DESC LIMIT 1"#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten())
    }

    // --- discovery runs ---

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_discovery_run(
        &self,
        sync_run_id: i64,
        subscription_id: i64,
        channel: Option<&str>,
        status: DiscoveryStatus,
        ref_count: i64,
        error_kind: Option<ErrorKind>,
        error_message: Option<&str>,
        latency_ms: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO discovery_runs
                   (sync_run_id, subscription_id, channel, status, ref_count,
                    error_kind, error_message, latency_ms)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(sync_run_id)
        .bind(subscription_id)
        .bind(channel)
        .bind(status)
        .bind(ref_count)
        .bind(error_kind)
        .bind(error_message)
        .bind(latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn discovery_runs_for(&self, sync_run_id: i64) -> Result<Vec<DiscoveryRun>> {
        Ok(sqlx::query_as::<_, DiscoveryRun>(
            "SELECT * FROM discovery_runs WHERE sync_run_id = ? ORDER BY id ASC",
        )
        .bind(sync_run_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // --- article refs ---

    /// New refs insert; repeats keep the best confidence and the freshest
    /// hints.
    pub async fn upsert_ref(&self, subscription_id: i64, article_ref: &DiscoveredArticleRef) -> Result<()> {
        let existing = sqlx::query_as::<_, ArticleRef>(
            "SELECT * FROM article_refs WHERE subscription_id = ? AND url = ?",
        )
        .bind(subscription_id)
        .bind(&article_ref.url)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"INSERT INTO article_refs
                           (subscription_id, url, title_hint, published_at_hint,
                            channel, confidence, discovered_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(subscription_id)
                .bind(&article_ref.url)
                .bind(&article_ref.title_hint)
                .bind(article_ref.published_at_hint)
                .bind(&article_ref.channel)
                .bind(article_ref.confidence)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
            }
            Some(row) => {
                sqlx::query(
                    r#"UPDATE article_refs
                       SET title_hint = COALESCE(?, title_hint),
                           published_at_hint = COALESCE(?, published_at_hint),
                           channel = ?, confidence = MAX(confidence, ?)
                       WHERE id = ?"#,
                )
                .bind(&article_ref.title_hint)
                .bind(article_ref.published_at_hint)
                .bind(&article_ref.channel)
                .bind(article_ref.confidence)
                .bind(row.id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn recent_ref_urls(&self, subscription_id: i64, limit: i64) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            r#"SELECT url FROM article_refs
               WHERE subscription_id = ?
               ORDER BY discovered_at DESC LIMIT ?"#,
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn refs_for_subscription(&self, subscription_id: i64) -> Result<Vec<ArticleRef>> {
        Ok(sqlx::query_as::<_, ArticleRef>(
            r#"SELECT * FROM article_refs
               WHERE subscription_id = ?
               ORDER BY confidence DESC, id ASC"#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
