use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::SqlitePool;

use crate::schemas::RawArticle;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Article {
    pub id: i64,
    pub subscription_id: i64,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub content_excerpt: Option<String>,
    pub raw_hash: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleSummary {
    pub article_id: i64,
    pub summary_text: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleEmbedding {
    pub article_id: i64,
    pub vector_json: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecommendationScoreEntry {
    pub id: i64,
    pub article_id: i64,
    pub score: f64,
    pub detail_json: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReadState {
    pub article_id: i64,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
}

/// Day-window article joined with its summary, for refresh and scoring.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DayArticleRow {
    pub id: i64,
    pub subscription_id: i64,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub content_excerpt: Option<String>,
    pub raw_hash: Option<String>,
    pub summary_text: Option<String>,
    pub summary_model: Option<String>,
}

/// Everything the reader view needs for one article.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ViewRow {
    pub id: i64,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
    pub summary_text: Option<String>,
    pub is_read: Option<bool>,
    pub score: Option<f64>,
}

#[derive(Clone)]
pub struct ArticleRepository {
    pool: SqlitePool,
}

impl ArticleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<Article>> {
        Ok(
            sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_by_external_id(
        &self,
        subscription_id: i64,
        external_id: &str,
    ) -> Result<Option<Article>> {
        Ok(sqlx::query_as::<_, Article>(
            "SELECT * FROM articles WHERE subscription_id = ? AND external_id = ?",
        )
        .bind(subscription_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn insert(&self, subscription_id: i64, raw: &RawArticle) -> Result<i64> {
        let id = sqlx::query(
            r#"INSERT INTO articles
                   (subscription_id, external_id, title, url, published_at,
                    fetched_at, content_excerpt, raw_hash)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(subscription_id)
        .bind(&raw.external_id)
        .bind(&raw.title)
        .bind(&raw.url)
        .bind(raw.published_at)
        .bind(Utc::now())
        .bind(&raw.content_excerpt)
        .bind(&raw.raw_hash)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    /// Re-observation updates mutable fields only; title and url are fixed at
    /// first insert.
    pub async fn update_mutable_fields(&self, existing: &Article, raw: &RawArticle) -> Result<bool> {
        let new_published = (raw.published_at != existing.published_at).then_some(raw.published_at);
        let new_excerpt = (!raw.content_excerpt.is_empty()
            && existing.content_excerpt.as_deref() != Some(raw.content_excerpt.as_str()))
        .then_some(raw.content_excerpt.as_str());
        let new_hash = (!raw.raw_hash.is_empty()
            && existing.raw_hash.as_deref() != Some(raw.raw_hash.as_str()))
        .then_some(raw.raw_hash.as_str());

        if new_published.is_none() && new_excerpt.is_none() && new_hash.is_none() {
            return Ok(false);
        }

        sqlx::query(
            r#"UPDATE articles
               SET published_at = COALESCE(?, published_at),
                   content_excerpt = COALESCE(?, content_excerpt),
                   raw_hash = COALESCE(?, raw_hash)
               WHERE id = ?"#,
        )
        .bind(new_published)
        .bind(new_excerpt)
        .bind(new_hash)
        .bind(existing.id)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    pub async fn count_all(&self) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn count_in_window(
        &self,
        subscription_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*) FROM articles
               WHERE subscription_id = ? AND published_at >= ? AND published_at < ?"#,
        )
        .bind(subscription_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Ids ordered for the day-id bijection: publish time descending, id
    /// ascending as the tiebreak.
    pub async fn day_ordered_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar::<_, i64>(
            r#"SELECT id FROM articles
               WHERE published_at >= ? AND published_at < ?
               ORDER BY published_at DESC, id ASC"#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn day_rows_with_summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DayArticleRow>> {
        Ok(sqlx::query_as::<_, DayArticleRow>(
            r#"SELECT a.id, a.subscription_id, a.external_id, a.title, a.url,
                      a.published_at, a.content_excerpt, a.raw_hash,
                      s.summary_text AS summary_text, s.model AS summary_model
               FROM articles a
               LEFT JOIN article_summaries s ON s.article_id = a.id
               WHERE a.published_at >= ? AND a.published_at < ?
               ORDER BY a.id ASC"#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn view_rows(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<ViewRow>> {
        Ok(sqlx::query_as::<_, ViewRow>(
            r#"SELECT a.id, sub.name AS source_name, a.published_at, a.title, a.url,
                      s.summary_text AS summary_text,
                      r.is_read AS is_read,
                      rec.score AS score
               FROM articles a
               JOIN subscriptions sub ON sub.id = a.subscription_id
               LEFT JOIN article_summaries s ON s.article_id = a.id
               LEFT JOIN read_states r ON r.article_id = a.id
               LEFT JOIN recommendation_scores rec ON rec.article_id = a.id
               WHERE a.published_at >= ? AND a.published_at < ?
               ORDER BY a.published_at DESC, a.id ASC"#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn max_published_by_subscription(&self) -> Result<Vec<(i64, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (i64, DateTime<Utc>)>(
            r#"SELECT subscription_id, MAX(published_at) FROM articles GROUP BY subscription_id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // --- summaries ---

    pub async fn get_summary(&self, article_id: i64) -> Result<Option<ArticleSummary>> {
        Ok(sqlx::query_as::<_, ArticleSummary>(
            "SELECT * FROM article_summaries WHERE article_id = ?",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn upsert_summary(&self, article_id: i64, summary_text: &str, model: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO article_summaries (article_id, summary_text, model, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(article_id)
               DO UPDATE SET summary_text = excluded.summary_text, model = excluded.model"#,
        )
        .bind(article_id)
        .bind(summary_text)
        .bind(model)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- read states ---

    pub async fn get_read_state(&self, article_id: i64) -> Result<Option<ReadState>> {
        Ok(
            sqlx::query_as::<_, ReadState>("SELECT * FROM read_states WHERE article_id = ?")
                .bind(article_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn set_read_state(&self, article_id: i64, is_read: bool) -> Result<()> {
        let read_at = is_read.then(Utc::now);
        sqlx::query(
            r#"INSERT INTO read_states (article_id, is_read, read_at)
               VALUES (?, ?, ?)
               ON CONFLICT(article_id)
               DO UPDATE SET is_read = excluded.is_read, read_at = excluded.read_at"#,
        )
        .bind(article_id)
        .bind(is_read)
        .bind(read_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- embeddings ---

    pub async fn get_embedding(&self, article_id: i64) -> Result<Option<ArticleEmbedding>> {
        Ok(sqlx::query_as::<_, ArticleEmbedding>(
            "SELECT * FROM article_embeddings WHERE article_id = ?",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn insert_embedding(
        &self,
        article_id: i64,
        vector_json: &str,
        model: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO article_embeddings (article_id, vector_json, model, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(article_id) DO NOTHING"#,
        )
        .bind(article_id)
        .bind(vector_json)
        .bind(model)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Embedding vectors of read articles published after `lower`; the input
    /// to the user profile.
    pub async fn read_vectors_since(&self, lower: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            r#"SELECT e.vector_json
               FROM article_embeddings e
               JOIN read_states r ON r.article_id = e.article_id
               JOIN articles a ON a.id = e.article_id
               WHERE r.is_read = 1 AND a.published_at >= ?"#,
        )
        .bind(lower)
        .fetch_all(&self.pool)
        .await?)
    }

    // --- recommendation scores ---

    pub async fn get_recommendation(&self, article_id: i64) -> Result<Option<RecommendationScoreEntry>> {
        Ok(sqlx::query_as::<_, RecommendationScoreEntry>(
            "SELECT * FROM recommendation_scores WHERE article_id = ?",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn upsert_recommendation(
        &self,
        article_id: i64,
        score: f64,
        detail_json: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO recommendation_scores (article_id, score, detail_json, scored_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(article_id)
               DO UPDATE SET score = excluded.score, detail_json = excluded.detail_json,
                             scored_at = excluded.scored_at"#,
        )
        .bind(article_id)
        .bind(score)
        .bind(detail_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
