use chrono::{DateTime, Duration, NaiveDate, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::ai_client::AiClient;
use crate::repository::ArticleRepository;
use crate::schemas::{RecommendationScore, UserProfile};
use crate::time_utils::local_day_bounds_utc;

const LOCAL_EMBED_MODEL: &str = "local-hash";
const PROFILE_WINDOW_DAYS: i64 = 30;
const FRESHNESS_HALFLIFE_HOURS: f64 = 48.0;

/// Recommendation weight split; defaults are the tested values.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub topic: f64,
    pub freshness: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            topic: 0.7,
            freshness: 0.3,
        }
    }
}

/// Embedding-based topic similarity blended with freshness decay. Falls back
/// to a deterministic local embedding when no remote model is configured, so
/// scoring always works offline.
pub struct Recommender {
    ai: Option<AiClient>,
    embed_model: Option<String>,
    articles: ArticleRepository,
    vector_size: usize,
    weights: ScoreWeights,
}

pub fn normalize_vector(vector: &mut [f64]) {
    let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        return;
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let numerator: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let denom_a = a.iter().map(|v| v * v).sum::<f64>().sqrt();
    let denom_b = b.iter().map(|v| v * v).sum::<f64>().sqrt();
    if denom_a == 0.0 || denom_b == 0.0 {
        return 0.0;
    }
    numerator / (denom_a * denom_b)
}

impl Recommender {
    pub fn new(
        ai: Option<AiClient>,
        embed_model: Option<String>,
        articles: ArticleRepository,
        vector_size: usize,
    ) -> Self {
        Self {
            ai,
            embed_model,
            articles,
            vector_size: vector_size.max(1),
            weights: ScoreWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    fn remote(&self) -> Option<(&AiClient, &str)> {
        match (&self.ai, self.embed_model.as_deref()) {
            (Some(ai), Some(model)) if !model.is_empty() => Some((ai, model)),
            _ => None,
        }
    }

    pub async fn embed_text(&self, text: &str) -> Vec<f64> {
        if let Some((ai, model)) = self.remote() {
            match ai.embed(model, text).await {
                Ok(mut vector) => {
                    normalize_vector(&mut vector);
                    return vector;
                }
                Err(err) => debug!("remote embedding degraded to local hash: {err}"),
            }
        }
        self.local_embedding(text)
    }

    /// Deterministic stand-in embedding: SHA-256 bytes folded to
    /// `vector_size` values in [-1, 1], L2-normalized.
    fn local_embedding(&self, text: &str) -> Vec<f64> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let mut raw: Vec<f64> = (0..self.vector_size)
            .map(|i| (digest[i % digest.len()] as f64 / 255.0) * 2.0 - 1.0)
            .collect();
        normalize_vector(&mut raw);
        raw
    }

    /// Read-through embedding for one article.
    pub async fn ensure_article_embedding(&self, article_id: i64, text: &str) -> Result<Vec<f64>> {
        if let Some(existing) = self.articles.get_embedding(article_id).await? {
            let vector: Vec<f64> = serde_json::from_str(&existing.vector_json)?;
            return Ok(vector);
        }

        let vector = self.embed_text(text).await;
        let model = self
            .remote()
            .map(|(_, model)| model.to_string())
            .unwrap_or_else(|| LOCAL_EMBED_MODEL.to_string());
        self.articles
            .insert_embedding(article_id, &serde_json::to_string(&vector)?, &model)
            .await?;
        Ok(vector)
    }

    /// Mean embedding of articles read in the last 30 days.
    pub async fn build_user_profile(&self, now: DateTime<Utc>) -> Result<UserProfile> {
        let lower = now - Duration::days(PROFILE_WINDOW_DAYS);
        let raw_vectors = self.articles.read_vectors_since(lower).await?;

        let vectors: Vec<Vec<f64>> = raw_vectors
            .iter()
            .filter_map(|json| serde_json::from_str::<Vec<f64>>(json).ok())
            .collect();
        let Some(first) = vectors.first() else {
            return Ok(UserProfile::default());
        };

        let dim = first.len();
        let mut avg = vec![0.0_f64; dim];
        for vector in &vectors {
            if vector.len() != dim {
                continue;
            }
            for (slot, value) in avg.iter_mut().zip(vector.iter()) {
                *slot += value;
            }
        }
        let sample_size = vectors.len();
        for slot in avg.iter_mut() {
            *slot /= sample_size as f64;
        }
        normalize_vector(&mut avg);
        Ok(UserProfile {
            vector: avg,
            sample_size,
        })
    }

    /// Topic similarity blended with freshness decay. With an empty profile
    /// (cold start) the score is freshness alone.
    pub fn score(
        &self,
        article_vector: &[f64],
        profile: &UserProfile,
        published_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RecommendationScore {
        let topic_score = if profile.sample_size > 0 && !profile.vector.is_empty() {
            cosine_similarity(article_vector, &profile.vector).max(0.0)
        } else {
            0.0
        };

        let age_hours = ((now - published_at).num_seconds() as f64 / 3600.0).max(0.0);
        let freshness_score = (-age_hours / FRESHNESS_HALFLIFE_HOURS).exp();

        let score = if profile.sample_size == 0 {
            freshness_score
        } else {
            self.weights.topic * topic_score + self.weights.freshness * freshness_score
        };

        RecommendationScore {
            score,
            topic_score,
            freshness_score,
        }
    }

    pub async fn upsert_recommendation(
        &self,
        article_id: i64,
        recommendation: &RecommendationScore,
        profile_size: usize,
    ) -> Result<()> {
        let detail = serde_json::json!({
            "topic_score": recommendation.topic_score,
            "freshness_score": recommendation.freshness_score,
            "profile_size": profile_size,
        });
        self.articles
            .upsert_recommendation(article_id, recommendation.score, &detail.to_string())
            .await
    }

    /// Ensure embeddings and recompute scores for every article published in
    /// the local-day window.
    pub async fn recompute_scores_for_date(&self, target_date: NaiveDate) -> Result<()> {
        let (day_start, day_end) = local_day_bounds_utc(target_date);
        let profile = self.build_user_profile(Utc::now()).await?;

        for row in self.articles.day_rows_with_summary(day_start, day_end).await? {
            let text = format!(
                "{}\n{}\n{}",
                row.title,
                row.summary_text.as_deref().unwrap_or(""),
                row.content_excerpt.as_deref().unwrap_or("")
            )
            .trim()
            .to_string();
            let vector = self.ensure_article_embedding(row.id, &text).await?;
            let recommendation = self.score(&vector, &profile, row.published_at, Utc::now());
            self.upsert_recommendation(row.id, &recommendation, profile.sample_size)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{connect, migrate};

    async fn recommender() -> Recommender {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        Recommender::new(None, None, ArticleRepository::new(pool), 64)
    }

    #[tokio::test]
    async fn test_local_embedding_is_deterministic_and_normalized() {
        let r = recommender().await;
        let a = r.embed_text("同一段文本").await;
        let b = r.embed_text("同一段文本").await;
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f64 = a.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!(a.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[tokio::test]
    async fn test_cold_start_final_equals_freshness() {
        let r = recommender().await;
        let vector = r.embed_text("文章").await;
        let profile = UserProfile::default();
        let now = Utc::now();

        let fresh = r.score(&vector, &profile, now - Duration::minutes(10), now);
        let stale = r.score(&vector, &profile, now - Duration::days(4), now);

        assert_eq!(fresh.score, fresh.freshness_score);
        assert_eq!(stale.score, stale.freshness_score);
        assert!(fresh.score > stale.score);
        assert_eq!(fresh.topic_score, 0.0);
    }

    #[tokio::test]
    async fn test_score_bounds() {
        let r = recommender().await;
        let vector = r.embed_text("文章").await;
        let mut profile_vector = vector.clone();
        normalize_vector(&mut profile_vector);
        let profile = UserProfile {
            vector: profile_vector,
            sample_size: 3,
        };
        let now = Utc::now();
        let rec = r.score(&vector, &profile, now - Duration::hours(2), now);

        assert!((0.0..=1.0).contains(&rec.topic_score));
        assert!(rec.freshness_score > 0.0 && rec.freshness_score <= 1.0);
        assert!((rec.score - (0.7 * rec.topic_score + 0.3 * rec.freshness_score)).abs() < 1e-9);
    }

    #[test]
    fn test_cosine_mismatched_dims_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
