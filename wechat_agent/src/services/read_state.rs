use color_eyre::Result;

use crate::repository::ArticleRepository;

/// Tracks which articles the operator has read; the recommender's profile
/// builds on this.
pub struct ReadStateService {
    articles: ArticleRepository,
}

impl ReadStateService {
    pub fn new(articles: ArticleRepository) -> Self {
        Self { articles }
    }

    pub async fn mark(&self, article_id: i64, is_read: bool) -> Result<()> {
        self.articles.set_read_state(article_id, is_read).await
    }

    pub async fn mark_many(&self, article_ids: &[i64], is_read: bool) -> Result<usize> {
        let mut marked = 0;
        for &article_id in article_ids {
            if self.articles.get(article_id).await?.is_none() {
                continue;
            }
            self.articles.set_read_state(article_id, is_read).await?;
            marked += 1;
        }
        Ok(marked)
    }
}
