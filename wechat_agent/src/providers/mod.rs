mod directory_index;
mod feed_client;
mod manual;
mod search_index;
mod signed_channel;
mod template_mirror;

pub use directory_index::{DIRECTORY_MIN_SCORE, DirectoryIndexProvider};
pub use feed_client::FeedClient;
pub use manual::ManualSourceProvider;
pub use search_index::SearchIndexProvider;
pub use signed_channel::SignedChannelProvider;
pub use template_mirror::TemplateMirrorProvider;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::Result;

use crate::repository::Subscription;
use crate::schemas::{DiscoveredArticleRef, ProbeResult, RawArticle, SourceCandidate};
use crate::types::ProviderError;

pub const MANUAL_PROVIDER: &str = "manual";
pub const TEMPLATE_MIRROR_PROVIDER: &str = "rsshub_mirror";
pub const DIRECTORY_INDEX_PROVIDER: &str = "wechat2rss_index";
pub const SEARCH_INDEX_CHANNEL: &str = "search_index";
pub const SIGNED_CHANNEL: &str = "weread";
pub const HISTORY_BACKTRACK_CHANNEL: &str = "history_backtrack";

/// A feed-backed acquisition path: discover candidate URLs for a
/// subscription, cheaply probe one, fetch its articles.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(&self, sub: &Subscription) -> Result<Vec<SourceCandidate>>;

    async fn probe(&self, candidate: &SourceCandidate) -> ProbeResult;

    async fn fetch(
        &self,
        candidate: &SourceCandidate,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError>;
}

/// An out-of-band acquisition path: return per-article link hints for a
/// subscription and day.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Providers that need a signed-in session get the vault token passed in;
    /// they raise AUTH_EXPIRED when it is missing.
    fn needs_session(&self) -> bool {
        false
    }

    async fn search(
        &self,
        subscription_name: &str,
        target_date: NaiveDate,
        extra_keywords: &[String],
        session_token: Option<&str>,
    ) -> Result<Vec<DiscoveredArticleRef>, ProviderError>;
}
