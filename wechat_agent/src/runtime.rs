use std::sync::Arc;

use color_eyre::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::ai_client::AiClient;
use crate::config::Settings;
use crate::providers::{
    DirectoryIndexProvider, DiscoveryProvider, FeedClient, ManualSourceProvider,
    SearchIndexProvider, SignedChannelProvider, SourceProvider, TemplateMirrorProvider,
};
use crate::repository::{
    ArticleRepository, AuthSessionRepository, CoverageRepository, SourceRepository,
    SubscriptionRepository, SyncRepository, connect, migrate,
};
use crate::services::{
    CoverageService, DiscoveryOrchestrator, ReadStateService, Recommender, SessionVault,
    SourceGateway, SourceHealthService, SourceRouter, Summarizer, SyncEngine, SyncOptions,
    VaultSessions,
};
use crate::views::{DayIndex, RunStatus};

const EMBEDDING_VECTOR_SIZE: usize = 64;
const DIRECTORY_CACHE_TTL_SECS: u64 = 1800;

/// Log wiring for the embedding process. `RUST_LOG` wins over the default.
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}

/// Composition root. Ownership is a tree: the runtime builds every shared
/// resource, hands explicit handles to each component, and releases them on
/// `close`.
pub struct Runtime {
    pub settings: Settings,
    pub pool: SqlitePool,
    pub subscriptions: SubscriptionRepository,
    pub articles: ArticleRepository,
    pub sync_repo: SyncRepository,
    pub gateway: Arc<SourceGateway>,
    pub orchestrator: Option<Arc<DiscoveryOrchestrator>>,
    pub sync_engine: SyncEngine,
    pub coverage: CoverageService,
    pub read_state: ReadStateService,
    pub day_index: DayIndex,
    pub run_status: RunStatus,
    pub sessions: Arc<VaultSessions>,
}

impl Runtime {
    pub async fn build(settings: Settings) -> Result<Self> {
        let pool = connect(&settings.db_url).await?;
        migrate(&pool).await?;

        let http = crate::http_client::build_client(settings.http_timeout_seconds)?;
        let article_http = crate::http_client::build_client(settings.article_fetch_timeout_seconds)?;

        let subscriptions = SubscriptionRepository::new(pool.clone());
        let articles = ArticleRepository::new(pool.clone());
        let source_repo = SourceRepository::new(pool.clone());
        let sync_repo = SyncRepository::new(pool.clone());
        let coverage_repo = CoverageRepository::new(pool.clone());
        let auth_repo = AuthSessionRepository::new(pool.clone());

        let ai = match (settings.resolved_api_key(), settings.resolved_base_url()) {
            (Some(key), Some(base_url)) => Some(AiClient::new(http.clone(), base_url, key)),
            _ => None,
        };

        let feed = FeedClient::new(http.clone(), settings.midnight_shift_days);
        let providers: Vec<Arc<dyn SourceProvider>> = vec![
            Arc::new(ManualSourceProvider::new(source_repo.clone(), feed.clone())),
            Arc::new(TemplateMirrorProvider::new(
                settings.source_templates.clone(),
                feed.clone(),
            )),
            Arc::new(DirectoryIndexProvider::new(
                Some(settings.wechat2rss_index_url.clone()),
                http.clone(),
                feed.clone(),
                DIRECTORY_CACHE_TTL_SECS,
            )),
        ];

        let health = Arc::new(SourceHealthService::new(
            source_repo.clone(),
            settings.source_circuit_fail_threshold,
            settings.source_cooldown_minutes,
        ));
        let gateway = Arc::new(SourceGateway::new(
            providers,
            SourceRouter::new(),
            health,
            source_repo.clone(),
            settings.source_max_candidates,
            settings.source_retry_backoff_ms,
        ));

        let sessions = Arc::new(VaultSessions::new(
            SessionVault::new(settings.session_backend.clone()),
            auth_repo,
        ));

        let search_index = Arc::new(SearchIndexProvider::new(http.clone()));
        let orchestrator = if settings.discovery_v2_enabled {
            let discovery_providers: Vec<Arc<dyn DiscoveryProvider>> = vec![
                Arc::new(SignedChannelProvider::new(http.clone())),
                search_index.clone() as Arc<dyn DiscoveryProvider>,
            ];
            Some(Arc::new(DiscoveryOrchestrator::new(
                discovery_providers,
                search_index,
                sessions.clone(),
                settings.session_provider.clone(),
                sync_repo.clone(),
                article_http.clone(),
                settings.midnight_shift_days,
            )))
        } else {
            None
        };

        let summarizer = Arc::new(Summarizer::new(
            ai.clone(),
            settings.resolved_chat_model(),
            article_http,
            settings.summary_source_char_limit,
        ));
        let recommender = Arc::new(Recommender::new(
            ai,
            settings.resolved_embed_model().map(str::to_string),
            articles.clone(),
            EMBEDDING_VECTOR_SIZE,
        ));

        let sync_engine = SyncEngine::new(
            subscriptions.clone(),
            articles.clone(),
            sync_repo.clone(),
            gateway.clone(),
            orchestrator.clone(),
            summarizer,
            recommender,
            SyncOptions {
                incremental_sync_enabled: settings.incremental_sync_enabled,
                sync_overlap_seconds: settings.sync_overlap_seconds,
                max_concurrency: settings.max_concurrency,
                discovery_v2_enabled: settings.discovery_v2_enabled,
            },
        );

        let coverage = CoverageService::new(
            subscriptions.clone(),
            sync_repo.clone(),
            coverage_repo,
        );
        let read_state = ReadStateService::new(articles.clone());
        let day_index = DayIndex::new(articles.clone());
        let run_status = RunStatus::new(articles.clone(), subscriptions.clone(), sync_repo.clone());

        info!(
            "runtime ready: ai={}, discovery_v2={}",
            settings.resolved_ai_provider(),
            settings.discovery_v2_enabled
        );

        Ok(Self {
            settings,
            pool,
            subscriptions,
            articles,
            sync_repo,
            gateway,
            orchestrator,
            sync_engine,
            coverage,
            read_state,
            day_index,
            run_status,
            sessions,
        })
    }

    /// Release shared resources. HTTP clients close on drop; the pool is
    /// closed explicitly so a pending write cannot outlive the scope.
    pub async fn close(self) {
        self.pool.close().await;
    }
}
