use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use pretty_assertions::assert_eq;
use wechat_agent::providers::{DiscoveryProvider, SearchIndexProvider};
use wechat_agent::repository::{
    ArticleRepository, AuthSessionRepository, CoverageRepository, SourceRepository,
    SubscriptionRepository, SyncRepository, connect, migrate,
};
use wechat_agent::schemas::{DiscoveredArticleRef, RawArticle};
use wechat_agent::services::{
    CoverageService, DiscoveryOrchestrator, Recommender, SessionVault, SourceGateway,
    SourceHealthService, SourceRouter, Summarizer, SyncEngine, SyncOptions, VaultSessions,
};
use wechat_agent::types::{DiscoveryStatus, ErrorKind, ProviderError, SourceMode, SyncItemStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct StubProvider {
    refs: Vec<DiscoveredArticleRef>,
    error: Option<ErrorKind>,
}

#[async_trait]
impl DiscoveryProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub_channel"
    }

    async fn search(
        &self,
        _subscription_name: &str,
        _target_date: NaiveDate,
        _extra_keywords: &[String],
        _session_token: Option<&str>,
    ) -> Result<Vec<DiscoveredArticleRef>, ProviderError> {
        match self.error {
            Some(kind) => Err(ProviderError::new(kind, "stub failure")),
            None => Ok(self.refs.clone()),
        }
    }
}

struct Fixture {
    pool: sqlx::SqlitePool,
    subs: SubscriptionRepository,
    articles: ArticleRepository,
    sync_repo: SyncRepository,
    _vault_dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let pool = connect("sqlite::memory:").await.unwrap();
    migrate(&pool).await.unwrap();
    Fixture {
        subs: SubscriptionRepository::new(pool.clone()),
        articles: ArticleRepository::new(pool.clone()),
        sync_repo: SyncRepository::new(pool.clone()),
        pool,
        _vault_dir: tempfile::tempdir().unwrap(),
    }
}

fn engine_with_provider(f: &Fixture, provider: StubProvider) -> SyncEngine {
    let client = reqwest::Client::new();
    let source_repo = SourceRepository::new(f.pool.clone());
    let health = Arc::new(SourceHealthService::new(source_repo.clone(), 3, 30));
    let gateway = Arc::new(SourceGateway::new(
        Vec::new(),
        SourceRouter::new(),
        health,
        source_repo,
        3,
        10,
    ));
    let sessions = Arc::new(VaultSessions::new(
        SessionVault::with_store_path(f._vault_dir.path().join("sessions.json")),
        AuthSessionRepository::new(f.pool.clone()),
    ));
    let orchestrator = Arc::new(DiscoveryOrchestrator::new(
        vec![Arc::new(provider) as Arc<dyn DiscoveryProvider>],
        Arc::new(SearchIndexProvider::new(client.clone())),
        sessions,
        "weread",
        f.sync_repo.clone(),
        client.clone(),
        2,
    ));
    let summarizer = Arc::new(Summarizer::new(None, "fallback", client, 6000));
    let recommender = Arc::new(Recommender::new(None, None, f.articles.clone(), 64));
    SyncEngine::new(
        f.subs.clone(),
        f.articles.clone(),
        f.sync_repo.clone(),
        gateway,
        Some(orchestrator),
        summarizer,
        recommender,
        SyncOptions {
            discovery_v2_enabled: true,
            ..SyncOptions::default()
        },
    )
}

fn coverage_service(f: &Fixture) -> CoverageService {
    CoverageService::new(
        f.subs.clone(),
        f.sync_repo.clone(),
        CoverageRepository::new(f.pool.clone()),
    )
}

fn today() -> NaiveDate {
    let now = chrono::Local::now();
    NaiveDate::from_ymd_opt(now.year(), now.month(), now.day()).unwrap()
}

#[tokio::test]
async fn test_v2_sync_materializes_discovered_articles() {
    let f = fixture().await;
    let sub = f
        .subs
        .create("发现号", "gh_v2", SourceMode::Auto, None)
        .await
        .unwrap();

    let server = MockServer::start().await;
    let epoch = Utc::now().timestamp();
    let article_html = format!(
        r#"<html><head><meta property="og:title" content="发现的文章" />
           <script>var ct = "{epoch}";</script></head>
           <body><div id="js_content"><p>正文内容足够长可以作为摘要依据。</p></div></body></html>"#
    );
    Mock::given(method("GET"))
        .and(path("/s"))
        .respond_with(ResponseTemplate::new(200).set_body_string(article_html))
        .mount(&server)
        .await;

    let engine = engine_with_provider(
        &f,
        StubProvider {
            refs: vec![DiscoveredArticleRef {
                url: format!("{}/s?__biz=v2&mid=1&idx=1&sn=x", server.uri()),
                title_hint: None,
                published_at_hint: None,
                channel: "stub_channel".to_string(),
                confidence: 0.9,
            }],
            error: None,
        },
    );

    let run = engine.sync(today(), "view", None).await.unwrap();
    assert_eq!(run.success_count, 1);
    assert_eq!(run.fail_count, 0);

    let discovery_rows = f.sync_repo.discovery_runs_for(run.id).await.unwrap();
    assert_eq!(discovery_rows.len(), 1);
    assert_eq!(discovery_rows[0].status, DiscoveryStatus::Success);
    assert_eq!(discovery_rows[0].channel.as_deref(), Some("stub_channel"));
    assert_eq!(discovery_rows[0].ref_count, 1);

    assert_eq!(f.articles.count_all().await.unwrap(), 1);
    let article = f
        .articles
        .get_by_external_id(sub.id, "v2|1|1|x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(article.title, "发现的文章");

    // The new article got a summary and an embedding on insert.
    assert!(f.articles.get_summary(article.id).await.unwrap().is_some());
    assert!(f.articles.get_embedding(article.id).await.unwrap().is_some());

    let sub = f.subs.get(sub.id).await.unwrap();
    assert_eq!(sub.discovery_status, DiscoveryStatus::Success);
}

#[tokio::test]
async fn test_v2_failure_without_cache_is_failed() {
    let f = fixture().await;
    f.subs
        .create("无缓存号", "gh_nocache", SourceMode::Auto, None)
        .await
        .unwrap();

    let engine = engine_with_provider(
        &f,
        StubProvider {
            refs: vec![],
            error: Some(ErrorKind::AuthExpired),
        },
    );
    let run = engine.sync(today(), "view", None).await.unwrap();
    assert_eq!(run.fail_count, 1);

    let rows = f.sync_repo.discovery_runs_for(run.id).await.unwrap();
    assert_eq!(rows[0].status, DiscoveryStatus::Failed);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::AuthExpired));

    let items = f.sync_repo.items_for_run(run.id).await.unwrap();
    assert_eq!(items[0].status, SyncItemStatus::Failed);

    // Coverage rolls the failure up with its error kind.
    let report = coverage_service(&f).compute(today()).await.unwrap();
    assert_eq!(report.total_subs, 1);
    assert_eq!(report.fail_subs, 1);
    assert_eq!(report.coverage_ratio, 0.0);
    let detail: serde_json::Value = serde_json::from_str(&report.detail_json).unwrap();
    assert_eq!(detail["error_kind_counts"]["AUTH_EXPIRED"], 1);
}

#[tokio::test]
async fn test_v2_failure_with_cached_articles_is_delayed() {
    let f = fixture().await;
    let sub = f
        .subs
        .create("缓存号", "gh_cached", SourceMode::Auto, None)
        .await
        .unwrap();

    // An article already acquired for today keeps the subscription readable.
    f.articles
        .insert(
            sub.id,
            &RawArticle {
                external_id: "cached-1".to_string(),
                title: "昨晚抓到的".to_string(),
                url: "https://mp.weixin.qq.com/s?__biz=c&mid=1".to_string(),
                published_at: Utc::now(),
                content_excerpt: "缓存内容".to_string(),
                raw_hash: "h".to_string(),
                source_name: None,
                is_midnight_publish: false,
            },
        )
        .await
        .unwrap();

    let engine = engine_with_provider(
        &f,
        StubProvider {
            refs: vec![],
            error: Some(ErrorKind::SearchEmpty),
        },
    );
    let run = engine.sync(today(), "view", None).await.unwrap();

    let rows = f.sync_repo.discovery_runs_for(run.id).await.unwrap();
    assert_eq!(rows[0].status, DiscoveryStatus::Delayed);

    let report = coverage_service(&f).compute(today()).await.unwrap();
    assert_eq!(report.delayed_subs, 1);
    assert_eq!(report.fail_subs, 0);
    // Delayed still counts toward coverage.
    assert_eq!(report.coverage_ratio, 1.0);
}

#[tokio::test]
async fn test_coverage_without_any_run_marks_all_failed() {
    let f = fixture().await;
    f.subs
        .create("号A", "gh_a", SourceMode::Auto, None)
        .await
        .unwrap();
    f.subs
        .create("号B", "gh_b", SourceMode::Auto, None)
        .await
        .unwrap();

    let report = coverage_service(&f).compute(today()).await.unwrap();
    assert_eq!(report.total_subs, 2);
    assert_eq!(report.fail_subs, 2);
    assert_eq!(report.coverage_ratio, 0.0);

    // Upserted row is readable back and re-computation overwrites in place.
    let repo = CoverageRepository::new(f.pool.clone());
    let stored = repo.get_daily(today()).await.unwrap().unwrap();
    assert_eq!(stored.total_subs, 2);
    let report2 = coverage_service(&f).compute(today()).await.unwrap();
    assert_eq!(report2.total_subs, report.total_subs);
}

#[tokio::test]
async fn test_coverage_with_no_subscriptions_is_full() {
    let f = fixture().await;
    let report = coverage_service(&f).compute(today()).await.unwrap();
    assert_eq!(report.total_subs, 0);
    assert_eq!(report.coverage_ratio, 1.0);
}
