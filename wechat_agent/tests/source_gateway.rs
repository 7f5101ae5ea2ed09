mod common;

use chrono::{Duration, TimeZone, Utc};
use common::*;
use pretty_assertions::assert_eq;
use wechat_agent::config::Settings;
use wechat_agent::repository::SourceRepository;
use wechat_agent::runtime::Runtime;
use wechat_agent::schemas::SourceCandidate;
use wechat_agent::types::{ErrorKind, FetchStatus, HealthState, SourceMode};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn early() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

#[tokio::test]
async fn test_circuit_opens_after_repeated_failures_and_skips_probe() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;
    let sub = runtime
        .subscriptions
        .create("熔断号", "gh_cb", SourceMode::Auto, None)
        .await
        .unwrap();

    // Exactly three probes reach the wire; the fourth call short-circuits.
    Mock::given(method("GET"))
        .and(path("/feed/gh_cb"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let run = runtime.sync_repo.create_run("test").await.unwrap();
    for _ in 0..3 {
        let result = runtime
            .gateway
            .fetch_with_failover(run.id, &sub, early())
            .await
            .unwrap();
        assert!(!result.ok);
        assert_eq!(result.error_kind, Some(ErrorKind::Http5xx));
    }

    let source_repo = SourceRepository::new(runtime.pool.clone());
    let feed_url = format!("{}/feed/gh_cb", server.uri());
    let health = source_repo
        .get_health(sub.id, "rsshub_mirror", &feed_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.state, HealthState::Open);
    assert_eq!(health.consecutive_failures, 3);
    assert!(health.cooldown_until.unwrap() > Utc::now());

    let result = runtime
        .gateway
        .fetch_with_failover(run.id, &sub, early())
        .await
        .unwrap();
    assert!(!result.ok);

    let attempts = source_repo.attempts_for_run(run.id).await.unwrap();
    assert_eq!(attempts.len(), 4);
    let last = attempts.last().unwrap();
    assert_eq!(last.status, FetchStatus::Skipped);
    assert_eq!(last.error_kind, Some(ErrorKind::CircuitOpen));
}

#[tokio::test]
async fn test_cooled_down_circuit_half_opens_and_recovers() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;
    let sub = runtime
        .subscriptions
        .create("恢复号", "gh_rec", SourceMode::Auto, None)
        .await
        .unwrap();
    mount_status(&server, "/feed/gh_rec", 500).await;

    let run = runtime.sync_repo.create_run("test").await.unwrap();
    for _ in 0..3 {
        runtime
            .gateway
            .fetch_with_failover(run.id, &sub, early())
            .await
            .unwrap();
    }

    let source_repo = SourceRepository::new(runtime.pool.clone());
    let feed_url = format!("{}/feed/gh_rec", server.uri());
    let mut health = source_repo
        .get_health(sub.id, "rsshub_mirror", &feed_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.state, HealthState::Open);

    // Cooldown elapsed; the source also recovered.
    health.cooldown_until = Some(Utc::now() - Duration::minutes(1));
    source_repo.save_health(&health).await.unwrap();
    server.reset().await;
    mount_status(&server, "/index", 404).await;
    mount_feed(
        &server,
        "/feed/gh_rec",
        rss_feed(&rss_item(
            "rec-1",
            "恢复文章",
            "https://example.com/r",
            "Mon, 01 Jan 2024 10:00:00 +0000",
            "内容",
        )),
    )
    .await;

    let result = runtime
        .gateway
        .fetch_with_failover(run.id, &sub, early())
        .await
        .unwrap();
    assert!(result.ok);

    let health = source_repo
        .get_health(sub.id, "rsshub_mirror", &feed_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(health.state, HealthState::Closed);
    assert_eq!(health.consecutive_failures, 0);
}

#[tokio::test]
async fn test_legacy_manual_pin_demoted_in_auto_mode() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;
    let sub = runtime
        .subscriptions
        .create(
            "旧号",
            "gh_legacy",
            SourceMode::Auto,
            Some("https://old-mirror.example/feed.xml"),
        )
        .await
        .unwrap();

    // A pin left behind by the pre-gateway binding flow.
    let source_repo = SourceRepository::new(runtime.pool.clone());
    source_repo
        .upsert_candidate(
            &SourceCandidate {
                subscription_id: sub.id,
                provider: "manual".to_string(),
                url: "https://old-mirror.example/feed.xml".to_string(),
                priority: 0,
                is_pinned: true,
                confidence: 1.0,
                discovered_at: Some(Utc::now()),
                metadata_json: Some("{\"legacy\":true}".to_string()),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    mount_status(&server, "/feed/gh_legacy", 404).await;

    let candidates = runtime.gateway.discover_candidates(&sub).await.unwrap();
    assert!(
        candidates
            .iter()
            .all(|c| c.url != "https://old-mirror.example/feed.xml"),
        "legacy pin must not resurface for auto-mode subscriptions"
    );

    let rows = source_repo.list_by_provider(sub.id, "manual").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].is_pinned);
    assert!(!rows[0].is_active);
    assert!(rows[0].priority >= 95);
}

#[tokio::test]
async fn test_no_candidates_yields_not_found() {
    let server = MockServer::start().await;
    let mut settings = Settings::new_for_test("sqlite::memory:".to_string());
    settings.source_templates = Vec::new();
    settings.wechat2rss_index_url = format!("{}/index", server.uri());
    let runtime = Runtime::build(settings).await.unwrap();

    let sub = runtime
        .subscriptions
        .create("空号", "gh_none", SourceMode::Auto, None)
        .await
        .unwrap();
    let run = runtime.sync_repo.create_run("test").await.unwrap();

    let result = runtime
        .gateway
        .fetch_with_failover(run.id, &sub, early())
        .await
        .unwrap();
    assert!(!result.ok);
    assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    assert_eq!(result.candidate.provider, "none");
}
