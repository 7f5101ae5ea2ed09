mod common;

use chrono::{Datelike, TimeZone, Utc};
use common::*;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use wechat_agent::types::{FetchStatus, SourceMode, SourceStatus, SyncItemStatus};
use wiremock::MockServer;

fn today() -> chrono::NaiveDate {
    let now = chrono::Local::now();
    chrono::NaiveDate::from_ymd_opt(now.year(), now.month(), now.day()).unwrap()
}

fn recent_pub_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

#[tokio::test]
async fn test_repeated_sync_is_idempotent() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;

    runtime
        .subscriptions
        .create("成功号", "gh_ok", SourceMode::Auto, None)
        .await
        .unwrap();
    runtime
        .subscriptions
        .create("失败号", "gh_fail", SourceMode::Auto, None)
        .await
        .unwrap();

    mount_feed(
        &server,
        "/feed/gh_ok",
        rss_feed(&rss_item(
            "external-1",
            "测试文章",
            "https://example.com/article/1",
            &recent_pub_date(),
            "这是测试文章内容。",
        )),
    )
    .await;
    mount_status(&server, "/feed/gh_fail", 404).await;

    let run1 = runtime
        .sync_engine
        .sync(today(), "test", None)
        .await
        .unwrap();
    let run2 = runtime
        .sync_engine
        .sync(today(), "test", None)
        .await
        .unwrap();

    assert_eq!(run1.success_count, 1);
    assert_eq!(run1.fail_count, 1);
    assert_eq!(run2.success_count, 1);
    assert_eq!(run2.fail_count, 1);
    assert!(run1.finished_at.is_some());

    // Same article observed twice never re-inserts.
    assert_eq!(runtime.articles.count_all().await.unwrap(), 1);
}

#[tokio::test]
async fn test_sync_updates_subscription_bookkeeping() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;

    let ok_sub = runtime
        .subscriptions
        .create("成功号", "gh_ok", SourceMode::Auto, None)
        .await
        .unwrap();
    let fail_sub = runtime
        .subscriptions
        .create("失败号", "gh_fail", SourceMode::Auto, None)
        .await
        .unwrap();

    mount_feed(
        &server,
        "/feed/gh_ok",
        rss_feed(&rss_item(
            "e-1",
            "文章",
            "https://example.com/a",
            &recent_pub_date(),
            "内容片段",
        )),
    )
    .await;
    mount_status(&server, "/feed/gh_fail", 403).await;

    let run = runtime
        .sync_engine
        .sync(today(), "view", None)
        .await
        .unwrap();

    let ok_sub = runtime.subscriptions.get(ok_sub.id).await.unwrap();
    assert_eq!(ok_sub.source_status, SourceStatus::Active);
    assert_eq!(ok_sub.preferred_provider.as_deref(), Some("rsshub_mirror"));
    assert!(ok_sub.source_url.as_deref().unwrap().contains("/feed/gh_ok"));
    assert!(ok_sub.last_error.is_none());

    let fail_sub = runtime.subscriptions.get(fail_sub.id).await.unwrap();
    assert_eq!(fail_sub.source_status, SourceStatus::MatchFailed);
    assert!(fail_sub.last_error.as_deref().unwrap().contains("BLOCKED"));

    // Items recorded in subscription-id order.
    let items = runtime.sync_repo.items_for_run(run.id).await.unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].subscription_id, ok_sub.id);
    assert_eq!(items[0].status, SyncItemStatus::Success);
    assert_eq!(items[0].new_count, 1);
    assert_eq!(items[1].subscription_id, fail_sub.id);
    assert_eq!(items[1].status, SyncItemStatus::Failed);

    // Every attempt carries a classified status.
    let attempts = runtime.sync_repo.get_run(run.id).await.unwrap();
    assert_eq!(attempts.success_count, 1);
    assert_eq!(attempts.fail_count, 1);
}

#[tokio::test]
async fn test_midnight_publish_is_shifted() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;

    let sub = runtime
        .subscriptions
        .create("午夜号", "gh_midnight", SourceMode::Auto, None)
        .await
        .unwrap();

    mount_feed(
        &server,
        "/feed/gh_midnight",
        rss_feed(&rss_item(
            "mid-1",
            "午夜文章",
            "https://example.com/m",
            "2024-01-01 00:00:00",
            "内容",
        )),
    )
    .await;

    let since = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
    let result = runtime
        .gateway
        .fetch_with_failover(
            runtime.sync_repo.create_run("test").await.unwrap().id,
            &sub,
            since,
        )
        .await
        .unwrap();

    assert!(result.ok);
    assert_eq!(result.articles.len(), 1);
    // 00:00 publishes are a sentinel for "unknown time": shifted forward by
    // the configured two days.
    assert_eq!(
        result.articles[0].published_at,
        Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn test_mutable_fields_update_without_reinsert() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;

    runtime
        .subscriptions
        .create("更新号", "gh_upd", SourceMode::Auto, None)
        .await
        .unwrap();

    mount_feed(
        &server,
        "/feed/gh_upd",
        rss_feed(&rss_item(
            "stable-id",
            "原始标题",
            "https://example.com/original",
            &recent_pub_date(),
            "第一版摘要内容",
        )),
    )
    .await;
    runtime
        .sync_engine
        .sync(today(), "test", None)
        .await
        .unwrap();

    // Same external id comes back with a changed excerpt and a new title;
    // only the mutable fields may move.
    server.reset().await;
    mount_status(&server, "/index", 404).await;
    mount_feed(
        &server,
        "/feed/gh_upd",
        rss_feed(&rss_item(
            "stable-id",
            "改过的标题",
            "https://example.com/changed",
            &recent_pub_date(),
            "第二版摘要内容",
        )),
    )
    .await;
    runtime
        .sync_engine
        .sync(today(), "test", None)
        .await
        .unwrap();

    assert_eq!(runtime.articles.count_all().await.unwrap(), 1);
    let subs = runtime.subscriptions.list_by_id().await.unwrap();
    let article = runtime
        .articles
        .get_by_external_id(subs[0].id, "stable-id")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(article.title, "原始标题");
    assert_eq!(article.url, "https://example.com/original");
    assert_eq!(article.content_excerpt.as_deref(), Some("第二版摘要内容"));
}

#[tokio::test]
async fn test_cancelled_run_stays_unfinished() {
    let server = MockServer::start().await;
    let runtime = test_runtime(&server).await;
    runtime
        .subscriptions
        .create("号A", "gh_a", SourceMode::Auto, None)
        .await
        .unwrap();
    mount_status(&server, "/feed/gh_a", 500).await;

    let token = CancellationToken::new();
    token.cancel();
    let run = runtime
        .sync_engine
        .sync(today(), "view", Some(&token))
        .await
        .unwrap();

    assert!(run.finished_at.is_none());
    assert_eq!(run.trigger, "view:cancelled");
}

#[tokio::test]
async fn test_failover_to_second_candidate() {
    let server = MockServer::start().await;
    let mut settings = wechat_agent::config::Settings::new_for_test("sqlite::memory:".to_string());
    settings.source_templates = vec![
        format!("{}/broken/{{wechat_id}}", server.uri()),
        format!("{}/feed/{{wechat_id}}", server.uri()),
    ];
    settings.wechat2rss_index_url = format!("{}/index", server.uri());
    settings.source_retry_backoff_ms = 10;
    let runtime = wechat_agent::runtime::Runtime::build(settings).await.unwrap();

    let sub = runtime
        .subscriptions
        .create("容错号", "gh_fo", SourceMode::Auto, None)
        .await
        .unwrap();
    mount_status(&server, "/broken/gh_fo", 500).await;
    mount_feed(
        &server,
        "/feed/gh_fo",
        rss_feed(&rss_item(
            "f-1",
            "文章",
            "https://example.com/f",
            &recent_pub_date(),
            "内容",
        )),
    )
    .await;

    let run = runtime.sync_repo.create_run("test").await.unwrap();
    let result = runtime
        .gateway
        .fetch_with_failover(run.id, &sub, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap())
        .await
        .unwrap();

    assert!(result.ok);
    assert!(result.candidate.url.contains("/feed/gh_fo"));

    let logged = wechat_agent::repository::SourceRepository::new(runtime.pool.clone())
        .attempts_for_run(run.id)
        .await
        .unwrap();
    assert!(logged.iter().any(|a| a.status == FetchStatus::Failed));
    assert!(logged.iter().any(|a| a.status == FetchStatus::Success));
}
