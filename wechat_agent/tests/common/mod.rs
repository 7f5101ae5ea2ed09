#![allow(dead_code)]

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use wechat_agent::config::Settings;
use wechat_agent::runtime::Runtime;

/// Runtime over an in-memory database with the template mirror pointed at a
/// mock server; the directory index resolves to a 404 so it contributes no
/// candidates.
pub async fn test_runtime(server: &MockServer) -> Runtime {
    let mut settings = Settings::new_for_test("sqlite::memory:".to_string());
    settings.source_templates = vec![format!("{}/feed/{{wechat_id}}", server.uri())];
    settings.wechat2rss_index_url = format!("{}/index", server.uri());
    settings.source_retry_backoff_ms = 10;
    Runtime::build(settings).await.expect("runtime build failed")
}

pub fn rss_feed(items: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>demo</title>{items}</channel></rss>"
    )
}

pub fn rss_item(guid: &str, title: &str, link: &str, pub_date: &str, description: &str) -> String {
    format!(
        "<item><guid>{guid}</guid><title>{title}</title><link>{link}</link>\
         <pubDate>{pub_date}</pubDate><description>{description}</description></item>"
    )
}

pub async fn mount_feed(server: &MockServer, feed_path: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(feed_path.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

pub async fn mount_status(server: &MockServer, feed_path: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(feed_path.to_string()))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}
