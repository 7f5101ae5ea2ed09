use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::ACCEPT;

use crate::feed_parser::parse_feed;
use crate::http_client::FEED_ACCEPT;
use crate::schemas::RawArticle;
use crate::time_utils::shift_midnight_publish_time;
use crate::types::{ErrorKind, ProviderError};

/// Fetch/probe of a single feed URL, shared by every feed-backed provider.
#[derive(Clone)]
pub struct FeedClient {
    client: Client,
    midnight_shift_days: i64,
}

impl FeedClient {
    pub fn new(client: Client, midnight_shift_days: i64) -> Self {
        Self {
            client,
            midnight_shift_days,
        }
    }

    async fn get_body(&self, source_url: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .get(source_url)
            .header(ACCEPT, FEED_ACCEPT)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_http_status(
                status.as_u16(),
                format!("feed request returned {status} for {source_url}"),
            ));
        }
        response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))
    }

    /// Fetch, shift midnight publishes, filter by `since`, and dedup within
    /// the call.
    pub async fn fetch(
        &self,
        source_url: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawArticle>, ProviderError> {
        let body = self.get_body(source_url).await?;
        let articles = parse_feed(&body, source_url, None);

        let mut seen: HashSet<String> = HashSet::new();
        let mut result = Vec::with_capacity(articles.len());
        for mut article in articles {
            article.published_at = shift_midnight_publish_time(
                article.published_at,
                article.is_midnight_publish,
                self.midnight_shift_days,
            );
            if article.published_at < since {
                continue;
            }
            if !seen.insert(article.external_id.clone()) {
                continue;
            }
            result.push(article);
        }
        Ok(result)
    }

    /// A probe succeeds only when the document yields at least one article.
    pub async fn probe(&self, source_url: &str) -> (bool, i64, Option<ProviderError>) {
        let started = Instant::now();
        let outcome = self.get_body(source_url).await;
        let latency_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(body) => {
                if parse_feed(&body, source_url, None).is_empty() {
                    (
                        false,
                        latency_ms,
                        Some(ProviderError::new(
                            ErrorKind::ParseEmpty,
                            "feed reachable but no articles parsed",
                        )),
                    )
                } else {
                    (true, latency_ms, None)
                }
            }
            Err(err) => (false, latency_ms, Some(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_body() -> String {
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>t</title>\
         <item><guid>e1</guid><title>one</title><link>https://example.com/1</link>\
         <pubDate>Mon, 01 Jan 2024 10:00:00 +0000</pubDate></item>\
         <item><guid>e1</guid><title>dup</title><link>https://example.com/1b</link>\
         <pubDate>Mon, 01 Jan 2024 11:00:00 +0000</pubDate></item>\
         <item><guid>e2</guid><title>old</title><link>https://example.com/2</link>\
         <pubDate>Fri, 01 Dec 2023 10:00:00 +0000</pubDate></item>\
         </channel></rss>"
            .to_string()
    }

    #[tokio::test]
    async fn test_fetch_filters_and_dedups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed_body()))
            .mount(&server)
            .await;

        let client = crate::http_client::build_client(5).unwrap();
        let feed = FeedClient::new(client, 2);
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let articles = feed.fetch(&format!("{}/feed", server.uri()), since).await.unwrap();

        // Duplicate external id dropped, pre-`since` entry dropped.
        assert_eq!(articles.len(), 1);
        assert_eq!(articles[0].external_id, "e1");
    }

    #[tokio::test]
    async fn test_probe_empty_feed_is_parse_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed</html>"))
            .mount(&server)
            .await;

        let client = crate::http_client::build_client(5).unwrap();
        let feed = FeedClient::new(client, 2);
        let (ok, _latency, err) = feed.probe(&format!("{}/feed", server.uri())).await;
        assert!(!ok);
        assert_eq!(err.unwrap().kind, ErrorKind::ParseEmpty);
    }

    #[tokio::test]
    async fn test_probe_maps_http_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = crate::http_client::build_client(5).unwrap();
        let feed = FeedClient::new(client, 2);
        let (ok, _latency, err) = feed.probe(&format!("{}/feed", server.uri())).await;
        assert!(!ok);
        assert_eq!(err.unwrap().kind, ErrorKind::NotFound);
    }
}
