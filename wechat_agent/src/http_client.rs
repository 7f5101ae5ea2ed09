use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

/// Browser-like UA: several mirrors and search indexes reject default
/// library agents outright.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2_1) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub const FEED_ACCEPT: &str = "application/rss+xml,application/xml,*/*";
pub const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

pub fn build_client(timeout_seconds: u64) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

    Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
}
