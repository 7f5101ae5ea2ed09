/// lib exports for integration testing
/// separated to simulate the real call flow: runtime -> service -> repo -> db
pub mod ai_client;
pub mod config;
pub mod feed_parser;
pub mod http_client;
pub mod providers;
pub mod repository;
pub mod runtime;
pub mod schemas;
pub mod services;
pub mod time_utils;
pub mod types;
mod utils;
pub mod views;

pub use types::{DiscoveryStatus, ErrorKind, FetchStatus, HealthState, SourceStatus, SyncItemStatus};
