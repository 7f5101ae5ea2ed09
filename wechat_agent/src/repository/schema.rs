use std::path::Path;
use std::str::FromStr;

use color_eyre::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

/// Writes are serialized on one shared connection; the sync run is the unit
/// of atomic progress commit.
pub async fn connect(db_url: &str) -> Result<SqlitePool> {
    let options = if let Some(path) = sqlite_file_path(db_url) {
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .foreign_keys(true)
    } else {
        SqliteConnectOptions::from_str(db_url)?.foreign_keys(true)
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// File path of a sqlite URL, `sqlite:///x` meaning the relative path `x`.
/// Memory URLs and non-sqlite URLs return None.
fn sqlite_file_path(db_url: &str) -> Option<String> {
    let rest = db_url.strip_prefix("sqlite://").or_else(|| db_url.strip_prefix("sqlite:"))?;
    if rest.is_empty() || rest.contains(":memory:") {
        return None;
    }
    Some(rest.trim_start_matches('/').to_string())
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        wechat_id TEXT NOT NULL UNIQUE,
        source_url TEXT,
        source_status TEXT NOT NULL DEFAULT 'PENDING',
        discovery_status TEXT NOT NULL DEFAULT 'PENDING',
        preferred_provider TEXT,
        source_mode TEXT NOT NULL DEFAULT 'auto',
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS subscription_sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        provider TEXT NOT NULL,
        source_url TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 50,
        is_pinned INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        confidence REAL NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL,
        metadata_json TEXT,
        UNIQUE(subscription_id, provider, source_url)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS source_health (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        provider TEXT NOT NULL,
        source_url TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'CLOSED',
        score REAL NOT NULL DEFAULT 0,
        success_rate_24h REAL NOT NULL DEFAULT 0,
        avg_latency_ms REAL NOT NULL DEFAULT 0,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        cooldown_until TEXT,
        last_ok_at TEXT,
        last_error TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE(subscription_id, provider, source_url)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sync_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        "trigger" TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        success_count INTEGER NOT NULL DEFAULT 0,
        fail_count INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS fetch_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        provider TEXT NOT NULL,
        source_url TEXT NOT NULL,
        status TEXT NOT NULL,
        http_code INTEGER,
        latency_ms INTEGER NOT NULL DEFAULT 0,
        error_kind TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        external_id TEXT NOT NULL,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        published_at TEXT NOT NULL,
        fetched_at TEXT NOT NULL,
        content_excerpt TEXT,
        raw_hash TEXT,
        UNIQUE(subscription_id, external_id)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_articles_published_at ON articles(published_at)"#,
    r#"CREATE TABLE IF NOT EXISTS article_summaries (
        article_id INTEGER PRIMARY KEY REFERENCES articles(id) ON DELETE CASCADE,
        summary_text TEXT NOT NULL,
        model TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS read_states (
        article_id INTEGER PRIMARY KEY REFERENCES articles(id) ON DELETE CASCADE,
        is_read INTEGER NOT NULL DEFAULT 0,
        read_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS article_embeddings (
        article_id INTEGER PRIMARY KEY REFERENCES articles(id) ON DELETE CASCADE,
        vector_json TEXT NOT NULL,
        model TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS recommendation_scores (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        article_id INTEGER NOT NULL UNIQUE REFERENCES articles(id) ON DELETE CASCADE,
        score REAL NOT NULL,
        detail_json TEXT NOT NULL,
        scored_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sync_run_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        new_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS discovery_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sync_run_id INTEGER NOT NULL REFERENCES sync_runs(id) ON DELETE CASCADE,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        channel TEXT,
        status TEXT NOT NULL,
        ref_count INTEGER NOT NULL DEFAULT 0,
        error_kind TEXT,
        error_message TEXT,
        latency_ms INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS article_refs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
        url TEXT NOT NULL,
        title_hint TEXT,
        published_at_hint TEXT,
        channel TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 0,
        discovered_at TEXT NOT NULL,
        UNIQUE(subscription_id, url)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS auth_sessions (
        provider TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        expires_at TEXT,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS coverage_daily (
        date TEXT PRIMARY KEY,
        total_subs INTEGER NOT NULL DEFAULT 0,
        success_subs INTEGER NOT NULL DEFAULT 0,
        delayed_subs INTEGER NOT NULL DEFAULT 0,
        fail_subs INTEGER NOT NULL DEFAULT 0,
        coverage_ratio REAL NOT NULL DEFAULT 0,
        detail_json TEXT NOT NULL DEFAULT '[]'
    )"#,
];

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_path_forms() {
        assert_eq!(
            sqlite_file_path("sqlite:///data/wechat_agent.db").as_deref(),
            Some("data/wechat_agent.db")
        );
        assert_eq!(
            sqlite_file_path("sqlite://wechat.db").as_deref(),
            Some("wechat.db")
        );
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x/y"), None);
    }

    #[tokio::test]
    async fn test_migrate_in_memory() {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        // Re-running the bootstrap is a no-op.
        migrate(&pool).await.unwrap();
    }
}
