use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::SqlitePool;

/// Non-sensitive session metadata. The secret itself lives in the vault
/// (keychain or restricted file), never in the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuthSessionEntry {
    pub provider: String,
    pub fingerprint: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuthSessionRepository {
    pool: SqlitePool,
}

impl AuthSessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        provider: &str,
        fingerprint: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO auth_sessions (provider, fingerprint, expires_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(provider)
               DO UPDATE SET fingerprint = excluded.fingerprint,
                             expires_at = excluded.expires_at,
                             updated_at = excluded.updated_at"#,
        )
        .bind(provider)
        .bind(fingerprint)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, provider: &str) -> Result<Option<AuthSessionEntry>> {
        Ok(
            sqlx::query_as::<_, AuthSessionEntry>("SELECT * FROM auth_sessions WHERE provider = ?")
                .bind(provider)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn delete(&self, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE provider = ?")
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
