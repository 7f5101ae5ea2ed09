use chrono::NaiveDate;
use color_eyre::Result;
use sqlx::SqlitePool;

use crate::schemas::CoverageReport;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CoverageDaily {
    pub date: NaiveDate,
    pub total_subs: i64,
    pub success_subs: i64,
    pub delayed_subs: i64,
    pub fail_subs: i64,
    pub coverage_ratio: f64,
    pub detail_json: String,
}

#[derive(Clone)]
pub struct CoverageRepository {
    pool: SqlitePool,
}

impl CoverageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn upsert_daily(&self, report: &CoverageReport) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO coverage_daily
                   (date, total_subs, success_subs, delayed_subs, fail_subs,
                    coverage_ratio, detail_json)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(date)
               DO UPDATE SET total_subs = excluded.total_subs,
                             success_subs = excluded.success_subs,
                             delayed_subs = excluded.delayed_subs,
                             fail_subs = excluded.fail_subs,
                             coverage_ratio = excluded.coverage_ratio,
                             detail_json = excluded.detail_json"#,
        )
        .bind(report.date)
        .bind(report.total_subs)
        .bind(report.success_subs)
        .bind(report.delayed_subs)
        .bind(report.fail_subs)
        .bind(report.coverage_ratio)
        .bind(&report.detail_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_daily(&self, date: NaiveDate) -> Result<Option<CoverageDaily>> {
        Ok(
            sqlx::query_as::<_, CoverageDaily>("SELECT * FROM coverage_daily WHERE date = ?")
                .bind(date)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}
