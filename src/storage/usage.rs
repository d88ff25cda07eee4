use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::database::decimal_helpers;

/// Repository for the deduplicated per-day usage series.
pub struct UsageRepository {
    pool: SqlitePool,
}

/// One stored usage row. The uniqueness key is
/// (date, identity, tool, model, provider_record_id); token and cost fields
/// are payload, overwritten wholesale on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRow {
    pub date: NaiveDate,
    /// None means "unattributed", distinct from any sentinel string.
    pub identity: Option<String>,
    pub tool: String,
    pub model: String,
    pub provider_record_id: Option<String>,
    pub input_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    pub raw_model: Option<String>,
}

impl UsageRow {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cache_write_tokens + self.cache_read_tokens + self.output_tokens
    }
}

/// Per-(date, tool) aggregate feeding the projection engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyToolUsage {
    pub date: NaiveDate,
    pub tool: String,
    pub input_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

impl DailyToolUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cache_write_tokens + self.cache_read_tokens + self.output_tokens
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";

impl UsageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a row, or overwrite the token/cost payload of the existing row
    /// with the same key. Last write wins; values are never added together,
    /// so re-running a sync over an overlapping range converges instead of
    /// double-counting.
    pub async fn upsert_record(&self, row: &UsageRow) -> Result<()> {
        debug!(
            "Upserting usage: date={}, tool={}, model={}, record_id={:?}",
            row.date, row.tool, row.model, row.provider_record_id
        );

        sqlx::query(
            r#"
            INSERT INTO usage_records (
                date, identity, tool, model, provider_record_id,
                input_tokens, cache_write_tokens, cache_read_tokens, output_tokens,
                cost, raw_model
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (date, COALESCE(identity, ''), tool, model, COALESCE(provider_record_id, ''))
            DO UPDATE SET
                input_tokens = excluded.input_tokens,
                cache_write_tokens = excluded.cache_write_tokens,
                cache_read_tokens = excluded.cache_read_tokens,
                output_tokens = excluded.output_tokens,
                cost = excluded.cost,
                raw_model = excluded.raw_model
            "#,
        )
        .bind(row.date.format(DATE_FORMAT).to_string())
        .bind(&row.identity)
        .bind(&row.tool)
        .bind(&row.model)
        .bind(&row.provider_record_id)
        .bind(row.input_tokens as i64)
        .bind(row.cache_write_tokens as i64)
        .bind(row.cache_read_tokens as i64)
        .bind(row.output_tokens as i64)
        .bind(decimal_helpers::decimal_to_string(row.cost))
        .bind(&row.raw_model)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Earliest stored date for a tool. Always derived from the data, never
    /// cached, so backfill progress can't drift from what's actually stored.
    pub async fn oldest_date(&self, tool: &str) -> Result<Option<NaiveDate>> {
        let min_date: Option<String> =
            sqlx::query_scalar("SELECT MIN(date) FROM usage_records WHERE tool = ?")
                .bind(tool)
                .fetch_one(&self.pool)
                .await?;

        min_date.map(|s| parse_date(&s)).transpose()
    }

    /// Rewrite the identity on every stored row for an external id. Called
    /// when an identity mapping is written so attribution applies to
    /// historical rows, not just future ones. Returns rows rewritten.
    pub async fn reattribute(
        &self,
        tool: &str,
        external_id: &str,
        identity: &str,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        // A row for the same key may already exist under the new identity if
        // a sync ran after the mapping was written elsewhere. Drop the stale
        // row first so the UPDATE can't violate the uniqueness index.
        sqlx::query(
            r#"
            DELETE FROM usage_records
            WHERE tool = ? AND provider_record_id = ?
              AND COALESCE(identity, '') != ?
              AND EXISTS (
                  SELECT 1 FROM usage_records u2
                  WHERE u2.date = usage_records.date
                    AND u2.tool = usage_records.tool
                    AND u2.model = usage_records.model
                    AND COALESCE(u2.provider_record_id, '') = COALESCE(usage_records.provider_record_id, '')
                    AND u2.identity = ?
              )
            "#,
        )
        .bind(tool)
        .bind(external_id)
        .bind(identity)
        .bind(identity)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE usage_records
            SET identity = ?
            WHERE tool = ? AND provider_record_id = ?
              AND COALESCE(identity, '') != ?
            "#,
        )
        .bind(identity)
        .bind(tool)
        .bind(external_id)
        .bind(identity)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let rewritten = result.rows_affected();
        if rewritten > 0 {
            info!(
                "Reattributed {} rows for {}:{} to {}",
                rewritten, tool, external_id, identity
            );
        }
        Ok(rewritten)
    }

    /// Per-(date, tool) sums over an inclusive date range, ordered by date.
    pub async fn daily_series(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyToolUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                date,
                tool,
                COALESCE(SUM(input_tokens), 0) AS input_tokens,
                COALESCE(SUM(cache_write_tokens), 0) AS cache_write_tokens,
                COALESCE(SUM(cache_read_tokens), 0) AS cache_read_tokens,
                COALESCE(SUM(output_tokens), 0) AS output_tokens,
                COALESCE(SUM(CAST(cost AS REAL)), 0.0) AS cost
            FROM usage_records
            WHERE date >= ? AND date <= ?
            GROUP BY date, tool
            ORDER BY date, tool
            "#,
        )
        .bind(start.format(DATE_FORMAT).to_string())
        .bind(end.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut series = Vec::with_capacity(rows.len());
        for row in rows {
            let date_str: String = row.get("date");
            let cost_f64: f64 = row.get("cost");

            series.push(DailyToolUsage {
                date: parse_date(&date_str)?,
                tool: row.get("tool"),
                input_tokens: row.get::<i64, _>("input_tokens") as u64,
                cache_write_tokens: row.get::<i64, _>("cache_write_tokens") as u64,
                cache_read_tokens: row.get::<i64, _>("cache_read_tokens") as u64,
                output_tokens: row.get::<i64, _>("output_tokens") as u64,
                cost: Decimal::from_f64_retain(cost_f64).unwrap_or(Decimal::ZERO),
            });
        }

        debug!("Retrieved {} daily usage points", series.len());
        Ok(series)
    }

    /// All stored rows for a date, ordered for stable assertions in tests
    /// and for the status surface.
    pub async fn records_for_date(&self, date: NaiveDate) -> Result<Vec<UsageRow>> {
        let rows = sqlx::query(
            r#"
            SELECT date, identity, tool, model, provider_record_id,
                   input_tokens, cache_write_tokens, cache_read_tokens, output_tokens,
                   cost, raw_model
            FROM usage_records
            WHERE date = ?
            ORDER BY tool, model, provider_record_id
            "#,
        )
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let date_str: String = row.get("date");
            let cost_str: String = row.get("cost");

            records.push(UsageRow {
                date: parse_date(&date_str)?,
                identity: row.get("identity"),
                tool: row.get("tool"),
                model: row.get("model"),
                provider_record_id: row.get("provider_record_id"),
                input_tokens: row.get::<i64, _>("input_tokens") as u64,
                cache_write_tokens: row.get::<i64, _>("cache_write_tokens") as u64,
                cache_read_tokens: row.get::<i64, _>("cache_read_tokens") as u64,
                output_tokens: row.get::<i64, _>("output_tokens") as u64,
                cost: decimal_helpers::string_to_decimal(&cost_str)?,
                raw_model: row.get("raw_model"),
            });
        }

        Ok(records)
    }

    pub async fn record_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| {
        Error::Database(sqlx::Error::Decode(
            format!("Invalid date '{}' in usage_records: {}", s, e).into(),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use tempfile::TempDir;

    async fn create_test_repository() -> (UsageRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        paths.ensure_dirs_exist().unwrap();
        let db = Database::new(&paths).await.unwrap();
        let repo = UsageRepository::new(db.pool().clone());
        (repo, temp_dir)
    }

    fn row(date: &str, identity: Option<&str>, record_id: Option<&str>, input: u64) -> UsageRow {
        UsageRow {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            identity: identity.map(str::to_string),
            tool: "claude-code".to_string(),
            model: "claude-sonnet-4".to_string(),
            provider_record_id: record_id.map(str::to_string),
            input_tokens: input,
            cache_write_tokens: 0,
            cache_read_tokens: 0,
            output_tokens: 10,
            cost: Decimal::new(25, 3),
            raw_model: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_instead_of_adding() {
        let (repo, _temp_dir) = create_test_repository().await;

        let mut record = row("2025-01-15", Some("u@example.com"), Some("key-1"), 1000);
        repo.upsert_record(&record).await.unwrap();

        record.input_tokens = 1500;
        record.cost = Decimal::new(40, 3);
        repo.upsert_record(&record).await.unwrap();

        let stored = repo.records_for_date(record.date).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].input_tokens, 1500);
        assert_eq!(stored[0].cost, Decimal::new(40, 3));
    }

    #[tokio::test]
    async fn test_distinct_record_ids_stay_distinct_rows() {
        let (repo, _temp_dir) = create_test_repository().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        repo.upsert_record(&row("2025-01-15", Some("u@example.com"), Some("key-1"), 1000))
            .await
            .unwrap();
        repo.upsert_record(&row("2025-01-15", Some("u@example.com"), Some("key-2"), 2000))
            .await
            .unwrap();

        let stored = repo.records_for_date(date).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.identity.as_deref() == Some("u@example.com")));
    }

    #[tokio::test]
    async fn test_null_identity_is_one_row_not_many() {
        let (repo, _temp_dir) = create_test_repository().await;
        let date = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();

        repo.upsert_record(&row("2025-02-01", None, Some("key-9"), 100))
            .await
            .unwrap();
        repo.upsert_record(&row("2025-02-01", None, Some("key-9"), 300))
            .await
            .unwrap();

        let stored = repo.records_for_date(date).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].identity, None);
        assert_eq!(stored[0].input_tokens, 300);
    }

    #[tokio::test]
    async fn test_reattribute_rewrites_historical_rows() {
        let (repo, _temp_dir) = create_test_repository().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();

        repo.upsert_record(&row("2025-01-10", None, Some("key-7"), 500))
            .await
            .unwrap();

        let rewritten = repo
            .reattribute("claude-code", "key-7", "dev@example.com")
            .await
            .unwrap();
        assert_eq!(rewritten, 1);

        let stored = repo.records_for_date(date).await.unwrap();
        assert_eq!(stored[0].identity.as_deref(), Some("dev@example.com"));
    }

    #[tokio::test]
    async fn test_reattribute_drops_stale_duplicate() {
        let (repo, _temp_dir) = create_test_repository().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 10).unwrap();

        // Unattributed row from before the mapping existed, plus the same
        // key already synced under the mapped identity.
        repo.upsert_record(&row("2025-01-10", None, Some("key-7"), 500))
            .await
            .unwrap();
        repo.upsert_record(&row("2025-01-10", Some("dev@example.com"), Some("key-7"), 520))
            .await
            .unwrap();

        repo.reattribute("claude-code", "key-7", "dev@example.com")
            .await
            .unwrap();

        let stored = repo.records_for_date(date).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].identity.as_deref(), Some("dev@example.com"));
    }

    #[tokio::test]
    async fn test_oldest_date_is_derived_from_rows() {
        let (repo, _temp_dir) = create_test_repository().await;

        assert_eq!(repo.oldest_date("claude-code").await.unwrap(), None);

        repo.upsert_record(&row("2025-03-05", None, Some("a"), 10))
            .await
            .unwrap();
        repo.upsert_record(&row("2025-01-20", None, Some("b"), 10))
            .await
            .unwrap();

        assert_eq!(
            repo.oldest_date("claude-code").await.unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 20)
        );
    }

    #[tokio::test]
    async fn test_daily_series_sums_per_date_and_tool() {
        let (repo, _temp_dir) = create_test_repository().await;

        repo.upsert_record(&row("2025-01-15", Some("a@example.com"), Some("k1"), 100))
            .await
            .unwrap();
        repo.upsert_record(&row("2025-01-15", Some("b@example.com"), Some("k2"), 250))
            .await
            .unwrap();

        let series = repo
            .daily_series(
                NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].input_tokens, 350);
        assert_eq!(series[0].output_tokens, 20);
    }
}
