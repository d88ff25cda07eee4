use sqlx::{migrate::MigrateDatabase, SqlitePool};
use tracing::{error, info};

use crate::error::Result;
use crate::platform::AppPaths;

/// Database connection manager. The schema is bootstrapped in-process; a
/// separate migration runner owns anything beyond CREATE IF NOT EXISTS.
pub struct Database {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS usage_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        date TEXT NOT NULL,
        identity TEXT,
        tool TEXT NOT NULL,
        model TEXT NOT NULL,
        provider_record_id TEXT,
        input_tokens INTEGER NOT NULL DEFAULT 0,
        cache_write_tokens INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens INTEGER NOT NULL DEFAULT 0,
        output_tokens INTEGER NOT NULL DEFAULT 0,
        cost TEXT NOT NULL DEFAULT '0',
        raw_model TEXT,
        created_at INTEGER NOT NULL DEFAULT (unixepoch())
    )
    "#,
    // NULL identity means "unattributed" and must stay NULL in the row, but
    // SQLite treats NULLs as distinct in unique indexes. The COALESCE lives
    // only inside the index expression so upserts converge on one row.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_usage_records_key
    ON usage_records (date, COALESCE(identity, ''), tool, model, COALESCE(provider_record_id, ''))
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_usage_records_date ON usage_records (date)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_usage_records_attribution
    ON usage_records (tool, provider_record_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS identity_mappings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tool TEXT NOT NULL,
        external_id TEXT NOT NULL,
        identity TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT (unixepoch()),
        UNIQUE (tool, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        provider TEXT PRIMARY KEY,
        cursor_kind TEXT,
        last_forward_cursor TEXT,
        last_sync_at INTEGER,
        backfill_complete INTEGER NOT NULL DEFAULT 0,
        empty_window_streak INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

impl Database {
    /// Open (creating if necessary) the database and bootstrap the schema.
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        let db_path = paths.database_file();

        info!("Initializing database at: {:?}", db_path);

        if !db_path.exists() {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&format!("sqlite:{}", db_path.display())).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Self { pool };
        db.init_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Get the database connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    /// Verify database integrity
    pub async fn verify_integrity(&self) -> Result<bool> {
        let integrity_result: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await?;

        let is_ok = integrity_result == "ok";
        if !is_ok {
            error!("Database integrity check failed: {}", integrity_result);
        }

        Ok(is_ok)
    }
}

/// Helper functions for working with decimal values in the database
pub mod decimal_helpers {
    use rust_decimal::Decimal;

    use crate::error::{Error, Result};

    /// Convert a Decimal to a string for database storage
    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.to_string()
    }

    /// Parse a string from the database back to a Decimal
    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    pub(crate) async fn create_test_database() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        paths.ensure_dirs_exist().unwrap();
        let db = Database::new(&paths).await.unwrap();
        (db, temp_dir)
    }

    #[tokio::test]
    async fn test_database_creation() {
        let (db, _temp_dir) = create_test_database().await;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_database_integrity() {
        let (db, _temp_dir) = create_test_database().await;
        assert!(db.verify_integrity().await.unwrap());
    }

    #[tokio::test]
    async fn test_schema_bootstrap_is_idempotent() {
        let (db, _temp_dir) = create_test_database().await;
        db.init_schema().await.unwrap();
    }

    #[test]
    fn test_decimal_helpers() {
        use decimal_helpers::*;

        let decimal = Decimal::new(12345, 2); // 123.45
        let string = decimal_to_string(decimal);
        assert_eq!(string, "123.45");

        let parsed = string_to_decimal(&string).unwrap();
        assert_eq!(parsed, decimal);
    }
}
