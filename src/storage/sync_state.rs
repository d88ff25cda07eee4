use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Forward-sync cursor. Providers report at different granularities, so the
/// cursor is typed per provider instead of overloading one string column:
/// a daily-bucket provider keeps a date, an hourly one an epoch timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardCursor {
    Date(NaiveDate),
    EpochSeconds(i64),
}

impl ForwardCursor {
    fn kind(&self) -> &'static str {
        match self {
            ForwardCursor::Date(_) => "date",
            ForwardCursor::EpochSeconds(_) => "epoch_seconds",
        }
    }

    fn encode(&self) -> String {
        match self {
            ForwardCursor::Date(d) => d.format("%Y-%m-%d").to_string(),
            ForwardCursor::EpochSeconds(s) => s.to_string(),
        }
    }

    fn decode(kind: &str, value: &str) -> Result<Self> {
        match kind {
            "date" => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(ForwardCursor::Date)
                .map_err(|e| decode_error(value, e)),
            "epoch_seconds" => value
                .parse()
                .map(ForwardCursor::EpochSeconds)
                .map_err(|e| decode_error(value, e)),
            other => Err(Error::Database(sqlx::Error::Decode(
                format!("Unknown cursor kind '{}'", other).into(),
            ))),
        }
    }

    /// The point in time the cursor has synced through.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ForwardCursor::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            ForwardCursor::EpochSeconds(s) => DateTime::from_timestamp(*s, 0),
        }
    }
}

fn decode_error(value: &str, e: impl std::fmt::Display) -> Error {
    Error::Database(sqlx::Error::Decode(
        format!("Invalid forward cursor '{}': {}", value, e).into(),
    ))
}

/// Persisted per-provider sync state. The forward axis is owned by the
/// forward job, the backfill axis by the backfill job.
#[derive(Debug, Clone, Default)]
pub struct SyncStateRecord {
    pub last_forward_cursor: Option<ForwardCursor>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub backfill_complete: bool,
    pub empty_window_streak: u32,
}

/// Backfill progress as surfaced to callers: the completion flag is
/// persisted, the oldest date is always derived from stored usage rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillState {
    pub oldest_date: Option<NaiveDate>,
    pub complete: bool,
}

pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, provider: &str) -> Result<SyncStateRecord> {
        let row = sqlx::query(
            r#"
            SELECT cursor_kind, last_forward_cursor, last_sync_at,
                   backfill_complete, empty_window_streak
            FROM sync_state WHERE provider = ?
            "#,
        )
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncStateRecord::default());
        };

        let cursor_kind: Option<String> = row.get("cursor_kind");
        let cursor_value: Option<String> = row.get("last_forward_cursor");
        let last_forward_cursor = match (cursor_kind, cursor_value) {
            (Some(kind), Some(value)) => Some(ForwardCursor::decode(&kind, &value)?),
            _ => None,
        };

        let last_sync_at: Option<i64> = row.get("last_sync_at");

        Ok(SyncStateRecord {
            last_forward_cursor,
            last_sync_at: last_sync_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            backfill_complete: row.get::<i64, _>("backfill_complete") != 0,
            empty_window_streak: row.get::<i64, _>("empty_window_streak") as u32,
        })
    }

    /// Advance the forward cursor and stamp the freshness marker. Called by
    /// the forward job only, and only after a fully successful run.
    pub async fn advance_forward_cursor(
        &self,
        provider: &str,
        cursor: ForwardCursor,
    ) -> Result<()> {
        debug!("Advancing {} forward cursor to {:?}", provider, cursor);

        sqlx::query(
            r#"
            INSERT INTO sync_state (provider, cursor_kind, last_forward_cursor, last_sync_at)
            VALUES (?, ?, ?, unixepoch())
            ON CONFLICT (provider) DO UPDATE SET
                cursor_kind = excluded.cursor_kind,
                last_forward_cursor = excluded.last_forward_cursor,
                last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(provider)
        .bind(cursor.kind())
        .bind(cursor.encode())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// One-way completion flag; only `reset_backfill` clears it.
    pub async fn mark_backfill_complete(&self, provider: &str) -> Result<()> {
        info!("Marking backfill complete for {}", provider);

        sqlx::query(
            r#"
            INSERT INTO sync_state (provider, backfill_complete)
            VALUES (?, 1)
            ON CONFLICT (provider) DO UPDATE SET backfill_complete = 1
            "#,
        )
        .bind(provider)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Explicit admin reset: clears the completion flag and the empty-window
    /// streak so backfill starts probing again.
    pub async fn reset_backfill(&self, provider: &str) -> Result<()> {
        info!("Resetting backfill state for {}", provider);

        sqlx::query(
            r#"
            INSERT INTO sync_state (provider, backfill_complete, empty_window_streak)
            VALUES (?, 0, 0)
            ON CONFLICT (provider) DO UPDATE SET
                backfill_complete = 0,
                empty_window_streak = 0
            "#,
        )
        .bind(provider)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persisted so the consecutive-empty-window heuristic survives process
    /// restarts between externally scheduled runs.
    pub async fn set_empty_window_streak(&self, provider: &str, streak: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (provider, empty_window_streak)
            VALUES (?, ?)
            ON CONFLICT (provider) DO UPDATE SET empty_window_streak = excluded.empty_window_streak
            "#,
        )
        .bind(provider)
        .bind(streak as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use tempfile::TempDir;

    async fn create_test_repository() -> (SyncStateRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        paths.ensure_dirs_exist().unwrap();
        let db = Database::new(&paths).await.unwrap();
        (SyncStateRepository::new(db.pool().clone()), temp_dir)
    }

    #[tokio::test]
    async fn test_unknown_provider_is_never_synced() {
        let (repo, _temp_dir) = create_test_repository().await;

        let state = repo.get("anthropic").await.unwrap();
        assert_eq!(state.last_forward_cursor, None);
        assert!(!state.backfill_complete);
        assert_eq!(state.empty_window_streak, 0);
    }

    #[tokio::test]
    async fn test_cursor_kinds_round_trip() {
        let (repo, _temp_dir) = create_test_repository().await;

        let date = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        repo.advance_forward_cursor("anthropic", date).await.unwrap();

        let epoch = ForwardCursor::EpochSeconds(1736899200);
        repo.advance_forward_cursor("openai", epoch).await.unwrap();

        assert_eq!(
            repo.get("anthropic").await.unwrap().last_forward_cursor,
            Some(date)
        );
        assert_eq!(
            repo.get("openai").await.unwrap().last_forward_cursor,
            Some(epoch)
        );
    }

    #[tokio::test]
    async fn test_advance_stamps_freshness_marker() {
        let (repo, _temp_dir) = create_test_repository().await;

        let cursor = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        repo.advance_forward_cursor("anthropic", cursor).await.unwrap();

        assert!(repo.get("anthropic").await.unwrap().last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_backfill_complete_is_sticky_until_reset() {
        let (repo, _temp_dir) = create_test_repository().await;

        repo.mark_backfill_complete("anthropic").await.unwrap();
        repo.set_empty_window_streak("anthropic", 3).await.unwrap();
        assert!(repo.get("anthropic").await.unwrap().backfill_complete);

        // Forward-axis writes don't touch the flag
        let cursor = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
        repo.advance_forward_cursor("anthropic", cursor).await.unwrap();
        assert!(repo.get("anthropic").await.unwrap().backfill_complete);

        repo.reset_backfill("anthropic").await.unwrap();
        let state = repo.get("anthropic").await.unwrap();
        assert!(!state.backfill_complete);
        assert_eq!(state.empty_window_streak, 0);
    }
}
