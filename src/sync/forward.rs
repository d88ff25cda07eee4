use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use tracing::{info, warn};

use crate::app::CredentialConfig;
use crate::error::{Error, Result};
use crate::providers::{Granularity, UsageProvider};
use crate::storage::ForwardCursor;
use crate::sync::{aggregate, SyncEngine, SyncOutcome};

impl SyncEngine {
    /// Run one forward sync for a provider: fetch from the last cursor
    /// (minus a lookback overlap for late-arriving data) through now, and
    /// advance the cursor only if everything succeeded. Rate limiting
    /// aborts with the cursor untouched so the same range is retried on
    /// the next scheduled run, never skipped.
    pub async fn sync_forward(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        now: DateTime<Utc>,
    ) -> SyncOutcome {
        match self.run_forward(provider, credentials, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Forward sync for {} failed: {}", provider.name(), e);
                SyncOutcome {
                    errors: vec![e.to_string()],
                    ..Default::default()
                }
            }
        }
    }

    async fn run_forward(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome> {
        let name = provider.name();
        if credentials.is_empty() {
            return Err(Error::MissingCredential(name.to_string()));
        }

        let mut outcome = SyncOutcome::default();
        let state = self.sync_state.get(name).await?;

        // Cursor at or past the start of the current period means there is
        // no complete period left to fetch.
        if let Some(cursor) = state.last_forward_cursor {
            if let Some(synced_through) = cursor.as_datetime() {
                if synced_through >= period_floor(now, provider.granularity()) {
                    info!("{} forward sync is a no-op, cursor already current", name);
                    return Ok(outcome);
                }
            }
        }

        let today = now.date_naive();
        let start = fetch_start(
            state.last_forward_cursor,
            today,
            self.config.lookback_days,
        );

        info!("Forward syncing {} from {} to {}", name, start, today);

        for credential in credentials {
            let events = match provider.fetch_usage(start, today, credential).await {
                Ok(events) => events,
                Err(Error::RateLimited(_)) => {
                    // Terminal for this invocation; rows stored so far stay.
                    info!("{} rate limited, will continue on next run", name);
                    outcome.rate_limited = true;
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!("{} fetch for org '{}' failed: {}", name, credential.org_name, e);
                    outcome.errors.push(e.to_string());
                    return Ok(outcome);
                }
            };

            let attributed = self.attribute_events(provider.tool(), events).await?;
            let aggregated = aggregate(provider.tool(), attributed);
            outcome.skipped += aggregated.skipped;

            for row in &aggregated.rows {
                match self.usage.upsert_record(row).await {
                    Ok(()) => outcome.imported += 1,
                    Err(e) => {
                        // One malformed row never aborts the batch
                        warn!("Skipping usage row for {}: {}", name, e);
                        outcome.skipped += 1;
                        outcome.errors.push(e.to_string());
                    }
                }
            }
        }

        let cursor = match provider.granularity() {
            Granularity::Daily => ForwardCursor::Date(today),
            Granularity::Hourly => ForwardCursor::EpochSeconds(now.timestamp()),
        };
        self.sync_state.advance_forward_cursor(name, cursor).await?;

        info!(
            "Forward sync for {} imported {} rows ({} skipped)",
            name, outcome.imported, outcome.skipped
        );
        Ok(outcome)
    }
}

fn fetch_start(cursor: Option<ForwardCursor>, today: NaiveDate, lookback_days: u32) -> NaiveDate {
    let anchor = cursor
        .and_then(|c| c.as_datetime())
        .map(|dt| dt.date_naive())
        .unwrap_or(today);
    anchor - Duration::days(lookback_days as i64)
}

fn period_floor(now: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Daily => now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid")
            .and_utc(),
        Granularity::Hourly => now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .expect("hour floor is always valid"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::*;

    fn at(date: &str, hour: u32) -> DateTime<Utc> {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_over_same_window() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();
        let now = at("2025-01-16", 12);

        provider.push_fetch(Ok(vec![
            usage_event("2025-01-15", "key-1", 1000, 200),
            usage_event("2025-01-15", "key-2", 2000, 500),
        ]));

        let first = engine
            .sync_forward(&provider, &[credential()], now)
            .await;
        assert_eq!(first.imported, 2);
        assert!(first.errors.is_empty());

        // Same data fetched again the next day
        provider.push_fetch(Ok(vec![
            usage_event("2025-01-15", "key-1", 1000, 200),
            usage_event("2025-01-15", "key-2", 2000, 500),
        ]));
        let second = engine
            .sync_forward(&provider, &[credential()], at("2025-01-17", 12))
            .await;
        assert_eq!(second.imported, 2);

        assert_eq!(engine.usage.record_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resync_overwrites_totals() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        provider.push_fetch(Ok(vec![
            usage_event("2025-01-15", "key-1", 100, 10),
            usage_event("2025-01-15", "key-1", 200, 20),
        ]));
        engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 12))
            .await;

        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let rows = engine.usage.records_for_date(date).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_tokens, 300);

        // Provider restates the day with different totals: overwrite, not add
        provider.push_fetch(Ok(vec![usage_event("2025-01-15", "key-1", 450, 45)]));
        engine
            .sync_forward(&provider, &[credential()], at("2025-01-17", 12))
            .await;

        let rows = engine.usage.records_for_date(date).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_tokens, 450);
    }

    #[tokio::test]
    async fn test_rate_limit_leaves_cursor_unchanged() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        provider.push_fetch(Err(rate_limited()));
        let outcome = engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 12))
            .await;

        assert!(outcome.rate_limited);
        assert!(outcome.errors.is_empty());
        let state = engine.sync_state.get("mock").await.unwrap();
        assert_eq!(state.last_forward_cursor, None);

        // Next run retries the identical range
        provider.push_fetch(Ok(vec![]));
        engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 13))
            .await;
        let ranges = provider.ranges();
        assert_eq!(ranges[0], ranges[1]);
    }

    #[tokio::test]
    async fn test_cursor_advances_only_on_success() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        provider.push_fetch(Ok(vec![usage_event("2025-01-15", "key-1", 10, 1)]));
        engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 12))
            .await;

        let state = engine.sync_state.get("mock").await.unwrap();
        assert_eq!(
            state.last_forward_cursor,
            Some(crate::storage::ForwardCursor::Date(
                NaiveDate::from_ymd_opt(2025, 1, 16).unwrap()
            ))
        );
        assert!(state.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_current_cursor_is_noop() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        provider.push_fetch(Ok(vec![]));
        engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 9))
            .await;
        assert_eq!(provider.ranges().len(), 1);

        // Later the same day: cursor already covers the current period
        let outcome = engine
            .sync_forward(&provider, &[credential()], at("2025-01-16", 15))
            .await;
        assert_eq!(outcome.imported, 0);
        assert_eq!(provider.ranges().len(), 1, "no fetch on no-op");
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_without_state_change() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        let outcome = engine.sync_forward(&provider, &[], at("2025-01-16", 12)).await;
        assert_eq!(outcome.errors.len(), 1);

        let state = engine.sync_state.get("mock").await.unwrap();
        assert_eq!(state.last_forward_cursor, None);
    }

    #[tokio::test]
    async fn test_hard_error_keeps_partial_progress() {
        let (engine, _temp_dir) = create_test_engine().await;
        let provider = MockProvider::new();

        // First org succeeds, second hits a hard API error
        provider.push_fetch(Ok(vec![usage_event("2025-01-15", "key-1", 10, 1)]));
        provider.push_fetch(Err(crate::error::Error::provider("boom")));

        let creds = [credential(), credential()];
        let outcome = engine
            .sync_forward(&provider, &creds, at("2025-01-16", 12))
            .await;

        assert_eq!(outcome.imported, 1);
        assert_eq!(outcome.errors.len(), 1);
        // Cursor stays put so the failed range is retried
        let state = engine.sync_state.get("mock").await.unwrap();
        assert_eq!(state.last_forward_cursor, None);
    }

    #[test]
    fn test_lookback_overlap() {
        let today = NaiveDate::from_ymd_opt(2025, 1, 16).unwrap();
        let cursor = ForwardCursor::Date(NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
        assert_eq!(
            fetch_start(Some(cursor), today, 1),
            NaiveDate::from_ymd_opt(2025, 1, 14).unwrap()
        );
        assert_eq!(
            fetch_start(None, today, 1),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }
}
