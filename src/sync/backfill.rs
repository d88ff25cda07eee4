use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{info, warn};

use crate::app::CredentialConfig;
use crate::error::{Error, Result};
use crate::providers::UsageProvider;
use crate::sync::{aggregate, BackfillOutcome, SyncEngine};

impl SyncEngine {
    /// Run one bounded unit of historical backfill toward `target`.
    ///
    /// Re-entrant: the resume point is derived from stored data (MIN date)
    /// plus the persisted empty-window streak, never from an in-memory
    /// position, so repeated or interleaved invocations converge. A
    /// rate-limited run leaves all state untouched and is retried whole.
    ///
    /// Providers give no definitive "no more history" signal; exhaustion is
    /// inferred once `stop_on_empty_days` consecutive windows come back
    /// empty. Only small windows may conclude exhaustion: one empty large
    /// window could just be a usage gap a wide jump happened to land on.
    pub async fn backfill(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        target: NaiveDate,
        now: DateTime<Utc>,
    ) -> BackfillOutcome {
        match self.run_backfill(provider, credentials, target, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Backfill for {} failed: {}", provider.name(), e);
                BackfillOutcome {
                    errors: vec![e.to_string()],
                    ..Default::default()
                }
            }
        }
    }

    async fn run_backfill(
        &self,
        provider: &dyn UsageProvider,
        credentials: &[CredentialConfig],
        target: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<BackfillOutcome> {
        let name = provider.name();
        if credentials.is_empty() {
            return Err(Error::MissingCredential(name.to_string()));
        }

        let mut outcome = BackfillOutcome::default();
        let state = self.sync_state.get(name).await?;

        if state.backfill_complete {
            outcome.backfill_complete = true;
            return Ok(outcome);
        }

        let oldest = self.usage.oldest_date(provider.tool()).await?;
        if let Some(oldest) = oldest {
            if oldest <= target {
                info!("{} backfill already reaches {}", name, target);
                return Ok(outcome);
            }
        }

        let Some(window) = fetch_window(
            oldest,
            target,
            now.date_naive(),
            self.config.backfill_window_days,
            state.empty_window_streak,
        ) else {
            info!("{} backfill has probed down to {}", name, target);
            return Ok(outcome);
        };

        let window_days = (window.1 - window.0).num_days() + 1;
        info!(
            "Backfilling {} window {}..={} ({} days)",
            name, window.0, window.1, window_days
        );

        let mut fetched_events = 0usize;
        for credential in credentials {
            let events = match provider.fetch_usage(window.0, window.1, credential).await {
                Ok(events) => events,
                Err(Error::RateLimited(_)) => {
                    info!("{} rate limited, backfill will continue on next run", name);
                    outcome.rate_limited = true;
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!("{} fetch for org '{}' failed: {}", name, credential.org_name, e);
                    outcome.errors.push(e.to_string());
                    return Ok(outcome);
                }
            };
            fetched_events += events.len();

            let attributed = self.attribute_events(provider.tool(), events).await?;
            let aggregated = aggregate(provider.tool(), attributed);
            outcome.skipped += aggregated.skipped;

            for row in &aggregated.rows {
                match self.usage.upsert_record(row).await {
                    Ok(()) => outcome.imported += 1,
                    Err(e) => {
                        warn!("Skipping usage row for {}: {}", name, e);
                        outcome.skipped += 1;
                        outcome.errors.push(e.to_string());
                    }
                }
            }
        }

        outcome.last_processed_date = Some(window.0);

        if fetched_events == 0 {
            let streak = state.empty_window_streak + 1;
            self.sync_state.set_empty_window_streak(name, streak).await?;

            let small = window_days <= self.config.small_window_max_days as i64;
            if small && streak >= self.config.stop_on_empty_days {
                self.sync_state.mark_backfill_complete(name).await?;
                outcome.backfill_complete = true;
                info!(
                    "{} history exhausted after {} empty windows",
                    name, streak
                );
            }
        } else if state.empty_window_streak > 0 {
            self.sync_state.set_empty_window_streak(name, 0).await?;
        }

        Ok(outcome)
    }
}

/// The next window to fetch, as an inclusive (start, end) date pair, or
/// None when probing has already passed the target.
///
/// The window ends the day before the oldest stored date (or yesterday when
/// nothing is stored yet). Empty windows store nothing, so MIN(date) alone
/// would re-probe the same range forever; the persisted empty-window streak
/// shifts each successive probe one full window further back.
fn fetch_window(
    oldest: Option<NaiveDate>,
    target: NaiveDate,
    today: NaiveDate,
    window_days: u32,
    empty_streak: u32,
) -> Option<(NaiveDate, NaiveDate)> {
    let anchor = match oldest {
        Some(date) => date - Duration::days(1),
        None => today - Duration::days(1),
    };

    let end = anchor - Duration::days(empty_streak as i64 * window_days as i64);
    if end < target {
        return None;
    }

    let start = (end - Duration::days(window_days as i64 - 1)).max(target);
    Some((start, end))
}
