pub mod aggregate;
pub mod backfill;
pub mod forward;
pub mod identity;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;

use crate::app::SyncConfig;
use crate::providers::UsageProvider;
use crate::storage::{
    BackfillState, ForwardCursor, IdentityRepository, SyncStateRepository, UsageRepository,
};

pub use aggregate::{aggregate, Aggregated, AttributedEvent};
pub use identity::MappingRefreshOutcome;

/// Orchestrates the sync and backfill jobs for all providers. Holds only
/// pool-backed repositories, so it is cheap to construct per invocation;
/// scheduling and single-flight are the caller's concern.
pub struct SyncEngine {
    pub(crate) usage: UsageRepository,
    pub(crate) identities: IdentityRepository,
    pub(crate) sync_state: SyncStateRepository,
    pub(crate) config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        usage: UsageRepository,
        identities: IdentityRepository,
        sync_state: SyncStateRepository,
        config: SyncConfig,
    ) -> Self {
        Self {
            usage,
            identities,
            sync_state,
            config,
        }
    }

    /// Forward cursor plus derived backfill progress for one provider.
    pub async fn get_sync_state(
        &self,
        provider: &dyn UsageProvider,
    ) -> crate::error::Result<SyncStatus> {
        let state = self.sync_state.get(provider.name()).await?;
        let oldest_date = self.usage.oldest_date(provider.tool()).await?;

        Ok(SyncStatus {
            last_forward_cursor: state.last_forward_cursor,
            last_sync_at: state.last_sync_at.map(|dt| dt.to_rfc3339()),
            backfill: BackfillState {
                oldest_date,
                complete: state.backfill_complete,
            },
        })
    }

    /// Last date each tool's provider is known to have fully reported,
    /// derived from the forward cursor. The cursor's own period is still
    /// open, so completeness trails it by one day; a tool with no cursor
    /// has nothing confirmed.
    pub async fn completeness_map(
        &self,
        providers: &[&dyn UsageProvider],
    ) -> crate::error::Result<HashMap<String, NaiveDate>> {
        let mut map = HashMap::new();
        for provider in providers {
            let state = self.sync_state.get(provider.name()).await?;
            let Some(synced_through) = state
                .last_forward_cursor
                .and_then(|c| c.as_datetime())
                .map(|dt| dt.date_naive())
            else {
                continue;
            };
            map.insert(provider.tool().to_string(), synced_through - Duration::days(1));
        }
        Ok(map)
    }

    /// Admin action: clear the sticky backfill-complete flag so the next
    /// backfill run probes history again.
    pub async fn reset_backfill(&self, provider: &str) -> crate::error::Result<()> {
        self.sync_state.reset_backfill(provider).await
    }
}

#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub last_forward_cursor: Option<ForwardCursor>,
    pub last_sync_at: Option<String>,
    pub backfill: BackfillState,
}

/// Result of one forward sync invocation. Expected failure modes land in
/// `errors` rather than aborting the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub rate_limited: bool,
}

/// Result of one backfill invocation. `rate_limited` means the run was cut
/// short and will continue from the same point on the next scheduled run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillOutcome {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub rate_limited: bool,
    pub backfill_complete: bool,
    pub last_processed_date: Option<NaiveDate>,
}
