pub mod database;
pub mod identity;
pub mod sync_state;
pub mod usage;

pub use database::Database;
pub use identity::IdentityRepository;
pub use sync_state::{BackfillState, ForwardCursor, SyncStateRepository};
pub use usage::{DailyToolUsage, UsageRepository, UsageRow};
