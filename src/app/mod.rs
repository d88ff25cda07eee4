pub mod config;

pub use config::{AppConfig, CredentialConfig, ProjectionConfig, ProviderConfig, SyncConfig};
