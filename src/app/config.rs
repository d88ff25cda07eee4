use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::AppPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub sync: SyncConfig,
    pub projection: ProjectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    /// Admin credentials, one per organization. Every credential is tried
    /// independently when resolving identities ("multi-org").
    pub credentials: Vec<CredentialConfig>,
    pub api_endpoint: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub org_name: String,
    pub admin_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Days re-fetched before the forward cursor to absorb late-arriving
    /// provider data.
    pub lookback_days: u32,
    /// Maximum width of one backfill fetch window, in days.
    pub backfill_window_days: u32,
    /// Consecutive empty small windows before backfill is marked complete.
    pub stop_on_empty_days: u32,
    /// A window wider than this never counts toward the empty streak.
    pub small_window_max_days: u32,
    /// Unmapped-id count at or under which identity resolution looks ids up
    /// individually instead of relisting the whole org.
    pub incremental_resync_max_ids: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Local hour at which daily usage is assumed to start accruing.
    pub workday_start_hour: u32,
    /// Local hour after which today's actual value is treated as final.
    pub workday_end_hour: u32,
    /// Blended today-estimates are capped at this multiple of the baseline.
    pub blend_cap_factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();

        // Disabled by default until an admin key is configured
        providers.insert(
            "anthropic".to_string(),
            ProviderConfig {
                enabled: false,
                credentials: Vec::new(),
                api_endpoint: None,
                timeout_seconds: Some(60),
            },
        );
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                enabled: false,
                credentials: Vec::new(),
                api_endpoint: None,
                timeout_seconds: Some(60),
            },
        );

        Self {
            providers,
            sync: SyncConfig::default(),
            projection: ProjectionConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_days: 1,
            backfill_window_days: 30,
            stop_on_empty_days: 7,
            small_window_max_days: 10,
            incremental_resync_max_ids: 25,
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            workday_start_hour: 7,
            workday_end_hour: 19,
            blend_cap_factor: 1.5,
        }
    }
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(paths).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(&config_file).await?;
        let config: AppConfig =
            toml::from_str(&config_content).map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();

        info!("Saving configuration to: {:?}", config_file);

        let config_content =
            toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;

        fs::write(&config_file, config_content).await?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            for cred in &provider.credentials {
                if cred.admin_key.is_empty() {
                    return Err(Error::config(format!(
                        "Provider {} org '{}' has an empty admin key",
                        name, cred.org_name
                    )));
                }
            }
        }

        if self.sync.backfill_window_days == 0 {
            return Err(Error::config("backfill_window_days must be at least 1"));
        }
        if self.sync.stop_on_empty_days == 0 {
            return Err(Error::config("stop_on_empty_days must be at least 1"));
        }
        if self.projection.workday_start_hour >= self.projection.workday_end_hour {
            return Err(Error::config(
                "workday_start_hour must be before workday_end_hour",
            ));
        }
        if self.projection.workday_end_hour > 24 {
            return Err(Error::config("workday_end_hour must be at most 24"));
        }

        Ok(())
    }

    /// Credentials for a provider, or a configuration error when the
    /// provider is enabled but has none. Jobs call this before any fetch so
    /// a missing credential never mutates state.
    pub fn credentials_for(&self, provider: &str) -> Result<&[CredentialConfig]> {
        let config = self
            .providers
            .get(provider)
            .ok_or_else(|| Error::MissingCredential(provider.to_string()))?;
        if config.credentials.is_empty() {
            return Err(Error::MissingCredential(provider.to_string()));
        }
        Ok(&config.credentials)
    }

    pub fn enabled_providers(&self) -> Vec<&str> {
        self.providers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
