pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::app::CredentialConfig;
use crate::error::Result;

pub use anthropic::AnthropicUsageProvider;
pub use openai::OpenAIUsageProvider;

/// Reporting granularity of a provider's usage endpoint. Decides how the
/// forward cursor is typed and how buckets collapse to dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Daily,
    Hourly,
}

/// One raw usage event as reported by a provider: one time bucket for one
/// actor and model. Several of these collapse into a single stored row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUsageEvent {
    pub date: NaiveDate,
    /// Provider-side actor id (API key id, user id). None when the provider
    /// reports org-level usage it can't attribute.
    pub external_id: Option<String>,
    pub model: String,
    pub raw_model: Option<String>,
    pub input_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
}

/// Org member from the provider's directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgMember {
    pub id: String,
    pub email: String,
}

/// API key (or other actor) from the provider's listing, with the id of the
/// member who created it for cross-referencing to an email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyActor {
    pub id: String,
    pub name: Option<String>,
    pub creator_id: Option<String>,
}

/// Paginated, authenticated access to one provider's admin reporting APIs.
///
/// Implementations fetch sequentially, honor the provider's inter-request
/// quota, and classify every response as success, rate-limited
/// (`Error::RateLimited`, terminal for the call, zero retries) or hard error
/// (`Error::Provider`). They never touch storage or sync state.
#[async_trait]
pub trait UsageProvider: Send + Sync {
    /// Provider key used in config and sync_state, e.g. "anthropic".
    fn name(&self) -> &str;

    /// Tool the imported rows are attributed to, e.g. "claude-code".
    fn tool(&self) -> &str;

    fn granularity(&self) -> Granularity;

    /// Fetch all usage events in [start, end] (inclusive dates), walking
    /// pagination to exhaustion.
    async fn fetch_usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        credential: &CredentialConfig,
    ) -> Result<Vec<RawUsageEvent>>;

    /// List every member of the credential's organization.
    async fn list_members(&self, credential: &CredentialConfig) -> Result<Vec<OrgMember>>;

    /// List every API key / actor in the credential's organization.
    async fn list_api_keys(&self, credential: &CredentialConfig) -> Result<Vec<ApiKeyActor>>;

    /// Look up a single actor by id. Used by incremental identity resync,
    /// where each configured credential is tried in turn; Ok(None) means
    /// this org doesn't know the id.
    async fn lookup_api_key(
        &self,
        credential: &CredentialConfig,
        id: &str,
    ) -> Result<Option<ApiKeyActor>>;
}

pub(crate) mod http {
    use reqwest::{Client, Response, StatusCode};
    use std::time::Duration;
    use tracing::warn;

    use crate::error::{Error, Result};

    pub fn build_client(timeout_seconds: u64) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| Error::provider(format!("Failed to create HTTP client: {}", e)))
    }

    /// Classify a response: success passes through, 429 is terminal
    /// rate-limiting, anything else is a hard API error.
    pub async fn classify(provider: &str, response: Response) -> Result<Response> {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("{} rate limited the request", provider);
            return Err(Error::RateLimited(provider.to_string()));
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!("{} API error: {} - {}", provider, status, error_text);
            return Err(Error::provider(format!(
                "{} API error {}: {}",
                provider, status, error_text
            )));
        }

        Ok(response)
    }
}
