use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::app::CredentialConfig;
use crate::error::{Error, Result};
use crate::providers::http::{build_client, classify};
use crate::providers::{ApiKeyActor, Granularity, OrgMember, RawUsageEvent, UsageProvider};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const USAGE_PAGE_LIMIT: u32 = 31;

/// Anthropic Admin API adapter. Usage is reported in daily buckets grouped
/// by API key and model, paginated with opaque page tokens.
pub struct AnthropicUsageProvider {
    client: Client,
    base_url: String,
}

impl AnthropicUsageProvider {
    pub fn new(base_url: Option<String>, timeout_seconds: u64) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout_seconds)?,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    async fn get(
        &self,
        credential: &CredentialConfig,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("x-api-key", &credential.admin_key)
            .header("anthropic-version", API_VERSION)
            .query(query)
            .send()
            .await?;

        classify("anthropic", response).await
    }
}

#[async_trait]
impl UsageProvider for AnthropicUsageProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn tool(&self) -> &str {
        "claude-code"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Daily
    }

    async fn fetch_usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        credential: &CredentialConfig,
    ) -> Result<Vec<RawUsageEvent>> {
        let starting_at = start
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::provider("invalid start date"))?
            .and_utc();
        // ending_at is exclusive, so step one day past the inclusive end
        let ending_at = end
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| Error::provider("invalid end date"))?
            .and_utc();

        let mut events = Vec::new();
        let mut page: Option<String> = None;

        loop {
            let mut query = vec![
                ("starting_at", starting_at.to_rfc3339()),
                ("ending_at", ending_at.to_rfc3339()),
                ("bucket_width", "1d".to_string()),
                ("group_by[]", "api_key_id".to_string()),
                ("group_by[]", "model".to_string()),
                ("limit", USAGE_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = &page {
                query.push(("page", token.clone()));
            }

            let response = self
                .get(credential, "/v1/organizations/usage_report/messages", &query)
                .await?;
            let body: UsagePage = response.json().await?;

            for bucket in body.data {
                let date = bucket_date(&bucket.starting_at)?;
                for result in bucket.results {
                    events.push(RawUsageEvent {
                        date,
                        external_id: result.api_key_id,
                        model: result.model.clone().unwrap_or_else(|| "unknown".to_string()),
                        raw_model: result.model,
                        input_tokens: result.uncached_input_tokens,
                        cache_write_tokens: result.cache_creation_input_tokens,
                        cache_read_tokens: result.cache_read_input_tokens,
                        output_tokens: result.output_tokens,
                        cost: result
                            .cost_usd
                            .and_then(Decimal::from_f64_retain)
                            .unwrap_or(Decimal::ZERO),
                    });
                }
            }

            if !body.has_more {
                break;
            }
            page = body.next_page;
            if page.is_none() {
                break;
            }
        }

        debug!(
            "Fetched {} anthropic usage events for {}..={}",
            events.len(),
            start,
            end
        );
        Ok(events)
    }

    async fn list_members(&self, credential: &CredentialConfig) -> Result<Vec<OrgMember>> {
        let mut members = Vec::new();
        let mut after_id: Option<String> = None;

        loop {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(id) = &after_id {
                query.push(("after_id", id.clone()));
            }

            let response = self.get(credential, "/v1/organizations/users", &query).await?;
            let body: ListPage<UserEntry> = response.json().await?;

            members.extend(body.data.into_iter().map(|u| OrgMember {
                id: u.id,
                email: u.email,
            }));

            if !body.has_more {
                break;
            }
            after_id = body.last_id;
            if after_id.is_none() {
                break;
            }
        }

        Ok(members)
    }

    async fn list_api_keys(&self, credential: &CredentialConfig) -> Result<Vec<ApiKeyActor>> {
        let mut keys = Vec::new();
        let mut after_id: Option<String> = None;

        loop {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(id) = &after_id {
                query.push(("after_id", id.clone()));
            }

            let response = self
                .get(credential, "/v1/organizations/api_keys", &query)
                .await?;
            let body: ListPage<ApiKeyEntry> = response.json().await?;

            keys.extend(body.data.into_iter().map(ApiKeyEntry::into_actor));

            if !body.has_more {
                break;
            }
            after_id = body.last_id;
            if after_id.is_none() {
                break;
            }
        }

        Ok(keys)
    }

    async fn lookup_api_key(
        &self,
        credential: &CredentialConfig,
        id: &str,
    ) -> Result<Option<ApiKeyActor>> {
        let response = self
            .client
            .get(format!("{}/v1/organizations/api_keys/{}", self.base_url, id))
            .header("x-api-key", &credential.admin_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await?;

        // A key belonging to another org is reported as not-found; the
        // caller tries the next credential.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = classify("anthropic", response).await?;
        let entry: ApiKeyEntry = response.json().await?;
        Ok(Some(entry.into_actor()))
    }
}

fn bucket_date(starting_at: &str) -> Result<NaiveDate> {
    DateTime::parse_from_rfc3339(starting_at)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|e| Error::provider(format!("Invalid bucket timestamp '{}': {}", starting_at, e)))
}

#[derive(Debug, Deserialize)]
struct UsagePage {
    data: Vec<UsageBucket>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBucket {
    starting_at: String,
    #[serde(default)]
    results: Vec<UsageResult>,
}

#[derive(Debug, Deserialize)]
struct UsageResult {
    #[serde(default)]
    api_key_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    uncached_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct ApiKeyEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_by: Option<CreatedBy>,
}

#[derive(Debug, Deserialize)]
struct CreatedBy {
    id: String,
}

impl ApiKeyEntry {
    fn into_actor(self) -> ApiKeyActor {
        ApiKeyActor {
            id: self.id,
            name: self.name,
            creator_id: self.created_by.map(|c| c.id),
        }
    }
}
