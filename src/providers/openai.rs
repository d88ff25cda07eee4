use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::app::CredentialConfig;
use crate::error::{Error, Result};
use crate::providers::http::{build_client, classify};
use crate::providers::{ApiKeyActor, Granularity, OrgMember, RawUsageEvent, UsageProvider};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const USAGE_PAGE_LIMIT: u32 = 24;
// The org usage endpoints have a much tighter quota than the inference API;
// pacing pages avoids burning a whole invocation on a 429 mid-range.
const INTER_PAGE_DELAY: Duration = Duration::from_millis(1200);

/// OpenAI organization usage API adapter. Usage comes in hourly buckets
/// keyed by epoch seconds, grouped by API key and model.
pub struct OpenAIUsageProvider {
    client: Client,
    base_url: String,
}

impl OpenAIUsageProvider {
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
            .bearer_auth(&credential.admin_key)
            .query(query)
            .send()
            .await?;

        classify("openai", response).await
    }
}

#[async_trait]
impl UsageProvider for OpenAIUsageProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn tool(&self) -> &str {
        "codex"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Hourly
    }

    async fn fetch_usage(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        credential: &CredentialConfig,
    ) -> Result<Vec<RawUsageEvent>> {
        let start_time = start
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::provider("invalid start date"))?
            .and_utc()
            .timestamp();
        // end_time is exclusive
        let end_time = end
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .ok_or_else(|| Error::provider("invalid end date"))?
            .and_utc()
            .timestamp();

        let mut events = Vec::new();
        let mut page: Option<String> = None;
        let mut first = true;

        loop {
            if !first {
                tokio::time::sleep(INTER_PAGE_DELAY).await;
            }
            first = false;

            let mut query = vec![
                ("start_time", start_time.to_string()),
                ("end_time", end_time.to_string()),
                ("bucket_width", "1h".to_string()),
                ("group_by", "api_key_id,model".to_string()),
                ("limit", USAGE_PAGE_LIMIT.to_string()),
            ];
            if let Some(token) = &page {
                query.push(("page", token.clone()));
            }

            let response = self
                .get(credential, "/v1/organization/usage/completions", &query)
                .await?;
            let body: UsagePage = response.json().await?;

            for bucket in body.data {
                let date = bucket_date(bucket.start_time)?;
                for result in bucket.results {
                    events.push(RawUsageEvent {
                        date,
                        external_id: result.api_key_id,
                        model: result.model.clone().unwrap_or_else(|| "unknown".to_string()),
                        raw_model: result.model,
                        input_tokens: result
                            .input_tokens
                            .saturating_sub(result.input_cached_tokens),
                        cache_write_tokens: 0,
                        cache_read_tokens: result.input_cached_tokens,
                        output_tokens: result.output_tokens,
                        cost: Decimal::ZERO,
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
            "Fetched {} openai usage events for {}..={}",
            events.len(),
            start,
            end
        );
        Ok(events)
    }

    async fn list_members(&self, credential: &CredentialConfig) -> Result<Vec<OrgMember>> {
        let mut members = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(id) = &after {
                query.push(("after", id.clone()));
            }

            let response = self.get(credential, "/v1/organization/users", &query).await?;
            let body: ListPage<UserEntry> = response.json().await?;

            members.extend(body.data.into_iter().map(|u| OrgMember {
                id: u.id,
                email: u.email,
            }));

            if !body.has_more {
                break;
            }
            after = body.last_id;
            if after.is_none() {
                break;
            }
        }

        Ok(members)
    }

    async fn list_api_keys(&self, credential: &CredentialConfig) -> Result<Vec<ApiKeyActor>> {
        let mut keys = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(id) = &after {
                query.push(("after", id.clone()));
            }

            let response = self
                .get(credential, "/v1/organization/admin_api_keys", &query)
                .await?;
            let body: ListPage<ApiKeyEntry> = response.json().await?;

            keys.extend(body.data.into_iter().map(ApiKeyEntry::into_actor));

            if !body.has_more {
                break;
            }
            after = body.last_id;
            if after.is_none() {
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
            .get(format!(
                "{}/v1/organization/admin_api_keys/{}",
                self.base_url, id
            ))
            .bearer_auth(&credential.admin_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = classify("openai", response).await?;
        let entry: ApiKeyEntry = response.json().await?;
        Ok(Some(entry.into_actor()))
    }
}

fn bucket_date(start_time: i64) -> Result<NaiveDate> {
    DateTime::from_timestamp(start_time, 0)
        .map(|dt| dt.date_naive())
        .ok_or_else(|| Error::provider(format!("Invalid bucket timestamp {}", start_time)))
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
    start_time: i64,
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
    input_tokens: u64,
    #[serde(default)]
    input_cached_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
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
    owner: Option<Owner>,
}

#[derive(Debug, Deserialize)]
struct Owner {
    id: String,
}

impl ApiKeyEntry {
    fn into_actor(self) -> ApiKeyActor {
        ApiKeyActor {
            id: self.id,
            name: self.name,
            creator_id: self.owner.map(|o| o.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_date_from_epoch() {
        // 2025-01-15T13:00:00Z
        assert_eq!(
            bucket_date(1736946000).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_usage_page_deserializes() {
        let json = r#"{
            "data": [{
                "start_time": 1736946000,
                "end_time": 1736949600,
                "results": [{
                    "api_key_id": "key_42",
                    "model": "gpt-4o",
                    "input_tokens": 900,
                    "input_cached_tokens": 300,
                    "output_tokens": 120
                }]
            }],
            "has_more": false
        }"#;

        let page: UsagePage = serde_json::from_str(json).unwrap();
        assert!(!page.has_more);
        assert_eq!(page.data[0].results[0].input_tokens, 900);
    }

    #[test]
    fn test_cached_tokens_split_out_of_input() {
        let result = UsageResult {
            api_key_id: None,
            model: None,
            input_tokens: 900,
            input_cached_tokens: 300,
            output_tokens: 0,
        };
        assert_eq!(result.input_tokens.saturating_sub(result.input_cached_tokens), 600);
    }
}
