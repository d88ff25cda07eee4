use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::providers::RawUsageEvent;
use crate::storage::UsageRow;

/// A raw provider event paired with its resolved identity. Resolution
/// happens before aggregation so rows for the same person collapse even
/// when the provider reported them under different buckets.
#[derive(Debug, Clone)]
pub struct AttributedEvent {
    pub event: RawUsageEvent,
    pub identity: Option<String>,
}

#[derive(Debug, Default)]
pub struct Aggregated {
    pub rows: Vec<UsageRow>,
    /// Rows whose token fields summed to zero. Not imported, not errors.
    pub skipped: usize,
}

/// Grouping key for one stored row. A struct key instead of a joined string:
/// identity and model strings are provider-controlled, so no visible
/// delimiter is collision-safe, and `Option` keeps "unattributed" distinct
/// from any sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RowKey {
    date: NaiveDate,
    identity: Option<String>,
    model: String,
    provider_record_id: Option<String>,
}

/// Collapse raw per-event results into one row per
/// (date, identity, tool, model, provider record id), summing token and
/// cost fields. Pure; ordering of the input doesn't affect the output rows.
pub fn aggregate(tool: &str, events: Vec<AttributedEvent>) -> Aggregated {
    let mut groups: HashMap<RowKey, UsageRow> = HashMap::new();

    for AttributedEvent { event, identity } in events {
        let key = RowKey {
            date: event.date,
            identity: identity.clone(),
            model: event.model.clone(),
            provider_record_id: event.external_id.clone(),
        };

        let row = groups.entry(key).or_insert_with(|| UsageRow {
            date: event.date,
            identity,
            tool: tool.to_string(),
            model: event.model.clone(),
            provider_record_id: event.external_id.clone(),
            input_tokens: 0,
            cache_write_tokens: 0,
            cache_read_tokens: 0,
            output_tokens: 0,
            cost: Decimal::ZERO,
            raw_model: event.raw_model.clone(),
        });

        row.input_tokens += event.input_tokens;
        row.cache_write_tokens += event.cache_write_tokens;
        row.cache_read_tokens += event.cache_read_tokens;
        row.output_tokens += event.output_tokens;
        row.cost += event.cost;
    }

    let mut result = Aggregated::default();
    for row in groups.into_values() {
        if row.total_tokens() == 0 {
            result.skipped += 1;
        } else {
            result.rows.push(row);
        }
    }

    // Stable order for deterministic upserts and assertions
    result.rows.sort_by(|a, b| {
        (a.date, &a.identity, &a.model, &a.provider_record_id).cmp(&(
            b.date,
            &b.identity,
            &b.model,
            &b.provider_record_id,
        ))
    });

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(
        date: &str,
        external_id: Option<&str>,
        model: &str,
        input: u64,
        output: u64,
    ) -> RawUsageEvent {
        RawUsageEvent {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            external_id: external_id.map(str::to_string),
            model: model.to_string(),
            raw_model: Some(model.to_string()),
            input_tokens: input,
            cache_write_tokens: 0,
            cache_read_tokens: 0,
            output_tokens: output,
            cost: Decimal::ZERO,
        }
    }

    fn attributed(event: RawUsageEvent, identity: Option<&str>) -> AttributedEvent {
        AttributedEvent {
            event,
            identity: identity.map(str::to_string),
        }
    }

    #[test]
    fn test_events_with_same_key_sum() {
        let events = vec![
            attributed(
                event("2025-01-15", Some("key-1"), "claude-sonnet-4", 100, 10),
                Some("u@example.com"),
            ),
            attributed(
                event("2025-01-15", Some("key-1"), "claude-sonnet-4", 250, 30),
                Some("u@example.com"),
            ),
        ];

        let result = aggregate("claude-code", events);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].input_tokens, 350);
        assert_eq!(result.rows[0].output_tokens, 40);
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn test_distinct_record_ids_make_distinct_rows() {
        let events = vec![
            attributed(
                event("2025-01-15", Some("key-1"), "claude-sonnet-4", 1000, 200),
                Some("u@example.com"),
            ),
            attributed(
                event("2025-01-15", Some("key-2"), "claude-sonnet-4", 2000, 500),
                Some("u@example.com"),
            ),
        ];

        let result = aggregate("claude-code", events);
        assert_eq!(result.rows.len(), 2);
        assert!(result
            .rows
            .iter()
            .all(|r| r.identity.as_deref() == Some("u@example.com")));
    }

    #[test]
    fn test_zero_token_rows_are_skipped() {
        let events = vec![
            attributed(event("2025-01-15", Some("key-1"), "claude-sonnet-4", 0, 0), None),
            attributed(event("2025-01-15", Some("key-2"), "claude-sonnet-4", 5, 0), None),
        ];

        let result = aggregate("claude-code", events);
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn test_unattributed_is_distinct_from_any_identity() {
        let events = vec![
            attributed(event("2025-01-15", Some("key-1"), "m", 10, 0), None),
            attributed(event("2025-01-15", Some("key-1"), "m", 20, 0), Some("")),
        ];

        // An empty-string identity is a real (if odd) identity; None is not.
        let result = aggregate("claude-code", events);
        assert_eq!(result.rows.len(), 2);
    }
}
