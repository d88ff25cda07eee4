use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::app::ProjectionConfig;
use crate::storage::DailyToolUsage;

/// One annotated point of the read model. Never persisted; presentation
/// derives "estimated" vs "confirmed" from whether a projection is set.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectedPoint {
    pub date: NaiveDate,
    pub tool: String,
    /// True stored token total, always retained.
    pub actual_tokens: u64,
    pub cost: Decimal,
    /// Estimate substituted for display, when one was produced.
    pub projected_tokens: Option<f64>,
    pub is_incomplete: bool,
}

impl ProjectedPoint {
    /// The value a dashboard should plot.
    pub fn displayed_tokens(&self) -> f64 {
        self.projected_tokens.unwrap_or(self.actual_tokens as f64)
    }
}

/// Read-time projection over a stored daily series.
///
/// Dates a provider hasn't fully reported yet would otherwise plot as
/// misleadingly low; those are flagged and, where a historical baseline
/// exists, filled with an estimate instead.
pub struct ProjectionEngine {
    config: ProjectionConfig,
}

impl ProjectionEngine {
    pub fn new(config: ProjectionConfig) -> Self {
        Self { config }
    }

    /// Annotate a series. `completeness` maps each tool to the last date
    /// its provider is known to have fully reported; a missing entry means
    /// nothing is confirmed. `local_hour` is the wall-clock hour used for
    /// today's completion factor (fractional hours allowed).
    pub fn project(
        &self,
        series: &[DailyToolUsage],
        completeness: &HashMap<String, NaiveDate>,
        as_of: NaiveDate,
        local_hour: f64,
    ) -> Vec<ProjectedPoint> {
        let factor = self.completion_factor(local_hour);

        series
            .iter()
            .map(|point| {
                let last_data_date = completeness.get(&point.tool).copied();
                let complete =
                    point.date != as_of && last_data_date.is_some_and(|d| point.date <= d);

                if complete {
                    return ProjectedPoint {
                        date: point.date,
                        tool: point.tool.clone(),
                        actual_tokens: point.total_tokens(),
                        cost: point.cost,
                        projected_tokens: None,
                        is_incomplete: false,
                    };
                }

                let baseline = baseline_for(series, point, as_of, last_data_date);
                let projected = if point.date == as_of {
                    project_today(point.total_tokens(), factor, baseline, &self.config)
                } else {
                    // A past day the provider hasn't reported yet: show the
                    // historical baseline rather than a partial value.
                    baseline
                };

                ProjectedPoint {
                    date: point.date,
                    tool: point.tool.clone(),
                    actual_tokens: point.total_tokens(),
                    cost: point.cost,
                    projected_tokens: projected,
                    is_incomplete: true,
                }
            })
            .collect()
    }

    /// Fraction of the working-hours window that has elapsed. Usage
    /// concentrates in that window, so before it opens nothing meaningful
    /// can be extrapolated and after it closes the day is effectively over.
    fn completion_factor(&self, local_hour: f64) -> f64 {
        let start = self.config.workday_start_hour as f64;
        let end = self.config.workday_end_hour as f64;

        if local_hour <= start {
            0.0
        } else if local_hour >= end {
            1.0
        } else {
            (local_hour - start) / (end - start)
        }
    }
}

/// Blend today's partial value with the baseline.
///
/// Early in the day the extrapolation v/f is wildly sensitive to noise, so
/// the blend weights toward the baseline; late in the day the actual data
/// dominates. The cap bounds a burst of early activity at 1.5x (configurable)
/// of a normal day; with no baseline there is nothing to anchor a cap to.
fn project_today(
    actual: u64,
    factor: f64,
    baseline: Option<f64>,
    config: &ProjectionConfig,
) -> Option<f64> {
    if factor <= 0.0 {
        // Before the window opens: flag only, never guess
        return None;
    }
    if factor >= 1.0 {
        // The day is over; the actual value is final
        return None;
    }

    let actual = actual as f64;
    if actual == 0.0 {
        return baseline;
    }

    let extrapolated = actual / factor;
    match baseline {
        Some(baseline) => {
            let blended = factor * extrapolated + (1.0 - factor) * baseline;
            Some(blended.min(baseline * config.blend_cap_factor))
        }
        None => Some(extrapolated),
    }
}

/// Baseline for an incomplete point: average of the same weekday over
/// complete days when at least two samples exist, otherwise the simple
/// average over all complete days, otherwise nothing.
fn baseline_for(
    series: &[DailyToolUsage],
    point: &DailyToolUsage,
    as_of: NaiveDate,
    last_data_date: Option<NaiveDate>,
) -> Option<f64> {
    let complete_days: Vec<&DailyToolUsage> = series
        .iter()
        .filter(|p| {
            p.tool == point.tool
                && p.date != as_of
                && last_data_date.is_some_and(|d| p.date <= d)
        })
        .collect();

    if complete_days.is_empty() {
        return None;
    }

    let weekday = point.date.weekday();
    let same_weekday: Vec<f64> = complete_days
        .iter()
        .filter(|p| p.date.weekday() == weekday)
        .map(|p| p.total_tokens() as f64)
        .collect();

    if same_weekday.len() >= 2 {
        return Some(same_weekday.iter().sum::<f64>() / same_weekday.len() as f64);
    }

    let all: Vec<f64> = complete_days
        .iter()
        .map(|p| p.total_tokens() as f64)
        .collect();
    Some(all.iter().sum::<f64>() / all.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProjectionConfig {
        ProjectionConfig {
            workday_start_hour: 7,
            workday_end_hour: 19,
            blend_cap_factor: 1.5,
        }
    }

    fn usage(date: &str, tokens: u64) -> DailyToolUsage {
        DailyToolUsage {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            tool: "claude-code".to_string(),
            input_tokens: tokens,
            cache_write_tokens: 0,
            cache_read_tokens: 0,
            output_tokens: 0,
            cost: Decimal::ZERO,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn completeness(last: &str) -> HashMap<String, NaiveDate> {
        HashMap::from([("claude-code".to_string(), date(last))])
    }

    #[test]
    fn test_complete_days_pass_through() {
        let engine = ProjectionEngine::new(config());
        let series = vec![usage("2025-01-13", 800), usage("2025-01-14", 900)];

        let points = engine.project(&series, &completeness("2025-01-14"), date("2025-01-16"), 12.0);

        assert!(points.iter().all(|p| !p.is_incomplete));
        assert!(points.iter().all(|p| p.projected_tokens.is_none()));
        assert_eq!(points[0].displayed_tokens(), 800.0);
    }

    #[test]
    fn test_incomplete_past_day_shows_baseline() {
        let engine = ProjectionEngine::new(config());
        // 2025-01-06 and 2025-01-13 are Mondays, as is the incomplete 2025-01-20
        let series = vec![
            usage("2025-01-06", 1000),
            usage("2025-01-13", 1200),
            usage("2025-01-20", 50),
        ];

        let points = engine.project(&series, &completeness("2025-01-14"), date("2025-01-22"), 12.0);

        let monday = points.iter().find(|p| p.date == date("2025-01-20")).unwrap();
        assert!(monday.is_incomplete);
        assert_eq!(monday.actual_tokens, 50);
        assert_eq!(monday.projected_tokens, Some(1100.0), "same-weekday average");
    }

    #[test]
    fn test_simple_average_when_too_few_weekday_samples() {
        let engine = ProjectionEngine::new(config());
        let series = vec![
            usage("2025-01-13", 1000),
            usage("2025-01-14", 500),
            usage("2025-01-17", 10),
        ];

        let points = engine.project(&series, &completeness("2025-01-14"), date("2025-01-22"), 12.0);

        let incomplete = points.iter().find(|p| p.date == date("2025-01-17")).unwrap();
        assert_eq!(incomplete.projected_tokens, Some(750.0));
    }

    #[test]
    fn test_no_baseline_keeps_raw_value() {
        let engine = ProjectionEngine::new(config());
        let series = vec![usage("2025-01-20", 50)];

        let points = engine.project(&series, &HashMap::new(), date("2025-01-22"), 12.0);

        assert!(points[0].is_incomplete);
        assert_eq!(points[0].projected_tokens, None);
        assert_eq!(points[0].displayed_tokens(), 50.0);
    }

    #[test]
    fn test_today_before_workday_is_flagged_not_projected() {
        let engine = ProjectionEngine::new(config());
        let series = vec![usage("2025-01-13", 1000), usage("2025-01-16", 0)];

        let points = engine.project(&series, &completeness("2025-01-14"), date("2025-01-16"), 6.0);

        let today = points.iter().find(|p| p.date == date("2025-01-16")).unwrap();
        assert!(today.is_incomplete);
        assert_eq!(today.projected_tokens, None);
        assert_eq!(today.displayed_tokens(), 0.0);
    }

    #[test]
    fn test_today_after_workday_is_final() {
        let engine = ProjectionEngine::new(config());
        let series = vec![usage("2025-01-13", 1000), usage("2025-01-16", 640)];

        let points = engine.project(&series, &completeness("2025-01-14"), date("2025-01-16"), 21.0);

        let today = points.iter().find(|p| p.date == date("2025-01-16")).unwrap();
        assert_eq!(today.projected_tokens, None, "no scaling after window close");
        assert_eq!(today.displayed_tokens(), 640.0);
    }

    #[test]
    fn test_today_blends_toward_baseline_early() {
        // One elapsed hour of twelve: f = 1/12, v = 200, baseline = 1000
        // extrapolated = 2400, blended = 200 + 11/12 * 1000 = 1116.67
        let blended = project_today(200, 1.0 / 12.0, Some(1000.0), &config()).unwrap();
        assert!((blended - 1116.666).abs() < 0.01, "got {}", blended);
    }

    #[test]
    fn test_today_blend_is_capped() {
        // v = 400 at f = 1/12 extrapolates to 4800; blend 858.33 exceeds
        // 1.5 * 500 and is capped
        let blended = project_today(400, 1.0 / 12.0, Some(500.0), &config()).unwrap();
        assert_eq!(blended, 750.0);
    }

    #[test]
    fn test_today_without_baseline_is_uncapped_extrapolation() {
        let projected = project_today(400, 1.0 / 12.0, None, &config()).unwrap();
        assert_eq!(projected, 4800.0);
    }

    #[test]
    fn test_today_zero_actual_shows_baseline() {
        let projected = project_today(0, 0.5, Some(900.0), &config()).unwrap();
        assert_eq!(projected, 900.0);
    }

    #[test]
    fn test_completion_factor_bounds() {
        let engine = ProjectionEngine::new(config());
        assert_eq!(engine.completion_factor(3.0), 0.0);
        assert_eq!(engine.completion_factor(7.0), 0.0);
        assert!((engine.completion_factor(8.0) - 1.0 / 12.0).abs() < 1e-9);
        assert_eq!(engine.completion_factor(19.0), 1.0);
        assert_eq!(engine.completion_factor(23.0), 1.0);
    }
}
