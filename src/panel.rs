use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::error::{Result, WatchError};
use crate::models::{EventRecord, Granularity, PanelRow, Period};

/// Half-open date window `[start, end)` applied to raw events before
/// bucketing.
#[derive(Debug, Clone, Default)]
pub struct DateFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateFilter {
    fn accepts(&self, date: NaiveDate) -> bool {
        if let Some(start) = self.start {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if date >= end {
                return false;
            }
        }
        true
    }
}

/// Panel construction knobs. Filters apply in a fixed order:
/// date_filter -> min_observations -> min_total_count -> decline_window.
#[derive(Debug, Clone)]
pub struct PanelFilters {
    pub date_filter: Option<DateFilter>,
    /// Drop entities observed in fewer than this many distinct periods.
    pub min_observations: usize,
    /// Drop entities whose summed count is below this threshold.
    pub min_total_count: f64,
    /// Drop entities whose last observed period is more than this many
    /// periods before the latest period in the full dataset.
    pub decline_window: Option<i64>,
    /// When set, count is the sum of this numeric attribute instead of the
    /// row count.
    pub count_attr: Option<String>,
    /// Optional per-(entity, period) mean aggregates.
    pub x_metric: Option<String>,
    pub y_metric: Option<String>,
}

impl Default for PanelFilters {
    fn default() -> Self {
        PanelFilters {
            date_filter: None,
            min_observations: 0,
            min_total_count: 0.0,
            decline_window: None,
            count_attr: None,
            x_metric: None,
            y_metric: None,
        }
    }
}

#[derive(Default)]
struct CellAcc {
    count: f64,
    x_sum: f64,
    x_n: usize,
    y_sum: f64,
    y_n: usize,
}

/// Turn raw events into one aggregate row per (entity, period). Pure
/// transform; output is sorted by (entity, period) for reproducibility.
pub fn build_panel(
    events: &[EventRecord],
    granularity: Granularity,
    filters: &PanelFilters,
) -> Result<Vec<PanelRow>> {
    if let Some(attr) = &filters.count_attr {
        ensure_numeric_attr(events, attr)?;
    }
    for metric in [&filters.x_metric, &filters.y_metric].into_iter().flatten() {
        ensure_numeric_attr(events, metric)?;
    }

    let mut cells: BTreeMap<(String, Period), CellAcc> = BTreeMap::new();

    for event in events {
        if let Some(date_filter) = &filters.date_filter {
            if !date_filter.accepts(event.occurred_at) {
                continue;
            }
        }

        let period = Period::from_date(event.occurred_at, granularity);
        let cell = cells
            .entry((event.entity.clone(), period))
            .or_default();

        match &filters.count_attr {
            None => cell.count += 1.0,
            Some(attr) => {
                if let Some(value) = event.attributes.get(attr).and_then(|v| v.as_number()) {
                    cell.count += value;
                }
            }
        }

        if let Some(metric) = &filters.x_metric {
            if let Some(value) = event.attributes.get(metric).and_then(|v| v.as_number()) {
                cell.x_sum += value;
                cell.x_n += 1;
            }
        }
        if let Some(metric) = &filters.y_metric {
            if let Some(value) = event.attributes.get(metric).and_then(|v| v.as_number()) {
                cell.y_sum += value;
                cell.y_n += 1;
            }
        }
    }

    // Entity-level filters look at the bucketed data, not raw events.
    let mut per_entity: BTreeMap<&str, Vec<&Period>> = BTreeMap::new();
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for ((entity, period), cell) in &cells {
        per_entity.entry(entity.as_str()).or_default().push(period);
        *totals.entry(entity.as_str()).or_default() += cell.count;
    }

    let latest_period = cells.keys().map(|(_, p)| *p).max();

    let mut dropped: Vec<String> = Vec::new();
    for (entity, periods) in &per_entity {
        if periods.len() < filters.min_observations {
            dropped.push(entity.to_string());
            continue;
        }
        if totals[entity] < filters.min_total_count {
            dropped.push(entity.to_string());
            continue;
        }
        if let (Some(window), Some(latest)) = (filters.decline_window, latest_period) {
            let last = periods.iter().copied().max().expect("entity has periods");
            if latest.distance_from(last) > window {
                dropped.push(entity.to_string());
            }
        }
    }

    let rows = cells
        .into_iter()
        .filter(|((entity, _), _)| !dropped.iter().any(|d| d == entity))
        .map(|((entity, period), cell)| PanelRow {
            entity,
            period,
            count: cell.count,
            x_metric: (cell.x_n > 0).then(|| cell.x_sum / cell.x_n as f64),
            y_metric: (cell.y_n > 0).then(|| cell.y_sum / cell.y_n as f64),
        })
        .collect();

    Ok(rows)
}

fn ensure_numeric_attr(events: &[EventRecord], attr: &str) -> Result<()> {
    let present = events
        .iter()
        .any(|e| e.attributes.get(attr).and_then(|v| v.as_number()).is_some());
    if events.is_empty() || present {
        Ok(())
    } else {
        Err(WatchError::Configuration(format!(
            "attribute '{attr}' is missing or non-numeric across all events"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttrValue;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(entity: &str, date: &str) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            occurred_at: date.parse().unwrap(),
            attributes: BTreeMap::new(),
        }
    }

    fn event_with(entity: &str, date: &str, attrs: &[(&str, AttrValue)]) -> EventRecord {
        let mut e = event(entity, date);
        e.attributes = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        e
    }

    #[test]
    fn counts_rows_per_entity_period() {
        let events = vec![
            event("api", "2024-01-05"),
            event("api", "2024-02-10"),
            event("api", "2024-04-01"),
            event("billing", "2024-01-20"),
        ];
        let rows = build_panel(&events, Granularity::Quarterly, &PanelFilters::default()).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].entity, "api");
        assert_eq!(rows[0].period.label(), "2024-Q1");
        assert_eq!(rows[0].count, 2.0);
        assert_eq!(rows[1].period.label(), "2024-Q2");
        assert_eq!(rows[2].entity, "billing");
    }

    #[test]
    fn count_attribute_sums_instead_of_counting() {
        let events = vec![
            event_with("api", "2024-01-05", &[("units", AttrValue::Number(3.0))]),
            event_with("api", "2024-02-10", &[("units", AttrValue::Number(4.0))]),
        ];
        let filters = PanelFilters {
            count_attr: Some("units".into()),
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert_eq!(rows[0].count, 7.0);
    }

    #[test]
    fn unknown_count_attribute_is_a_configuration_error() {
        let events = vec![event("api", "2024-01-05")];
        let filters = PanelFilters {
            count_attr: Some("units".into()),
            ..Default::default()
        };
        let err = build_panel(&events, Granularity::Quarterly, &filters).unwrap_err();
        assert!(matches!(err, WatchError::Configuration(_)));
    }

    #[test]
    fn metric_aggregates_are_means() {
        let events = vec![
            event_with("api", "2024-01-05", &[("amount", AttrValue::Number(10.0))]),
            event_with("api", "2024-02-10", &[("amount", AttrValue::Number(30.0))]),
        ];
        let filters = PanelFilters {
            x_metric: Some("amount".into()),
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert_eq!(rows[0].x_metric, Some(20.0));
        assert_eq!(rows[0].y_metric, None);
    }

    #[test]
    fn min_observations_drops_entity_entirely() {
        // Two periods with high counts, but min_observations = 3: zero rows.
        let mut events = Vec::new();
        for _ in 0..50 {
            events.push(event("api", "2024-01-05"));
            events.push(event("api", "2024-04-05"));
        }
        let filters = PanelFilters {
            min_observations: 3,
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn min_total_count_drops_low_volume_entities() {
        let events = vec![
            event("api", "2024-01-05"),
            event("api", "2024-04-05"),
            event("billing", "2024-01-05"),
        ];
        let filters = PanelFilters {
            min_total_count: 2.0,
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert!(rows.iter().all(|r| r.entity == "api"));
    }

    #[test]
    fn decline_window_drops_stale_entities() {
        let events = vec![
            event("api", "2024-01-05"),
            event("stale", "2023-02-01"),
            event("api", "2024-10-05"),
        ];
        let filters = PanelFilters {
            decline_window: Some(2),
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert!(rows.iter().all(|r| r.entity == "api"));
    }

    #[test]
    fn date_filter_applies_before_entity_filters() {
        // Entity has 3 periods, but the window trims it to 2; with
        // min_observations = 3 it must then drop entirely.
        let events = vec![
            event("api", "2024-01-05"),
            event("api", "2024-04-05"),
            event("api", "2024-07-05"),
        ];
        let filters = PanelFilters {
            date_filter: Some(DateFilter {
                start: Some("2024-03-01".parse().unwrap()),
                end: None,
            }),
            min_observations: 3,
            ..Default::default()
        };
        let rows = build_panel(&events, Granularity::Quarterly, &filters).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn output_is_sorted_by_entity_then_period() {
        let events = vec![
            event("zeta", "2024-04-05"),
            event("alpha", "2024-07-05"),
            event("zeta", "2024-01-05"),
            event("alpha", "2024-01-05"),
        ];
        let rows = build_panel(&events, Granularity::Quarterly, &PanelFilters::default()).unwrap();
        let keys: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.entity.clone(), r.period.label()))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
