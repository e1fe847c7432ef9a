use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, WatchError};
use crate::models::{
    EventRecord, MovementRecord, Period, PriorityLabel, Quadrant, SpikeAxis,
};
use crate::priority::{PriorityRules, TransitionContext};

/// Numeric bin specification: explicit edges (left-closed/right-open, last
/// bin closed) or a count of empirical quantile bins computed over the union
/// of both periods' values.
#[derive(Debug, Clone)]
pub enum BinSpec {
    Edges(Vec<f64>),
    Quantiles(usize),
}

/// What to attribute, and how hard to prune.
#[derive(Debug, Clone)]
pub struct DriverQuery {
    pub entity: String,
    pub period_from: Period,
    pub period_to: Period,
    /// `None` auto-detects candidate categorical columns.
    pub subcategory_cols: Option<Vec<String>>,
    pub numeric_cols: BTreeMap<String, BinSpec>,
    pub top_n: usize,
    pub min_delta: f64,
}

impl DriverQuery {
    pub fn new(entity: &str, period_from: Period, period_to: Period) -> DriverQuery {
        DriverQuery {
            entity: entity.to_string(),
            period_from,
            period_to,
            subcategory_cols: None,
            numeric_cols: BTreeMap::new(),
            top_n: 5,
            min_delta: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionSummary {
    pub entity: String,
    pub period_from: Period,
    pub period_to: Period,
    pub quadrant_from: Quadrant,
    pub quadrant_to: Quadrant,
    pub quadrant_changed: bool,
    /// Steps climbed (positive) or descended (negative) on the risk order.
    pub risk_level_change: i8,
}

/// Overall magnitude of the change: panel counts, cumulative deltas, and
/// per-period weekly-average rates, plus the raw event counts behind them.
#[derive(Debug, Clone, Serialize)]
pub struct Magnitude {
    pub count_from: f64,
    pub count_to: f64,
    pub count_delta: f64,
    pub percent_change: Option<f64>,
    pub weekly_avg_from: f64,
    pub weekly_avg_to: f64,
    pub events_from: usize,
    pub events_to: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpikeDrivers {
    pub axis: SpikeAxis,
    pub x_delta: f64,
    pub y_delta: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Rising,
    Falling,
    Flat,
}

/// One ranked driver row: a category value or a numeric bin.
#[derive(Debug, Clone, Serialize)]
pub struct DriverRow {
    pub name: String,
    pub count_from: usize,
    pub count_to: usize,
    pub delta: f64,
    pub direction: Direction,
    pub percent_of_change: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryDrivers {
    pub top_drivers: Vec<DriverRow>,
    pub total_delta: f64,
    /// Share of total absolute movement the kept rows explain.
    pub top_n_explain_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NumericDrivers {
    pub bin_edges: Vec<f64>,
    pub top_drivers: Vec<DriverRow>,
    pub total_delta: f64,
    pub top_n_explain_pct: Option<f64>,
}

/// Auto-detection and pruning decisions, for auditability.
#[derive(Debug, Clone, Serialize)]
pub struct DriverMeta {
    pub subcategory_columns_used: Vec<String>,
    pub subcategory_columns_auto_detected: bool,
    pub numeric_columns_used: Vec<String>,
    pub skipped_columns: Vec<String>,
    pub top_n: usize,
    pub min_delta: f64,
}

/// The full attribution record for one transition.
#[derive(Debug, Clone, Serialize)]
pub struct DriverAnalysis {
    pub transition: TransitionSummary,
    pub magnitude: Magnitude,
    pub spike_drivers: SpikeDrivers,
    pub subcategory_drivers: BTreeMap<String, CategoryDrivers>,
    pub numeric_drivers: BTreeMap<String, NumericDrivers>,
    pub priority: PriorityLabel,
    pub meta: DriverMeta,
}

/// Candidate categorical columns: text attributes with between 2 and 20
/// distinct values across the entity's events. A heuristic, so it is a
/// swappable function; decisions land in `DriverMeta`.
pub type SubcategoryDetector = dyn Fn(&[&EventRecord]) -> Vec<String>;

pub fn default_subcategory_detection(events: &[&EventRecord]) -> Vec<String> {
    const MAX_CARDINALITY: usize = 20;

    let mut values: BTreeMap<&str, std::collections::BTreeSet<String>> = BTreeMap::new();
    for event in events {
        for (key, value) in &event.attributes {
            if value.is_text() && value.as_number().is_none() {
                values
                    .entry(key.as_str())
                    .or_default()
                    .insert(value.category_label());
            }
        }
    }

    values
        .into_iter()
        .filter(|(_, distinct)| (2..=MAX_CARDINALITY).contains(&distinct.len()))
        .map(|(key, _)| key.to_string())
        .collect()
}

/// Attribute a transition's magnitude to categorical values and numeric bins
/// of the underlying raw events, using the default column detector.
pub fn analyze(
    records: &[MovementRecord],
    events: &[EventRecord],
    query: &DriverQuery,
) -> Result<DriverAnalysis> {
    analyze_with_detector(records, events, query, &default_subcategory_detection)
}

pub fn analyze_with_detector(
    records: &[MovementRecord],
    events: &[EventRecord],
    query: &DriverQuery,
    detector: &SubcategoryDetector,
) -> Result<DriverAnalysis> {
    let record = records
        .iter()
        .find(|r| r.entity == query.entity)
        .ok_or_else(|| {
            WatchError::InsufficientData(format!(
                "entity '{}' has no movement record",
                query.entity
            ))
        })?;
    let from_point = record.point_for(&query.period_from).ok_or_else(|| {
        WatchError::InsufficientData(format!(
            "entity '{}' has no movement point in {}",
            query.entity, query.period_from
        ))
    })?;
    let to_point = record.point_for(&query.period_to).ok_or_else(|| {
        WatchError::InsufficientData(format!(
            "entity '{}' has no movement point in {}",
            query.entity, query.period_to
        ))
    })?;

    let entity_events: Vec<&EventRecord> = events
        .iter()
        .filter(|e| e.entity == query.entity)
        .collect();
    let from_slice: Vec<&EventRecord> = entity_events
        .iter()
        .copied()
        .filter(|e| query.period_from.contains(e.occurred_at))
        .collect();
    let to_slice: Vec<&EventRecord> = entity_events
        .iter()
        .copied()
        .filter(|e| query.period_to.contains(e.occurred_at))
        .collect();

    if from_slice.is_empty() || to_slice.is_empty() {
        return Err(WatchError::InsufficientData(format!(
            "entity '{}' has no raw events in {} or {}",
            query.entity, query.period_from, query.period_to
        )));
    }

    // Transition summary and priority, from the movement points.
    let x_delta = to_point.x_score - from_point.x_score;
    let y_delta = to_point.y_score - from_point.y_score;
    let count_delta = to_point.count - from_point.count;
    let percent_change = if from_point.count == 0.0 {
        None
    } else {
        Some(count_delta / from_point.count * 100.0)
    };

    let rules = PriorityRules::default();
    let priority = rules.classify(&TransitionContext {
        quadrant_from: from_point.quadrant,
        quadrant_to: to_point.quadrant,
        x: to_point.x_score,
        y: to_point.y_score,
        x_ref: to_point.x_ref,
        y_ref: to_point.y_ref,
        x_delta,
        y_delta,
        count_delta,
        percent_change,
    });

    let transition = TransitionSummary {
        entity: query.entity.clone(),
        period_from: query.period_from,
        period_to: query.period_to,
        quadrant_from: from_point.quadrant,
        quadrant_to: to_point.quadrant,
        quadrant_changed: from_point.quadrant != to_point.quadrant,
        risk_level_change: to_point.quadrant.risk_rank() as i8
            - from_point.quadrant.risk_rank() as i8,
    };

    let magnitude = Magnitude {
        count_from: from_point.count,
        count_to: to_point.count,
        count_delta,
        percent_change,
        weekly_avg_from: from_point.count / (query.period_from.days() as f64 / 7.0),
        weekly_avg_to: to_point.count / (query.period_to.days() as f64 / 7.0),
        events_from: from_slice.len(),
        events_to: to_slice.len(),
    };

    let spike_drivers = SpikeDrivers {
        axis: rules.spike_axis(x_delta, y_delta),
        x_delta,
        y_delta,
    };

    // Categorical breakdowns.
    let (subcategory_cols, auto_detected) = match &query.subcategory_cols {
        Some(cols) => (cols.clone(), false),
        None => {
            let detected = detector(&entity_events);
            debug!(entity = %query.entity, ?detected, "auto-detected subcategory columns");
            (detected, true)
        }
    };

    let mut skipped_columns = Vec::new();
    let mut subcategory_drivers = BTreeMap::new();
    for col in &subcategory_cols {
        match category_breakdown(col, &from_slice, &to_slice, query) {
            Some(drivers) => {
                subcategory_drivers.insert(col.clone(), drivers);
            }
            None => skipped_columns.push(format!("{col}: no values observed")),
        }
    }

    // Numeric breakdowns. A bad bin spec kills that column only.
    let mut numeric_drivers = BTreeMap::new();
    for (col, spec) in &query.numeric_cols {
        match numeric_breakdown(col, spec, &from_slice, &to_slice, query) {
            Ok(drivers) => {
                numeric_drivers.insert(col.clone(), drivers);
            }
            Err(err) => {
                warn!(column = %col, %err, "numeric column skipped");
                skipped_columns.push(format!("{col}: {err}"));
            }
        }
    }

    let meta = DriverMeta {
        subcategory_columns_used: subcategory_drivers.keys().cloned().collect(),
        subcategory_columns_auto_detected: auto_detected,
        numeric_columns_used: numeric_drivers.keys().cloned().collect(),
        skipped_columns,
        top_n: query.top_n,
        min_delta: query.min_delta,
    };

    Ok(DriverAnalysis {
        transition,
        magnitude,
        spike_drivers,
        subcategory_drivers,
        numeric_drivers,
        priority,
        meta,
    })
}

const MISSING_BUCKET: &str = "(missing)";

fn category_breakdown(
    column: &str,
    from_slice: &[&EventRecord],
    to_slice: &[&EventRecord],
    query: &DriverQuery,
) -> Option<CategoryDrivers> {
    let value_of = |event: &EventRecord| {
        event
            .attributes
            .get(column)
            .map(|v| v.category_label())
            .unwrap_or_else(|| MISSING_BUCKET.to_string())
    };

    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for event in from_slice {
        counts.entry(value_of(event)).or_default().0 += 1;
    }
    for event in to_slice {
        counts.entry(value_of(event)).or_default().1 += 1;
    }

    // A column that never appears has nothing to attribute.
    if counts.len() == 1 && counts.contains_key(MISSING_BUCKET) {
        return None;
    }

    Some(rank_rows(counts, query))
}

fn rank_rows(counts: BTreeMap<String, (usize, usize)>, query: &DriverQuery) -> CategoryDrivers {
    let total_delta: f64 = counts
        .values()
        .map(|(from, to)| *to as f64 - *from as f64)
        .sum();
    let total_abs: f64 = counts
        .values()
        .map(|(from, to)| (*to as f64 - *from as f64).abs())
        .sum();

    let mut rows: Vec<DriverRow> = counts
        .into_iter()
        .map(|(name, (count_from, count_to))| {
            let delta = count_to as f64 - count_from as f64;
            DriverRow {
                name,
                count_from,
                count_to,
                delta,
                direction: if delta > 0.0 {
                    Direction::Rising
                } else if delta < 0.0 {
                    Direction::Falling
                } else {
                    Direction::Flat
                },
                percent_of_change: (total_delta != 0.0).then(|| delta / total_delta * 100.0),
            }
        })
        .filter(|row| row.delta.abs() >= query.min_delta)
        .collect();

    // Rank by |delta| descending; name ascending keeps ties deterministic.
    rows.sort_by(|a, b| {
        b.delta
            .abs()
            .partial_cmp(&a.delta.abs())
            .expect("finite deltas")
            .then_with(|| a.name.cmp(&b.name))
    });
    rows.truncate(query.top_n);

    let kept_abs: f64 = rows.iter().map(|r| r.delta.abs()).sum();
    CategoryDrivers {
        top_drivers: rows,
        total_delta,
        top_n_explain_pct: (total_abs > 0.0).then(|| kept_abs / total_abs * 100.0),
    }
}

fn numeric_breakdown(
    column: &str,
    spec: &BinSpec,
    from_slice: &[&EventRecord],
    to_slice: &[&EventRecord],
    query: &DriverQuery,
) -> Result<NumericDrivers> {
    let values_in = |slice: &[&EventRecord]| -> Vec<f64> {
        slice
            .iter()
            .filter_map(|e| e.attributes.get(column).and_then(|v| v.as_number()))
            .filter(|v| v.is_finite())
            .collect()
    };
    let from_values = values_in(from_slice);
    let to_values = values_in(to_slice);

    if from_values.is_empty() && to_values.is_empty() {
        return Err(WatchError::InsufficientData(format!(
            "no numeric values for '{column}' in either period"
        )));
    }

    let edges = match spec {
        BinSpec::Edges(edges) => {
            validate_edges(column, edges)?;
            edges.clone()
        }
        BinSpec::Quantiles(n) => {
            if *n == 0 {
                return Err(WatchError::AmbiguousBinSpec {
                    column: column.to_string(),
                    reason: "quantile bin count must be positive".to_string(),
                });
            }
            // Quantile edges over the union of both periods, recomputed on
            // every call.
            let mut union: Vec<f64> = from_values
                .iter()
                .chain(to_values.iter())
                .copied()
                .collect();
            union.sort_by(|a, b| a.partial_cmp(b).expect("finite values"));
            let edges = quantile_edges(&union, *n);
            if edges.len() < 2 {
                return Err(WatchError::InsufficientData(format!(
                    "'{column}' has a degenerate distribution, all quantile edges equal"
                )));
            }
            edges
        }
    };

    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    // Seed every bin so empty bins still report.
    for bin in 0..edges.len() - 1 {
        counts.insert(bin_label(&edges, bin), (0, 0));
    }
    for value in &from_values {
        if let Some(bin) = bin_of(&edges, *value) {
            counts.get_mut(&bin_label(&edges, bin)).expect("bin seeded").0 += 1;
        }
    }
    for value in &to_values {
        if let Some(bin) = bin_of(&edges, *value) {
            counts.get_mut(&bin_label(&edges, bin)).expect("bin seeded").1 += 1;
        }
    }

    let ranked = rank_rows(counts, query);
    Ok(NumericDrivers {
        bin_edges: edges,
        top_drivers: ranked.top_drivers,
        total_delta: ranked.total_delta,
        top_n_explain_pct: ranked.top_n_explain_pct,
    })
}

fn validate_edges(column: &str, edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(WatchError::AmbiguousBinSpec {
            column: column.to_string(),
            reason: "an edge list needs at least two edges".to_string(),
        });
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(WatchError::AmbiguousBinSpec {
            column: column.to_string(),
            reason: "edges must be finite".to_string(),
        });
    }
    if edges.windows(2).any(|w| w[0] >= w[1]) {
        return Err(WatchError::AmbiguousBinSpec {
            column: column.to_string(),
            reason: "edges must be strictly increasing".to_string(),
        });
    }
    Ok(())
}

/// Empirical quantile edges (linear interpolation) for `bins` bins:
/// `bins + 1` edges at ranks k/bins.
fn quantile_edges(sorted: &[f64], bins: usize) -> Vec<f64> {
    let mut edges = Vec::with_capacity(bins + 1);
    for k in 0..=bins {
        edges.push(quantile(sorted, k as f64 / bins as f64));
    }
    edges.dedup();
    edges
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Left-closed/right-open bins; the last bin also includes its upper edge.
fn bin_of(edges: &[f64], value: f64) -> Option<usize> {
    let last = edges.len() - 1;
    for bin in 0..last {
        if value >= edges[bin] && value < edges[bin + 1] {
            return Some(bin);
        }
    }
    (value == edges[last]).then_some(last - 1)
}

fn bin_label(edges: &[f64], bin: usize) -> String {
    let close = if bin + 2 == edges.len() { "]" } else { ")" };
    format!("[{}, {}{close}", edges[bin], edges[bin + 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttrValue, MovementPoint};
    use uuid::Uuid;

    fn event(entity: &str, date: &str, attrs: &[(&str, AttrValue)]) -> EventRecord {
        EventRecord {
            id: Uuid::new_v4(),
            entity: entity.to_string(),
            occurred_at: date.parse().unwrap(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn text(s: &str) -> AttrValue {
        AttrValue::Text(s.to_string())
    }

    fn movement(entity: &str) -> MovementRecord {
        let point = |period: &str, quadrant: Quadrant, x: f64, y: f64, count: f64| MovementPoint {
            period: Period::parse(period).unwrap(),
            x_score: x,
            y_score: y,
            x_ref: 0.0,
            y_ref: 0.0,
            quadrant,
            count,
            x_delta: None,
            y_delta: None,
            count_delta: None,
            percent_change: None,
        };
        MovementRecord {
            entity: entity.to_string(),
            points: vec![
                point("2024-Q2", Quadrant::Q3, -0.2, -0.1, 50.0),
                point("2024-Q3", Quadrant::Q2, -0.1, 0.2, 80.0),
            ],
        }
    }

    fn q2_q3_query(entity: &str) -> DriverQuery {
        DriverQuery::new(
            entity,
            Period::parse("2024-Q2").unwrap(),
            Period::parse("2024-Q3").unwrap(),
        )
    }

    fn type_events() -> Vec<EventRecord> {
        let mut events = Vec::new();
        // Q2 (Apr-Jun): 6 alpha, 4 beta. Q3 (Jul-Sep): 5 alpha, 12 beta.
        for _ in 0..6 {
            events.push(event("svc", "2024-05-01", &[("type", text("alpha"))]));
        }
        for _ in 0..4 {
            events.push(event("svc", "2024-05-02", &[("type", text("beta"))]));
        }
        for _ in 0..5 {
            events.push(event("svc", "2024-08-01", &[("type", text("alpha"))]));
        }
        for _ in 0..12 {
            events.push(event("svc", "2024-08-02", &[("type", text("beta"))]));
        }
        events
    }

    #[test]
    fn analysis_structure_and_transition_summary() {
        let analysis = analyze(&[movement("svc")], &type_events(), &q2_q3_query("svc")).unwrap();

        assert_eq!(analysis.transition.entity, "svc");
        assert_eq!(analysis.transition.quadrant_from, Quadrant::Q3);
        assert_eq!(analysis.transition.quadrant_to, Quadrant::Q2);
        assert!(analysis.transition.quadrant_changed);
        assert_eq!(analysis.transition.risk_level_change, 2);

        assert_eq!(analysis.magnitude.count_from, 50.0);
        assert_eq!(analysis.magnitude.count_to, 80.0);
        assert_eq!(analysis.magnitude.count_delta, 30.0);
        assert_eq!(analysis.magnitude.percent_change, Some(60.0));
        assert_eq!(analysis.magnitude.events_from, 10);
        assert_eq!(analysis.magnitude.events_to, 17);
        assert!(analysis.magnitude.weekly_avg_from > 0.0);

        assert!((1..=4).contains(&analysis.priority.tier.rank()));
        assert_eq!(analysis.spike_drivers.axis, SpikeAxis::None);

        // "type" auto-detected.
        assert!(analysis.meta.subcategory_columns_auto_detected);
        assert_eq!(analysis.meta.subcategory_columns_used, vec!["type"]);
        assert!(analysis.subcategory_drivers.contains_key("type"));
    }

    #[test]
    fn manual_columns_with_pruning_knobs() {
        let mut query = q2_q3_query("svc");
        query.subcategory_cols = Some(vec!["type".to_string()]);
        query.top_n = 1;
        query.min_delta = 2.0;

        let analysis = analyze(&[movement("svc")], &type_events(), &query).unwrap();
        assert!(!analysis.meta.subcategory_columns_auto_detected);

        let drivers = &analysis.subcategory_drivers["type"].top_drivers;
        // beta: 4 -> 12 (delta 8); alpha: 6 -> 5 (delta -1, below min_delta).
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].name, "beta");
        assert_eq!(drivers[0].delta, 8.0);
        assert_eq!(drivers[0].direction, Direction::Rising);
    }

    #[test]
    fn category_deltas_conserve_the_total() {
        let mut query = q2_q3_query("svc");
        query.subcategory_cols = Some(vec!["type".to_string()]);
        query.min_delta = 0.0;
        query.top_n = usize::MAX;

        let analysis = analyze(&[movement("svc")], &type_events(), &query).unwrap();
        let drivers = &analysis.subcategory_drivers["type"];
        let sum: f64 = drivers.top_drivers.iter().map(|d| d.delta).sum();
        // 17 raw events in Q3 minus 10 in Q2.
        assert_eq!(sum, 7.0);
        assert_eq!(drivers.total_delta, 7.0);
    }

    #[test]
    fn explicit_edge_bins() {
        let mut events = Vec::new();
        for amount in [100.0, 200.0, 300.0] {
            events.push(event("svc", "2024-05-01", &[("amount", AttrValue::Number(amount))]));
        }
        for amount in [600.0, 700.0, 800.0, 900.0] {
            events.push(event("svc", "2024-08-01", &[("amount", AttrValue::Number(amount))]));
        }

        let mut query = q2_q3_query("svc");
        query.numeric_cols.insert(
            "amount".to_string(),
            BinSpec::Edges(vec![0.0, 500.0, 1000.0]),
        );
        let analysis = analyze(&[movement("svc")], &events, &query).unwrap();

        let drivers = &analysis.numeric_drivers["amount"];
        assert_eq!(drivers.bin_edges, vec![0.0, 500.0, 1000.0]);
        let high = drivers
            .top_drivers
            .iter()
            .find(|d| d.name == "[500, 1000]")
            .unwrap();
        assert_eq!(high.count_from, 0);
        assert_eq!(high.count_to, 4);
        assert_eq!(analysis.meta.numeric_columns_used, vec!["amount"]);
    }

    #[test]
    fn quantile_bins_are_empirical_quartiles() {
        // Union sample [1..8, 100]: quartile edges 1, 3, 5, 7, 100.
        let mut events = Vec::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            events.push(event("svc", "2024-05-01", &[("amount", AttrValue::Number(v))]));
        }
        for v in [5.0, 6.0, 7.0, 8.0, 100.0] {
            events.push(event("svc", "2024-08-01", &[("amount", AttrValue::Number(v))]));
        }

        let mut query = q2_q3_query("svc");
        query.numeric_cols.insert("amount".to_string(), BinSpec::Quantiles(4));
        query.min_delta = 0.0;
        query.top_n = usize::MAX;
        let analysis = analyze(&[movement("svc")], &events, &query).unwrap();

        let drivers = &analysis.numeric_drivers["amount"];
        assert_eq!(drivers.bin_edges, vec![1.0, 3.0, 5.0, 7.0, 100.0]);

        // Every value lands in exactly one bin.
        let total: usize = drivers
            .top_drivers
            .iter()
            .map(|d| d.count_from + d.count_to)
            .sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn bad_bin_spec_skips_that_column_only() {
        let mut events = type_events();
        for v in [1.0, 2.0] {
            events.push(event("svc", "2024-05-01", &[("amount", AttrValue::Number(v))]));
            events.push(event("svc", "2024-08-01", &[("amount", AttrValue::Number(v))]));
        }

        let mut query = q2_q3_query("svc");
        query.numeric_cols.insert("amount".to_string(), BinSpec::Quantiles(0));
        let analysis = analyze(&[movement("svc")], &events, &query).unwrap();

        assert!(analysis.numeric_drivers.is_empty());
        assert!(analysis
            .meta
            .skipped_columns
            .iter()
            .any(|s| s.starts_with("amount:")));
        // The categorical column still processed.
        assert!(analysis.subcategory_drivers.contains_key("type"));
    }

    #[test]
    fn empty_period_slice_is_insufficient_data() {
        // All raw events sit in Q3; Q2 is empty.
        let events = vec![event("svc", "2024-08-01", &[("type", text("alpha"))])];
        let err = analyze(&[movement("svc")], &events, &q2_q3_query("svc")).unwrap_err();
        assert!(matches!(err, WatchError::InsufficientData(_)));
    }

    #[test]
    fn detector_is_pluggable_and_audited() {
        let detector = |_: &[&EventRecord]| vec!["type".to_string()];
        let analysis = analyze_with_detector(
            &[movement("svc")],
            &type_events(),
            &q2_q3_query("svc"),
            &detector,
        )
        .unwrap();
        assert!(analysis.meta.subcategory_columns_auto_detected);
        assert_eq!(analysis.meta.subcategory_columns_used, vec!["type"]);
    }

    #[test]
    fn default_detection_skips_high_cardinality_and_numeric_text() {
        let mut events = Vec::new();
        for i in 0..30 {
            events.push(event(
                "svc",
                "2024-05-01",
                &[
                    ("ticket", text(&format!("T-{i}"))),
                    ("code", text(&format!("{i}"))),
                    ("module", text(if i % 2 == 0 { "core" } else { "api" })),
                ],
            ));
        }
        let refs: Vec<&EventRecord> = events.iter().collect();
        assert_eq!(default_subcategory_detection(&refs), vec!["module"]);
    }
}
