use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ModelFitWarning, Result, WatchError};
use crate::models::{EventRecord, Granularity, MovementPoint, MovementRecord, Period, ScoredPoint};
use crate::panel::{build_panel, PanelFilters};
use crate::quadrant::{classify, PeriodReference, ReferencePolicy};
use crate::score::{ScoreConfig, ScoreProvider};

/// Which events feed each period's panel. `Windowed` scores only that
/// period's events; `Cumulative` scores everything up to the period's end,
/// reporting cumulative counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MovementMode {
    Windowed,
    Cumulative,
}

/// Tracking parameters. `periods: None` auto-detects the full range covered
/// by the events.
#[derive(Debug, Clone)]
pub struct TrackParams {
    pub granularity: Granularity,
    pub periods: Option<Vec<Period>>,
    pub min_total_count: f64,
    pub mode: MovementMode,
    pub reference_policy: ReferencePolicy,
    pub score: ScoreConfig,
}

impl TrackParams {
    pub fn new(granularity: Granularity) -> TrackParams {
        TrackParams {
            granularity,
            periods: None,
            min_total_count: 0.0,
            mode: MovementMode::Windowed,
            reference_policy: ReferencePolicy::Zero,
            score: ScoreConfig::default(),
        }
    }
}

/// Run metadata returned alongside the movement records. Skipped periods are
/// diagnostics, never fatal.
#[derive(Debug, Clone, Serialize)]
pub struct TrackMeta {
    pub granularity: Granularity,
    pub mode: MovementMode,
    pub periods_tracked: Vec<String>,
    pub skipped_periods: Vec<ModelFitWarning>,
    pub entity_count: usize,
}

/// Build each entity's quadrant trajectory across the tracking window.
/// Periods are processed and scored strictly in chronological order; deltas
/// depend only on the immediately preceding observed period.
pub fn track(
    events: &[EventRecord],
    params: &TrackParams,
    provider: &dyn ScoreProvider,
) -> Result<(Vec<MovementRecord>, TrackMeta)> {
    let periods = match &params.periods {
        Some(periods) => {
            let mut sorted = periods.clone();
            sorted.sort();
            sorted
        }
        None => detect_periods(events, params.granularity)?,
    };

    let mut meta = TrackMeta {
        granularity: params.granularity,
        mode: params.mode,
        periods_tracked: Vec::new(),
        skipped_periods: Vec::new(),
        entity_count: 0,
    };

    // Entity -> chronologically accumulated points (periods are visited in
    // order, so plain pushes keep each series sorted).
    let mut series: BTreeMap<String, Vec<(ScoredPoint, PeriodReference)>> = BTreeMap::new();

    for period in &periods {
        let window: Vec<EventRecord> = events
            .iter()
            .filter(|e| match params.mode {
                MovementMode::Windowed => period.contains(e.occurred_at),
                MovementMode::Cumulative => e.occurred_at < period.end_date(),
            })
            .cloned()
            .collect();

        let filters = PanelFilters {
            min_total_count: params.min_total_count,
            ..Default::default()
        };
        let panel = build_panel(&window, params.granularity, &filters)?;
        if panel.is_empty() {
            debug!(period = %period, "no panel rows, skipping period");
            continue;
        }

        let outcome = provider.fit(&panel, &params.score);
        if !outcome.status.converged {
            warn!(period = %period, warnings = ?outcome.status.warnings, "score fit did not converge");
            meta.skipped_periods.push(ModelFitWarning {
                period: period.label(),
                messages: outcome.status.warnings,
            });
            continue;
        }

        let snapshot = period_snapshot(&outcome.points, period, params.mode);
        if snapshot.is_empty() {
            continue;
        }
        let reference = PeriodReference::compute(params.reference_policy, &snapshot);

        for point in snapshot {
            series
                .entry(point.entity.clone())
                .or_default()
                .push((point, reference));
        }
        meta.periods_tracked.push(period.label());
    }

    let records: Vec<MovementRecord> = series
        .into_iter()
        .map(|(entity, points)| assemble_record(entity, points))
        .collect();
    meta.entity_count = records.len();

    Ok((records, meta))
}

/// One scored point per entity for the tracked period. Windowed panels carry
/// only that period's rows; cumulative panels are collapsed to the entity's
/// fitted effects plus its cumulative count.
fn period_snapshot(
    points: &[ScoredPoint],
    period: &Period,
    mode: MovementMode,
) -> Vec<ScoredPoint> {
    match mode {
        MovementMode::Windowed => points
            .iter()
            .filter(|p| p.period == *period)
            .cloned()
            .collect(),
        MovementMode::Cumulative => {
            // Collapse to one point per entity: cumulative count, scores
            // from the entity's most recent panel row.
            let mut by_entity: BTreeMap<String, (Period, ScoredPoint)> = BTreeMap::new();
            for point in points {
                let entry = by_entity
                    .entry(point.entity.clone())
                    .or_insert_with(|| {
                        (
                            point.period,
                            ScoredPoint {
                                entity: point.entity.clone(),
                                period: *period,
                                x_score: point.x_score,
                                y_score: point.y_score,
                                count: 0.0,
                            },
                        )
                    });
                if point.period >= entry.0 {
                    entry.0 = point.period;
                    entry.1.x_score = point.x_score;
                    entry.1.y_score = point.y_score;
                }
                entry.1.count += point.count;
            }
            by_entity.into_values().map(|(_, point)| point).collect()
        }
    }
}

fn assemble_record(entity: String, points: Vec<(ScoredPoint, PeriodReference)>) -> MovementRecord {
    let mut assembled: Vec<MovementPoint> = Vec::with_capacity(points.len());

    for (point, reference) in points {
        let quadrant = classify(point.x_score, point.y_score, reference.x_ref, reference.y_ref);
        // Deltas bridge no gaps: only the immediately preceding observed
        // period counts, and it is adjacent by construction of the series.
        let previous = assembled.last();
        let (x_delta, y_delta, count_delta, percent_change) = match previous {
            None => (None, None, None, None),
            Some(prev) => {
                let pct = if prev.count == 0.0 {
                    None
                } else {
                    Some((point.count - prev.count) / prev.count * 100.0)
                };
                (
                    Some(point.x_score - prev.x_score),
                    Some(point.y_score - prev.y_score),
                    Some(point.count - prev.count),
                    pct,
                )
            }
        };

        assembled.push(MovementPoint {
            period: point.period,
            x_score: point.x_score,
            y_score: point.y_score,
            x_ref: reference.x_ref,
            y_ref: reference.y_ref,
            quadrant,
            count: point.count,
            x_delta,
            y_delta,
            count_delta,
            percent_change,
        });
    }

    MovementRecord {
        entity,
        points: assembled,
    }
}

fn detect_periods(events: &[EventRecord], granularity: Granularity) -> Result<Vec<Period>> {
    let first = events.iter().map(|e| e.occurred_at).min();
    let last = events.iter().map(|e| e.occurred_at).max();
    let (first, last) = match (first, last) {
        (Some(f), Some(l)) => (f, l),
        _ => {
            return Err(WatchError::InsufficientData(
                "no events to detect a tracking range from".to_string(),
            ))
        }
    };

    let mut period = Period::from_date(first, granularity);
    let end = Period::from_date(last, granularity);
    let mut periods = vec![period];
    while period < end {
        period = period.next();
        periods.push(period);
    }
    Ok(periods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Quadrant;
    use crate::score::{FitOutcome, FitStatus};
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

    /// Deterministic stand-in backend: x = count - 10, y = count - 20.
    struct StubProvider {
        fail_periods: Vec<&'static str>,
    }

    impl StubProvider {
        fn new() -> StubProvider {
            StubProvider {
                fail_periods: Vec::new(),
            }
        }
    }

    impl ScoreProvider for StubProvider {
        fn fit(&self, panel: &[crate::models::PanelRow], _config: &ScoreConfig) -> FitOutcome {
            let fail = panel
                .iter()
                .any(|r| self.fail_periods.contains(&r.period.label().as_str()));
            FitOutcome {
                points: panel
                    .iter()
                    .map(|r| ScoredPoint {
                        entity: r.entity.clone(),
                        period: r.period,
                        x_score: r.count - 10.0,
                        y_score: r.count - 20.0,
                        count: r.count,
                    })
                    .collect(),
                status: FitStatus {
                    converged: !fail,
                    warnings: if fail {
                        vec!["stubbed failure".to_string()]
                    } else {
                        Vec::new()
                    },
                },
            }
        }
    }

    fn quarterly_events() -> Vec<EventRecord> {
        let mut events = Vec::new();
        // api: 5 events in Q1, 25 in Q2 -> crosses both references.
        for _ in 0..5 {
            events.push(event("api", "2024-01-10"));
        }
        for _ in 0..25 {
            events.push(event("api", "2024-04-10"));
        }
        // billing: steady 15 per quarter.
        for _ in 0..15 {
            events.push(event("billing", "2024-02-10"));
        }
        for _ in 0..15 {
            events.push(event("billing", "2024-05-10"));
        }
        events
    }

    #[test]
    fn tracks_one_point_per_entity_period() {
        let (records, meta) = track(
            &quarterly_events(),
            &TrackParams::new(Granularity::Quarterly),
            &StubProvider::new(),
        )
        .unwrap();

        assert_eq!(meta.periods_tracked, vec!["2024-Q1", "2024-Q2"]);
        assert_eq!(records.len(), 2);
        let api = records.iter().find(|r| r.entity == "api").unwrap();
        assert_eq!(api.points.len(), 2);
        assert_eq!(api.points[0].quadrant, Quadrant::Q3); // 5 events: x=-5, y=-15
        assert_eq!(api.points[1].quadrant, Quadrant::Q1); // 25 events: x=15, y=5
    }

    #[test]
    fn deltas_and_percent_change_between_adjacent_periods() {
        let (records, _) = track(
            &quarterly_events(),
            &TrackParams::new(Granularity::Quarterly),
            &StubProvider::new(),
        )
        .unwrap();

        let api = records.iter().find(|r| r.entity == "api").unwrap();
        assert_eq!(api.points[0].x_delta, None);
        assert_eq!(api.points[1].x_delta, Some(20.0));
        assert_eq!(api.points[1].count_delta, Some(20.0));
        assert_eq!(api.points[1].percent_change, Some(400.0));
    }

    #[test]
    fn entities_missing_a_period_are_not_interpolated() {
        let mut events = quarterly_events();
        // flaky appears in Q1 and Q3 only.
        events.push(event("flaky", "2024-01-15"));
        events.push(event("flaky", "2024-07-15"));

        let (records, _) = track(
            &events,
            &TrackParams::new(Granularity::Quarterly),
            &StubProvider::new(),
        )
        .unwrap();

        let flaky = records.iter().find(|r| r.entity == "flaky").unwrap();
        let labels: Vec<String> = flaky.points.iter().map(|p| p.period.label()).collect();
        assert_eq!(labels, vec!["2024-Q1", "2024-Q3"]);
        // The gap is not bridged, but the delta spans the two observed points.
        assert_eq!(flaky.points[1].x_delta, Some(0.0));
    }

    #[test]
    fn zero_base_count_leaves_percent_change_undefined() {
        let q1 = Period::parse("2024-Q1").unwrap();
        let q2 = Period::parse("2024-Q2").unwrap();
        let point = |period: Period, count: f64| ScoredPoint {
            entity: "ghost".to_string(),
            period,
            x_score: 0.1,
            y_score: 0.1,
            count,
        };
        let record = assemble_record(
            "ghost".to_string(),
            vec![
                (point(q1, 0.0), PeriodReference::ZERO),
                (point(q2, 8.0), PeriodReference::ZERO),
            ],
        );
        assert_eq!(record.points[1].count_delta, Some(8.0));
        assert_eq!(record.points[1].percent_change, None);
    }

    #[test]
    fn min_total_count_applies_per_period() {
        let mut events = quarterly_events();
        events.push(event("tiny", "2024-01-15"));

        let mut params = TrackParams::new(Granularity::Quarterly);
        params.min_total_count = 3.0;
        let (records, _) = track(&events, &params, &StubProvider::new()).unwrap();
        assert!(records.iter().all(|r| r.entity != "tiny"));
    }

    #[test]
    fn failed_fit_skips_period_and_records_diagnostic() {
        let provider = StubProvider {
            fail_periods: vec!["2024-Q1"],
        };
        let (records, meta) = track(
            &quarterly_events(),
            &TrackParams::new(Granularity::Quarterly),
            &provider,
        )
        .unwrap();

        assert_eq!(meta.periods_tracked, vec!["2024-Q2"]);
        assert_eq!(meta.skipped_periods.len(), 1);
        assert_eq!(meta.skipped_periods[0].period, "2024-Q1");
        // Q2 still tracked for everyone.
        assert!(records.iter().all(|r| r.points.len() == 1));
    }

    #[test]
    fn cumulative_mode_reports_cumulative_counts() {
        let mut params = TrackParams::new(Granularity::Quarterly);
        params.mode = MovementMode::Cumulative;
        let (records, _) = track(&quarterly_events(), &params, &StubProvider::new()).unwrap();

        let api = records.iter().find(|r| r.entity == "api").unwrap();
        assert_eq!(api.points[0].count, 5.0);
        assert_eq!(api.points[1].count, 30.0);
    }

    #[test]
    fn empty_events_are_insufficient_data() {
        let err = track(
            &[],
            &TrackParams::new(Granularity::Quarterly),
            &StubProvider::new(),
        )
        .unwrap_err();
        assert!(matches!(err, WatchError::InsufficientData(_)));
    }
}
