use std::fmt::Write;
use std::path::Path;

use crate::error::ModelFitWarning;
use crate::models::{MovementRecord, Quadrant, ScoredPoint, TransitionRecord};

/// One row of the quadrant results table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QuadrantRow {
    pub entity: String,
    pub x_score: f64,
    pub y_score: f64,
    pub count: f64,
    pub quadrant: Quadrant,
}

/// Collapse a snapshot fit into the quadrant results table, one row per
/// entity, sorted by risk order then entity.
pub fn quadrant_table(points: &[ScoredPoint], quadrants: &[Quadrant]) -> Vec<QuadrantRow> {
    let mut rows: Vec<QuadrantRow> = points
        .iter()
        .zip(quadrants.iter())
        .map(|(point, quadrant)| QuadrantRow {
            entity: point.entity.clone(),
            x_score: point.x_score,
            y_score: point.y_score,
            count: point.count,
            quadrant: *quadrant,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.quadrant
            .risk_rank()
            .cmp(&a.quadrant.risk_rank())
            .then_with(|| a.entity.cmp(&b.entity))
    });
    rows
}

pub fn write_quadrant_csv(path: &Path, rows: &[QuadrantRow]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["entity", "x_score", "y_score", "count", "quadrant"])?;
    for row in rows {
        writer.write_record(&[
            row.entity.clone(),
            format!("{:.4}", row.x_score),
            format!("{:.4}", row.y_score),
            format!("{}", row.count),
            row.quadrant.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_movement_csv(path: &Path, records: &[MovementRecord]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "entity",
        "period",
        "x_score",
        "y_score",
        "quadrant",
        "count",
        "x_delta",
        "y_delta",
        "count_delta",
        "percent_change",
    ])?;

    let opt = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_default();

    for record in records {
        for point in &record.points {
            writer.write_record(&[
                record.entity.clone(),
                point.period.label(),
                format!("{:.4}", point.x_score),
                format!("{:.4}", point.y_score),
                point.quadrant.to_string(),
                format!("{}", point.count),
                opt(point.x_delta),
                opt(point.y_delta),
                opt(point.count_delta),
                opt(point.percent_change),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_transitions_csv(path: &Path, transitions: &[TransitionRecord]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "entity",
        "period_from",
        "period_to",
        "quadrant_from",
        "quadrant_to",
        "x",
        "y",
        "x_delta",
        "y_delta",
        "count_delta",
        "percent_change",
        "priority",
        "reason",
        "spike_axis",
    ])?;

    for t in transitions {
        writer.write_record(&[
            t.entity.clone(),
            t.period_from.label(),
            t.period_to.label(),
            t.quadrant_from.to_string(),
            t.quadrant_to.to_string(),
            format!("{:.4}", t.x),
            format!("{:.4}", t.y),
            format!("{:.4}", t.x_delta),
            format!("{:.4}", t.y_delta),
            format!("{}", t.count_delta),
            t.percent_change.map(|p| format!("{p:.1}")).unwrap_or_default(),
            t.priority.tier.rank().to_string(),
            t.priority.reason.clone(),
            t.priority.spike_axis.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Markdown run report: quadrant mix, highest-priority transitions, and any
/// skipped periods.
pub fn build_report(
    entity_label: &str,
    records: &[MovementRecord],
    transitions: &[TransitionRecord],
    skipped_periods: &[ModelFitWarning],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Escalation Watch Report");
    let _ = writeln!(
        output,
        "Tracked {} {entity_label} across {} transitions.",
        records.len(),
        transitions.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Current Quadrant Mix");

    let mut mix: Vec<(Quadrant, usize)> = [Quadrant::Q1, Quadrant::Q2, Quadrant::Q4, Quadrant::Q3]
        .into_iter()
        .map(|q| {
            let n = records
                .iter()
                .filter(|r| r.points.last().map(|p| p.quadrant) == Some(q))
                .count();
            (q, n)
        })
        .collect();
    mix.retain(|(_, n)| *n > 0);

    if mix.is_empty() {
        let _ = writeln!(output, "No entities tracked in this window.");
    } else {
        for (quadrant, n) in mix {
            let _ = writeln!(
                output,
                "- {} ({}): {} {entity_label}",
                quadrant,
                quadrant.description(),
                n
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Priority Transitions");

    let mut ranked: Vec<&TransitionRecord> = transitions.iter().collect();
    ranked.sort_by_key(|t| (t.priority.tier.rank(), t.entity.clone()));

    if ranked.is_empty() {
        let _ = writeln!(output, "No quadrant transitions in this window.");
    } else {
        for t in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- [{}] {} moved {} -> {} in {} ({}, spike {})",
                t.priority.tier.name(),
                t.entity,
                t.quadrant_from,
                t.quadrant_to,
                t.period_to,
                t.priority.reason,
                t.priority.spike_axis
            );
        }
    }

    if !skipped_periods.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Skipped Periods");
        for skipped in skipped_periods {
            let _ = writeln!(
                output,
                "- {}: {}",
                skipped.period,
                skipped.messages.join("; ")
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MovementPoint, Period, PriorityLabel, PriorityTier, SpikeAxis};

    fn record(entity: &str, quadrant: Quadrant) -> MovementRecord {
        MovementRecord {
            entity: entity.to_string(),
            points: vec![MovementPoint {
                period: Period::parse("2024-Q3").unwrap(),
                x_score: 0.1,
                y_score: 0.2,
                x_ref: 0.0,
                y_ref: 0.0,
                quadrant,
                count: 10.0,
                x_delta: None,
                y_delta: None,
                count_delta: None,
                percent_change: None,
            }],
        }
    }

    fn transition(entity: &str, tier: PriorityTier) -> TransitionRecord {
        TransitionRecord {
            entity: entity.to_string(),
            period_from: Period::parse("2024-Q2").unwrap(),
            period_to: Period::parse("2024-Q3").unwrap(),
            quadrant_from: Quadrant::Q3,
            quadrant_to: Quadrant::Q2,
            x: -0.1,
            y: 0.3,
            x_delta: 0.1,
            y_delta: 0.4,
            count_delta: 12.0,
            percent_change: Some(80.0),
            priority: PriorityLabel {
                tier,
                reason: "investigate-y-shift".to_string(),
                spike_axis: SpikeAxis::Y,
            },
        }
    }

    #[test]
    fn report_lists_mix_and_transitions_by_priority() {
        let records = vec![record("api", Quadrant::Q1), record("billing", Quadrant::Q3)];
        let transitions = vec![
            transition("billing", PriorityTier::Low),
            transition("api", PriorityTier::Crisis),
        ];

        let report = build_report("services", &records, &transitions, &[]);

        assert!(report.contains("# Escalation Watch Report"));
        assert!(report.contains("Q1 (Critical): 1 services"));
        assert!(report.contains("Q3 (Quiet): 1 services"));
        // Crisis sorts above Low.
        let crisis = report.find("[Crisis] api").unwrap();
        let low = report.find("[Low] billing").unwrap();
        assert!(crisis < low);
    }

    #[test]
    fn report_surfaces_skipped_periods() {
        let skipped = vec![ModelFitWarning {
            period: "2024-Q1".to_string(),
            messages: vec!["2 entities in panel, need at least 3".to_string()],
        }];
        let report = build_report("services", &[], &[], &skipped);
        assert!(report.contains("## Skipped Periods"));
        assert!(report.contains("2024-Q1"));
    }

    #[test]
    fn quadrant_table_sorts_by_risk() {
        let points = vec![
            ScoredPoint {
                entity: "quiet".to_string(),
                period: Period::parse("2024-Q3").unwrap(),
                x_score: -0.5,
                y_score: -0.5,
                count: 3.0,
            },
            ScoredPoint {
                entity: "hot".to_string(),
                period: Period::parse("2024-Q3").unwrap(),
                x_score: 0.5,
                y_score: 0.5,
                count: 30.0,
            },
        ];
        let quadrants = vec![Quadrant::Q3, Quadrant::Q1];
        let table = quadrant_table(&points, &quadrants);
        assert_eq!(table[0].entity, "hot");
        assert_eq!(table[1].entity, "quiet");
    }
}
