use crate::models::{MovementRecord, TransitionRecord};
use crate::priority::{PriorityRules, TransitionContext};

/// Scan each movement record for quadrant changes between successive observed
/// points and package each one as a classified transition.
///
/// Spike markers live only on the transitions emitted here; quadrant-stable
/// adjacent periods produce nothing, however large the in-quadrant movement.
/// With `focus_risk_increasing`, only transitions that climb the risk order
/// (Q3 < Q4 < Q2 < Q1) are kept.
pub fn extract(
    records: &[MovementRecord],
    focus_risk_increasing: bool,
    rules: &PriorityRules,
) -> Vec<TransitionRecord> {
    let mut transitions = Vec::new();

    for record in records {
        for pair in record.points.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if from.quadrant == to.quadrant {
                continue;
            }

            let context = TransitionContext {
                quadrant_from: from.quadrant,
                quadrant_to: to.quadrant,
                x: to.x_score,
                y: to.y_score,
                x_ref: to.x_ref,
                y_ref: to.y_ref,
                x_delta: to.x_delta.unwrap_or(to.x_score - from.x_score),
                y_delta: to.y_delta.unwrap_or(to.y_score - from.y_score),
                count_delta: to.count_delta.unwrap_or(to.count - from.count),
                percent_change: to.percent_change,
            };
            let priority = rules.classify(&context);

            let transition = TransitionRecord {
                entity: record.entity.clone(),
                period_from: from.period,
                period_to: to.period,
                quadrant_from: from.quadrant,
                quadrant_to: to.quadrant,
                x: context.x,
                y: context.y,
                x_delta: context.x_delta,
                y_delta: context.y_delta,
                count_delta: context.count_delta,
                percent_change: context.percent_change,
                priority,
            };

            if focus_risk_increasing && !transition.risk_increasing() {
                continue;
            }
            transitions.push(transition);
        }
    }

    transitions
}
