use crate::models::{Quadrant, ScoredPoint};

/// Population reference policy for a period. `Zero` suits centered random
/// effects; `Median` re-centers on the period's score distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferencePolicy {
    Zero,
    Median,
}

/// Per-period reference pair the classifier compares scores against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodReference {
    pub x_ref: f64,
    pub y_ref: f64,
}

impl PeriodReference {
    pub const ZERO: PeriodReference = PeriodReference {
        x_ref: 0.0,
        y_ref: 0.0,
    };

    pub fn compute(policy: ReferencePolicy, points: &[ScoredPoint]) -> PeriodReference {
        match policy {
            ReferencePolicy::Zero => PeriodReference::ZERO,
            ReferencePolicy::Median => PeriodReference {
                x_ref: median(points.iter().map(|p| p.x_score)),
                y_ref: median(points.iter().map(|p| p.y_score)),
            },
        }
    }
}

/// Classify a score pair against its period references. Pure function; a
/// score exactly on its reference counts as the low side of that axis, so an
/// entity on both references lands in Q3.
pub fn classify(x_score: f64, y_score: f64, x_ref: f64, y_ref: f64) -> Quadrant {
    let high_x = x_score > x_ref;
    let high_y = y_score > y_ref;
    match (high_x, high_y) {
        (true, true) => Quadrant::Q1,
        (false, true) => Quadrant::Q2,
        (false, false) => Quadrant::Q3,
        (true, false) => Quadrant::Q4,
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut values: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite values compare"));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}
