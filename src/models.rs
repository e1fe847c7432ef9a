use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WatchError;

/// A free-form event attribute. Numeric values bin into ranges in driver
/// analysis; text values act as categorical subcategories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Categorical label for value counting.
    pub fn category_label(&self) -> String {
        match self {
            AttrValue::Text(s) => s.clone(),
            AttrValue::Number(n) => format!("{n}"),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, AttrValue::Text(_))
    }
}

/// One raw event row. Entities have no independent lifecycle; they exist by
/// appearing in event data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub entity: String,
    pub occurred_at: NaiveDate,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

/// Temporal bucketing granularity for periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Yearly,
    Semiannual,
    Quarterly,
    Monthly,
}

impl Granularity {
    pub fn periods_per_year(self) -> u32 {
        match self {
            Granularity::Yearly => 1,
            Granularity::Semiannual => 2,
            Granularity::Quarterly => 4,
            Granularity::Monthly => 12,
        }
    }

    fn months_per_period(self) -> u32 {
        12 / self.periods_per_year()
    }
}

impl FromStr for Granularity {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yearly" => Ok(Granularity::Yearly),
            "semiannual" => Ok(Granularity::Semiannual),
            "quarterly" => Ok(Granularity::Quarterly),
            "monthly" => Ok(Granularity::Monthly),
            other => Err(WatchError::Configuration(format!(
                "unknown granularity '{other}' (expected yearly, semiannual, quarterly, or monthly)"
            ))),
        }
    }
}

/// A canonical time bucket, e.g. "2024-Q3" or "2024-07". Totally ordered by
/// calendar position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub granularity: Granularity,
    pub year: i32,
    /// Zero-based index within the year (quarter 0..=3, month 0..=11, ...).
    pub index: u32,
}

impl Period {
    pub fn from_date(date: NaiveDate, granularity: Granularity) -> Period {
        let index = date.month0() / granularity.months_per_period();
        Period {
            granularity,
            year: date.year(),
            index,
        }
    }

    /// Parse a canonical label, inferring granularity from its shape:
    /// "2024" (yearly), "2024-H1" (semiannual), "2024-Q3" (quarterly),
    /// "2024-07" (monthly).
    pub fn parse(label: &str) -> Result<Period, WatchError> {
        let bad = || WatchError::Configuration(format!("unparseable period label '{label}'"));

        let (year_part, rest) = match label.split_once('-') {
            None => (label, None),
            Some((y, r)) => (y, Some(r)),
        };
        let year: i32 = year_part.parse().map_err(|_| bad())?;

        match rest {
            None => Ok(Period {
                granularity: Granularity::Yearly,
                year,
                index: 0,
            }),
            Some(r) if r.starts_with('H') || r.starts_with('h') => {
                let n: u32 = r[1..].parse().map_err(|_| bad())?;
                if !(1..=2).contains(&n) {
                    return Err(bad());
                }
                Ok(Period {
                    granularity: Granularity::Semiannual,
                    year,
                    index: n - 1,
                })
            }
            Some(r) if r.starts_with('Q') || r.starts_with('q') => {
                let n: u32 = r[1..].parse().map_err(|_| bad())?;
                if !(1..=4).contains(&n) {
                    return Err(bad());
                }
                Ok(Period {
                    granularity: Granularity::Quarterly,
                    year,
                    index: n - 1,
                })
            }
            Some(r) => {
                let n: u32 = r.parse().map_err(|_| bad())?;
                if !(1..=12).contains(&n) {
                    return Err(bad());
                }
                Ok(Period {
                    granularity: Granularity::Monthly,
                    year,
                    index: n - 1,
                })
            }
        }
    }

    pub fn label(&self) -> String {
        match self.granularity {
            Granularity::Yearly => format!("{}", self.year),
            Granularity::Semiannual => format!("{}-H{}", self.year, self.index + 1),
            Granularity::Quarterly => format!("{}-Q{}", self.year, self.index + 1),
            Granularity::Monthly => format!("{}-{:02}", self.year, self.index + 1),
        }
    }

    fn start_month0(&self) -> u32 {
        self.index * self.granularity.months_per_period()
    }

    /// First day of the period.
    pub fn start_date(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.start_month0() + 1, 1)
            .expect("period start is a valid calendar date")
    }

    /// First day after the period (`[start, end)`).
    pub fn end_date(&self) -> NaiveDate {
        self.next().start_date()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date() && date < self.end_date()
    }

    pub fn next(&self) -> Period {
        let per_year = self.granularity.periods_per_year();
        if self.index + 1 < per_year {
            Period {
                index: self.index + 1,
                ..*self
            }
        } else {
            Period {
                year: self.year + 1,
                index: 0,
                ..*self
            }
        }
    }

    /// Signed distance in periods from `other` to `self` (same granularity).
    pub fn distance_from(&self, other: &Period) -> i64 {
        let per_year = self.granularity.periods_per_year() as i64;
        (self.year as i64 - other.year as i64) * per_year
            + (self.index as i64 - other.index as i64)
    }

    /// Days covered by the period, for weekly-rate math.
    pub fn days(&self) -> i64 {
        (self.end_date() - self.start_date()).num_days()
    }
}

impl Ord for Period {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.year, self.start_month0(), self.index)
            .cmp(&(other.year, other.start_month0(), other.index))
    }
}

impl PartialOrd for Period {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// One entity x period aggregate row. At most one row per (entity, period).
#[derive(Debug, Clone, Serialize)]
pub struct PanelRow {
    pub entity: String,
    pub period: Period,
    pub count: f64,
    pub x_metric: Option<f64>,
    pub y_metric: Option<f64>,
}

/// Per-entity, per-period score pair from the score provider. Scores are
/// always finite; a failed fit is reported through `FitStatus`, never as
/// silent zeros.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPoint {
    pub entity: String,
    pub period: Period,
    pub x_score: f64,
    pub y_score: f64,
    pub count: f64,
}

/// Quadrants of the 2D score space. Convention (volume on x, growth on y):
/// Q1 high-x/high-y (Critical), Q2 low-x/high-y (Emerging), Q3 low-x/low-y
/// (Quiet), Q4 high-x/low-y (Persistent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quadrant {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quadrant {
    /// Total risk order used by `focus_risk_increasing`: Q3 < Q4 < Q2 < Q1.
    pub fn risk_rank(self) -> u8 {
        match self {
            Quadrant::Q3 => 0,
            Quadrant::Q4 => 1,
            Quadrant::Q2 => 2,
            Quadrant::Q1 => 3,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Quadrant::Q1 => "Critical",
            Quadrant::Q2 => "Emerging",
            Quadrant::Q3 => "Quiet",
            Quadrant::Q4 => "Persistent",
        }
    }
}

impl fmt::Display for Quadrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One point of an entity's movement trajectory. Delta fields are `None` on
/// the first observed period; `percent_change` is additionally `None`
/// (undefined, not inferred) when the previous count was zero.
#[derive(Debug, Clone, Serialize)]
pub struct MovementPoint {
    pub period: Period,
    pub x_score: f64,
    pub y_score: f64,
    pub x_ref: f64,
    pub y_ref: f64,
    pub quadrant: Quadrant,
    pub count: f64,
    pub x_delta: Option<f64>,
    pub y_delta: Option<f64>,
    pub count_delta: Option<f64>,
    pub percent_change: Option<f64>,
}

/// Chronologically ordered movement points for one entity. Immutable once
/// produced for a run.
#[derive(Debug, Clone, Serialize)]
pub struct MovementRecord {
    pub entity: String,
    pub points: Vec<MovementPoint>,
}

impl MovementRecord {
    pub fn point_for(&self, period: &Period) -> Option<&MovementPoint> {
        self.points.iter().find(|p| p.period == *period)
    }
}

/// Four-tier priority of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PriorityTier {
    Crisis,
    Investigate,
    Monitor,
    Low,
}

impl PriorityTier {
    pub fn rank(self) -> u8 {
        match self {
            PriorityTier::Crisis => 1,
            PriorityTier::Investigate => 2,
            PriorityTier::Monitor => 3,
            PriorityTier::Low => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PriorityTier::Crisis => "Crisis",
            PriorityTier::Investigate => "Investigate",
            PriorityTier::Monitor => "Monitor",
            PriorityTier::Low => "Low",
        }
    }
}

/// Axis (or axes) whose inter-period delta exceeded the spike threshold.
/// Computed independently of the priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SpikeAxis {
    None,
    X,
    Y,
    Xy,
}

impl fmt::Display for SpikeAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpikeAxis::None => "none",
            SpikeAxis::X => "X",
            SpikeAxis::Y => "Y",
            SpikeAxis::Xy => "XY",
        };
        f.write_str(s)
    }
}

/// Output of the priority rule table. `reason` is a stable machine-checkable
/// label naming the clause that fired.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityLabel {
    pub tier: PriorityTier,
    pub reason: String,
    pub spike_axis: SpikeAxis,
}

/// A quadrant change between two adjacent observed periods of one entity.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub entity: String,
    pub period_from: Period,
    pub period_to: Period,
    pub quadrant_from: Quadrant,
    pub quadrant_to: Quadrant,
    pub x: f64,
    pub y: f64,
    pub x_delta: f64,
    pub y_delta: f64,
    pub count_delta: f64,
    pub percent_change: Option<f64>,
    pub priority: PriorityLabel,
}

impl TransitionRecord {
    pub fn risk_increasing(&self) -> bool {
        self.quadrant_to.risk_rank() > self.quadrant_from.risk_rank()
    }
}
