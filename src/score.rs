use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::WatchError;
use crate::models::{PanelRow, Period, ScoredPoint};

/// Observation family of the panel counts. Poisson fits on log1p counts,
/// Gaussian on the raw values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Poisson,
    Gaussian,
}

impl FromStr for Family {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poisson" => Ok(Family::Poisson),
            "gaussian" => Ok(Family::Gaussian),
            other => Err(WatchError::Configuration(format!(
                "unknown family '{other}' (expected poisson or gaussian)"
            ))),
        }
    }
}

/// Which fitted effect feeds which axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Centered volume level.
    Intercept,
    /// Centered growth rate over the panel's period range.
    Slope,
}

/// Ridge shrinkage scales per effect. Larger scales shrink less.
#[derive(Debug, Clone, Copy)]
pub struct PriorScales {
    pub intercept: f64,
    pub slope: f64,
}

impl Default for PriorScales {
    fn default() -> Self {
        PriorScales {
            intercept: 1.0,
            slope: 1.0,
        }
    }
}

/// Score-fit configuration threaded into every provider call. The seed is an
/// explicit value (read once from the environment by the binary), never
/// ambient process state; deterministic backends may ignore it.
#[derive(Debug, Clone)]
pub struct ScoreConfig {
    pub x_effect: Effect,
    pub y_effect: Effect,
    pub family: Family,
    pub prior_scales: PriorScales,
    pub seed: Option<u64>,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        ScoreConfig {
            x_effect: Effect::Intercept,
            y_effect: Effect::Slope,
            family: Family::Poisson,
            prior_scales: PriorScales::default(),
            seed: None,
        }
    }
}

/// Per-fit convergence status. A non-converged fit is a per-period
/// diagnostic for the caller, never a crash.
#[derive(Debug, Clone)]
pub struct FitStatus {
    pub converged: bool,
    pub warnings: Vec<String>,
}

/// Scores plus status, one `ScoredPoint` per input `PanelRow`.
#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub points: Vec<ScoredPoint>,
    pub status: FitStatus,
}

/// The score backend contract. Any mixed-effects regression engine can sit
/// behind this; the pipeline depends only on the output shape.
pub trait ScoreProvider {
    fn fit(&self, panel: &[PanelRow], config: &ScoreConfig) -> FitOutcome;
}

/// Default deterministic backend: per-entity least squares of the
/// (transformed) counts against the centered period index, ridge-shrunk by
/// the prior scales, then population-centered so both effects are
/// zero-referenced. Stands in for a full GLMM without sampling.
#[derive(Debug, Default)]
pub struct RidgeGrowthProvider;

impl RidgeGrowthProvider {
    const MIN_ENTITIES: usize = 3;
}

struct EntityFit {
    intercept: f64,
    slope: f64,
}

impl ScoreProvider for RidgeGrowthProvider {
    fn fit(&self, panel: &[PanelRow], config: &ScoreConfig) -> FitOutcome {
        let mut warnings = Vec::new();

        // Chronological rank of each distinct period in the panel.
        let period_index: BTreeMap<Period, f64> = panel
            .iter()
            .map(|row| row.period)
            .collect::<std::collections::BTreeSet<Period>>()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (p, i as f64))
            .collect();
        let n_periods = period_index.len();
        let index_mean = if n_periods == 0 {
            0.0
        } else {
            period_index.values().sum::<f64>() / n_periods as f64
        };

        let mut by_entity: BTreeMap<&str, Vec<(f64, f64)>> = BTreeMap::new();
        for row in panel {
            let value = match config.family {
                Family::Poisson => row.count.max(0.0).ln_1p(),
                Family::Gaussian => row.count,
            };
            let t = period_index[&row.period] - index_mean;
            by_entity.entry(&row.entity).or_default().push((t, value));
        }

        let n_entities = by_entity.len();
        let mut converged = true;

        if n_entities < Self::MIN_ENTITIES {
            converged = false;
            warnings.push(format!(
                "{n_entities} entities in panel, need at least {}",
                Self::MIN_ENTITIES
            ));
        }
        if n_periods < 2 {
            warnings.push("single-period panel, growth effect is degenerate".to_string());
        }

        let ridge_intercept = 1.0 / config.prior_scales.intercept.max(f64::EPSILON);
        let ridge_slope = 1.0 / config.prior_scales.slope.max(f64::EPSILON);

        let mut fits: BTreeMap<&str, EntityFit> = BTreeMap::new();
        for (&entity, obs) in &by_entity {
            let n = obs.len() as f64;
            let t_mean = obs.iter().map(|(t, _)| t).sum::<f64>() / n;
            let v_mean = obs.iter().map(|(_, v)| v).sum::<f64>() / n;
            let mut st2 = 0.0;
            let mut stv = 0.0;
            for (t, v) in obs.iter() {
                st2 += (t - t_mean) * (t - t_mean);
                stv += (t - t_mean) * (v - v_mean);
            }
            let slope = stv / (st2 + ridge_slope);
            // Entity level evaluated at the panel's centered origin, so
            // volume and growth stay separable.
            let intercept = (v_mean - slope * t_mean) * n / (n + ridge_intercept - 1.0);
            fits.insert(entity, EntityFit { intercept, slope });
        }

        // Center both effects across the population.
        let n = fits.len().max(1) as f64;
        let intercept_mean = fits.values().map(|f| f.intercept).sum::<f64>() / n;
        let slope_mean = fits.values().map(|f| f.slope).sum::<f64>() / n;

        let intercept_var = fits
            .values()
            .map(|f| (f.intercept - intercept_mean).powi(2))
            .sum::<f64>()
            / n;
        if n_entities >= Self::MIN_ENTITIES && intercept_var == 0.0 {
            converged = false;
            warnings.push("degenerate variance: all entities share one volume level".to_string());
        }

        let effect = |fit: &EntityFit, which: Effect| match which {
            Effect::Intercept => fit.intercept - intercept_mean,
            Effect::Slope => fit.slope - slope_mean,
        };

        let points = panel
            .iter()
            .map(|row| {
                let fit = &fits[row.entity.as_str()];
                ScoredPoint {
                    entity: row.entity.clone(),
                    period: row.period,
                    x_score: effect(fit, config.x_effect),
                    y_score: effect(fit, config.y_effect),
                    count: row.count,
                }
            })
            .collect();

        FitOutcome {
            points,
            status: FitStatus {
                converged,
                warnings,
            },
        }
    }
}
