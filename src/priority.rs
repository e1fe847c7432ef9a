use crate::models::{PriorityLabel, PriorityTier, Quadrant, SpikeAxis};

/// Everything the rule table looks at for one transition. References are the
/// period references the destination point was classified against.
#[derive(Debug, Clone)]
pub struct TransitionContext {
    pub quadrant_from: Quadrant,
    pub quadrant_to: Quadrant,
    pub x: f64,
    pub y: f64,
    pub x_ref: f64,
    pub y_ref: f64,
    pub x_delta: f64,
    pub y_delta: f64,
    pub count_delta: f64,
    /// `None` when the source count was zero (undefined, not inferred).
    pub percent_change: Option<f64>,
}

/// Named rule constants. The strong-entry margin and the boundary band are
/// empirical knobs; defaults documented here rather than buried as literals.
#[derive(Debug, Clone)]
pub struct PriorityRules {
    /// Single-axis delta at or above this is a spike (and tier 1).
    pub spike_threshold: f64,
    /// Single-axis delta strictly above this is tier 2.
    pub shift_threshold: f64,
    /// Distance from a quadrant boundary that still counts as "near".
    pub boundary_band: f64,
    /// Margin above both references that makes a Q1 entry "strong".
    pub strong_entry_margin: f64,
    /// Count delta floor of the tier-1 volume surge clause.
    pub surge_count: f64,
    /// Percent change floor of the tier-1 volume surge clause.
    pub surge_pct: f64,
    /// Count delta floor of the tier-2 volume growth clause.
    pub growth_count: f64,
    /// Percent change floor of the tier-2 volume growth clause.
    pub growth_pct: f64,
}

impl Default for PriorityRules {
    fn default() -> Self {
        PriorityRules {
            spike_threshold: 0.40,
            shift_threshold: 0.15,
            boundary_band: 0.10,
            strong_entry_margin: 0.25,
            surge_count: 50.0,
            surge_pct: 500.0,
            growth_count: 5.0,
            growth_pct: 100.0,
        }
    }
}

impl PriorityRules {
    /// Spike axis for a delta pair, independent of any tier decision.
    pub fn spike_axis(&self, x_delta: f64, y_delta: f64) -> SpikeAxis {
        let x = x_delta.abs() >= self.spike_threshold;
        let y = y_delta.abs() >= self.spike_threshold;
        match (x, y) {
            (true, true) => SpikeAxis::Xy,
            (true, false) => SpikeAxis::X,
            (false, true) => SpikeAxis::Y,
            (false, false) => SpikeAxis::None,
        }
    }

    /// Deterministic decision table, evaluated top-down, first match wins.
    pub fn classify(&self, ctx: &TransitionContext) -> PriorityLabel {
        let spike_axis = self.spike_axis(ctx.x_delta, ctx.y_delta);
        let pct = ctx.percent_change;

        let (tier, reason) = if let Some(reason) = self.crisis_reason(ctx, spike_axis, pct) {
            (PriorityTier::Crisis, reason)
        } else if let Some(reason) = self.investigate_reason(ctx, pct) {
            (PriorityTier::Investigate, reason)
        } else if let Some(reason) = self.monitor_reason(ctx) {
            (PriorityTier::Monitor, reason)
        } else {
            (PriorityTier::Low, "low-default")
        };

        PriorityLabel {
            tier,
            reason: reason.to_string(),
            spike_axis,
        }
    }

    fn crisis_reason(
        &self,
        ctx: &TransitionContext,
        spike_axis: SpikeAxis,
        pct: Option<f64>,
    ) -> Option<&'static str> {
        match spike_axis {
            SpikeAxis::Xy => return Some("crisis-xy-spike"),
            SpikeAxis::X => return Some("crisis-x-spike"),
            SpikeAxis::Y => return Some("crisis-y-spike"),
            SpikeAxis::None => {}
        }
        if ctx.count_delta >= self.surge_count && pct.is_some_and(|p| p >= self.surge_pct) {
            return Some("crisis-volume-surge");
        }
        None
    }

    fn investigate_reason(
        &self,
        ctx: &TransitionContext,
        pct: Option<f64>,
    ) -> Option<&'static str> {
        if ctx.x_delta.abs() > self.shift_threshold {
            return Some("investigate-x-shift");
        }
        if ctx.y_delta.abs() > self.shift_threshold {
            return Some("investigate-y-shift");
        }
        if ctx.quadrant_to == Quadrant::Q1
            && ctx.x > ctx.x_ref + self.strong_entry_margin
            && ctx.y > ctx.y_ref + self.strong_entry_margin
        {
            return Some("investigate-strong-entry");
        }
        if pct.is_some_and(|p| p >= self.growth_pct) && ctx.count_delta >= self.growth_count {
            return Some("investigate-volume-growth");
        }
        None
    }

    fn monitor_reason(&self, ctx: &TransitionContext) -> Option<&'static str> {
        if (ctx.x - ctx.x_ref).abs() <= self.boundary_band
            || (ctx.y - ctx.y_ref).abs() <= self.boundary_band
        {
            return Some("monitor-boundary");
        }
        if ctx.quadrant_to == Quadrant::Q1 {
            return Some("monitor-gentle-entry");
        }
        None
    }
}
