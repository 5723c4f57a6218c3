// =============================================================================
// Decision Planner — per-cycle plan with hysteresis
// =============================================================================
//
// At most one plan per (symbol, cycle). A plan snapshots the live price as its
// base and freezes breakout thresholds; within a cycle the only allowed
// transition is a single SIDEWAYS -> SETUP promotion. After a SETUP snapshot
// the thresholds never move until the cycle id changes. The simulator flips
// `has_triggered` when the plan fires so a cycle never fires twice.
// =============================================================================

use serde::Serialize;

use crate::strategy::analyzer::{DecisionAnalysis, PlanStatus};

/// The frozen decision for one candle cycle.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionPlan {
    /// Cycle identity: the next candle close timestamp.
    pub cycle_id: i64,
    pub status: PlanStatus,
    pub reason: String,
    pub trigger_pct: f64,
    pub flow_imbalance: Option<f64>,
    pub flow_samples: Option<usize>,
    /// Live price at snapshot time; thresholds derive from it.
    pub base_price: f64,
    pub long_above: f64,
    pub short_below: f64,
    pub created_at: i64,
    /// Set by the simulator when the plan opens a trade.
    pub has_triggered: bool,
}

/// Planner knobs lifted from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct PlannerSettings {
    pub trigger_min_pct: f64,
    pub trigger_max_pct: f64,
}

impl From<&crate::config::EngineConfig> for PlannerSettings {
    fn from(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            trigger_min_pct: cfg.trigger_min_pct,
            trigger_max_pct: cfg.trigger_max_pct,
        }
    }
}

/// Reconcile the plan slot for one symbol against the latest analysis.
pub fn sync_plan(
    slot: &mut Option<DecisionPlan>,
    cycle_id: Option<i64>,
    analysis: &DecisionAnalysis,
    live_price: Option<f64>,
    now_ms: i64,
    settings: &PlannerSettings,
) {
    let Some(cycle_id) = cycle_id else {
        // Cycle clock unknown: nothing to key a plan on.
        *slot = None;
        return;
    };

    match slot {
        Some(plan) if plan.cycle_id == cycle_id => {
            // Within the cycle: only the one-shot SIDEWAYS -> SETUP promotion.
            if plan.status == PlanStatus::Sideways && analysis.status == PlanStatus::Setup {
                if let Some(snapshot) = snapshot_plan(cycle_id, analysis, live_price, now_ms, settings)
                {
                    let has_triggered = plan.has_triggered;
                    let created_at = plan.created_at;
                    *plan = DecisionPlan {
                        has_triggered,
                        created_at,
                        ..snapshot
                    };
                }
            }
        }
        _ => {
            // New cycle (or no plan yet): snapshot if the analysis warrants one.
            if matches!(analysis.status, PlanStatus::Setup | PlanStatus::Sideways) {
                *slot = snapshot_plan(cycle_id, analysis, live_price, now_ms, settings);
            } else {
                *slot = None;
            }
        }
    }
}

/// Build a plan snapshot from an analysis, clamping the trigger into the
/// configured bounds and re-deriving thresholds from the base price. Returns
/// `None` when the inputs cannot produce finite positive thresholds.
fn snapshot_plan(
    cycle_id: i64,
    analysis: &DecisionAnalysis,
    live_price: Option<f64>,
    now_ms: i64,
    settings: &PlannerSettings,
) -> Option<DecisionPlan> {
    let base_price = live_price.filter(|p| p.is_finite() && *p > 0.0)?;
    let (analysis_long, analysis_short) = (analysis.long_above?, analysis.short_below?);
    if !(analysis_long.is_finite() && analysis_long > 0.0)
        || !(analysis_short.is_finite() && analysis_short > 0.0)
    {
        return None;
    }

    let trigger_pct = analysis
        .trigger_pct
        .clamp(settings.trigger_min_pct, settings.trigger_max_pct);
    let long_above = base_price * (1.0 + trigger_pct / 100.0);
    let short_below = base_price * (1.0 - trigger_pct / 100.0);
    if !(long_above.is_finite() && long_above > 0.0 && short_below.is_finite() && short_below > 0.0)
    {
        return None;
    }

    Some(DecisionPlan {
        cycle_id,
        status: analysis.status,
        reason: analysis.reason.clone(),
        trigger_pct,
        flow_imbalance: analysis.flow_imbalance,
        flow_samples: analysis.flow_samples,
        base_price,
        long_above,
        short_below,
        created_at: now_ms,
        has_triggered: false,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: PlannerSettings = PlannerSettings {
        trigger_min_pct: 0.05,
        trigger_max_pct: 1.2,
    };

    fn analysis(status: PlanStatus, trigger_pct: f64) -> DecisionAnalysis {
        DecisionAnalysis {
            status,
            reason: format!("{status} test"),
            trigger_pct,
            long_above: Some(100.0 * (1.0 + trigger_pct / 100.0)),
            short_below: Some(100.0 * (1.0 - trigger_pct / 100.0)),
            flow_imbalance: Some(0.1),
            flow_samples: Some(30),
        }
    }

    #[test]
    fn no_cycle_means_no_plan() {
        let mut slot = Some(DecisionPlan {
            cycle_id: 1,
            status: PlanStatus::Setup,
            reason: String::new(),
            trigger_pct: 0.5,
            flow_imbalance: None,
            flow_samples: None,
            base_price: 100.0,
            long_above: 100.5,
            short_below: 99.5,
            created_at: 0,
            has_triggered: false,
        });
        sync_plan(&mut slot, None, &analysis(PlanStatus::Setup, 0.5), Some(100.0), 1, &SETTINGS);
        assert!(slot.is_none());
    }

    #[test]
    fn wait_analysis_creates_nothing() {
        let mut slot = None;
        let wait = DecisionAnalysis {
            status: PlanStatus::Wait,
            reason: "warming up".to_string(),
            trigger_pct: 0.0,
            long_above: None,
            short_below: None,
            flow_imbalance: None,
            flow_samples: None,
        };
        sync_plan(&mut slot, Some(10), &wait, Some(100.0), 1, &SETTINGS);
        assert!(slot.is_none());
    }

    #[test]
    fn setup_snapshot_freezes_thresholds() {
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), Some(100.0), 1, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert_eq!(plan.cycle_id, 10);
        assert_eq!(plan.status, PlanStatus::Setup);
        assert!((plan.base_price - 100.0).abs() < 1e-9);
        assert!((plan.long_above - 100.5).abs() < 1e-9);
        assert!((plan.short_below - 99.5).abs() < 1e-9);
        assert!(!plan.has_triggered);

        // A later, different SETUP within the same cycle must not move anything.
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 1.5), Some(110.0), 2, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert!((plan.long_above - 100.5).abs() < 1e-9);
        assert!((plan.short_below - 99.5).abs() < 1e-9);
        assert!((plan.trigger_pct - 0.5).abs() < 1e-9);
    }

    #[test]
    fn sideways_promotes_to_setup_once() {
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Sideways, 0.4), Some(100.0), 1, &SETTINGS);
        assert_eq!(slot.as_ref().unwrap().status, PlanStatus::Sideways);

        // Promote with a fresh price: thresholds re-derive from it.
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), Some(102.0), 2, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert_eq!(plan.status, PlanStatus::Setup);
        assert!((plan.base_price - 102.0).abs() < 1e-9);
        assert!((plan.long_above - 102.0 * 1.005).abs() < 1e-9);
        assert_eq!(plan.created_at, 1);

        // Oscillation back to SIDEWAYS leaves the SETUP snapshot in place.
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Sideways, 0.9), Some(103.0), 3, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert_eq!(plan.status, PlanStatus::Setup);
        assert!((plan.base_price - 102.0).abs() < 1e-9);
        assert!((plan.trigger_pct - 0.5).abs() < 1e-9);
    }

    #[test]
    fn new_cycle_replaces_plan() {
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), Some(100.0), 1, &SETTINGS);
        sync_plan(&mut slot, Some(20), &analysis(PlanStatus::Sideways, 0.8), Some(101.0), 2, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert_eq!(plan.cycle_id, 20);
        assert_eq!(plan.status, PlanStatus::Sideways);
        assert!(!plan.has_triggered);
    }

    #[test]
    fn triggered_flag_survives_promotion() {
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Sideways, 0.4), Some(100.0), 1, &SETTINGS);
        slot.as_mut().unwrap().has_triggered = true;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), Some(101.0), 2, &SETTINGS);
        assert!(slot.as_ref().unwrap().has_triggered);
    }

    #[test]
    fn trigger_clamped_into_configured_bounds() {
        // The default bounds are tighter than the analyzer's own clamp: a
        // 1.5% analysis trigger snapshots at 1.2%.
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 1.5), Some(100.0), 1, &SETTINGS);
        let plan = slot.as_ref().unwrap();
        assert!((plan.trigger_pct - 1.2).abs() < 1e-9);
        assert!((plan.long_above - 101.2).abs() < 1e-9);
        assert!((plan.short_below - 98.8).abs() < 1e-9);

        let tight = PlannerSettings {
            trigger_min_pct: 0.1,
            trigger_max_pct: 0.3,
        };
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), Some(100.0), 1, &tight);
        let plan = slot.as_ref().unwrap();
        assert!((plan.trigger_pct - 0.3).abs() < 1e-9);
        assert!((plan.long_above - 100.3).abs() < 1e-9);
    }

    #[test]
    fn missing_price_or_thresholds_block_creation() {
        let mut slot = None;
        sync_plan(&mut slot, Some(10), &analysis(PlanStatus::Setup, 0.5), None, 1, &SETTINGS);
        assert!(slot.is_none());

        let mut bad = analysis(PlanStatus::Setup, 0.5);
        bad.long_above = Some(f64::NAN);
        sync_plan(&mut slot, Some(10), &bad, Some(100.0), 1, &SETTINGS);
        assert!(slot.is_none());
    }
}
