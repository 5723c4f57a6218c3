// =============================================================================
// Strategy Analyzer — pure per-symbol decision analysis
// =============================================================================
//
// Pure function over a symbol's candle history, live price, time-to-close and
// flow context. No state, no side effects: the planner decides what sticks.
//
// Pipeline:
//   1. Preconditions (price present, ring full, inside the decision window)
//   2. Volatility (mean candle range %, stddev of close returns)
//   3. Trend (EMA-9 over the last 30 closes vs EMA-21 over the last 40)
//   4. Volume ratio (last closed candle vs mean of the last 20)
//   5. Flow imbalance (taker buy vs sell within the lookback window)
//   6. Trigger % = range·0.6 + vol·0.8, flow-adjusted, clamped
//   7. Classify WAIT / SIDEWAYS / SETUP with breakout thresholds
// =============================================================================

use serde::Serialize;

use crate::indicators::ema::ema_last;
use crate::indicators::volatility::{close_returns, mean_range_pct, stddev};
use crate::market_data::store::FlowSnapshot;
use crate::market_data::Candle;

// ---------------------------------------------------------------------------
// Tunables
// ---------------------------------------------------------------------------

/// Candle window for the mean range percentage.
const RANGE_WINDOW: usize = 14;
/// Fast EMA: period 9 over the last 30 closes.
const FAST_EMA_WINDOW: usize = 30;
const FAST_EMA_PERIOD: usize = 9;
/// Slow EMA: period 21 over the last 40 closes.
const SLOW_EMA_WINDOW: usize = 40;
const SLOW_EMA_PERIOD: usize = 21;
/// Volume mean window.
const VOLUME_WINDOW: usize = 20;

/// Absolute trigger clamp, in percent.
const TRIGGER_CLAMP_MIN_PCT: f64 = 0.08;
const TRIGGER_CLAMP_MAX_PCT: f64 = 2.2;

/// Trigger composition weights.
const RANGE_WEIGHT: f64 = 0.6;
const VOL_WEIGHT: f64 = 0.8;

/// Flow-vs-trend trigger multipliers.
const FLOW_CONFLICT_MULT: f64 = 1.25;
const FLOW_SUPPORT_MULT: f64 = 0.85;

/// Classification thresholds.
const WEAK_TREND_PCT: f64 = 0.08;
const WEAK_VOLUME_RATIO: f64 = 0.75;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Status of an analysis (and of the plan derived from it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanStatus {
    Wait,
    Sideways,
    Setup,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wait => write!(f, "WAIT"),
            Self::Sideways => write!(f, "SIDEWAYS"),
            Self::Setup => write!(f, "SETUP"),
        }
    }
}

/// Result of one analysis pass. Pure value.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionAnalysis {
    pub status: PlanStatus,
    pub reason: String,
    pub trigger_pct: f64,
    pub long_above: Option<f64>,
    pub short_below: Option<f64>,
    pub flow_imbalance: Option<f64>,
    pub flow_samples: Option<usize>,
}

impl DecisionAnalysis {
    fn wait(reason: impl Into<String>) -> Self {
        Self {
            status: PlanStatus::Wait,
            reason: reason.into(),
            trigger_pct: 0.0,
            long_above: None,
            short_below: None,
            flow_imbalance: None,
            flow_samples: None,
        }
    }
}

/// Analyzer knobs lifted from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerSettings {
    pub history_candles: usize,
    pub decision_window_ms: i64,
    pub flow_min_samples: usize,
    pub flow_confirm_threshold: f64,
}

impl From<&crate::config::EngineConfig> for AnalyzerSettings {
    fn from(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            history_candles: cfg.history_candles,
            decision_window_ms: cfg.decision_window_ms,
            flow_min_samples: cfg.flow_min_samples,
            flow_confirm_threshold: cfg.flow_confirm_threshold,
        }
    }
}

/// How the flow window relates to the trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowRelation {
    Neutral,
    Supports,
    Conflicts,
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Analyze one symbol. `ms_to_next_candle == None` means the cycle clock is
/// unknown, which reads as infinitely far from the next close.
pub fn analyze(
    candles: &[Candle],
    live_price: Option<f64>,
    ms_to_next_candle: Option<i64>,
    flow: Option<FlowSnapshot>,
    settings: &AnalyzerSettings,
) -> DecisionAnalysis {
    // ── 1. Preconditions ─────────────────────────────────────────────
    let price = match live_price {
        Some(p) if p.is_finite() && p > 0.0 => p,
        _ => return DecisionAnalysis::wait("no live price"),
    };

    if candles.len() < settings.history_candles {
        return DecisionAnalysis::wait(format!(
            "warming up: {}/{} candles",
            candles.len(),
            settings.history_candles
        ));
    }

    match ms_to_next_candle {
        Some(ms) if ms <= settings.decision_window_ms => {}
        _ => return DecisionAnalysis::wait("outside decision window"),
    }

    // ── 2. Volatility ────────────────────────────────────────────────
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let returns = close_returns(&closes);

    let range_pct = match mean_range_pct(candles, RANGE_WINDOW) {
        Some(v) => v,
        None => return DecisionAnalysis::wait("range not ready"),
    };
    let vol_pct = match stddev(&returns) {
        Some(sd) => sd * 100.0,
        None => return DecisionAnalysis::wait("returns not ready"),
    };

    // ── 3. Trend ─────────────────────────────────────────────────────
    let fast_window = &closes[closes.len().saturating_sub(FAST_EMA_WINDOW)..];
    let slow_window = &closes[closes.len().saturating_sub(SLOW_EMA_WINDOW)..];
    let trend_pct = match (
        ema_last(fast_window, FAST_EMA_PERIOD),
        ema_last(slow_window, SLOW_EMA_PERIOD),
    ) {
        (Some(fast), Some(slow)) if slow != 0.0 => (fast - slow) / slow * 100.0,
        _ => return DecisionAnalysis::wait("trend not ready"),
    };

    // ── 4. Volume ratio ──────────────────────────────────────────────
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let vol_window = &volumes[volumes.len().saturating_sub(VOLUME_WINDOW)..];
    let mean_volume = vol_window.iter().sum::<f64>() / vol_window.len() as f64;
    let volume_ratio = if mean_volume > 0.0 {
        volumes.last().copied().unwrap_or(0.0) / mean_volume
    } else {
        0.0
    };

    // ── 5. Flow context ──────────────────────────────────────────────
    let flow = flow.filter(|f| f.samples >= settings.flow_min_samples && f.imbalance.is_finite());
    let relation = flow_relation(flow, trend_pct, settings.flow_confirm_threshold);

    // ── 6. Trigger ───────────────────────────────────────────────────
    let trigger_base = range_pct * RANGE_WEIGHT + vol_pct * VOL_WEIGHT;
    let multiplier = match relation {
        FlowRelation::Conflicts => FLOW_CONFLICT_MULT,
        FlowRelation::Supports => FLOW_SUPPORT_MULT,
        FlowRelation::Neutral => 1.0,
    };
    let trigger_pct = (trigger_base * multiplier).clamp(TRIGGER_CLAMP_MIN_PCT, TRIGGER_CLAMP_MAX_PCT);

    let long_above = price * (1.0 + trigger_pct / 100.0);
    let short_below = price * (1.0 - trigger_pct / 100.0);

    // ── 7. Classification ────────────────────────────────────────────
    let weak_trend = trend_pct.abs() < WEAK_TREND_PCT;
    let weak_volume = volume_ratio < WEAK_VOLUME_RATIO;

    let (status, reason) = if weak_trend && weak_volume {
        (
            PlanStatus::Sideways,
            format!(
                "flat: trend {trend_pct:+.3}% and volume ratio {volume_ratio:.2} both weak"
            ),
        )
    } else if relation == FlowRelation::Conflicts {
        let (imbalance, buy_qty, sell_qty) = flow
            .map(|f| (f.imbalance, f.buy_qty, f.sell_qty))
            .unwrap_or((0.0, 0.0, 0.0));
        (
            PlanStatus::Sideways,
            format!(
                "flow {imbalance:+.3} (buy {buy_qty:.2} / sell {sell_qty:.2}) against trend {trend_pct:+.3}%"
            ),
        )
    } else {
        let bias = if trend_pct >= 0.0 { "long" } else { "short" };
        (
            PlanStatus::Setup,
            format!(
                "{bias} bias: trend {trend_pct:+.3}%, vol {vol_pct:.3}%, trigger {trigger_pct:.3}%"
            ),
        )
    };

    DecisionAnalysis {
        status,
        reason,
        trigger_pct,
        long_above: Some(long_above),
        short_below: Some(short_below),
        flow_imbalance: flow.map(|f| f.imbalance),
        flow_samples: flow.map(|f| f.samples),
    }
}

/// Flow supports the trend when the imbalance leans the same way beyond the
/// confirm threshold; conflicts when it leans the other way.
fn flow_relation(flow: Option<FlowSnapshot>, trend_pct: f64, threshold: f64) -> FlowRelation {
    let Some(flow) = flow else {
        return FlowRelation::Neutral;
    };
    if flow.imbalance.abs() < threshold || trend_pct == 0.0 {
        return FlowRelation::Neutral;
    }
    if (flow.imbalance > 0.0) == (trend_pct > 0.0) {
        FlowRelation::Supports
    } else {
        FlowRelation::Conflicts
    }
}
