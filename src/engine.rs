// =============================================================================
// Engine Loop — cooperative event application and fixed-cadence ticks
// =============================================================================
//
// One task owns every symbol's state. Market events are applied as they
// arrive; on each render tick the loop health-checks the feed, then walks the
// symbols in configured order: analyze, sync the plan, update the simulator
// (possibly closing), try to open, and build the published row. Live mirror
// operations are handed off to spawned tasks — the adapter's per-symbol
// in-flight guard keeps at most one outstanding order op per symbol.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app_state::{AppState, SimMetrics, SymbolRow};
use crate::config::{EngineConfig, SimConfig};
use crate::live::LiveTrader;
use crate::market_data::{MarketEvent, SymbolState, SymbolStore};
use crate::sim::SimState;
use crate::strategy::{analyze, sync_plan, AnalyzerSettings, DecisionPlan, PlannerSettings};
use crate::types::Side;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Live order operation decided by a tick, executed off-loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MirrorOp {
    Open { side: Side, price: f64 },
    Close,
}

/// Run the engine until the event channel closes.
pub async fn run_engine(
    state: Arc<AppState>,
    mut store: SymbolStore,
    mut events: mpsc::Receiver<MarketEvent>,
) {
    let cfg = state.config.clone();
    let analyzer_settings = AnalyzerSettings::from(&cfg);
    let planner_settings = PlannerSettings::from(&cfg);

    let keys: Vec<String> = store.keys().to_vec();
    let mut plans: HashMap<String, Option<DecisionPlan>> =
        keys.iter().map(|k| (k.clone(), None)).collect();
    let mut sims: HashMap<String, SimState> =
        keys.iter().map(|k| (k.clone(), SimState::new())).collect();

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.render_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        symbols = keys.len(),
        interval_ms = cfg.render_interval_ms,
        "engine loop started"
    );

    loop {
        tokio::select! {
            maybe_event = events.recv() => match maybe_event {
                Some(event) => store.apply(&event, now_ms()),
                None => {
                    warn!("event channel closed — engine loop exiting");
                    return;
                }
            },
            _ = ticker.tick() => {
                run_tick(
                    &state,
                    &cfg,
                    &store,
                    &keys,
                    &mut plans,
                    &mut sims,
                    &analyzer_settings,
                    &planner_settings,
                );
            }
        }
    }
}

/// One tick: watchdog, per-symbol pipeline, row publish.
#[allow(clippy::too_many_arguments)]
fn run_tick(
    state: &Arc<AppState>,
    cfg: &EngineConfig,
    store: &SymbolStore,
    keys: &[String],
    plans: &mut HashMap<String, Option<DecisionPlan>>,
    sims: &mut HashMap<String, SimState>,
    analyzer_settings: &AnalyzerSettings,
    planner_settings: &PlannerSettings,
) {
    let now = now_ms();

    // ── 1. Feed watchdog ─────────────────────────────────────────────
    if state.feed.is_stale(now, cfg.ws_stale_timeout_ms) {
        warn!(
            stale_ms = now - state.feed.last_message_at(),
            "feed watchdog tripped — requesting reconnect"
        );
        state.feed.request_reconnect();
    }

    // ── 2. Per-symbol pipeline ───────────────────────────────────────
    let mut rows = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(symbol_state) = store.get(key) else {
            continue;
        };
        let plan_slot = plans.get_mut(key).expect("plan slot exists per key");
        let sim = sims.get_mut(key).expect("sim state exists per key");

        let (row, ops) = tick_symbol(
            symbol_state,
            plan_slot,
            sim,
            now,
            analyzer_settings,
            planner_settings,
            &cfg.sim,
        );

        // One task per symbol keeps a same-tick close-then-open ordered; the
        // adapter's in-flight guard handles anything overlapping.
        if let (false, Some(live)) = (ops.is_empty(), state.live.as_ref()) {
            let live = Arc::clone(live);
            let market = symbol_state.market_symbol.clone();
            tokio::spawn(async move {
                for op in ops {
                    match op {
                        MirrorOp::Open { side, price } => {
                            live.mirror_open(&market, side, price).await
                        }
                        MirrorOp::Close => live.mirror_close(&market).await,
                    }
                }
            });
        }

        rows.push(attach_live(row, symbol_state, state.live.as_deref()));
    }

    // ── 3. Publish ───────────────────────────────────────────────────
    state.publish_rows(rows);
}

/// Run the decision pipeline for one symbol. Pure over its inputs apart from
/// the plan/sim mutations; live side effects come back as `MirrorOp`s for the
/// caller to dispatch.
pub fn tick_symbol(
    symbol_state: &SymbolState,
    plan_slot: &mut Option<DecisionPlan>,
    sim: &mut SimState,
    now: i64,
    analyzer_settings: &AnalyzerSettings,
    planner_settings: &PlannerSettings,
    sim_cfg: &SimConfig,
) -> (SymbolRow, Vec<MirrorOp>) {
    let candles = symbol_state.candle_slice();
    let live_price = symbol_state.live_price();

    let analysis = analyze(
        &candles,
        live_price,
        symbol_state.ms_to_next_candle(now),
        symbol_state.flow_snapshot(),
        analyzer_settings,
    );
    sync_plan(
        plan_slot,
        symbol_state.current_cycle_id(),
        &analysis,
        live_price,
        now,
        planner_settings,
    );

    let mut ops = Vec::new();
    let mut event_note = None;

    if let Some(price) = live_price {
        if let Some(closed) = sim.update_open_trade(&symbol_state.symbol, price, now) {
            ops.push(MirrorOp::Close);
            event_note = Some(format!(
                "closed {} {:+.2} USD ({:+.2}%)",
                closed.exit_reason, closed.pnl_usd, closed.roi_pct
            ));
        }

        if let Some(plan) = plan_slot.as_mut() {
            if sim.maybe_open_trade(&symbol_state.symbol, plan, price, now, sim_cfg) {
                let side = sim.active().expect("trade just opened").side;
                ops.push(MirrorOp::Open { side, price });
                event_note = Some(format!("opened {side} @ {price}"));
            }
        }
    }

    let note = symbol_state
        .error
        .clone()
        .or(event_note)
        .or_else(|| plan_slot.as_ref().map(|p| p.reason.clone()))
        .or_else(|| {
            sim.last_closed().map(|c| {
                format!(
                    "last {} {:+.2} USD ({:+.2}%)",
                    c.exit_reason, c.pnl_usd, c.roi_pct
                )
            })
        })
        .unwrap_or_else(|| analysis.reason.clone());

    let stats = sim.stats();
    let sim_metrics = SimMetrics {
        entry_price: sim.active().map(|t| t.entry_price),
        net_pnl_usd: sim
            .active()
            .zip(live_price)
            .map(|(t, p)| t.unrealized(p).2),
        roi_pct: sim
            .active()
            .zip(live_price)
            .map(|(t, p)| t.unrealized(p).3),
        peak_roi_pct: sim.active().map(|t| t.peak_roi_pct),
        trailing_armed: sim.active().map(|t| t.trailing_armed).unwrap_or(false),
        trades: stats.total,
        wins: stats.wins,
        losses: stats.losses,
        realized_pnl_usd: stats.realized_pnl_usd,
    };

    let row = SymbolRow {
        symbol: symbol_state.symbol.clone(),
        mark_price: symbol_state.mark_price,
        mark_ts: symbol_state.mark_ts,
        trade_price: symbol_state.trade_price,
        trade_qty: symbol_state.trade_qty,
        trade_ts: symbol_state.trade_ts,
        last_volume: symbol_state.last_volume,
        last_stream_at: symbol_state.last_stream_at,
        ms_to_next_candle: symbol_state.ms_to_next_candle(now),
        plan_status: plan_slot
            .as_ref()
            .map(|p| p.status.to_string())
            .unwrap_or_else(|| analysis.status.to_string()),
        long_above: plan_slot.as_ref().map(|p| p.long_above),
        short_below: plan_slot.as_ref().map(|p| p.short_below),
        sim_side: sim.active().map(|t| t.side.to_string()),
        note,
        sim_metrics: Some(sim_metrics),
        live_position: None,
        live_income: None,
    };

    (row, ops)
}

/// Attach live adapter snapshots to a finished row.
fn attach_live(mut row: SymbolRow, symbol_state: &SymbolState, live: Option<&LiveTrader>) -> SymbolRow {
    if let Some(trader) = live {
        row.live_position = trader.position_for(&symbol_state.market_symbol);
        row.live_income = Some(trader.income_stats());
    }
    row
}
