// =============================================================================
// Central Application State — Borealis Perp Engine
// =============================================================================
//
// Shared read surface for the renderer API. The engine loop owns all symbol
// state privately and publishes immutable row snapshots here once per tick;
// the version counter lets pollers detect fresh data cheaply.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::live::{IncomeStats, LivePosition, LiveTrader};
use crate::market_data::FeedHealth;

// =============================================================================
// Published row
// =============================================================================

/// Simulator metrics attached to a row while a trade is open (plus the
/// aggregate counters, which are always present).
#[derive(Debug, Clone, Serialize)]
pub struct SimMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_pnl_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roi_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_roi_pct: Option<f64>,
    pub trailing_armed: bool,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl_usd: f64,
}

/// One published line per symbol. Formatting is the renderer's concern; field
/// semantics are stable.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolRow {
    pub symbol: String,
    pub mark_price: Option<f64>,
    pub mark_ts: Option<i64>,
    pub trade_price: Option<f64>,
    pub trade_qty: Option<f64>,
    pub trade_ts: Option<i64>,
    pub last_volume: Option<f64>,
    pub last_stream_at: Option<i64>,
    pub ms_to_next_candle: Option<i64>,
    pub plan_status: String,
    pub long_above: Option<f64>,
    pub short_below: Option<f64>,
    pub sim_side: Option<String>,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sim_metrics: Option<SimMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_position: Option<LivePosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_income: Option<IncomeStats>,
}

// =============================================================================
// AppState
// =============================================================================

/// Shared state across the engine, the feed supervisor, and the renderer API.
pub struct AppState {
    /// Bumped on every row publish; pollers compare against it.
    pub state_version: AtomicU64,
    pub config: EngineConfig,
    pub rows: RwLock<Vec<SymbolRow>>,
    pub feed: Arc<FeedHealth>,
    /// Present when live mirroring bootstrapped successfully.
    pub live: Option<Arc<LiveTrader>>,
    /// Why the live path is off (missing credentials, bootstrap failure); the
    /// renderer shows this as a banner.
    pub live_status: RwLock<Option<String>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: EngineConfig, feed: Arc<FeedHealth>, live: Option<Arc<LiveTrader>>) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            rows: RwLock::new(Vec::new()),
            feed,
            live,
            live_status: RwLock::new(None),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Swap in the tick's freshly built rows and bump the version.
    pub fn publish_rows(&self, rows: Vec<SymbolRow>) {
        *self.rows.write() = rows;
        self.increment_version();
    }

    pub fn set_live_status(&self, status: impl Into<String>) {
        *self.live_status.write() = Some(status.into());
    }

    // ── Snapshot Builder ────────────────────────────────────────────────

    /// Full state snapshot served by `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = chrono::Utc::now().timestamp_millis();
        let feed = FeedSnapshot {
            connected: self.feed.is_connected(),
            last_message_age_ms: {
                let last = self.feed.last_message_at();
                if last > 0 {
                    Some((now - last).max(0))
                } else {
                    None
                }
            },
            reconnect_attempts: self.feed.attempts(),
            last_error: self.feed.last_error(),
        };

        let live = self.live.as_ref().map(|trader| LiveSummary {
            hedge_mode: trader.is_hedge_mode(),
            last_action: trader.last_action(),
            last_error: trader.last_error(),
            income: trader.income_stats(),
        });

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now,
            uptime_secs: self.start_time.elapsed().as_secs(),
            symbols: self.config.symbols.iter().map(|s| s.symbol.clone()).collect(),
            feed,
            live,
            live_status: self.live_status.read().clone(),
            rows: self.rows.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_age_ms: Option<i64>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSummary {
    pub hedge_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub income: IncomeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub symbols: Vec<String>,
    pub feed: FeedSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_status: Option<String>,
    pub rows: Vec<SymbolRow>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(EngineConfig::default(), Arc::new(FeedHealth::new()), None)
    }

    fn row(symbol: &str) -> SymbolRow {
        SymbolRow {
            symbol: symbol.to_string(),
            mark_price: Some(100.0),
            mark_ts: None,
            trade_price: None,
            trade_qty: None,
            trade_ts: None,
            last_volume: None,
            last_stream_at: None,
            ms_to_next_candle: Some(1000),
            plan_status: "WAIT".to_string(),
            long_above: None,
            short_below: None,
            sim_side: None,
            note: "warming up".to_string(),
            sim_metrics: None,
            live_position: None,
            live_income: None,
        }
    }

    #[test]
    fn publish_bumps_version() {
        let state = state();
        let v0 = state.current_state_version();
        state.publish_rows(vec![row("BTCUSDT")]);
        assert!(state.current_state_version() > v0);
        assert_eq!(state.rows.read().len(), 1);
    }

    #[test]
    fn snapshot_reflects_rows_and_banner() {
        let state = state();
        state.publish_rows(vec![row("BTCUSDT"), row("ETHUSDT")]);
        state.set_live_status("live disabled: missing credentials");

        let snap = state.build_snapshot();
        assert_eq!(snap.rows.len(), 2);
        assert_eq!(snap.symbols.len(), 5);
        assert!(!snap.feed.connected);
        assert!(snap.live.is_none());
        assert_eq!(
            snap.live_status.as_deref(),
            Some("live disabled: missing credentials")
        );
    }

    #[test]
    fn rows_serialize_snake_case_and_skip_empty() {
        let json = serde_json::to_value(row("BTCUSDT")).unwrap();
        assert_eq!(json["symbol"], "BTCUSDT");
        assert_eq!(json["plan_status"], "WAIT");
        assert!(json.get("sim_metrics").is_none());
        assert!(json.get("live_position").is_none());
    }
}
