// =============================================================================
// Symbol State Store — per-symbol candle ring, flow window, and cycle clock
// =============================================================================
//
// One `SymbolState` per configured symbol, exclusively owned by the engine
// loop. Candle ring invariant: bounded to the configured history depth with
// strictly increasing close times (a closed kline with an equal close time
// replaces the last entry; an older one is dropped).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::config::SymbolSpec;
use crate::market_data::event::{Candle, MarketEvent};

// ---------------------------------------------------------------------------
// Flow window
// ---------------------------------------------------------------------------

/// Taker side of an aggregated trade. The buyer being the maker means the
/// taker sold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSide {
    Buy,
    Sell,
}

/// One aggregated trade inside the rolling flow window.
#[derive(Debug, Clone, Copy)]
pub struct AggTrade {
    pub ts: i64,
    pub qty: f64,
    pub side: FlowSide,
}

/// Aggregate view over the current flow window.
#[derive(Debug, Clone, Copy)]
pub struct FlowSnapshot {
    pub buy_qty: f64,
    pub sell_qty: f64,
    pub samples: usize,
    /// `(buy - sell) / (buy + sell)`, in `[-1, 1]`.
    pub imbalance: f64,
}

// ---------------------------------------------------------------------------
// SymbolState
// ---------------------------------------------------------------------------

/// All mutable market state for a single symbol.
#[derive(Debug)]
pub struct SymbolState {
    pub symbol: String,
    pub market_symbol: String,

    candles: VecDeque<Candle>,
    flow: VecDeque<AggTrade>,

    pub trade_price: Option<f64>,
    pub trade_qty: Option<f64>,
    pub trade_ts: Option<i64>,
    pub mark_price: Option<f64>,
    pub mark_ts: Option<i64>,

    /// Running volume of the current decision-interval kline.
    pub last_volume: Option<f64>,
    pub next_candle_close_ts: Option<i64>,
    pub last_stream_at: Option<i64>,

    /// Symbol-specific error surfaced to the renderer (e.g. hydration failure).
    pub error: Option<String>,

    history_candles: usize,
    flow_lookback_ms: i64,
    cycle_ms: i64,
}

impl SymbolState {
    pub fn new(
        symbol: impl Into<String>,
        market_symbol: impl Into<String>,
        history_candles: usize,
        flow_lookback_ms: i64,
        cycle_ms: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            market_symbol: market_symbol.into(),
            candles: VecDeque::with_capacity(history_candles + 1),
            flow: VecDeque::new(),
            trade_price: None,
            trade_qty: None,
            trade_ts: None,
            mark_price: None,
            mark_ts: None,
            last_volume: None,
            next_candle_close_ts: None,
            last_stream_at: None,
            error: None,
            history_candles,
            flow_lookback_ms,
            cycle_ms,
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Apply one decoded market event.
    pub fn apply_event(&mut self, event: &MarketEvent, now_ms: i64) {
        self.last_stream_at = Some(now_ms);

        match event {
            MarketEvent::Trade {
                price,
                qty,
                ts,
                buyer_is_maker,
                ..
            } => {
                self.trade_price = Some(*price);
                self.trade_qty = Some(*qty);
                self.trade_ts = Some(*ts);

                if *qty > 0.0 {
                    let side = if *buyer_is_maker {
                        FlowSide::Sell
                    } else {
                        FlowSide::Buy
                    };
                    self.flow.push_back(AggTrade {
                        ts: *ts,
                        qty: *qty,
                        side,
                    });
                    self.prune_flow(*ts);
                }
            }
            MarketEvent::Mark { price, ts, .. } => {
                self.mark_price = Some(*price);
                self.mark_ts = Some(*ts);
            }
            MarketEvent::Kline { candle, closed, .. } => {
                self.last_volume = Some(candle.volume);
                self.next_candle_close_ts = Some(if *closed {
                    candle.close_time + self.cycle_ms
                } else {
                    candle.close_time
                });

                if *closed {
                    self.upsert_candle(candle.clone());
                }
            }
        }
    }

    /// Append or replace a closed candle, preserving strictly increasing close
    /// times and the ring bound.
    fn upsert_candle(&mut self, candle: Candle) {
        match self.candles.back() {
            Some(last) if candle.close_time > last.close_time => {
                self.candles.push_back(candle);
            }
            Some(last) if candle.close_time == last.close_time => {
                *self.candles.back_mut().expect("ring is non-empty") = candle;
            }
            Some(last) => {
                debug!(
                    symbol = %self.symbol,
                    incoming = candle.close_time,
                    last = last.close_time,
                    "out-of-order closed candle dropped"
                );
            }
            None => self.candles.push_back(candle),
        }

        while self.candles.len() > self.history_candles {
            self.candles.pop_front();
        }
    }

    /// Replace the candle ring from boot hydration (rows assumed oldest-first;
    /// unsorted or duplicate rows are squeezed through the upsert path).
    pub fn seed_history(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        for candle in candles {
            if candle.is_valid() {
                self.upsert_candle(candle);
            }
        }
        if let Some(last) = self.candles.back() {
            self.next_candle_close_ts = Some(last.close_time + self.cycle_ms);
        }
        debug!(symbol = %self.symbol, count = self.candles.len(), "candle history seeded");
    }

    fn prune_flow(&mut self, newest_ts: i64) {
        let cutoff = newest_ts - self.flow_lookback_ms;
        while let Some(front) = self.flow.front() {
            if front.ts < cutoff {
                self.flow.pop_front();
            } else {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Best available live price: last trade, then mark, then last close.
    pub fn live_price(&self) -> Option<f64> {
        self.trade_price
            .or(self.mark_price)
            .or_else(|| self.candles.back().map(|c| c.close))
    }

    /// Milliseconds until the current cycle's candle closes. `None` means the
    /// clock is unknown (no kline seen yet and no history).
    pub fn ms_to_next_candle(&self, now_ms: i64) -> Option<i64> {
        let target = self
            .next_candle_close_ts
            .or_else(|| self.candles.back().map(|c| c.close_time + self.cycle_ms))?;
        Some((target - now_ms).max(0))
    }

    /// Cycle identity used as the decision-plan key.
    pub fn current_cycle_id(&self) -> Option<i64> {
        self.next_candle_close_ts
            .or_else(|| self.candles.back().map(|c| c.close_time + self.cycle_ms))
    }

    /// Candle ring, oldest-first.
    pub fn candles(&self) -> &VecDeque<Candle> {
        &self.candles
    }

    pub fn candle_slice(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }

    /// Aggregate the current flow window.
    pub fn flow_snapshot(&self) -> Option<FlowSnapshot> {
        if self.flow.is_empty() {
            return None;
        }
        let mut buy_qty = 0.0;
        let mut sell_qty = 0.0;
        for trade in &self.flow {
            match trade.side {
                FlowSide::Buy => buy_qty += trade.qty,
                FlowSide::Sell => sell_qty += trade.qty,
            }
        }
        let total = buy_qty + sell_qty;
        if total <= 0.0 {
            return None;
        }
        Some(FlowSnapshot {
            buy_qty,
            sell_qty,
            samples: self.flow.len(),
            imbalance: (buy_qty - sell_qty) / total,
        })
    }
}

// ---------------------------------------------------------------------------
// SymbolStore
// ---------------------------------------------------------------------------

/// Owning map of symbol states, iterated in configured order.
#[derive(Debug)]
pub struct SymbolStore {
    states: HashMap<String, SymbolState>,
    order: Vec<String>,
}

impl SymbolStore {
    pub fn new(
        specs: &[SymbolSpec],
        history_candles: usize,
        flow_lookback_ms: i64,
        cycle_ms: i64,
    ) -> Self {
        let mut states = HashMap::new();
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            let key = spec.market_lower();
            states.insert(
                key.clone(),
                SymbolState::new(
                    spec.symbol.clone(),
                    key.clone(),
                    history_candles,
                    flow_lookback_ms,
                    cycle_ms,
                ),
            );
            order.push(key);
        }
        Self { states, order }
    }

    /// Route an event to its owning symbol. Events for unknown symbols are
    /// dropped with a warning (the subscription set is fixed at boot).
    pub fn apply(&mut self, event: &MarketEvent, now_ms: i64) {
        match self.states.get_mut(event.symbol()) {
            Some(state) => state.apply_event(event, now_ms),
            None => warn!(symbol = event.symbol(), "event for unsubscribed symbol dropped"),
        }
    }

    pub fn get(&self, market_lower: &str) -> Option<&SymbolState> {
        self.states.get(market_lower)
    }

    pub fn get_mut(&mut self, market_lower: &str) -> Option<&mut SymbolState> {
        self.states.get_mut(market_lower)
    }

    /// Symbol keys in configured order.
    pub fn keys(&self) -> &[String] {
        &self.order
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 10.0,
            close_time,
        }
    }

    fn state() -> SymbolState {
        SymbolState::new("BTCUSDT", "btcusdt", 3, 60_000, 300_000)
    }

    fn kline_event(open_time: i64, close_time: i64, close: f64, closed: bool) -> MarketEvent {
        MarketEvent::Kline {
            symbol: "btcusdt".to_string(),
            candle: candle(open_time, close_time, close),
            closed,
        }
    }

    fn trade_event(ts: i64, price: f64, qty: f64, buyer_is_maker: bool) -> MarketEvent {
        MarketEvent::Trade {
            symbol: "btcusdt".to_string(),
            price,
            qty,
            ts,
            buyer_is_maker,
        }
    }

    #[test]
    fn ring_is_bounded_and_strictly_increasing() {
        let mut st = state();
        for i in 0..5 {
            let open = i * 300_000;
            st.apply_event(&kline_event(open, open + 299_999, 100.0 + i as f64, true), 0);
        }
        assert_eq!(st.candles().len(), 3);
        let closes: Vec<i64> = st.candles().iter().map(|c| c.close_time).collect();
        let mut sorted = closes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(closes, sorted);
        assert!((st.candles().back().unwrap().close - 104.0).abs() < 1e-9);
    }

    #[test]
    fn duplicate_close_time_replaces_in_place() {
        let mut st = state();
        st.apply_event(&kline_event(0, 299_999, 100.0, true), 0);
        st.apply_event(&kline_event(0, 299_999, 101.0, true), 0);
        assert_eq!(st.candles().len(), 1);
        assert!((st.candles().back().unwrap().close - 101.0).abs() < 1e-9);

        // Replaying the identical event leaves the ring unchanged.
        let before = st.candle_slice();
        st.apply_event(&kline_event(0, 299_999, 101.0, true), 0);
        assert_eq!(st.candle_slice(), before);
    }

    #[test]
    fn older_candle_is_dropped() {
        let mut st = state();
        st.apply_event(&kline_event(300_000, 599_999, 100.0, true), 0);
        st.apply_event(&kline_event(0, 299_999, 99.0, true), 0);
        assert_eq!(st.candles().len(), 1);
        assert_eq!(st.candles().back().unwrap().close_time, 599_999);
    }

    #[test]
    fn open_kline_updates_clock_but_not_ring() {
        let mut st = state();
        st.apply_event(&kline_event(0, 299_999, 100.0, false), 0);
        assert!(st.candles().is_empty());
        assert_eq!(st.next_candle_close_ts, Some(299_999));
        assert_eq!(st.last_volume, Some(10.0));

        st.apply_event(&kline_event(0, 299_999, 100.0, true), 0);
        assert_eq!(st.candles().len(), 1);
        assert_eq!(st.next_candle_close_ts, Some(299_999 + 300_000));
    }

    #[test]
    fn flow_window_prunes_and_aggregates() {
        let mut st = state();
        st.apply_event(&trade_event(1_000, 100.0, 2.0, false), 0); // taker buy
        st.apply_event(&trade_event(30_000, 100.0, 1.0, true), 0); // taker sell
        st.apply_event(&trade_event(55_000, 100.0, 3.0, false), 0); // taker buy

        let snap = st.flow_snapshot().unwrap();
        assert_eq!(snap.samples, 3);
        assert!((snap.buy_qty - 5.0).abs() < 1e-9);
        assert!((snap.sell_qty - 1.0).abs() < 1e-9);

        // A trade past the lookback evicts the first entry (cutoff = ts - 60s).
        st.apply_event(&trade_event(62_000, 100.0, 1.0, true), 0);
        let snap = st.flow_snapshot().unwrap();
        assert_eq!(snap.samples, 3);
        assert!((snap.buy_qty - 3.0).abs() < 1e-9);
        assert!((snap.sell_qty - 2.0).abs() < 1e-9);
        assert!((snap.imbalance - 0.2).abs() < 1e-9);
    }

    #[test]
    fn zero_qty_trade_not_added_to_flow() {
        let mut st = state();
        st.apply_event(&trade_event(1_000, 100.0, 0.0, false), 0);
        assert!(st.flow_snapshot().is_none());
        assert_eq!(st.trade_price, Some(100.0));
    }

    #[test]
    fn live_price_fallback_order() {
        let mut st = state();
        assert_eq!(st.live_price(), None);

        st.apply_event(&kline_event(0, 299_999, 105.0, true), 0);
        assert_eq!(st.live_price(), Some(105.0));

        st.apply_event(
            &MarketEvent::Mark {
                symbol: "btcusdt".to_string(),
                price: 106.0,
                ts: 1,
            },
            0,
        );
        assert_eq!(st.live_price(), Some(106.0));

        st.apply_event(&trade_event(2, 107.0, 1.0, false), 0);
        assert_eq!(st.live_price(), Some(107.0));
    }

    #[test]
    fn ms_to_next_candle_and_cycle_id() {
        let mut st = state();
        assert_eq!(st.ms_to_next_candle(0), None);
        assert_eq!(st.current_cycle_id(), None);

        st.apply_event(&kline_event(0, 299_999, 100.0, true), 0);
        assert_eq!(st.current_cycle_id(), Some(599_999));
        assert_eq!(st.ms_to_next_candle(500_000), Some(99_999));
        assert_eq!(st.ms_to_next_candle(700_000), Some(0));
    }

    #[test]
    fn cycle_id_falls_back_to_seeded_history() {
        let mut st = state();
        st.seed_history(vec![candle(0, 299_999, 100.0), candle(300_000, 599_999, 101.0)]);
        assert_eq!(st.current_cycle_id(), Some(899_999));
        assert_eq!(st.candles().len(), 2);
    }

    #[test]
    fn store_routes_by_market_symbol() {
        let specs = vec![
            SymbolSpec {
                symbol: "BTCUSDT".to_string(),
                market: "BTCUSDT".to_string(),
            },
            SymbolSpec {
                symbol: "ETHUSDT".to_string(),
                market: "ETHUSDC".to_string(),
            },
        ];
        let mut store = SymbolStore::new(&specs, 72, 60_000, 300_000);
        assert_eq!(store.keys(), &["btcusdt".to_string(), "ethusdc".to_string()]);

        store.apply(&trade_event(1, 100.0, 1.0, false), 0);
        assert_eq!(store.get("btcusdt").unwrap().trade_price, Some(100.0));
        assert_eq!(store.get("ethusdc").unwrap().trade_price, None);

        // Unknown symbol is a no-op.
        store.apply(
            &MarketEvent::Mark {
                symbol: "dogeusdt".to_string(),
                price: 1.0,
                ts: 1,
            },
            0,
        );
    }
}
