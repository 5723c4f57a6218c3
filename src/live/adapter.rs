// =============================================================================
// Live Trader Adapter — mirrors simulator decisions onto the exchange
// =============================================================================
//
// Bootstrap order per symbol: position mode, exchange-info filters, leverage
// brackets (best-effort), margin mode, leverage negotiation, then an initial
// reconciliation. After that the adapter only reacts: the engine mirrors
// simulator opens/closes into signed orders, and a periodic `sync_runtime`
// re-reads positions and income from the venue.
//
// Failure semantics: order errors set `last_error`/`last_action` and never
// touch `active_positions` except on confirmed fills. Server-side
// reconciliation is authoritative over everything tracked locally.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{LiveConfig, SimConfig};
use crate::live::client::FuturesClient;
use crate::live::error::{VenueError, VenueResult};
use crate::live::income::{IncomeLedger, IncomeStats};
use crate::live::normalize::{
    decimals_for, normalize_qty, parse_filters, round_price_down_to_tick, round_price_up_to_tick,
    SymbolFilters,
};
use crate::types::{EntryMode, MarginMode, Side};

/// Hard ceiling on negotiated leverage regardless of brackets.
const LEVERAGE_HARD_CAP: u32 = 20;
/// Leverage candidates tried after the target itself.
const LEVERAGE_FALLBACKS: [u32; 9] = [20, 15, 12, 10, 8, 5, 3, 2, 1];
/// Income page size per poll.
const INCOME_PAGE_LIMIT: u32 = 1000;

/// Reconciled position snapshot for one symbol.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LivePosition {
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl_usd: f64,
    pub notional_usd: f64,
    pub margin_usd: f64,
    pub margin_type: MarginMode,
    pub leverage: f64,
}

/// Locally tracked open position (what we believe we hold between
/// reconciliations).
#[derive(Debug, Clone, Copy)]
struct ActiveRef {
    side: Side,
    quantity: f64,
}

// ---------------------------------------------------------------------------
// LiveTrader
// ---------------------------------------------------------------------------

pub struct LiveTrader {
    client: FuturesClient,
    live_cfg: LiveConfig,
    sim_cfg: SimConfig,
    /// Uppercase market symbols, in configured order.
    symbols: Vec<String>,

    hedge_mode: AtomicBool,
    filters: RwLock<HashMap<String, SymbolFilters>>,
    bracket_max: RwLock<HashMap<String, u32>>,
    effective_leverage: RwLock<HashMap<String, u32>>,
    margin_mode: RwLock<HashMap<String, MarginMode>>,

    active_positions: RwLock<HashMap<String, ActiveRef>>,
    in_flight: Mutex<HashSet<String>>,
    positions: RwLock<HashMap<String, LivePosition>>,
    income: Mutex<IncomeLedger>,

    last_action: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
}

impl LiveTrader {
    pub fn new(
        client: FuturesClient,
        live_cfg: LiveConfig,
        sim_cfg: SimConfig,
        market_symbols: Vec<String>,
        income_start_ts: i64,
    ) -> Self {
        Self {
            client,
            live_cfg,
            sim_cfg,
            symbols: market_symbols.iter().map(|s| s.to_uppercase()).collect(),
            hedge_mode: AtomicBool::new(false),
            filters: RwLock::new(HashMap::new()),
            bracket_max: RwLock::new(HashMap::new()),
            effective_leverage: RwLock::new(HashMap::new()),
            margin_mode: RwLock::new(HashMap::new()),
            active_positions: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            positions: RwLock::new(HashMap::new()),
            income: Mutex::new(IncomeLedger::new(income_start_ts)),
            last_action: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Discover venue constraints and negotiate leverage/margin for every
    /// configured symbol. A failure here surfaces to the caller; the engine
    /// keeps simulating with the live path disabled.
    pub async fn bootstrap(&self) -> VenueResult<()> {
        // ── 1. Position mode ─────────────────────────────────────────
        let dual = self.client.position_side_dual().await?;
        let hedge = dual
            .get("dualSidePosition")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.hedge_mode.store(hedge, Ordering::Relaxed);
        info!(hedge_mode = hedge, "position mode discovered");

        // ── 2. Exchange info filters ─────────────────────────────────
        let info = self.client.exchange_info().await?;
        let empty = Vec::new();
        let entries = info
            .get("symbols")
            .and_then(Value::as_array)
            .unwrap_or(&empty);
        {
            let mut filters = self.filters.write();
            for symbol in &self.symbols {
                let entry = entries
                    .iter()
                    .find(|e| e.get("symbol").and_then(Value::as_str) == Some(symbol));
                match entry.and_then(parse_filters) {
                    Some(f) => {
                        debug!(symbol = %symbol, ?f, "filters loaded");
                        filters.insert(symbol.clone(), f);
                    }
                    None => warn!(symbol = %symbol, "no usable filters in exchangeInfo"),
                }
            }
        }

        // ── 3. Leverage brackets (best-effort) ───────────────────────
        for symbol in &self.symbols {
            match self.client.leverage_brackets(symbol).await {
                Ok(body) => {
                    if let Some(max) = parse_bracket_max(&body, symbol) {
                        self.bracket_max.write().insert(symbol.clone(), max);
                        debug!(symbol = %symbol, max_leverage = max, "bracket loaded");
                    }
                }
                Err(e) => warn!(symbol = %symbol, error = %e, "leverage brackets unavailable"),
            }
        }

        // ── 4. Margin mode ───────────────────────────────────────────
        if self.live_cfg.force_isolated {
            for symbol in &self.symbols {
                let mode = match self.client.set_margin_type(symbol, "ISOLATED").await {
                    Ok(_) => MarginMode::Isolated,
                    Err(e) if e.is_margin_noop() => MarginMode::Isolated,
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "margin switch failed");
                        MarginMode::Unknown
                    }
                };
                self.margin_mode.write().insert(symbol.clone(), mode);
            }
        }

        // ── 5. Leverage negotiation ──────────────────────────────────
        let target = self.sim_cfg.leverage.round().max(1.0) as u32;
        for symbol in &self.symbols {
            let bracket = self.bracket_max.read().get(symbol).copied();
            let effective = self.negotiate_leverage(symbol, target, bracket).await;
            info!(symbol = %symbol, leverage = effective, "effective leverage");
            self.effective_leverage.write().insert(symbol.clone(), effective);
        }

        // ── 6. Initial reconciliation ────────────────────────────────
        self.sync_runtime().await;
        Ok(())
    }

    /// Walk the candidate list until the venue accepts one. `-4028` (invalid
    /// leverage) moves to the next candidate; any other error stops the walk.
    async fn negotiate_leverage(&self, symbol: &str, target: u32, bracket_max: Option<u32>) -> u32 {
        for candidate in leverage_candidates(target, bracket_max) {
            match self.client.set_leverage(symbol, candidate).await {
                Ok(_) => return candidate,
                Err(e) if e.is_code(-4028) => {
                    debug!(symbol, candidate, "leverage rejected, trying next");
                }
                Err(e) => {
                    warn!(symbol, candidate, error = %e, "leverage negotiation aborted");
                    break;
                }
            }
        }
        1
    }

    // -------------------------------------------------------------------------
    // Mirror open
    // -------------------------------------------------------------------------

    /// Mirror a simulator open. Quantity derives from the configured margin at
    /// the negotiated leverage and is normalized to the venue's lot grid.
    pub async fn mirror_open(&self, market_symbol: &str, side: Side, reference_price: f64) {
        let symbol = market_symbol.to_uppercase();

        if self.active_positions.read().contains_key(&symbol) {
            debug!(symbol = %symbol, "open skipped: position already tracked");
            return;
        }
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight, &symbol) else {
            debug!(symbol = %symbol, "open skipped: operation in flight");
            return;
        };

        if !(reference_price.is_finite() && reference_price > 0.0) {
            self.fail(&symbol, "open", "no usable reference price");
            return;
        }

        let Some(filters) = self.filters.read().get(&symbol).copied() else {
            self.fail(&symbol, "open", "no exchange filters");
            return;
        };
        let leverage = self
            .effective_leverage
            .read()
            .get(&symbol)
            .copied()
            .unwrap_or(1);

        let raw_qty = self.sim_cfg.margin_usd * leverage as f64 / reference_price;
        let Some(qty) = normalize_qty(raw_qty, &filters) else {
            self.fail(
                &symbol,
                "open",
                format!("quantity {raw_qty:.8} below venue minimum"),
            );
            return;
        };

        let executed = match self.live_cfg.entry_mode {
            EntryMode::Market => self.market_entry(&symbol, side, qty, &filters).await,
            EntryMode::LimitGtx => self.gtx_entry(&symbol, side, qty, &filters).await,
        };

        match executed {
            Ok(filled_qty) if filled_qty > 0.0 => {
                self.active_positions.write().insert(
                    symbol.clone(),
                    ActiveRef {
                        side,
                        quantity: filled_qty,
                    },
                );
                self.note_action(format!(
                    "OPEN {side} {filled_qty} {symbol} ({})",
                    self.live_cfg.entry_mode
                ));
                *self.last_error.write() = None;
            }
            Ok(_) => {
                self.note_action(format!("OPEN {side} {symbol}: nothing filled"));
            }
            Err(e) => {
                self.fail(&symbol, "open", e.to_string());
            }
        }
    }

    async fn market_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        filters: &SymbolFilters,
    ) -> VenueResult<f64> {
        let qty_str = format_qty(qty, filters.step_size);
        let params = build_entry_params(symbol, side, &qty_str, self.is_hedge_mode());
        let resp = self.client.place_order(&params).await?;
        let (_, executed) = parse_order_status(&resp);
        // Market fills synchronously; fall back to the requested size when the
        // venue omits executedQty in the ack.
        Ok(if executed > 0.0 { executed } else { qty })
    }

    /// Post-only entry: gate on the observed spread, rest at the top of the
    /// book, poll until filled or timed out, cancel and optionally market the
    /// remainder.
    async fn gtx_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: f64,
        filters: &SymbolFilters,
    ) -> VenueResult<f64> {
        let book = self.client.book_ticker(symbol).await?;
        let bid = book_price(&book, "bidPrice")?;
        let ask = book_price(&book, "askPrice")?;
        let Some(spread) = spread_bps(bid, ask) else {
            return Err(VenueError::transport("degenerate top of book"));
        };

        let cap = self.live_cfg.spread_cap_bps(symbol);
        if spread > cap {
            return Err(VenueError::transport(format!(
                "spread {spread:.2} bps exceeds cap {cap:.2}"
            )));
        }

        let limit_price = match side {
            Side::Long => round_price_down_to_tick(bid, filters.tick_size),
            Side::Short => round_price_up_to_tick(ask, filters.tick_size),
        };
        let qty_str = format_qty(qty, filters.step_size);
        let price_str = format_price(limit_price, filters.tick_size);
        let params = build_gtx_params(symbol, side, &qty_str, &price_str, self.is_hedge_mode());

        let order = match self.client.place_order(&params).await {
            Ok(order) => order,
            Err(e) if (e.is_code(-5022) || e.is_code(-2010)) && self.live_cfg.gtx_fallback_market => {
                // Post-only would match immediately: take the market instead.
                info!(symbol, side = %side, "GTX rejected as immediate match — market fallback");
                return self.market_entry(symbol, side, qty, filters).await;
            }
            Err(e) => return Err(e),
        };

        let order_id = order.get("orderId").and_then(Value::as_i64).unwrap_or(0);
        let mut executed = parse_order_status(&order).1;
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.live_cfg.gtx_timeout_ms);

        loop {
            tokio::time::sleep(Duration::from_millis(self.live_cfg.gtx_poll_ms)).await;

            match self.client.query_order(symbol, order_id).await {
                Ok(status_body) => {
                    let (status, exec_qty) = parse_order_status(&status_body);
                    executed = exec_qty;
                    match status.as_str() {
                        "FILLED" => return Ok(executed),
                        "CANCELED" | "EXPIRED" | "REJECTED" => break,
                        _ => {}
                    }
                }
                Err(e) => warn!(symbol, order_id, error = %e, "GTX status poll failed"),
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(symbol, order_id, "GTX timed out — cancelling remainder");
                match self.client.cancel_order(symbol, order_id).await {
                    Ok(cancel_body) => executed = parse_order_status(&cancel_body).1.max(executed),
                    Err(e) => warn!(symbol, order_id, error = %e, "GTX cancel failed"),
                }
                break;
            }
        }

        let remainder = qty - executed;
        if remainder > 0.0 && self.live_cfg.gtx_fallback_market {
            if let Some(rem_qty) = normalize_qty(remainder, filters) {
                info!(symbol, remainder = rem_qty, "marketing unfilled GTX remainder");
                let filled = self.market_entry(symbol, side, rem_qty, filters).await?;
                return Ok(executed + filled);
            }
        }
        Ok(executed)
    }

    // -------------------------------------------------------------------------
    // Mirror close
    // -------------------------------------------------------------------------

    /// Mirror a simulator close with a reduce-only (or positionSide-matched)
    /// market order sized from the last-known active position.
    pub async fn mirror_close(&self, market_symbol: &str) {
        let symbol = market_symbol.to_uppercase();

        let Some(active) = self.active_positions.read().get(&symbol).copied() else {
            debug!(symbol = %symbol, "close skipped: no tracked position");
            return;
        };
        let Some(_guard) = InFlightGuard::try_acquire(&self.in_flight, &symbol) else {
            debug!(symbol = %symbol, "close skipped: operation in flight");
            return;
        };

        let Some(filters) = self.filters.read().get(&symbol).copied() else {
            self.fail(&symbol, "close", "no exchange filters");
            return;
        };
        let Some(qty) = normalize_qty(active.quantity, &filters) else {
            self.fail(&symbol, "close", "tracked quantity below venue minimum");
            return;
        };

        let qty_str = format_qty(qty, filters.step_size);
        let params = build_close_params(&symbol, active.side, &qty_str, self.is_hedge_mode());

        match self.client.place_order(&params).await {
            Ok(_) => {
                self.active_positions.write().remove(&symbol);
                self.note_action(format!("CLOSE {} {qty} {symbol}", active.side));
                *self.last_error.write() = None;
                self.reconcile_positions().await;
            }
            Err(e) => self.fail(&symbol, "close", e.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Refresh positions and income from the venue. Errors are recorded, never
    /// propagated: the next cycle retries.
    pub async fn sync_runtime(&self) {
        self.reconcile_positions().await;
        self.pull_income().await;
    }

    /// Wholesale rebuild of the position snapshot (and the locally tracked
    /// active set) from the venue's position risk feed.
    pub async fn reconcile_positions(&self) {
        let body = match self.client.position_risk().await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "position reconciliation failed");
                *self.last_error.write() = Some(format!("reconcile: {e}"));
                return;
            }
        };
        let Some(rows) = body.as_array() else {
            warn!("positionRisk response is not an array");
            return;
        };

        let hedge = self.is_hedge_mode();
        let mut snapshot: HashMap<String, LivePosition> = HashMap::new();
        let mut active: HashMap<String, ActiveRef> = HashMap::new();

        for row in rows {
            let Some(symbol) = row.get("symbol").and_then(Value::as_str) else {
                continue;
            };
            if !self.symbols.iter().any(|s| s == symbol) {
                continue;
            }
            let Some(mut position) = parse_position_row(row, hedge) else {
                continue;
            };
            // positionRisk omits marginType on some venues; fall back to what
            // bootstrap established.
            if position.margin_type == MarginMode::Unknown {
                if let Some(mode) = self.margin_mode.read().get(symbol) {
                    position.margin_type = *mode;
                }
            }
            active.insert(
                symbol.to_string(),
                ActiveRef {
                    side: position.side,
                    quantity: position.quantity,
                },
            );
            snapshot.insert(symbol.to_string(), position);
        }

        debug!(count = snapshot.len(), "positions reconciled");
        *self.positions.write() = snapshot;

        // Symbols with an order op in flight keep their local tracking; the
        // next reconciliation pass picks up the settled truth.
        let in_flight: Vec<String> = self.in_flight.lock().iter().cloned().collect();
        let mut tracked = self.active_positions.write();
        for symbol in &in_flight {
            match tracked.get(symbol) {
                Some(existing) => {
                    active.insert(symbol.clone(), *existing);
                }
                None => {
                    active.remove(symbol);
                }
            }
        }
        *tracked = active;
    }

    /// Pull the income ledger incrementally from the cursor.
    pub async fn pull_income(&self) {
        let cursor = self.income.lock().cursor_ts();
        let body = match self.client.income(cursor, INCOME_PAGE_LIMIT).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "income poll failed");
                *self.last_error.write() = Some(format!("income: {e}"));
                return;
            }
        };
        if let Some(rows) = body.as_array() {
            let applied = self.income.lock().apply_rows(rows);
            if applied > 0 {
                debug!(applied, "income rows applied");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots for the renderer
    // -------------------------------------------------------------------------

    pub fn position_for(&self, market_symbol: &str) -> Option<LivePosition> {
        self.positions
            .read()
            .get(&market_symbol.to_uppercase())
            .copied()
    }

    pub fn income_stats(&self) -> IncomeStats {
        self.income.lock().stats()
    }

    pub fn last_action(&self) -> Option<String> {
        self.last_action.read().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn is_hedge_mode(&self) -> bool {
        self.hedge_mode.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn note_action(&self, action: String) {
        info!(action = %action, "live action");
        *self.last_action.write() = Some(action);
    }

    fn fail(&self, symbol: &str, op: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(symbol, op, error = %message, "live operation failed");
        *self.last_error.write() = Some(format!("{symbol} {op}: {message}"));
        *self.last_action.write() = Some(format!("{op} {symbol} failed"));
    }
}

impl std::fmt::Debug for LiveTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTrader")
            .field("symbols", &self.symbols)
            .field("hedge_mode", &self.is_hedge_mode())
            .field("tracked_positions", &self.active_positions.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// One outstanding open/close per symbol. Releases on drop, including every
/// error path.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    key: String,
}

impl<'a> InFlightGuard<'a> {
    fn try_acquire(set: &'a Mutex<HashSet<String>>, key: &str) -> Option<Self> {
        if set.lock().insert(key.to_string()) {
            Some(Self {
                set,
                key: key.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Candidate leverages: target first, then the fallback ladder, each capped by
/// the bracket maximum and the hard ceiling, deduplicated in order.
pub fn leverage_candidates(target: u32, bracket_max: Option<u32>) -> Vec<u32> {
    let cap = bracket_max.unwrap_or(LEVERAGE_HARD_CAP).min(LEVERAGE_HARD_CAP).max(1);
    let mut out: Vec<u32> = Vec::with_capacity(1 + LEVERAGE_FALLBACKS.len());
    for candidate in std::iter::once(target.max(1)).chain(LEVERAGE_FALLBACKS) {
        let capped = candidate.min(cap);
        if out.last() != Some(&capped) {
            out.push(capped);
        }
    }
    out
}

/// Observed spread in basis points over the mid price.
pub fn spread_bps(bid: f64, ask: f64) -> Option<f64> {
    if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 || ask <= 0.0 || ask < bid {
        return None;
    }
    let mid = (bid + ask) / 2.0;
    Some((ask - bid) / mid * 10_000.0)
}

fn format_qty(qty: f64, step_size: f64) -> String {
    format!("{:.*}", decimals_for(step_size) as usize, qty)
}

fn format_price(price: f64, tick_size: f64) -> String {
    format!("{:.*}", decimals_for(tick_size) as usize, price)
}

fn build_entry_params(symbol: &str, side: Side, qty: &str, hedge: bool) -> String {
    let mut params = format!(
        "symbol={symbol}&side={}&type=MARKET&quantity={qty}",
        side.entry_order_side()
    );
    if hedge {
        params.push_str(&format!("&positionSide={}", side.position_side()));
    }
    params
}

fn build_gtx_params(symbol: &str, side: Side, qty: &str, price: &str, hedge: bool) -> String {
    let mut params = format!(
        "symbol={symbol}&side={}&type=LIMIT&timeInForce=GTX&quantity={qty}&price={price}",
        side.entry_order_side()
    );
    if hedge {
        params.push_str(&format!("&positionSide={}", side.position_side()));
    }
    params
}

fn build_close_params(symbol: &str, side: Side, qty: &str, hedge: bool) -> String {
    let mut params = format!(
        "symbol={symbol}&side={}&type=MARKET&quantity={qty}",
        side.close_order_side()
    );
    if hedge {
        params.push_str(&format!("&positionSide={}", side.position_side()));
    } else {
        params.push_str("&reduceOnly=true");
    }
    params
}

fn book_price(book: &Value, key: &str) -> VenueResult<f64> {
    book.get(key)
        .and_then(|v| match v {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| VenueError::transport(format!("bookTicker missing {key}")))
}

/// Extract (status, executedQty) from an order response.
fn parse_order_status(body: &Value) -> (String, f64) {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN")
        .to_string();
    let executed = body
        .get("executedQty")
        .and_then(|v| match v {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        })
        .unwrap_or(0.0);
    (status, executed)
}

/// Pull the max initial leverage from a leverageBracket response.
fn parse_bracket_max(body: &Value, symbol: &str) -> Option<u32> {
    // Response may be a bare array or a single object.
    let entries: Vec<&Value> = match body {
        Value::Array(arr) => arr.iter().collect(),
        obj => vec![obj],
    };
    let entry = entries
        .into_iter()
        .find(|e| e.get("symbol").and_then(Value::as_str) == Some(symbol))?;
    entry
        .get("brackets")?
        .as_array()?
        .iter()
        .filter_map(|b| b.get("initialLeverage").and_then(Value::as_u64))
        .max()
        .map(|v| v as u32)
}

/// Derive a position snapshot from one positionRisk row. Returns `None` for
/// flat rows.
fn parse_position_row(row: &Value, hedge: bool) -> Option<LivePosition> {
    let amt: f64 = row.get("positionAmt").and_then(str_or_num)?;
    if amt == 0.0 {
        return None;
    }

    let side = if hedge {
        match row.get("positionSide").and_then(Value::as_str) {
            Some("LONG") => Side::Long,
            Some("SHORT") => Side::Short,
            // BOTH rows in hedge mode fall back to the signed amount.
            _ => {
                if amt > 0.0 {
                    Side::Long
                } else {
                    Side::Short
                }
            }
        }
    } else if amt > 0.0 {
        Side::Long
    } else {
        Side::Short
    };

    let entry_price = row.get("entryPrice").and_then(str_or_num).unwrap_or(0.0);
    let mark_price = row.get("markPrice").and_then(str_or_num).unwrap_or(0.0);
    let unrealized = row
        .get("unRealizedProfit")
        .and_then(str_or_num)
        .unwrap_or(0.0);
    let leverage = row.get("leverage").and_then(str_or_num).unwrap_or(1.0);
    let notional = row
        .get("notional")
        .and_then(str_or_num)
        .map(f64::abs)
        .unwrap_or_else(|| (amt * mark_price).abs());

    let margin_type = match row.get("marginType").and_then(Value::as_str) {
        Some("isolated") => MarginMode::Isolated,
        Some("cross") => MarginMode::Cross,
        _ => MarginMode::Unknown,
    };
    let isolated_margin = row
        .get("isolatedMargin")
        .and_then(str_or_num)
        .unwrap_or(0.0);
    let margin_usd = if margin_type == MarginMode::Isolated && isolated_margin > 0.0 {
        isolated_margin
    } else if leverage > 0.0 {
        notional / leverage
    } else {
        notional
    };

    Some(LivePosition {
        side,
        quantity: amt.abs(),
        entry_price,
        mark_price,
        unrealized_pnl_usd: unrealized,
        notional_usd: notional,
        margin_usd,
        margin_type,
        leverage,
    })
}

fn str_or_num(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
