// =============================================================================
// Engine Configuration — env-var driven, immutable after boot
// =============================================================================
//
// Every tunable lives here. `EngineConfig::from_env()` reads the process
// environment once at startup; malformed values fall back to the default with
// a warning rather than aborting the engine.
// =============================================================================

use std::collections::HashMap;

use tracing::warn;

use crate::types::EntryMode;

// =============================================================================
// Symbol universe
// =============================================================================

/// One entry of the configured symbol universe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSpec {
    /// Display symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// Market (stream/order) symbol, usually identical to `symbol` unless
    /// overridden via `MARKET_SYMBOL_OVERRIDES`.
    pub market: String,
}

impl SymbolSpec {
    /// Lowercase market symbol — the key used on the multiplexed stream.
    pub fn market_lower(&self) -> String {
        self.market.to_lowercase()
    }
}

// =============================================================================
// Sub-configs
// =============================================================================

/// Risk parameters for the simulated trade state machine. The `*_min/max`
/// pairs are interpolated against the plan's trigger percentage at open time.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub margin_usd: f64,
    pub leverage: f64,
    pub sl_roi_min_pct: f64,
    pub sl_roi_max_pct: f64,
    pub trail_activate_roi_min_pct: f64,
    pub trail_activate_roi_max_pct: f64,
    pub trail_dd_roi_min_pct: f64,
    pub trail_dd_roi_max_pct: f64,
    pub min_net_profit_usd: f64,
    pub fee_rate_pct: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            margin_usd: 10.0,
            leverage: 20.0,
            sl_roi_min_pct: 8.0,
            sl_roi_max_pct: 15.0,
            trail_activate_roi_min_pct: 10.0,
            trail_activate_roi_max_pct: 20.0,
            trail_dd_roi_min_pct: 3.0,
            trail_dd_roi_max_pct: 7.0,
            min_net_profit_usd: 0.2,
            fee_rate_pct: 0.05,
        }
    }
}

/// Live-exchange mirroring configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub enabled: bool,
    pub testnet: bool,
    pub force_isolated: bool,
    pub entry_mode: EntryMode,
    pub gtx_timeout_ms: u64,
    pub gtx_poll_ms: u64,
    pub gtx_fallback_market: bool,
    pub spread_max_bps_default: f64,
    /// Per-market-symbol spread caps (uppercase market symbol -> bps).
    pub spread_max_bps: HashMap<String, f64>,
    pub api_key: String,
    pub api_secret: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            testnet: false,
            force_isolated: true,
            entry_mode: EntryMode::Market,
            gtx_timeout_ms: 4000,
            gtx_poll_ms: 250,
            gtx_fallback_market: true,
            spread_max_bps_default: 6.0,
            spread_max_bps: HashMap::new(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl LiveConfig {
    /// Spread cap for a market symbol, falling back to the default.
    pub fn spread_cap_bps(&self, market_symbol: &str) -> f64 {
        self.spread_max_bps
            .get(&market_symbol.to_uppercase())
            .copied()
            .unwrap_or(self.spread_max_bps_default)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration, parsed from the environment at boot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<SymbolSpec>,

    // Cadence
    pub render_interval_ms: u64,
    pub ws_ping_interval_ms: u64,
    pub ws_stale_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    // Candles
    pub history_candles: usize,
    pub history_interval: String,
    /// Milliseconds between two decision-interval candle closes. Derived from
    /// `history_interval`.
    pub cycle_ms: i64,
    pub decision_window_ms: i64,

    // Flow
    pub flow_lookback_ms: i64,
    pub flow_min_samples: usize,
    pub flow_confirm_threshold: f64,

    // Trigger clamp bounds applied by the planner
    pub trigger_min_pct: f64,
    pub trigger_max_pct: f64,

    pub sim: SimConfig,
    pub live: LiveConfig,

    /// Bind address of the renderer REST API.
    pub bind_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            render_interval_ms: 1000,
            ws_ping_interval_ms: 15_000,
            ws_stale_timeout_ms: 45_000,
            reconnect_base_ms: 1000,
            reconnect_max_ms: 15_000,
            history_candles: 72,
            history_interval: "5m".to_string(),
            cycle_ms: 300_000,
            decision_window_ms: 300_000,
            flow_lookback_ms: 60_000,
            flow_min_samples: 20,
            flow_confirm_threshold: 0.08,
            trigger_min_pct: 0.05,
            trigger_max_pct: 1.2,
            sim: SimConfig::default(),
            live: LiveConfig::default(),
            bind_addr: "0.0.0.0:3001".to_string(),
        }
    }
}

fn default_symbols() -> Vec<SymbolSpec> {
    ["BTCUSDT", "ETHUSDT", "BNBUSDT", "XRPUSDT", "SOLUSDT"]
        .iter()
        .map(|s| SymbolSpec {
            symbol: s.to_string(),
            market: s.to_string(),
        })
        .collect()
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (tests inject a map here).
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(raw) = get("SYMBOLS") {
            let overrides = get("MARKET_SYMBOL_OVERRIDES")
                .map(|s| parse_pair_list(&s))
                .unwrap_or_default();
            let symbols = parse_symbols(&raw, &overrides);
            if !symbols.is_empty() {
                cfg.symbols = symbols;
            }
        } else if let Some(raw) = get("MARKET_SYMBOL_OVERRIDES") {
            let overrides = parse_pair_list(&raw);
            for spec in &mut cfg.symbols {
                if let Some(market) = overrides.get(&spec.symbol) {
                    spec.market = market.clone();
                }
            }
        }

        parse_into(&get, "RENDER_INTERVAL_MS", &mut cfg.render_interval_ms);
        parse_into(&get, "WS_PING_INTERVAL_MS", &mut cfg.ws_ping_interval_ms);
        parse_into(&get, "WS_STALE_TIMEOUT_MS", &mut cfg.ws_stale_timeout_ms);
        parse_into(&get, "RECONNECT_BASE_MS", &mut cfg.reconnect_base_ms);
        parse_into(&get, "RECONNECT_MAX_MS", &mut cfg.reconnect_max_ms);

        parse_into(&get, "HISTORY_CANDLES", &mut cfg.history_candles);
        if let Some(interval) = get("HISTORY_INTERVAL") {
            match interval_to_ms(&interval) {
                Some(ms) => {
                    cfg.history_interval = interval;
                    cfg.cycle_ms = ms;
                }
                None => warn!(interval = %interval, "unknown HISTORY_INTERVAL — keeping default"),
            }
        }
        parse_into(&get, "DECISION_WINDOW_MS", &mut cfg.decision_window_ms);

        parse_into(&get, "FLOW_LOOKBACK_MS", &mut cfg.flow_lookback_ms);
        parse_into(&get, "FLOW_MIN_SAMPLES", &mut cfg.flow_min_samples);
        parse_into(&get, "FLOW_CONFIRM_THRESHOLD", &mut cfg.flow_confirm_threshold);

        parse_into(&get, "TRIGGER_MIN_PCT", &mut cfg.trigger_min_pct);
        parse_into(&get, "TRIGGER_MAX_PCT", &mut cfg.trigger_max_pct);

        parse_into(&get, "SIM_MARGIN_USD", &mut cfg.sim.margin_usd);
        parse_into(&get, "SIM_LEVERAGE", &mut cfg.sim.leverage);
        parse_into(&get, "SIM_SL_ROI_MIN_PCT", &mut cfg.sim.sl_roi_min_pct);
        parse_into(&get, "SIM_SL_ROI_MAX_PCT", &mut cfg.sim.sl_roi_max_pct);
        parse_into(
            &get,
            "SIM_TRAIL_ACTIVATE_ROI_MIN_PCT",
            &mut cfg.sim.trail_activate_roi_min_pct,
        );
        parse_into(
            &get,
            "SIM_TRAIL_ACTIVATE_ROI_MAX_PCT",
            &mut cfg.sim.trail_activate_roi_max_pct,
        );
        parse_into(&get, "SIM_TRAIL_DD_ROI_MIN_PCT", &mut cfg.sim.trail_dd_roi_min_pct);
        parse_into(&get, "SIM_TRAIL_DD_ROI_MAX_PCT", &mut cfg.sim.trail_dd_roi_max_pct);
        parse_into(&get, "SIM_MIN_NET_PROFIT_USD", &mut cfg.sim.min_net_profit_usd);
        parse_into(&get, "SIM_FEE_RATE_PCT", &mut cfg.sim.fee_rate_pct);

        if let Some(v) = get("LIVE_TRADING_ENABLE") {
            cfg.live.enabled = parse_bool(&v);
        }
        if let Some(v) = get("LIVE_TRADING_TESTNET") {
            cfg.live.testnet = parse_bool(&v);
        }
        if let Some(v) = get("LIVE_TRADING_FORCE_ISOLATED") {
            cfg.live.force_isolated = parse_bool(&v);
        }
        if let Some(v) = get("LIVE_ENTRY_MODE") {
            match v.trim().to_uppercase().as_str() {
                "MARKET" => cfg.live.entry_mode = EntryMode::Market,
                "LIMIT_GTX" => cfg.live.entry_mode = EntryMode::LimitGtx,
                other => warn!(mode = other, "unknown LIVE_ENTRY_MODE — keeping default"),
            }
        }
        parse_into(&get, "LIVE_GTX_TIMEOUT_MS", &mut cfg.live.gtx_timeout_ms);
        parse_into(&get, "LIVE_GTX_POLL_MS", &mut cfg.live.gtx_poll_ms);
        if let Some(v) = get("LIVE_GTX_FALLBACK_MARKET") {
            cfg.live.gtx_fallback_market = parse_bool(&v);
        }
        parse_into(
            &get,
            "LIVE_SPREAD_MAX_BPS_DEFAULT",
            &mut cfg.live.spread_max_bps_default,
        );
        // Per-symbol caps live in discrete LIVE_SPREAD_MAX_BPS_<SYMBOL> vars,
        // keyed off the configured display symbol; the cap is stored under the
        // market symbol the order path looks up.
        for spec in &cfg.symbols {
            let key = format!("LIVE_SPREAD_MAX_BPS_{}", spec.symbol);
            if let Some(raw) = get(&key) {
                match raw.trim().parse::<f64>() {
                    Ok(bps) if bps.is_finite() && bps > 0.0 => {
                        cfg.live.spread_max_bps.insert(spec.market.to_uppercase(), bps);
                    }
                    _ => warn!(key = %key, value = %raw, "bad spread cap — ignored"),
                }
            }
        }
        if let Some(v) = get("BINANCE_API_KEY") {
            cfg.live.api_key = v;
        }
        if let Some(v) = get("BINANCE_API_SECRET") {
            cfg.live.api_secret = v;
        }

        if let Some(v) = get("BIND_ADDR") {
            cfg.bind_addr = v;
        }

        cfg
    }
}

// =============================================================================
// Parse helpers
// =============================================================================

/// Parse an env value into `target`, leaving the default in place (with a
/// warning) when the value is malformed.
fn parse_into<F, T>(get: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *target = v,
            Err(_) => warn!(key, value = %raw, "malformed config value — keeping default"),
        }
    }
}

/// Truthy strings: "1", "true", "yes", "on" (case-insensitive).
pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Parse a comma-separated `KEY=VALUE` list into a map (keys uppercased).
fn parse_pair_list(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            let k = k.trim().to_uppercase();
            let v = v.trim().to_string();
            if k.is_empty() || v.is_empty() {
                None
            } else {
                Some((k, v))
            }
        })
        .collect()
}

/// Parse the `SYMBOLS` list, applying market-symbol overrides.
fn parse_symbols(raw: &str, overrides: &HashMap<String, String>) -> Vec<SymbolSpec> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .map(|symbol| {
            let market = overrides.get(&symbol).cloned().unwrap_or_else(|| symbol.clone());
            SymbolSpec { symbol, market }
        })
        .collect()
}

/// Translate a kline interval string into its length in milliseconds.
pub fn interval_to_ms(interval: &str) -> Option<i64> {
    let ms = match interval {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "2h" => 7_200_000,
        "4h" => 14_400_000,
        _ => return None,
    };
    Some(ms)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.render_interval_ms, 1000);
        assert_eq!(cfg.ws_ping_interval_ms, 15_000);
        assert_eq!(cfg.ws_stale_timeout_ms, 45_000);
        assert_eq!(cfg.history_candles, 72);
        assert_eq!(cfg.history_interval, "5m");
        assert_eq!(cfg.cycle_ms, 300_000);
        assert_eq!(cfg.decision_window_ms, 300_000);
        assert_eq!(cfg.flow_lookback_ms, 60_000);
        assert_eq!(cfg.flow_min_samples, 20);
        assert!((cfg.flow_confirm_threshold - 0.08).abs() < f64::EPSILON);
        assert!((cfg.trigger_min_pct - 0.05).abs() < f64::EPSILON);
        assert!((cfg.trigger_max_pct - 1.2).abs() < f64::EPSILON);
        assert!((cfg.sim.margin_usd - 10.0).abs() < f64::EPSILON);
        assert!((cfg.sim.leverage - 20.0).abs() < f64::EPSILON);
        assert!(!cfg.live.enabled);
        assert_eq!(cfg.live.entry_mode, EntryMode::Market);
        assert_eq!(cfg.symbols.len(), 5);
    }

    #[test]
    fn symbols_and_overrides() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SYMBOLS", "btcusdt, ethusdt,"),
            ("MARKET_SYMBOL_OVERRIDES", "ETHUSDT=ETHUSDC"),
        ]));
        assert_eq!(cfg.symbols.len(), 2);
        assert_eq!(cfg.symbols[0].symbol, "BTCUSDT");
        assert_eq!(cfg.symbols[0].market, "BTCUSDT");
        assert_eq!(cfg.symbols[1].symbol, "ETHUSDT");
        assert_eq!(cfg.symbols[1].market, "ETHUSDC");
        assert_eq!(cfg.symbols[1].market_lower(), "ethusdc");
    }

    #[test]
    fn malformed_numeric_keeps_default() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("RENDER_INTERVAL_MS", "not-a-number"),
            ("SIM_LEVERAGE", "25"),
        ]));
        assert_eq!(cfg.render_interval_ms, 1000);
        assert!((cfg.sim.leverage - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn interval_derives_cycle_ms() {
        let cfg = EngineConfig::from_lookup(lookup(&[("HISTORY_INTERVAL", "15m")]));
        assert_eq!(cfg.history_interval, "15m");
        assert_eq!(cfg.cycle_ms, 900_000);

        let cfg = EngineConfig::from_lookup(lookup(&[("HISTORY_INTERVAL", "7x")]));
        assert_eq!(cfg.history_interval, "5m");
        assert_eq!(cfg.cycle_ms, 300_000);
    }

    #[test]
    fn live_flags_and_entry_mode() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("LIVE_TRADING_ENABLE", "true"),
            ("LIVE_TRADING_TESTNET", "1"),
            ("LIVE_ENTRY_MODE", "limit_gtx"),
            ("LIVE_SPREAD_MAX_BPS_BTCUSDT", "3.5"),
            ("LIVE_SPREAD_MAX_BPS_ETHUSDT", "junk"),
        ]));
        assert!(cfg.live.enabled);
        assert!(cfg.live.testnet);
        assert_eq!(cfg.live.entry_mode, EntryMode::LimitGtx);
        assert!((cfg.live.spread_cap_bps("btcusdt") - 3.5).abs() < f64::EPSILON);
        // Malformed or absent per-symbol caps fall back to the default.
        assert!(
            (cfg.live.spread_cap_bps("ETHUSDT") - cfg.live.spread_max_bps_default).abs()
                < f64::EPSILON
        );
        assert!(
            (cfg.live.spread_cap_bps("SOLUSDT") - cfg.live.spread_max_bps_default).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn spread_cap_follows_market_symbol_override() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("SYMBOLS", "ETHUSDT"),
            ("MARKET_SYMBOL_OVERRIDES", "ETHUSDT=ETHUSDC"),
            ("LIVE_SPREAD_MAX_BPS_ETHUSDT", "4.0"),
        ]));
        // The cap is keyed by the market symbol the order path uses.
        assert!((cfg.live.spread_cap_bps("ethusdc") - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
        assert!(!parse_bool(""));
    }
}
