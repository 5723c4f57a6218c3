// =============================================================================
// Venue Normalization — LOT_SIZE / PRICE_FILTER aware rounding
// =============================================================================
//
// Quantities floor to the step size (never send more than sized for) and
// prices round toward the passive side of the book (down for longs, up for
// shorts). Rounding is re-anchored to the filter's decimal count so binary
// float noise never leaks into order parameters.
// =============================================================================

use serde_json::Value;
use tracing::warn;

/// Per-symbol order constraints from exchangeInfo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolFilters {
    pub min_qty: f64,
    pub step_size: f64,
    pub tick_size: f64,
}

/// Extract LOT_SIZE / PRICE_FILTER values from one exchangeInfo symbol entry.
pub fn parse_filters(symbol_entry: &Value) -> Option<SymbolFilters> {
    let filters = symbol_entry.get("filters")?.as_array()?;

    let mut min_qty = None;
    let mut step_size = None;
    let mut tick_size = None;

    for filter in filters {
        match filter.get("filterType").and_then(Value::as_str) {
            Some("LOT_SIZE") => {
                min_qty = str_f64(filter.get("minQty")?);
                step_size = str_f64(filter.get("stepSize")?);
            }
            Some("PRICE_FILTER") => {
                tick_size = str_f64(filter.get("tickSize")?);
            }
            _ => {}
        }
    }

    match (min_qty, step_size, tick_size) {
        (Some(min_qty), Some(step_size), Some(tick_size))
            if step_size > 0.0 && tick_size > 0.0 =>
        {
            Some(SymbolFilters {
                min_qty,
                step_size,
                tick_size,
            })
        }
        _ => {
            warn!("exchangeInfo entry missing LOT_SIZE/PRICE_FILTER");
            None
        }
    }
}

fn str_f64(val: &Value) -> Option<f64> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Decimal places implied by a step/tick size (e.g. 0.001 -> 3).
pub fn decimals_for(step: f64) -> u32 {
    let text = format!("{step:.8}");
    let trimmed = text.trim_end_matches('0');
    match trimmed.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    }
}

fn round_to_dp(value: f64, dp: u32) -> f64 {
    let factor = 10f64.powi(dp as i32);
    (value * factor).round() / factor
}

/// Tolerance (in grid units) under which a ratio is treated as already on
/// the grid, absorbing binary float noise like `0.3 / 0.1 = 2.99..96`.
const GRID_SNAP: f64 = 1e-6;

fn grid_floor(ratio: f64) -> f64 {
    let nearest = ratio.round();
    if (ratio - nearest).abs() < GRID_SNAP {
        nearest
    } else {
        ratio.floor()
    }
}

fn grid_ceil(ratio: f64) -> f64 {
    let nearest = ratio.round();
    if (ratio - nearest).abs() < GRID_SNAP {
        nearest
    } else {
        ratio.ceil()
    }
}

/// Floor a raw quantity to the lot step. Returns `None` when the result would
/// violate the minimum quantity (or the input is unusable).
pub fn normalize_qty(raw: f64, filters: &SymbolFilters) -> Option<f64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    let steps = grid_floor(raw / filters.step_size);
    let qty = round_to_dp(steps * filters.step_size, decimals_for(filters.step_size));
    if !qty.is_finite() || qty <= 0.0 || qty < filters.min_qty {
        return None;
    }
    Some(qty)
}

/// Round a price down to the tick grid (passive side for a long entry).
pub fn round_price_down_to_tick(price: f64, tick_size: f64) -> f64 {
    let ticks = grid_floor(price / tick_size);
    round_to_dp(ticks * tick_size, decimals_for(tick_size))
}

/// Round a price up to the tick grid (passive side for a short entry).
pub fn round_price_up_to_tick(price: f64, tick_size: f64) -> f64 {
    let ticks = grid_ceil(price / tick_size);
    round_to_dp(ticks * tick_size, decimals_for(tick_size))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filters(min_qty: f64, step_size: f64, tick_size: f64) -> SymbolFilters {
        SymbolFilters {
            min_qty,
            step_size,
            tick_size,
        }
    }

    #[test]
    fn qty_floors_to_step() {
        let f = filters(0.001, 0.001, 0.1);
        assert_eq!(normalize_qty(1.9905, &f), Some(1.990));
        assert_eq!(normalize_qty(0.0019, &f), Some(0.001));
    }

    #[test]
    fn qty_on_step_grid_within_tolerance() {
        let f = filters(0.001, 0.001, 0.1);
        for raw in [0.0034, 1.23456, 199.0049, 0.3] {
            let qty = normalize_qty(raw, &f).unwrap();
            let rem = (qty / f.step_size) - (qty / f.step_size).round();
            assert!(rem.abs() < 1e-6, "qty {qty} off the step grid (rem {rem})");
            assert!(qty >= f.min_qty);
            assert!(qty <= raw + 1e-12);
        }
    }

    #[test]
    fn qty_below_minimum_rejected() {
        let f = filters(0.01, 0.001, 0.1);
        assert_eq!(normalize_qty(0.005, &f), None);
        assert_eq!(normalize_qty(0.0, &f), None);
        assert_eq!(normalize_qty(f64::NAN, &f), None);
        assert_eq!(normalize_qty(-1.0, &f), None);
    }

    #[test]
    fn binary_noise_does_not_drop_a_step() {
        let f = filters(0.1, 0.1, 0.1);
        // 0.3 / 0.1 is 2.9999999999999996 in binary floats.
        assert_eq!(normalize_qty(0.3, &f), Some(0.3));
    }

    #[test]
    fn price_rounds_toward_passive_side() {
        assert!((round_price_down_to_tick(100.456, 0.01) - 100.45).abs() < 1e-12);
        assert!((round_price_up_to_tick(100.451, 0.01) - 100.46).abs() < 1e-12);
        // Exactly on the grid stays put in both directions.
        assert!((round_price_down_to_tick(100.45, 0.01) - 100.45).abs() < 1e-12);
        assert!((round_price_up_to_tick(100.45, 0.01) - 100.45).abs() < 1e-12);
    }

    #[test]
    fn decimals_from_step() {
        assert_eq!(decimals_for(1.0), 0);
        assert_eq!(decimals_for(0.1), 1);
        assert_eq!(decimals_for(0.001), 3);
        assert_eq!(decimals_for(0.00000001), 8);
    }

    #[test]
    fn parses_exchange_info_entry() {
        let entry = json!({
            "symbol": "BTCUSDT",
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000" },
                { "filterType": "MARKET_LOT_SIZE", "stepSize": "0.001" }
            ]
        });
        let f = parse_filters(&entry).unwrap();
        assert!((f.min_qty - 0.001).abs() < 1e-12);
        assert!((f.step_size - 0.001).abs() < 1e-12);
        assert!((f.tick_size - 0.1).abs() < 1e-12);
    }

    #[test]
    fn missing_filters_rejected() {
        let entry = json!({ "symbol": "BTCUSDT", "filters": [] });
        assert_eq!(parse_filters(&entry), None);
    }
}
