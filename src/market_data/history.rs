// =============================================================================
// Boot History Hydration — seed candle rings from the REST klines endpoint
// =============================================================================

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::market_data::event::Candle;

/// USD-M futures REST endpoint (public klines need no signature).
const FAPI_BASE: &str = "https://fapi.binance.com";

/// Fetch the last `limit` closed klines for one market symbol.
///
/// The response is an array of tuples:
/// `[openTime, open, high, low, close, volume, closeTime, ...]` with numeric
/// strings. Non-finite rows are dropped.
pub async fn fetch_history(
    client: &reqwest::Client,
    market_symbol: &str,
    interval: &str,
    limit: usize,
) -> Result<Vec<Candle>> {
    let url = format!(
        "{FAPI_BASE}/fapi/v1/klines?symbol={}&interval={}&limit={}",
        market_symbol.to_uppercase(),
        interval,
        limit
    );

    let resp = client
        .get(&url)
        .send()
        .await
        .context("GET /fapi/v1/klines request failed")?;

    let status = resp.status();
    let body: Value = resp.json().await.context("failed to parse klines response")?;

    if !status.is_success() {
        anyhow::bail!("klines returned {status}: {body}");
    }

    let candles = parse_history_rows(&body)?;
    debug!(
        symbol = %market_symbol,
        interval,
        count = candles.len(),
        "history hydrated"
    );
    Ok(candles)
}

/// Parse the tuple-array klines body into candles, oldest-first.
pub fn parse_history_rows(body: &Value) -> Result<Vec<Candle>> {
    let rows = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let arr = match row.as_array() {
            Some(arr) if arr.len() >= 7 => arr,
            _ => {
                warn!("skipping malformed kline row");
                continue;
            }
        };

        let candle = Candle {
            open_time: arr[0].as_i64().unwrap_or(0),
            open: coerce_f64(&arr[1]),
            high: coerce_f64(&arr[2]),
            low: coerce_f64(&arr[3]),
            close: coerce_f64(&arr[4]),
            volume: coerce_f64(&arr[5]),
            close_time: arr[6].as_i64().unwrap_or(0),
        };

        if candle.is_valid() {
            candles.push(candle);
        } else {
            warn!(open_time = candle.open_time, "dropping non-finite kline row");
        }
    }

    Ok(candles)
}

/// Coerce a string-or-number JSON value; anything else becomes NaN and the
/// row is dropped by the validity check.
fn coerce_f64(val: &Value) -> f64 {
    match val {
        Value::String(s) => s.parse::<f64>().unwrap_or(f64::NAN),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}
