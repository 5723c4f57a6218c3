// =============================================================================
// Feed Decoder — multiplexed stream frames to tagged market events
// =============================================================================
//
// One frame in, zero or one event out. The combined stream wraps payloads in
// a `{stream, data}` envelope; single-stream payloads arrive bare. Both are
// accepted. Venue error envelopes (`{code, msg}`) surface as a typed error so
// the supervisor can log the code. Unknown event discriminators and events
// with non-finite numerics are dropped silently.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A single OHLCV candle on the decision interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    /// A candle is usable only when its numerics are finite and its close
    /// time is after its open time.
    pub fn is_valid(&self) -> bool {
        self.close_time > self.open_time
            && self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
    }
}

/// Decoded market event, keyed by lowercase market symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Trade {
        symbol: String,
        price: f64,
        qty: f64,
        ts: i64,
        buyer_is_maker: bool,
    },
    Mark {
        symbol: String,
        price: f64,
        ts: i64,
    },
    Kline {
        symbol: String,
        candle: Candle,
        closed: bool,
    },
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Trade { symbol, .. } | Self::Mark { symbol, .. } | Self::Kline { symbol, .. } => {
                symbol
            }
        }
    }
}

/// Decode failure for a single frame.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed feed payload: {0}")]
    Malformed(String),
    #[error("venue error {code}: {msg}")]
    Venue { code: i64, msg: String },
}

/// Decode one raw frame (text or binary) into at most one event.
///
/// Returns `Ok(None)` for unknown discriminators and for events carrying
/// non-finite numerics.
pub fn parse_frame(bytes: &[u8]) -> Result<Option<MarketEvent>, DecodeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| DecodeError::Malformed("frame is not valid UTF-8".to_string()))?;
    parse_market_event(text)
}

/// Decode one text frame into at most one event.
pub fn parse_market_event(text: &str) -> Result<Option<MarketEvent>, DecodeError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| DecodeError::Malformed(format!("invalid JSON: {e}")))?;

    // Server-side error envelope.
    if let (Some(code), Some(msg)) = (root.get("code").and_then(Value::as_i64), root.get("msg")) {
        return Err(DecodeError::Venue {
            code,
            msg: msg.as_str().unwrap_or_default().to_string(),
        });
    }

    // Combined-stream envelope or bare payload.
    let payload = root.get("data").unwrap_or(&root);

    let event_type = match payload.get("e").and_then(Value::as_str) {
        Some(e) => e,
        None => return Ok(None),
    };

    let symbol = payload
        .get("s")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing field s".to_string()))?
        .to_lowercase();

    match event_type {
        "trade" | "aggTrade" => {
            let price = num_field(payload, "p")?;
            let qty = num_field(payload, "q")?;
            let ts = payload
                .get("T")
                .and_then(Value::as_i64)
                .or_else(|| payload.get("E").and_then(Value::as_i64))
                .ok_or_else(|| DecodeError::Malformed("missing field T".to_string()))?;
            let buyer_is_maker = payload
                .get("m")
                .and_then(Value::as_bool)
                .ok_or_else(|| DecodeError::Malformed("missing field m".to_string()))?;

            if !price.is_finite() || !qty.is_finite() {
                return Ok(None);
            }
            Ok(Some(MarketEvent::Trade {
                symbol,
                price,
                qty,
                ts,
                buyer_is_maker,
            }))
        }
        "markPriceUpdate" => {
            let price = num_field(payload, "p")?;
            let ts = payload
                .get("E")
                .and_then(Value::as_i64)
                .ok_or_else(|| DecodeError::Malformed("missing field E".to_string()))?;
            if !price.is_finite() {
                return Ok(None);
            }
            Ok(Some(MarketEvent::Mark { symbol, price, ts }))
        }
        "kline" => {
            let k = payload
                .get("k")
                .ok_or_else(|| DecodeError::Malformed("missing field k".to_string()))?;
            let candle = Candle {
                open_time: k
                    .get("t")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| DecodeError::Malformed("missing field k.t".to_string()))?,
                open: num_field(k, "o")?,
                high: num_field(k, "h")?,
                low: num_field(k, "l")?,
                close: num_field(k, "c")?,
                volume: num_field(k, "v")?,
                close_time: k
                    .get("T")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| DecodeError::Malformed("missing field k.T".to_string()))?,
            };
            let closed = k
                .get("x")
                .and_then(Value::as_bool)
                .ok_or_else(|| DecodeError::Malformed("missing field k.x".to_string()))?;

            if !candle.is_valid() {
                return Ok(None);
            }
            Ok(Some(MarketEvent::Kline {
                symbol,
                candle,
                closed,
            }))
        }
        _ => Ok(None),
    }
}

/// Numeric field that may arrive as a JSON string or number.
fn num_field(obj: &Value, key: &str) -> Result<f64, DecodeError> {
    let val = obj
        .get(key)
        .ok_or_else(|| DecodeError::Malformed(format!("missing field {key}")))?;
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| DecodeError::Malformed(format!("field {key} is not numeric: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| DecodeError::Malformed(format!("field {key} is not an f64"))),
        _ => Err(DecodeError::Malformed(format!(
            "field {key} has unexpected JSON type"
        ))),
    }
}
