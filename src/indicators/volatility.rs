// =============================================================================
// Volatility measures — candle range percentage and return dispersion
// =============================================================================

use crate::market_data::Candle;

/// Mean of `|high - low| / close * 100` over the last `n` candles.
///
/// Returns `None` on empty input, `n == 0`, or when every candle in the
/// window has a zero/non-finite close.
pub fn mean_range_pct(candles: &[Candle], n: usize) -> Option<f64> {
    if n == 0 || candles.is_empty() {
        return None;
    }
    let start = candles.len().saturating_sub(n);
    let mut sum = 0.0;
    let mut count = 0usize;
    for candle in &candles[start..] {
        if candle.close != 0.0 && candle.close.is_finite() {
            let range_pct = (candle.high - candle.low).abs() / candle.close * 100.0;
            if range_pct.is_finite() {
                sum += range_pct;
                count += 1;
            }
        }
    }
    if count == 0 {
        return None;
    }
    Some(sum / count as f64)
}

/// Percentage returns over consecutive closes.
pub fn close_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter_map(|pair| {
            let (prev, next) = (pair[0], pair[1]);
            if prev != 0.0 && prev.is_finite() && next.is_finite() {
                Some((next - prev) / prev)
            } else {
                None
            }
        })
        .collect()
}

/// Population standard deviation. `None` on empty input.
pub fn stddev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = variance.sqrt();
    if sd.is_finite() {
        Some(sd)
    } else {
        None
    }
}
