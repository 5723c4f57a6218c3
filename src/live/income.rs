// =============================================================================
// Income Ledger — incremental venue income aggregation with dedupe
// =============================================================================
//
// The income endpoint is polled from a cursor timestamp. The venue may replay
// rows around the cursor, so every row is keyed by
// (tranId, symbol, incomeType, time, income) and applied at most once. The
// cursor then advances to max(time) + 1.
// =============================================================================

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

/// Monotonic accumulators over the venue income ledger.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IncomeStats {
    pub realized_pnl_usd: f64,
    pub commission_usd: f64,
    pub funding_usd: f64,
    pub net_usd: f64,
    pub events: u64,
}

/// Incremental income state for the whole account.
#[derive(Debug, Default)]
pub struct IncomeLedger {
    seen: HashSet<String>,
    cursor_ts: i64,
    stats: IncomeStats,
}

impl IncomeLedger {
    pub fn new(start_ts: i64) -> Self {
        Self {
            seen: HashSet::new(),
            cursor_ts: start_ts,
            stats: IncomeStats::default(),
        }
    }

    /// Cursor to use as `startTime` on the next poll.
    pub fn cursor_ts(&self) -> i64 {
        self.cursor_ts
    }

    pub fn stats(&self) -> IncomeStats {
        self.stats
    }

    /// Apply one page of income rows. Returns the number of rows that were
    /// new; replayed rows never change the stats.
    pub fn apply_rows(&mut self, rows: &[Value]) -> usize {
        let mut applied = 0usize;
        let mut max_ts = self.cursor_ts - 1;

        for row in rows {
            let Some((key, ts, amount, income_type)) = parse_row(row) else {
                debug!("skipping malformed income row");
                continue;
            };
            max_ts = max_ts.max(ts);

            if !self.seen.insert(key) {
                continue;
            }

            match income_type.as_str() {
                "REALIZED_PNL" => self.stats.realized_pnl_usd += amount,
                "COMMISSION" => self.stats.commission_usd += amount,
                "FUNDING_FEE" => self.stats.funding_usd += amount,
                _ => {}
            }
            self.stats.net_usd += amount;
            self.stats.events += 1;
            applied += 1;
        }

        if max_ts >= self.cursor_ts {
            self.cursor_ts = max_ts + 1;
        }
        applied
    }
}

/// Extract (dedupe key, timestamp, amount, incomeType) from a ledger row.
fn parse_row(row: &Value) -> Option<(String, i64, f64, String)> {
    let tran_id = row.get("tranId").and_then(Value::as_i64).unwrap_or(0);
    let symbol = row.get("symbol").and_then(Value::as_str).unwrap_or("");
    let income_type = row.get("incomeType").and_then(Value::as_str)?.to_string();
    let ts = row.get("time").and_then(Value::as_i64)?;
    let income_raw = match row.get("income")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let amount: f64 = income_raw.parse().ok()?;
    if !amount.is_finite() {
        return None;
    }

    let key = format!("{tran_id}|{symbol}|{income_type}|{ts}|{income_raw}");
    Some((key, ts, amount, income_type))
}
