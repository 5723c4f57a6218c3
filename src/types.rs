// =============================================================================
// Shared types used across the Borealis perp engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a simulated or live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side string the venue expects for an entry in this direction.
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Self::Long => "BUY",
            Self::Short => "SELL",
        }
    }

    /// Order side string the venue expects for a close in this direction.
    pub fn close_order_side(&self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }

    /// Hedge-mode positionSide parameter value.
    pub fn position_side(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// How live entries are submitted to the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    /// Single market order.
    Market,
    /// Post-only limit at top of book, with polling and optional market
    /// fallback for the unfilled remainder.
    LimitGtx,
}

impl Default for EntryMode {
    fn default() -> Self {
        Self::Market
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::LimitGtx => write!(f, "LIMIT_GTX"),
        }
    }
}

/// Margin mode the venue reports (or that we failed to establish).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
    Cross,
    Unknown,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "ISOLATED"),
            Self::Cross => write!(f, "CROSS"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Why a simulated trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// ROI fell through the stop-loss threshold.
    SlRoi,
    /// Trailing drawdown from the peak after arming.
    TrailRoi,
    /// Net profit fell back to the minimum after the peak had cleared it.
    LockProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SlRoi => write!(f, "SL_ROI"),
            Self::TrailRoi => write!(f, "TRAIL_ROI"),
            Self::LockProfit => write!(f, "LOCK_PROFIT"),
        }
    }
}
