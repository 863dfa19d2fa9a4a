use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Timeframe;

/// Signal kinds produced by the signal engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// RSI crossed above the entry threshold
    RsiCrossUp,
    /// RSI crossed below the entry threshold
    RsiCrossDown,
    /// Weekly RSI closed above the risk-off threshold
    WeeklyRsiHigh,
    /// Daily close set a new 52-week high
    Price52wHigh,
    /// Daily close set a new all-time high
    AllTimeHigh,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::RsiCrossUp => write!(f, "RSI_CROSS_UP"),
            SignalKind::RsiCrossDown => write!(f, "RSI_CROSS_DOWN"),
            SignalKind::WeeklyRsiHigh => write!(f, "WEEKLY_RSI_HIGH"),
            SignalKind::Price52wHigh => write!(f, "PRICE_52W_HIGH"),
            SignalKind::AllTimeHigh => write!(f, "ALL_TIME_HIGH"),
        }
    }
}

/// An edge-triggered signal, consumed exactly once by the decision pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub kind: SignalKind,
    /// RSI value or price, depending on kind
    pub value: Decimal,
    /// Close time of the bar that produced the signal
    pub timestamp: DateTime<Utc>,
    /// The signal is tradable from the open of the bar following the
    /// crossing bar, never on the crossing bar itself.
    pub effective_at: DateTime<Utc>,
}

/// Gap direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GapDirection {
    Up,
    Down,
}

/// A pre-market gap between previous close and current open.
///
/// Only valid inside the opening window; `expires_at` marks the end of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapEvent {
    pub symbol: String,
    pub previous_close: Decimal,
    pub current_open: Decimal,
    pub gap_percent: Decimal,
    pub direction: GapDirection,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GapEvent {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
