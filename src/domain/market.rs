use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bar timeframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    /// 15-minute bars (entry signals)
    M15,
    /// Daily bars (risk state)
    Daily,
    /// Weekly bars (risk state)
    Weekly,
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeframe::M15 => write!(f, "15min"),
            Timeframe::Daily => write!(f, "daily"),
            Timeframe::Weekly => write!(f, "weekly"),
        }
    }
}

/// A closed OHLC bar. Immutable once produced by the market data feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Close time of the bar
    pub timestamp: DateTime<Utc>,
}

impl Bar {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            open,
            high,
            low,
            close,
            timestamp,
        }
    }
}

/// Best bid/ask snapshot used for limit price computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Bid if present, otherwise last traded price
    pub fn bid_or_last(&self) -> Decimal {
        self.bid.unwrap_or(self.last)
    }

    /// Ask if present, otherwise last traded price
    pub fn ask_or_last(&self) -> Decimal {
        self.ask.unwrap_or(self.last)
    }
}
