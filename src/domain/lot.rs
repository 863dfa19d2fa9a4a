use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a lot belongs to the long-term core or is traded around it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LotRole {
    Core,
    Trading,
}

impl std::fmt::Display for LotRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LotRole::Core => write!(f, "CORE"),
            LotRole::Trading => write!(f, "TRADING"),
        }
    }
}

/// Lot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LotStatus {
    Open,
    PartiallyClosed,
    Closed,
}

/// A discrete acquisition of shares with its own cost basis.
///
/// Owned exclusively by the lot ledger; mutated only through fill
/// application. Closed lots are retained for cost-basis history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lot {
    pub id: Uuid,
    pub symbol: String,
    /// Remaining open quantity
    pub quantity: u64,
    /// Quantity originally acquired
    pub original_quantity: u64,
    pub cost_basis_per_share: Decimal,
    pub acquired_at: DateTime<Utc>,
    pub role: LotRole,
    /// Limit price for the profit-target exit, set at acquisition
    pub profit_target_price: Option<Decimal>,
    pub status: LotStatus,
}

impl Lot {
    pub fn is_open(&self) -> bool {
        matches!(self.status, LotStatus::Open | LotStatus::PartiallyClosed)
    }

    /// Remaining cost of the open quantity
    pub fn open_cost(&self) -> Decimal {
        self.cost_basis_per_share * Decimal::from(self.quantity)
    }
}

/// Derived per-symbol view; recomputed on demand, never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub core_quantity: u64,
    pub trading_quantity: u64,
    pub core_avg_cost: Option<Decimal>,
    pub trading_avg_cost: Option<Decimal>,
    /// Market value of all open lots as a fraction of account equity
    pub exposure_percent: Decimal,
}

impl PositionSnapshot {
    pub fn total_quantity(&self) -> u64 {
        self.core_quantity + self.trading_quantity
    }
}
