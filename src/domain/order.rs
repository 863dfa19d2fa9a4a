use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// What an order is for; drives retry timeouts and fill routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Trading-around-core entry
    Entry,
    /// Trading-around-core profit-target exit
    Exit,
    /// Core build cycle buy (1% of equity)
    CoreBuild,
    /// Core build cycle trim sell (75% of the cycle's fill)
    CoreBuildTrim,
    /// Core unwind sell under risk-off
    CoreUnwind,
    /// Gap-scenario repriced sell, 10-second deadline
    GapReprice,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Entry => write!(f, "ENTRY"),
            OrderKind::Exit => write!(f, "EXIT"),
            OrderKind::CoreBuild => write!(f, "CORE_BUILD"),
            OrderKind::CoreBuildTrim => write!(f, "CORE_BUILD_TRIM"),
            OrderKind::CoreUnwind => write!(f, "CORE_UNWIND"),
            OrderKind::GapReprice => write!(f, "GAP_REPRICE"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created but not yet submitted
    New,
    /// Submitted to the broker
    Submitted,
    /// Partially filled
    PartiallyFilled,
    /// Fully filled
    Filled,
    /// Cancelled (including exhausted retries)
    Cancelled,
    /// Rejected by the broker or the position sizer
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Order request (what we want the broker to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Stable across cancel-and-resubmit; lets a late fill from a
    /// cancelled attempt be reconciled instead of double-applied.
    pub correlation_key: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    pub limit_price: Decimal,
    /// Lots this order closes (sells) or retags (core trim)
    pub linked_lot_ids: Vec<Uuid>,
}

impl OrderRequest {
    pub fn buy(symbol: impl Into<String>, kind: OrderKind, quantity: u64, price: Decimal) -> Self {
        Self {
            correlation_key: Uuid::new_v4(),
            symbol: symbol.into(),
            side: OrderSide::Buy,
            kind,
            quantity,
            limit_price: price,
            linked_lot_ids: Vec::new(),
        }
    }

    pub fn sell(
        symbol: impl Into<String>,
        kind: OrderKind,
        quantity: u64,
        price: Decimal,
        linked_lot_ids: Vec<Uuid>,
    ) -> Self {
        Self {
            correlation_key: Uuid::new_v4(),
            symbol: symbol.into(),
            side: OrderSide::Sell,
            kind,
            quantity,
            limit_price: price,
            linked_lot_ids,
        }
    }

    /// Notional value at the limit price
    pub fn value(&self) -> Decimal {
        self.limit_price * Decimal::from(self.quantity)
    }
}

/// Order tracked by the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub correlation_key: Uuid,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: u64,
    pub limit_price: Decimal,
    pub filled_quantity: u64,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub linked_lot_ids: Vec<Uuid>,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(request: &OrderRequest) -> Self {
        Self {
            correlation_key: request.correlation_key,
            broker_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            quantity: request.quantity,
            limit_price: request.limit_price,
            filled_quantity: 0,
            avg_fill_price: None,
            status: OrderStatus::New,
            submitted_at: None,
            retry_count: 0,
            linked_lot_ids: request.linked_lot_ids.clone(),
            reject_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn remaining_quantity(&self) -> u64 {
        self.quantity.saturating_sub(self.filled_quantity)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    /// Record a fill, updating the running average price
    pub fn record_fill(&mut self, quantity: u64, price: Decimal) {
        let prev_value = self
            .avg_fill_price
            .map(|p| p * Decimal::from(self.filled_quantity))
            .unwrap_or(Decimal::ZERO);
        self.filled_quantity += quantity;
        if self.filled_quantity > 0 {
            self.avg_fill_price =
                Some((prev_value + price * Decimal::from(quantity)) / Decimal::from(self.filled_quantity));
        }
        self.status = if self.is_fully_filled() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

/// Fill event from the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    /// Broker-side order id the fill belongs to
    pub broker_order_id: String,
    /// Unique fill id; duplicate notifications share it
    pub fill_id: String,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn record_fill_tracks_average_and_status() {
        let request = OrderRequest::buy("SOXL", OrderKind::Entry, 100, dec!(30));
        let mut order = Order::from_request(&request);

        order.record_fill(40, dec!(30));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining_quantity(), 60);

        order.record_fill(60, dec!(31));
        assert_eq!(order.status, OrderStatus::Filled);
        // (40*30 + 60*31) / 100 = 30.6
        assert_eq!(order.avg_fill_price, Some(dec!(30.6)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Submitted.is_active());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
