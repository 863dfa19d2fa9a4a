use async_trait::async_trait;

use crate::domain::{Fill, OrderRequest, Quote};
use crate::error::Result;

/// Asynchronous status/fill events pushed by the broker.
///
/// The engine never assumes a synchronous fill: submission returns a broker
/// order id and everything after that arrives on this stream.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A (possibly partial) fill
    Fill(Fill),
    /// The broker rejected a resting order after acceptance
    Rejected {
        broker_order_id: String,
        symbol: String,
        reason: String,
    },
}

impl BrokerEvent {
    pub fn symbol(&self) -> &str {
        match self {
            BrokerEvent::Fill(fill) => &fill.symbol,
            BrokerEvent::Rejected { symbol, .. } => symbol,
        }
    }
}

/// Broker connectivity seam.
///
/// The transport behind this trait is out of scope; implementations must
/// keep each call bounded (the lifecycle manager additionally wraps calls
/// in its own timeout).
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order; returns the broker-side order id
    async fn submit_order(&self, request: &OrderRequest) -> Result<String>;

    /// Cancel an order; Ok(false) when it was already gone
    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool>;

    /// Broker-reported signed position for a symbol, in shares
    async fn query_position(&self, symbol: &str) -> Result<i64>;

    /// Current best bid/ask/last snapshot
    async fn best_quote(&self, symbol: &str) -> Result<Quote>;
}
