//! Simulated broker for paper trading and tests.
//!
//! Immediate mode fills every accepted order at its limit price, the way a
//! dry run should. Manual mode leaves orders resting so tests can drive
//! timeouts, partial fills and cancel/fill races explicitly.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

use async_trait::async_trait;

use crate::domain::{Fill, OrderRequest, OrderSide, Quote};
use crate::error::{KeelError, Result};

use super::traits::{BrokerClient, BrokerEvent};

/// How the paper broker fills accepted orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Fill at the limit price as soon as the order is accepted
    Immediate,
    /// Leave orders resting until `fill_order` is called
    Manual,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    request: OrderRequest,
    remaining: u64,
    cancelled: bool,
}

/// In-memory broker simulator
pub struct PaperBroker {
    mode: FillMode,
    quotes: RwLock<HashMap<String, Quote>>,
    resting: RwLock<HashMap<String, RestingOrder>>,
    positions: RwLock<HashMap<String, i64>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_order_id: AtomicU64,
    next_fill_id: AtomicU64,
}

impl PaperBroker {
    /// Create a broker and the event stream the engine will consume
    pub fn new(mode: FillMode) -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Self {
            mode,
            quotes: RwLock::new(HashMap::new()),
            resting: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            events: tx,
            next_order_id: AtomicU64::new(1),
            next_fill_id: AtomicU64::new(1),
        });
        (broker, rx)
    }

    /// Publish a quote snapshot for a symbol
    pub async fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal, last: Decimal) {
        self.quotes.write().await.insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                bid: Some(bid),
                ask: Some(ask),
                last,
                timestamp: Utc::now(),
            },
        );
    }

    /// Seed the broker-reported position (for reconciliation tests)
    pub async fn set_position(&self, symbol: &str, quantity: i64) {
        self.positions
            .write()
            .await
            .insert(symbol.to_string(), quantity);
    }

    /// Fill a resting order (manual mode); emits the fill event.
    /// Filling more than once with the same quantity produces distinct
    /// fill ids; `emit_duplicate_fill` replays an id instead.
    pub async fn fill_order(&self, broker_order_id: &str, quantity: u64, price: Decimal) -> bool {
        let mut resting = self.resting.write().await;
        let Some(order) = resting.get_mut(broker_order_id) else {
            return false;
        };
        if order.remaining < quantity {
            return false;
        }
        order.remaining -= quantity;
        let request = order.request.clone();
        drop(resting);

        self.emit_fill(broker_order_id, &request, quantity, price)
            .await;
        true
    }

    /// Inspect a resting order's request (tests)
    pub async fn resting_request(&self, broker_order_id: &str) -> Option<OrderRequest> {
        self.resting
            .read()
            .await
            .get(broker_order_id)
            .map(|o| o.request.clone())
    }

    /// Resting order ids for a symbol, oldest first by id
    pub async fn resting_order_ids(&self, symbol: &str) -> Vec<String> {
        let resting = self.resting.read().await;
        let mut ids: Vec<String> = resting
            .iter()
            .filter(|(_, o)| !o.cancelled && o.request.symbol == symbol && o.remaining > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn emit_fill(
        &self,
        broker_order_id: &str,
        request: &OrderRequest,
        quantity: u64,
        price: Decimal,
    ) {
        let signed = match request.side {
            OrderSide::Buy => quantity as i64,
            OrderSide::Sell => -(quantity as i64),
        };
        *self
            .positions
            .write()
            .await
            .entry(request.symbol.clone())
            .or_insert(0) += signed;

        let fill = Fill {
            broker_order_id: broker_order_id.to_string(),
            fill_id: format!("pf-{}", self.next_fill_id.fetch_add(1, Ordering::SeqCst)),
            symbol: request.symbol.clone(),
            price,
            quantity,
            timestamp: Utc::now(),
        };
        debug!(
            "paper fill: {} {} {} @ {}",
            request.side, quantity, request.symbol, price
        );
        let _ = self.events.send(BrokerEvent::Fill(fill));
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn submit_order(&self, request: &OrderRequest) -> Result<String> {
        let broker_order_id = format!("po-{:06}", self.next_order_id.fetch_add(1, Ordering::SeqCst));

        match self.mode {
            FillMode::Immediate => {
                self.emit_fill(&broker_order_id, request, request.quantity, request.limit_price)
                    .await;
            }
            FillMode::Manual => {
                self.resting.write().await.insert(
                    broker_order_id.clone(),
                    RestingOrder {
                        request: request.clone(),
                        remaining: request.quantity,
                        cancelled: false,
                    },
                );
            }
        }

        Ok(broker_order_id)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool> {
        let mut resting = self.resting.write().await;
        match resting.get_mut(broker_order_id) {
            Some(order) if !order.cancelled && order.remaining > 0 => {
                order.cancelled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn query_position(&self, symbol: &str) -> Result<i64> {
        Ok(*self.positions.read().await.get(symbol).unwrap_or(&0))
    }

    async fn best_quote(&self, symbol: &str) -> Result<Quote> {
        self.quotes
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| KeelError::QuoteUnavailable {
                symbol: symbol.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderKind;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn immediate_mode_fills_at_limit() {
        let (broker, mut rx) = PaperBroker::new(FillMode::Immediate);
        let request = OrderRequest::buy("SOXL", OrderKind::Entry, 100, dec!(30));
        let id = broker.submit_order(&request).await.unwrap();

        match rx.recv().await.unwrap() {
            BrokerEvent::Fill(fill) => {
                assert_eq!(fill.broker_order_id, id);
                assert_eq!(fill.quantity, 100);
                assert_eq!(fill.price, dec!(30));
            }
            other => panic!("expected fill, got {other:?}"),
        }
        assert_eq!(broker.query_position("SOXL").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn manual_mode_rests_until_filled() {
        let (broker, mut rx) = PaperBroker::new(FillMode::Manual);
        let request = OrderRequest::sell("SOXL", OrderKind::Exit, 50, dec!(31), vec![]);
        let id = broker.submit_order(&request).await.unwrap();

        assert_eq!(broker.resting_order_ids("SOXL").await, vec![id.clone()]);
        assert!(broker.fill_order(&id, 50, dec!(31)).await);
        assert!(matches!(rx.recv().await.unwrap(), BrokerEvent::Fill(_)));

        // Fully consumed; cancel now reports it gone
        assert!(!broker.cancel_order(&id).await.unwrap());
    }
}
