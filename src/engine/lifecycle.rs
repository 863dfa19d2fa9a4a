//! Order lifecycle: submit, retry, cancel, and fill reconciliation.
//!
//! Every order keeps a stable correlation key across cancel-and-resubmit
//! rounds, so a fill racing a cancellation lands on the same logical order
//! instead of being double-applied. Standard limit orders get a one-minute
//! unfilled deadline; gap-reprice sells get ten seconds.

use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerEvent};
use crate::config::{AppConfig, ExecutionConfig};
use crate::domain::{Fill, Order, OrderKind, OrderRequest, OrderSide, OrderStatus, Quote};
use crate::error::{KeelError, OrderError, Result};

use super::gap::reprice_price;

/// Lifecycle tuning, extracted from the app configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub limit_timeout: Duration,
    pub gap_timeout: Duration,
    pub submit_retry_limit: u32,
    pub reprice_retry_limit: u32,
    pub broker_call_timeout: Duration,
    pub backoff_base: Duration,
    pub reprice_discount: Decimal,
}

impl LifecycleConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self::from_parts(&config.execution, config.gap.reprice_discount)
    }

    pub fn from_parts(execution: &ExecutionConfig, reprice_discount: Decimal) -> Self {
        Self {
            limit_timeout: Duration::from_secs(execution.limit_order_timeout_secs),
            gap_timeout: Duration::from_secs(execution.gap_order_timeout_secs),
            submit_retry_limit: execution.submit_retry_limit,
            reprice_retry_limit: execution.reprice_retry_limit,
            broker_call_timeout: Duration::from_millis(execution.broker_call_timeout_ms),
            backoff_base: Duration::from_millis(execution.backoff_base_ms),
            reprice_discount,
        }
    }

    fn deadline_for(&self, kind: OrderKind) -> Duration {
        match kind {
            OrderKind::GapReprice => self.gap_timeout,
            _ => self.limit_timeout,
        }
    }
}

/// A fill confirmed against a tracked order; the order snapshot already
/// reflects it.
#[derive(Debug, Clone)]
pub struct ConfirmedFill {
    pub order: Order,
    pub fill: Fill,
}

/// What the lifecycle made of a broker event
#[derive(Debug, Clone)]
pub enum LifecycleOutcome {
    Confirmed(ConfirmedFill),
    OrderRejected(Order),
    /// Duplicate or unknown; nothing to apply
    Ignored,
}

/// What an expired deadline turned into
#[derive(Debug, Clone)]
pub enum DeadlineOutcome {
    Resubmitted { correlation_key: Uuid },
    GaveUp { order: Order },
}

struct TrackedOrder {
    order: Order,
    deadline: Instant,
}

pub struct OrderLifecycleManager {
    symbol: String,
    broker: Arc<dyn BrokerClient>,
    config: LifecycleConfig,
    active: HashMap<Uuid, TrackedOrder>,
    /// Every broker order id ever issued for an order, kept for the life
    /// of the process so late fills from cancelled attempts still resolve
    broker_ids: HashMap<String, Uuid>,
    seen_fill_ids: HashSet<String>,
    /// Terminal orders, retained for the audit trail
    completed: Vec<Order>,
}

impl OrderLifecycleManager {
    pub fn new(symbol: impl Into<String>, broker: Arc<dyn BrokerClient>, config: LifecycleConfig) -> Self {
        Self {
            symbol: symbol.into(),
            broker,
            config,
            active: HashMap::new(),
            broker_ids: HashMap::new(),
            seen_fill_ids: HashSet::new(),
            completed: Vec::new(),
        }
    }

    pub fn order(&self, correlation_key: Uuid) -> Option<&Order> {
        self.active.get(&correlation_key).map(|t| &t.order)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed(&self) -> &[Order] {
        &self.completed
    }

    /// Lots referenced by any in-flight order (guards crash recovery
    /// against re-trimming a lot that already has a live exit)
    pub fn active_linked_lots(&self) -> Vec<Uuid> {
        self.active
            .values()
            .flat_map(|t| t.order.linked_lot_ids.iter().copied())
            .collect()
    }

    /// Active sell orders of a kind (gap handling scans standing exits)
    pub fn active_sells(&self, kind: OrderKind) -> Vec<Uuid> {
        self.active
            .values()
            .filter(|t| t.order.side == OrderSide::Sell && t.order.kind == kind)
            .map(|t| t.order.correlation_key)
            .collect()
    }

    /// Submit a new order. Bounded retry with exponential backoff around
    /// the broker call; exhaustion rejects the order rather than leaving
    /// it ambiguous.
    pub async fn submit(&mut self, request: OrderRequest) -> Result<Uuid> {
        let mut order = Order::from_request(&request);

        match self.submit_to_broker(&request).await {
            Ok(broker_order_id) => {
                order.broker_order_id = Some(broker_order_id.clone());
                order.status = OrderStatus::Submitted;
                order.submitted_at = Some(chrono::Utc::now());
                self.broker_ids
                    .insert(broker_order_id, request.correlation_key);
                let deadline = Instant::now() + self.config.deadline_for(order.kind);
                info!(
                    symbol = %self.symbol,
                    "submitted {} {} {} @ {} ({})",
                    order.side, order.quantity, order.symbol, order.limit_price, order.kind
                );
                self.active.insert(
                    request.correlation_key,
                    TrackedOrder { order, deadline },
                );
                Ok(request.correlation_key)
            }
            Err(e) => {
                error!(
                    symbol = %self.symbol,
                    "submission failed after {} attempts: {e}",
                    self.config.submit_retry_limit
                );
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(e.to_string());
                self.completed.push(order);
                Err(e)
            }
        }
    }

    /// Record a locally rejected order (position sizer) for the audit trail
    pub fn reject_locally(&mut self, request: &OrderRequest, reason: String) {
        let mut order = Order::from_request(request);
        order.status = OrderStatus::Rejected;
        order.reject_reason = Some(reason);
        self.completed.push(order);
    }

    async fn submit_to_broker(&self, request: &OrderRequest) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call = timeout(
                self.config.broker_call_timeout,
                self.broker.submit_order(request),
            );
            match call.await {
                Ok(Ok(broker_order_id)) => return Ok(broker_order_id),
                Ok(Err(e)) if attempt >= self.config.submit_retry_limit => {
                    return Err(OrderError::SubmitFailed {
                        reason: e.to_string(),
                    }
                    .into());
                }
                Ok(Err(e)) => {
                    warn!(
                        symbol = %self.symbol,
                        "submit attempt {attempt} failed: {e}; retrying"
                    );
                }
                Err(_) if attempt >= self.config.submit_retry_limit => {
                    return Err(OrderError::MaxRetriesExceeded { attempts: attempt }.into());
                }
                Err(_) => {
                    warn!(symbol = %self.symbol, "submit attempt {attempt} timed out; retrying");
                }
            }
            sleep(self.config.backoff_base * (1 << attempt.min(6))).await;
        }
    }

    async fn cancel_at_broker(&self, broker_order_id: &str) {
        let call = timeout(
            self.config.broker_call_timeout,
            self.broker.cancel_order(broker_order_id),
        );
        match call.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(symbol = %self.symbol, "cancel of {broker_order_id} failed: {e}"),
            Err(_) => warn!(symbol = %self.symbol, "cancel of {broker_order_id} timed out"),
        }
    }

    /// Earliest unfilled deadline among active orders, with its key
    pub fn next_deadline(&self) -> Option<(Uuid, Instant)> {
        self.active
            .values()
            .filter(|t| t.order.status.is_active())
            .map(|t| (t.order.correlation_key, t.deadline))
            .min_by_key(|(_, deadline)| *deadline)
    }

    /// An unfilled deadline expired: cancel and resubmit at a recomputed
    /// price under the same correlation key, until the retry budget runs
    /// out; then cancel for good, leaving no resting order.
    pub async fn handle_deadline(&mut self, correlation_key: Uuid) -> Result<DeadlineOutcome> {
        let tracked = self
            .active
            .get(&correlation_key)
            .ok_or(OrderError::NotFound {
                correlation_key: correlation_key.to_string(),
            })?;
        let kind = tracked.order.kind;
        let retry_count = tracked.order.retry_count;
        let broker_order_id = tracked.order.broker_order_id.clone();

        if let Some(id) = &broker_order_id {
            self.cancel_at_broker(id).await;
        }

        if retry_count >= self.config.reprice_retry_limit {
            let mut tracked = self
                .active
                .remove(&correlation_key)
                .expect("checked above");
            tracked.order.status = OrderStatus::Cancelled;
            warn!(
                symbol = %self.symbol,
                "{} order {correlation_key} exhausted {} reprice retries; no resting order remains",
                kind, retry_count
            );
            let order = tracked.order.clone();
            self.completed.push(tracked.order);
            return Ok(DeadlineOutcome::GaveUp { order });
        }

        // Recompute the limit from a fresh quote; a dead quote feed means
        // we cannot reprice, so give up rather than spin on the deadline
        let quote = match self.fresh_quote().await {
            Ok(quote) => quote,
            Err(e) => {
                let mut tracked = self
                    .active
                    .remove(&correlation_key)
                    .expect("checked above");
                tracked.order.status = OrderStatus::Cancelled;
                tracked.order.reject_reason = Some(e.to_string());
                warn!(
                    symbol = %self.symbol,
                    "no quote to reprice {correlation_key}: {e}; order cancelled"
                );
                let order = tracked.order.clone();
                self.completed.push(tracked.order);
                return Ok(DeadlineOutcome::GaveUp { order });
            }
        };
        let tracked = self
            .active
            .get_mut(&correlation_key)
            .ok_or(OrderError::NotFound {
                correlation_key: correlation_key.to_string(),
            })?;
        tracked.order.limit_price = match (tracked.order.kind, tracked.order.side) {
            (OrderKind::GapReprice, _) => reprice_price(&quote, self.config.reprice_discount),
            (_, OrderSide::Sell) => quote.bid_or_last(),
            (_, OrderSide::Buy) => quote.ask_or_last(),
        };
        tracked.order.retry_count += 1;
        tracked.order.quantity = tracked.order.remaining_quantity();
        tracked.order.filled_quantity = 0;
        tracked.order.status = OrderStatus::New;

        let request = OrderRequest {
            correlation_key,
            symbol: tracked.order.symbol.clone(),
            side: tracked.order.side,
            kind: tracked.order.kind,
            quantity: tracked.order.quantity,
            limit_price: tracked.order.limit_price,
            linked_lot_ids: tracked.order.linked_lot_ids.clone(),
        };

        match self.submit_to_broker(&request).await {
            Ok(broker_order_id) => {
                let tracked = self
                    .active
                    .get_mut(&correlation_key)
                    .expect("still tracked");
                tracked.order.broker_order_id = Some(broker_order_id.clone());
                tracked.order.status = OrderStatus::Submitted;
                tracked.order.submitted_at = Some(chrono::Utc::now());
                tracked.deadline = Instant::now() + self.config.deadline_for(kind);
                self.broker_ids.insert(broker_order_id, correlation_key);
                debug!(
                    symbol = %self.symbol,
                    "resubmitted {correlation_key} (retry {}): {} @ {}",
                    retry_count + 1,
                    request.quantity,
                    request.limit_price
                );
                Ok(DeadlineOutcome::Resubmitted { correlation_key })
            }
            Err(e) => {
                let mut tracked = self
                    .active
                    .remove(&correlation_key)
                    .expect("still tracked");
                tracked.order.status = OrderStatus::Rejected;
                tracked.order.reject_reason = Some(e.to_string());
                let order = tracked.order.clone();
                self.completed.push(tracked.order);
                error!(
                    symbol = %self.symbol,
                    "resubmit of {correlation_key} failed: {e}"
                );
                Ok(DeadlineOutcome::GaveUp { order })
            }
        }
    }

    /// Replace the standing profit-target sell with a gap-reprice sell:
    /// cancel it, recompute min(last x (1 - discount), bid), resubmit
    /// under the same correlation key with the 10-second deadline.
    pub async fn convert_to_gap_reprice(
        &mut self,
        correlation_key: Uuid,
        quote: &Quote,
    ) -> Result<()> {
        let tracked = self
            .active
            .get(&correlation_key)
            .ok_or(OrderError::NotFound {
                correlation_key: correlation_key.to_string(),
            })?;
        if tracked.order.side != OrderSide::Sell {
            return Err(KeelError::Validation(
                "only sell orders can be gap-repriced".to_string(),
            ));
        }
        if let Some(id) = tracked.order.broker_order_id.clone() {
            self.cancel_at_broker(&id).await;
        }

        let price = reprice_price(quote, self.config.reprice_discount);
        let tracked = self
            .active
            .get_mut(&correlation_key)
            .expect("checked above");
        tracked.order.kind = OrderKind::GapReprice;
        tracked.order.limit_price = price;
        tracked.order.quantity = tracked.order.remaining_quantity();
        tracked.order.filled_quantity = 0;
        tracked.order.retry_count = 0;
        tracked.order.status = OrderStatus::New;

        let request = OrderRequest {
            correlation_key,
            symbol: tracked.order.symbol.clone(),
            side: OrderSide::Sell,
            kind: OrderKind::GapReprice,
            quantity: tracked.order.quantity,
            limit_price: price,
            linked_lot_ids: tracked.order.linked_lot_ids.clone(),
        };

        let broker_order_id = self.submit_to_broker(&request).await?;
        let tracked = self
            .active
            .get_mut(&correlation_key)
            .expect("still tracked");
        tracked.order.broker_order_id = Some(broker_order_id.clone());
        tracked.order.status = OrderStatus::Submitted;
        tracked.order.submitted_at = Some(chrono::Utc::now());
        tracked.deadline = Instant::now() + self.config.gap_timeout;
        self.broker_ids.insert(broker_order_id, correlation_key);
        info!(
            symbol = %self.symbol,
            "gap reprice: sell {} resubmitted at {price}",
            request.quantity
        );
        Ok(())
    }

    /// Consume a broker event. Fills are idempotent by fill id; a fill
    /// arriving for a cancelled earlier attempt of a resubmitted order is
    /// applied to the same logical order and the newer resting attempt is
    /// cancelled, so nothing is double-applied.
    pub async fn handle_broker_event(&mut self, event: BrokerEvent) -> LifecycleOutcome {
        match event {
            BrokerEvent::Fill(fill) => self.handle_fill(fill).await,
            BrokerEvent::Rejected {
                broker_order_id,
                reason,
                ..
            } => {
                let Some(correlation_key) = self.broker_ids.get(&broker_order_id).copied() else {
                    warn!(symbol = %self.symbol, "rejection for unknown order {broker_order_id}");
                    return LifecycleOutcome::Ignored;
                };
                let Some(mut tracked) = self.active.remove(&correlation_key) else {
                    return LifecycleOutcome::Ignored;
                };
                tracked.order.status = OrderStatus::Rejected;
                tracked.order.reject_reason = Some(reason);
                let order = tracked.order.clone();
                self.completed.push(tracked.order);
                LifecycleOutcome::OrderRejected(order)
            }
        }
    }

    async fn handle_fill(&mut self, fill: Fill) -> LifecycleOutcome {
        let Some(correlation_key) = self.broker_ids.get(&fill.broker_order_id).copied() else {
            warn!(
                symbol = %self.symbol,
                "fill {} for unknown broker order {}",
                fill.fill_id, fill.broker_order_id
            );
            return LifecycleOutcome::Ignored;
        };
        if !self.seen_fill_ids.insert(fill.fill_id.clone()) {
            debug!(symbol = %self.symbol, "duplicate fill {} ignored", fill.fill_id);
            return LifecycleOutcome::Ignored;
        }
        let cancel_target = {
            let Some(tracked) = self.active.get_mut(&correlation_key) else {
                // Terminal already; the ledger's own idempotence would catch
                // a re-application, but there is nothing left to update here.
                debug!(
                    symbol = %self.symbol,
                    "fill {} for terminal order {correlation_key} ignored",
                    fill.fill_id
                );
                return LifecycleOutcome::Ignored;
            };

            let stale_attempt =
                tracked.order.broker_order_id.as_deref() != Some(&fill.broker_order_id);
            tracked.order.record_fill(fill.quantity, fill.price);

            if stale_attempt && tracked.order.is_fully_filled() {
                tracked.order.broker_order_id.clone()
            } else {
                None
            }
        };

        if let Some(current) = cancel_target {
            // Cancel raced the fill: the shares are ours, so pull the
            // resubmitted resting attempt before it can double-fill.
            warn!(
                symbol = %self.symbol,
                "fill {} landed on a cancelled attempt of {correlation_key}; reconciling",
                fill.fill_id
            );
            self.cancel_at_broker(&current).await;
        }

        let tracked = self.active.get(&correlation_key).expect("still tracked");
        let order = tracked.order.clone();
        if order.status.is_terminal() {
            let tracked = self.active.remove(&correlation_key).expect("tracked");
            self.completed.push(tracked.order);
        }
        LifecycleOutcome::Confirmed(ConfirmedFill { order, fill })
    }

    /// Best-effort cancel of everything still resting (shutdown, halt)
    pub async fn cancel_all(&mut self) -> Vec<Order> {
        let keys: Vec<Uuid> = self.active.keys().copied().collect();
        let mut cancelled = Vec::new();
        for key in keys {
            if let Some(mut tracked) = self.active.remove(&key) {
                if let Some(id) = tracked.order.broker_order_id.clone() {
                    self.cancel_at_broker(&id).await;
                }
                tracked.order.status = OrderStatus::Cancelled;
                cancelled.push(tracked.order.clone());
                self.completed.push(tracked.order);
            }
        }
        cancelled
    }

    async fn fresh_quote(&self) -> Result<Quote> {
        match timeout(
            self.config.broker_call_timeout,
            self.broker.best_quote(&self.symbol),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(KeelError::BrokerTimeout {
                elapsed_ms: self.config.broker_call_timeout.as_millis() as u64,
            }),
        }
    }
}
