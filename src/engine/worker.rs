//! Per-symbol worker: the single owner of all mutable state for a symbol.
//!
//! Bars, fills and order deadlines for one symbol are processed on this
//! one logical stream, so the ledger and build progress never race.
//! Different symbols run their own workers in parallel; only the shared
//! account aggregates cross between them, behind one lock.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerClient, BrokerEvent};
use crate::config::AppConfig;
use crate::domain::{
    Bar, GapEvent, LotRole, OrderKind, OrderRequest, OrderSide, Signal, SignalKind, Timeframe,
};
use crate::error::Result;
use crate::sink::{record_write_behind, Alert, AlertSink, AuditEvent, EventSink};

use super::builder::CorePositionBuilder;
use super::gap::GapDetector;
use super::ledger::{FillOutcome, LotLedger};
use super::lifecycle::{
    ConfirmedFill, DeadlineOutcome, LifecycleConfig, LifecycleOutcome, OrderLifecycleManager,
};
use super::risk::{RiskState, RiskStateMachine, RiskTransition};
use super::signals::SignalEngine;
use super::sizer::{AccountState, PositionSizer};

/// Events consumed by a symbol worker, in arrival order
#[derive(Debug)]
pub enum WorkerEvent {
    Bar(Bar),
    Broker(BrokerEvent),
}

pub struct SymbolWorker {
    symbol: String,
    core_target: Decimal,
    signals: SignalEngine,
    gap: GapDetector,
    risk: RiskStateMachine,
    ledger: LotLedger,
    builder: CorePositionBuilder,
    sizer: PositionSizer,
    lifecycle: OrderLifecycleManager,
    account: Arc<RwLock<AccountState>>,
    broker: Arc<dyn BrokerClient>,
    event_sink: Arc<dyn EventSink>,
    alert_sink: Arc<dyn AlertSink>,
    order_size_percent: Decimal,
    profit_target_percent: Decimal,
    reconcile_tolerance: u64,
    broker_call_timeout: Duration,
    last_price: Option<Decimal>,
}

impl SymbolWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        core_target: Decimal,
        config: &AppConfig,
        broker: Arc<dyn BrokerClient>,
        account: Arc<RwLock<AccountState>>,
        event_sink: Arc<dyn EventSink>,
        alert_sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let symbol = symbol.into();
        let session_open = config
            .session_open_time()
            .map_err(crate::error::KeelError::Config)?;
        Ok(Self {
            signals: SignalEngine::new(symbol.clone(), config.signals.clone()),
            gap: GapDetector::new(symbol.clone(), &config.gap, session_open),
            risk: RiskStateMachine::new(symbol.clone(), &config.signals, &config.limits),
            ledger: LotLedger::new(symbol.clone()),
            builder: CorePositionBuilder::new(symbol.clone(), core_target, &config.limits),
            sizer: PositionSizer::new(config.limits.clone()),
            lifecycle: OrderLifecycleManager::new(
                symbol.clone(),
                broker.clone(),
                LifecycleConfig::from_app(config),
            ),
            symbol,
            core_target,
            account,
            broker,
            event_sink,
            alert_sink,
            order_size_percent: config.limits.order_size_percent,
            profit_target_percent: config.limits.profit_target_percent,
            reconcile_tolerance: config.limits.reconcile_tolerance,
            broker_call_timeout: Duration::from_millis(config.execution.broker_call_timeout_ms),
            last_price: None,
        })
    }

    /// Event loop: bars and broker events in arrival order, with order
    /// deadlines interleaved. A fill or shutdown re-arms the deadline
    /// timer immediately, so no stale resubmission can dangle.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<WorkerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(symbol = %self.symbol, "worker started (core target {}%)",
            self.core_target * Decimal::from(100));

        loop {
            let deadline = self.lifecycle.next_deadline();
            let sleep_target = deadline
                .map(|(_, at)| at)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => break,
                    }
                }
                _ = sleep_until(sleep_target), if deadline.is_some() => {
                    if let Some((key, _)) = deadline {
                        self.on_deadline(key).await;
                    }
                }
            }
        }

        // Drain: pull resting orders and release their reservations
        let cancelled = self.lifecycle.cancel_all().await;
        if !cancelled.is_empty() {
            let mut account = self.account.write().await;
            for order in &cancelled {
                if order.side == OrderSide::Buy {
                    account.release(order.correlation_key);
                }
            }
            info!(symbol = %self.symbol, "cancelled {} resting orders on shutdown", cancelled.len());
        }
        info!(symbol = %self.symbol, "worker stopped");
    }

    /// Process one event synchronously; `run` loops this, and tests can
    /// step the worker deterministically through it
    pub async fn handle(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Bar(bar) => self.on_bar(bar).await,
            WorkerEvent::Broker(event) => self.on_broker_event(event).await,
        }
    }

    /// Ledger view for inspection (status surface, tests)
    pub fn ledger(&self) -> &LotLedger {
        &self.ledger
    }

    /// Derived core build progress
    pub fn progress(&self) -> super::builder::CoreBuildProgress {
        self.builder.progress(&self.ledger)
    }

    /// Derived position view at the last seen price
    pub async fn position_snapshot(&self) -> crate::domain::PositionSnapshot {
        let equity = self.account.read().await.equity();
        self.ledger
            .snapshot(self.last_price.unwrap_or(Decimal::ZERO), equity)
    }

    /// Current risk state
    pub fn risk_state(&self) -> RiskState {
        self.risk.state()
    }

    /// Orders still in flight
    pub fn active_orders(&self) -> usize {
        self.lifecycle.active_count()
    }

    async fn on_bar(&mut self, bar: Bar) {
        self.last_price = Some(bar.close);

        if let Some(gap_event) = self.gap.observe(&bar) {
            self.on_gap(gap_event).await;
        }

        let signals = self.signals.on_bar(&bar);
        for signal in &signals {
            record_write_behind(self.event_sink.as_ref(), AuditEvent::Signal(signal.clone()))
                .await;
        }

        // Feed risk state from this close
        match bar.timeframe {
            Timeframe::Weekly => {
                if let Some(rsi) = self.signals.rsi(Timeframe::Weekly) {
                    let transition = self.risk.on_weekly_rsi(rsi);
                    self.apply_transition(transition).await;
                }
            }
            Timeframe::Daily => {
                self.gap.set_previous_close(bar.close);
                if let Some(rsi) = self.signals.rsi(Timeframe::Daily) {
                    let transition = self.risk.on_daily_rsi(rsi);
                    self.apply_transition(transition).await;
                }
            }
            Timeframe::M15 => {}
        }

        for signal in signals {
            self.on_signal(signal).await;
        }

        // Risk-off: check whether the price has reached the next tranche
        if self.risk.state() == RiskState::RiskOff {
            let due = self.risk.unwind_due(bar.close);
            if due > 0 {
                self.submit_unwind(due, bar.close).await;
            }
        }

        // Risk-on: the core rebuild has priority over everything else
        if bar.timeframe == Timeframe::M15 && self.risk.is_risk_on() {
            self.advance_core_build(bar.close).await;
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        self.alert_sink
            .alert(Alert::SignalFired {
                symbol: self.symbol.clone(),
                signal: signal.kind.to_string(),
            })
            .await;

        match signal.kind {
            SignalKind::Price52wHigh | SignalKind::AllTimeHigh => {
                let transition = self.risk.on_price_extreme(signal.kind, signal.value);
                self.apply_transition(transition).await;
            }
            SignalKind::RsiCrossUp => {
                // Candidate entry, gated on risk state; core rebuild has
                // priority over trading-around-core entries
                if !self.risk.is_risk_on() {
                    debug!(symbol = %self.symbol, "entry signal suppressed: risk off");
                    return;
                }
                if !self.builder.is_complete(&self.ledger) {
                    debug!(symbol = %self.symbol, "entry signal deferred: core incomplete");
                    return;
                }
                self.submit_trading_entry().await;
            }
            SignalKind::RsiCrossDown | SignalKind::WeeklyRsiHigh => {
                // Recorded; weekly RSI feeds the risk machine at bar close
            }
        }
    }

    async fn apply_transition(&mut self, transition: Option<RiskTransition>) {
        let Some(transition) = transition else { return };
        self.alert_sink
            .alert(Alert::RiskTransition {
                symbol: self.symbol.clone(),
                from: transition.from.to_string(),
                to: transition.to.to_string(),
                reason: transition.reason.to_string(),
            })
            .await;

        match transition.to {
            RiskState::RiskOff => {
                let core_quantity = self.ledger.open_quantity(LotRole::Core);
                let anchor = self.last_price.unwrap_or(Decimal::ZERO);
                self.risk.arm_unwind(anchor, core_quantity);
                let due = self.risk.unwind_due(anchor);
                if due > 0 {
                    self.submit_unwind(due, anchor).await;
                }
            }
            RiskState::RiskOn => {
                // Unwind disarmed inside the machine; the builder resumes
                // on the next bar with priority over new entries
            }
        }
    }

    async fn on_gap(&mut self, event: GapEvent) {
        record_write_behind(self.event_sink.as_ref(), AuditEvent::Gap(event.clone())).await;

        let quote = match tokio::time::timeout(
            self.broker_call_timeout,
            self.broker.best_quote(&self.symbol),
        )
        .await
        {
            Ok(Ok(quote)) => quote,
            Ok(Err(e)) => {
                warn!(symbol = %self.symbol, "gap handling skipped, no quote: {e}");
                return;
            }
            Err(_) => {
                warn!(symbol = %self.symbol, "gap handling skipped, quote timed out");
                return;
            }
        };

        // Replace every standing profit-target sell with an aggressive
        // repriced one on the 10-second clock
        let standing = self.lifecycle.active_sells(OrderKind::Exit);
        if standing.is_empty() {
            debug!(symbol = %self.symbol, "gap up but no standing sell to reprice");
        }
        for key in standing {
            if let Err(e) = self.lifecycle.convert_to_gap_reprice(key, &quote).await {
                warn!(symbol = %self.symbol, "gap reprice of {key} failed: {e}");
            }
        }
    }

    async fn submit_trading_entry(&mut self) {
        let Some(price) = self.last_price else { return };
        let equity = self.account.read().await.equity();
        let quantity = (equity * self.order_size_percent / price)
            .floor()
            .to_u64()
            .unwrap_or(0);
        if quantity == 0 {
            return;
        }
        let request = OrderRequest::buy(self.symbol.clone(), OrderKind::Entry, quantity, price);
        self.try_submit(request).await;
    }

    async fn advance_core_build(&mut self, price: Decimal) {
        if self.builder.cycle_in_flight() || self.builder.is_complete(&self.ledger) {
            return;
        }
        // A crash mid-cycle leaves an open trading lot with a profit
        // target and no live order against it; re-arm its trim before
        // starting anything new
        let linked = self.lifecycle.active_linked_lots();
        if let Some(trim) = self.builder.resume_from_ledger(&self.ledger, &linked) {
            let key = trim.correlation_key;
            if self.try_submit(trim).await.is_none() {
                self.builder.on_order_failed(key);
            }
            return;
        }
        let equity = self.account.read().await.equity();
        if let Some(buy) = self.builder.next_buy(&self.ledger, equity, price) {
            let key = buy.correlation_key;
            if self.try_submit(buy).await.is_none() {
                self.builder.on_order_failed(key);
            }
        }
    }

    async fn submit_unwind(&mut self, quantity: u64, price: Decimal) {
        let open_core = self.ledger.open_quantity(LotRole::Core);
        let quantity = quantity.min(open_core);
        if quantity == 0 {
            return;
        }
        let selection = self.ledger.select_lowest_cost(LotRole::Core, quantity);
        let lots: Vec<Uuid> = selection.iter().map(|(id, _)| *id).collect();
        self.alert_sink
            .alert(Alert::UnwindTriggered {
                symbol: self.symbol.clone(),
                quantity,
            })
            .await;
        let request = OrderRequest::sell(
            self.symbol.clone(),
            OrderKind::CoreUnwind,
            quantity,
            price,
            lots,
        );
        self.try_submit(request).await;
    }

    /// Limit check, reservation, submission. Local limit violations
    /// reject without retry; a halted ledger blocks everything.
    async fn try_submit(&mut self, request: OrderRequest) -> Option<Uuid> {
        if let Some(reason) = self.ledger.halt_reason() {
            let reason = format!("symbol halted pending reconciliation: {reason}");
            warn!(symbol = %self.symbol, "{reason}");
            self.lifecycle.reject_locally(&request, reason);
            return None;
        }

        let key = request.correlation_key;
        {
            let mut account = self.account.write().await;
            if let Err(breach) =
                self.sizer
                    .check_and_reserve(&mut account, &request, self.core_target)
            {
                drop(account);
                warn!(symbol = %self.symbol, "order rejected: {breach}");
                self.lifecycle.reject_locally(&request, breach.to_string());
                self.alert_sink
                    .alert(Alert::OrderRejected {
                        symbol: self.symbol.clone(),
                        reason: breach.to_string(),
                    })
                    .await;
                return None;
            }
        }

        match self.lifecycle.submit(request).await {
            Ok(key) => Some(key),
            Err(e) => {
                // Submission exhausted its retries; hand the cash back
                self.account.write().await.release(key);
                self.alert_sink
                    .alert(Alert::OrderRejected {
                        symbol: self.symbol.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                None
            }
        }
    }

    async fn on_deadline(&mut self, key: Uuid) {
        match self.lifecycle.handle_deadline(key).await {
            Ok(DeadlineOutcome::Resubmitted { .. }) => {}
            Ok(DeadlineOutcome::GaveUp { order }) => {
                if order.side == OrderSide::Buy {
                    self.account.write().await.release(order.correlation_key);
                }
                self.builder.on_order_failed(order.correlation_key);
                if order.kind == OrderKind::GapReprice {
                    self.alert_sink
                        .alert(Alert::GapRetriesExhausted {
                            symbol: self.symbol.clone(),
                        })
                        .await;
                }
                record_write_behind(self.event_sink.as_ref(), AuditEvent::Order(order)).await;
            }
            Err(e) => error!(symbol = %self.symbol, "deadline handling failed: {e}"),
        }
    }

    async fn on_broker_event(&mut self, event: BrokerEvent) {
        match self.lifecycle.handle_broker_event(event).await {
            LifecycleOutcome::Confirmed(confirmed) => self.on_confirmed_fill(confirmed).await,
            LifecycleOutcome::OrderRejected(order) => {
                if order.side == OrderSide::Buy {
                    self.account.write().await.release(order.correlation_key);
                }
                self.builder.on_order_failed(order.correlation_key);
                self.alert_sink
                    .alert(Alert::OrderRejected {
                        symbol: self.symbol.clone(),
                        reason: order
                            .reject_reason
                            .clone()
                            .unwrap_or_else(|| "broker rejection".to_string()),
                    })
                    .await;
                record_write_behind(self.event_sink.as_ref(), AuditEvent::Order(order)).await;
            }
            LifecycleOutcome::Ignored => {}
        }
    }

    async fn on_confirmed_fill(&mut self, confirmed: ConfirmedFill) {
        let ConfirmedFill { order, fill } = confirmed;

        // Account aggregates first, under one short write guard
        {
            let mut account = self.account.write().await;
            match order.side {
                OrderSide::Buy => {
                    account.on_buy_fill(order.correlation_key, fill.quantity, fill.price)
                }
                OrderSide::Sell => account.on_sell_fill(&self.symbol, fill.quantity, fill.price),
            }
        }

        let profit_target = match (order.side, order.kind) {
            (OrderSide::Buy, OrderKind::Entry) | (OrderSide::Buy, OrderKind::CoreBuild) => {
                Some(fill.price * (Decimal::ONE + self.profit_target_percent))
            }
            _ => None,
        };

        let outcome = match self.ledger.apply_fill(&order, &fill, profit_target) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(symbol = %self.symbol, "fill application failed: {e}");
                return;
            }
        };
        record_write_behind(self.event_sink.as_ref(), AuditEvent::Order(order.clone())).await;

        match outcome {
            FillOutcome::Duplicate => return,
            FillOutcome::Opened { lot_id } => {
                if let Some(lot) = self.ledger.lot(lot_id) {
                    record_write_behind(self.event_sink.as_ref(), AuditEvent::Lot(lot.clone()))
                        .await;
                }
                if order.is_fully_filled() {
                    match order.kind {
                        OrderKind::CoreBuild => {
                            if let Some(trim) = self.builder.on_buy_filled(
                                order.correlation_key,
                                lot_id,
                                order.filled_quantity,
                                fill.price,
                            ) {
                                let key = trim.correlation_key;
                                if self.try_submit(trim).await.is_none() {
                                    self.builder.on_order_failed(key);
                                }
                            }
                        }
                        OrderKind::Entry => {
                            // Arm the 100% profit-target exit for this lot
                            let target =
                                fill.price * (Decimal::ONE + self.profit_target_percent);
                            let request = OrderRequest::sell(
                                self.symbol.clone(),
                                OrderKind::Exit,
                                order.filled_quantity,
                                target,
                                vec![lot_id],
                            );
                            self.try_submit(request).await;
                        }
                        _ => {}
                    }
                }
            }
            FillOutcome::Reduced {
                closed_lot_ids,
                retagged_to_core,
                ..
            } => {
                for lot_id in closed_lot_ids.iter().chain(retagged_to_core.iter()) {
                    if let Some(lot) = self.ledger.lot(*lot_id) {
                        record_write_behind(
                            self.event_sink.as_ref(),
                            AuditEvent::Lot(lot.clone()),
                        )
                        .await;
                    }
                }
                if order.kind == OrderKind::CoreBuildTrim && order.is_fully_filled() {
                    self.builder.on_trim_filled(order.correlation_key, &self.ledger);
                }
            }
        }

        self.reconcile_against_broker().await;
    }

    /// Compare ledger totals with the broker-reported position after each
    /// applied fill; halt the symbol on divergence beyond tolerance.
    async fn reconcile_against_broker(&mut self) {
        let broker_position = match tokio::time::timeout(
            self.broker_call_timeout,
            self.broker.query_position(&self.symbol),
        )
        .await
        {
            Ok(Ok(position)) => position,
            Ok(Err(e)) => {
                warn!(symbol = %self.symbol, "position query failed, skipping reconcile: {e}");
                return;
            }
            Err(_) => {
                warn!(symbol = %self.symbol, "position query timed out, skipping reconcile");
                return;
            }
        };

        if let Err(e) = self
            .ledger
            .reconcile(broker_position, self.reconcile_tolerance)
        {
            error!(symbol = %self.symbol, "reconciliation failure: {e}");
            self.alert_sink
                .alert(Alert::ReconciliationRequired {
                    symbol: self.symbol.clone(),
                    detail: e.to_string(),
                })
                .await;
        }
    }

    /// Clear a reconciliation halt after the external action (used by the
    /// runtime's control surface and by tests)
    pub fn mark_reconciled(&mut self) {
        self.ledger.mark_reconciled();
    }
}
