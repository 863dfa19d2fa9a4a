//! Lot ledger: per-symbol cost-basis bookkeeping.
//!
//! Every filled buy opens a lot; every filled sell reduces one or more.
//! Fill application is idempotent by fill id. Closed lots are retained for
//! cost-basis history rather than deleted.

use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Fill, Lot, LotRole, LotStatus, Order, OrderKind, OrderSide, PositionSnapshot};
use crate::error::{Result, RiskError};

/// What applying a fill did to the ledger
#[derive(Debug, Clone)]
pub enum FillOutcome {
    /// Fill id seen before; nothing changed
    Duplicate,
    /// Buy fill opened a new lot
    Opened { lot_id: Uuid },
    /// Sell fill reduced lots
    Reduced {
        quantity: u64,
        closed_lot_ids: Vec<Uuid>,
        /// Lot whose remainder became core inventory (core trim completion)
        retagged_to_core: Option<Uuid>,
    },
}

pub struct LotLedger {
    symbol: String,
    /// Acquisition order; closed lots stay for the audit trail
    lots: Vec<Lot>,
    applied_fill_ids: HashSet<String>,
    /// Set when the broker-reported position diverges beyond tolerance
    halt_reason: Option<String>,
}

impl LotLedger {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            lots: Vec::new(),
            applied_fill_ids: HashSet::new(),
            halt_reason: None,
        }
    }

    /// Apply a confirmed fill exactly once. `order` must already reflect
    /// the fill (the lifecycle manager records it first), so trim
    /// completion can be read off the order status.
    pub fn apply_fill(
        &mut self,
        order: &Order,
        fill: &Fill,
        profit_target: Option<Decimal>,
    ) -> Result<FillOutcome> {
        if !self.applied_fill_ids.insert(fill.fill_id.clone()) {
            debug!(
                symbol = %self.symbol,
                "duplicate fill {} ignored",
                fill.fill_id
            );
            return Ok(FillOutcome::Duplicate);
        }

        match order.side {
            OrderSide::Buy => Ok(self.open_lot(order, fill, profit_target)),
            OrderSide::Sell => Ok(self.reduce_lots(order, fill)),
        }
    }

    fn open_lot(&mut self, order: &Order, fill: &Fill, profit_target: Option<Decimal>) -> FillOutcome {
        let lot = Lot {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            quantity: fill.quantity,
            original_quantity: fill.quantity,
            cost_basis_per_share: fill.price,
            acquired_at: fill.timestamp,
            // Both entry and core-build buys start as trading inventory;
            // the retained remainder of a core cycle is re-tagged on the
            // trim sell's completion.
            role: LotRole::Trading,
            profit_target_price: profit_target,
            status: LotStatus::Open,
        };
        let lot_id = lot.id;
        debug!(
            symbol = %self.symbol,
            "opened lot {lot_id}: {} @ {} ({})",
            fill.quantity, fill.price, order.kind
        );
        self.lots.push(lot);
        FillOutcome::Opened { lot_id }
    }

    fn reduce_lots(&mut self, order: &Order, fill: &Fill) -> FillOutcome {
        let mut remaining = fill.quantity;
        let mut closed = Vec::new();

        // Consume the lots the order was created against, in listed order
        for lot_id in &order.linked_lot_ids {
            if remaining == 0 {
                break;
            }
            if let Some(lot) = self.lots.iter_mut().find(|l| l.id == *lot_id && l.is_open()) {
                let take = lot.quantity.min(remaining);
                lot.quantity -= take;
                remaining -= take;
                if lot.quantity == 0 {
                    lot.status = LotStatus::Closed;
                    closed.push(lot.id);
                } else {
                    lot.status = LotStatus::PartiallyClosed;
                }
            }
        }

        // A fill that outruns its linked lots means the link went stale
        // (e.g. a lot was split since order creation); fall back to the
        // lowest-cost-first rule over the matching role.
        if remaining > 0 {
            warn!(
                symbol = %self.symbol,
                "sell fill {} exceeds linked lots by {remaining}; applying lowest-cost-first",
                fill.fill_id
            );
            let role = match order.kind {
                OrderKind::CoreUnwind => LotRole::Core,
                _ => LotRole::Trading,
            };
            for (lot_id, take) in self.select_lowest_cost(role, remaining) {
                let lot = self
                    .lots
                    .iter_mut()
                    .find(|l| l.id == lot_id)
                    .expect("selected lot exists");
                lot.quantity -= take;
                remaining -= take;
                if lot.quantity == 0 {
                    lot.status = LotStatus::Closed;
                    closed.push(lot.id);
                } else {
                    lot.status = LotStatus::PartiallyClosed;
                }
            }
        }

        // Core trim completed: the cycle's remainder becomes permanent core
        let mut retagged = None;
        if order.kind == OrderKind::CoreBuildTrim && order.is_fully_filled() {
            for lot_id in &order.linked_lot_ids {
                if let Some(lot) = self.lots.iter_mut().find(|l| l.id == *lot_id && l.is_open()) {
                    lot.role = LotRole::Core;
                    lot.profit_target_price = None;
                    retagged = Some(lot.id);
                }
            }
        }

        FillOutcome::Reduced {
            quantity: fill.quantity - remaining,
            closed_lot_ids: closed,
            retagged_to_core: retagged,
        }
    }

    /// Lowest-cost-basis-first selection over open lots of a role.
    /// Splits the last lot when it only partially covers the remainder.
    pub fn select_lowest_cost(&self, role: LotRole, quantity: u64) -> Vec<(Uuid, u64)> {
        let mut open: Vec<&Lot> = self
            .lots
            .iter()
            .filter(|l| l.role == role && l.is_open())
            .collect();
        open.sort_by(|a, b| a.cost_basis_per_share.cmp(&b.cost_basis_per_share));

        let mut remaining = quantity;
        let mut selection = Vec::new();
        for lot in open {
            if remaining == 0 {
                break;
            }
            let take = lot.quantity.min(remaining);
            selection.push((lot.id, take));
            remaining -= take;
        }
        selection
    }

    pub fn lot(&self, lot_id: Uuid) -> Option<&Lot> {
        self.lots.iter().find(|l| l.id == lot_id)
    }

    pub fn open_lots(&self, role: LotRole) -> impl Iterator<Item = &Lot> {
        self.lots.iter().filter(move |l| l.role == role && l.is_open())
    }

    pub fn open_quantity(&self, role: LotRole) -> u64 {
        self.open_lots(role).map(|l| l.quantity).sum()
    }

    pub fn total_open_quantity(&self) -> u64 {
        self.open_quantity(LotRole::Core) + self.open_quantity(LotRole::Trading)
    }

    /// Open CORE lots; core-build progress is derived from this count
    pub fn core_lot_count(&self) -> usize {
        self.open_lots(LotRole::Core).count()
    }

    /// Weighted average cost basis of the open quantity for a role
    pub fn weighted_avg_cost(&self, role: LotRole) -> Option<Decimal> {
        let (qty, cost) = self.open_lots(role).fold(
            (0u64, Decimal::ZERO),
            |(qty, cost), lot| (qty + lot.quantity, cost + lot.open_cost()),
        );
        if qty == 0 {
            None
        } else {
            Some(cost / Decimal::from(qty))
        }
    }

    /// Derived position view; never stored
    pub fn snapshot(&self, last_price: Decimal, equity: Decimal) -> PositionSnapshot {
        let core_quantity = self.open_quantity(LotRole::Core);
        let trading_quantity = self.open_quantity(LotRole::Trading);
        let market_value = Decimal::from(core_quantity + trading_quantity) * last_price;
        let exposure_percent = if equity.is_zero() {
            Decimal::ZERO
        } else {
            market_value / equity
        };
        PositionSnapshot {
            symbol: self.symbol.clone(),
            core_quantity,
            trading_quantity,
            core_avg_cost: self.weighted_avg_cost(LotRole::Core),
            trading_avg_cost: self.weighted_avg_cost(LotRole::Trading),
            exposure_percent,
        }
    }

    /// Compare against the broker-reported position. A divergence beyond
    /// tolerance halts new submissions for the symbol until an explicit
    /// reconciliation action clears it.
    pub fn reconcile(&mut self, broker_quantity: i64, tolerance: u64) -> Result<()> {
        let ledger_quantity = self.total_open_quantity();
        let divergence = (ledger_quantity as i64 - broker_quantity).unsigned_abs();
        if divergence > tolerance {
            let reason = format!(
                "ledger {} vs broker {} (tolerance {})",
                ledger_quantity, broker_quantity, tolerance
            );
            self.halt_reason = Some(reason);
            return Err(RiskError::ReconciliationDivergence {
                symbol: self.symbol.clone(),
                ledger_qty: ledger_quantity,
                broker_qty: broker_quantity.max(0) as u64,
            }
            .into());
        }
        Ok(())
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    /// Explicit external reconciliation action; trading resumes after this
    pub fn mark_reconciled(&mut self) {
        self.halt_reason = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderRequest;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn fill_event(id: &str, quantity: u64, price: Decimal) -> Fill {
        Fill {
            broker_order_id: "b-1".to_string(),
            fill_id: id.to_string(),
            symbol: "SOXL".to_string(),
            price,
            quantity,
            timestamp: Utc::now(),
        }
    }

    fn filled_buy(kind: OrderKind, quantity: u64, price: Decimal) -> Order {
        let request = OrderRequest::buy("SOXL", kind, quantity, price);
        let mut order = Order::from_request(&request);
        order.record_fill(quantity, price);
        order
    }

    fn filled_sell(kind: OrderKind, quantity: u64, price: Decimal, lots: Vec<Uuid>) -> Order {
        let request = OrderRequest::sell("SOXL", kind, quantity, price, lots);
        let mut order = Order::from_request(&request);
        order.record_fill(quantity, price);
        order
    }

    fn open_lot(ledger: &mut LotLedger, fill_id: &str, quantity: u64, price: Decimal) -> Uuid {
        let order = filled_buy(OrderKind::CoreBuild, quantity, price);
        match ledger
            .apply_fill(&order, &fill_event(fill_id, quantity, price), None)
            .unwrap()
        {
            FillOutcome::Opened { lot_id } => lot_id,
            other => panic!("expected open, got {other:?}"),
        }
    }

    /// Build a CORE lot through the real path: cycle buy, then trim sell
    /// that retags the remainder.
    fn make_core_lot(ledger: &mut LotLedger, fill_id: &str, quantity: u64, price: Decimal) -> Uuid {
        let lot_id = open_lot(ledger, &format!("{fill_id}-buy"), quantity * 4, price);
        let trim = filled_sell(OrderKind::CoreBuildTrim, quantity * 3, price, vec![lot_id]);
        ledger
            .apply_fill(
                &trim,
                &fill_event(&format!("{fill_id}-trim"), quantity * 3, price),
                None,
            )
            .unwrap();
        lot_id
    }

    #[test]
    fn buy_fill_opens_trading_lot() {
        let mut ledger = LotLedger::new("SOXL");
        let order = filled_buy(OrderKind::Entry, 100, dec!(30));
        let outcome = ledger
            .apply_fill(&order, &fill_event("f-1", 100, dec!(30)), Some(dec!(30.3)))
            .unwrap();

        let FillOutcome::Opened { lot_id } = outcome else {
            panic!("expected open");
        };
        let lot = ledger.lot(lot_id).unwrap();
        assert_eq!(lot.role, LotRole::Trading);
        assert_eq!(lot.quantity, 100);
        assert_eq!(lot.profit_target_price, Some(dec!(30.3)));
        assert_eq!(ledger.open_quantity(LotRole::Trading), 100);
    }

    #[test]
    fn duplicate_fill_is_ignored() {
        let mut ledger = LotLedger::new("SOXL");
        let order = filled_buy(OrderKind::Entry, 100, dec!(30));
        let fill = fill_event("f-1", 100, dec!(30));
        ledger.apply_fill(&order, &fill, None).unwrap();
        let outcome = ledger.apply_fill(&order, &fill, None).unwrap();
        assert!(matches!(outcome, FillOutcome::Duplicate));
        assert_eq!(ledger.open_quantity(LotRole::Trading), 100);
    }

    #[test]
    fn trading_exit_closes_the_entry_lot() {
        let mut ledger = LotLedger::new("SOXL");
        let lot_id = open_lot(&mut ledger, "f-1", 100, dec!(30));

        let exit = filled_sell(OrderKind::Exit, 100, dec!(30.3), vec![lot_id]);
        let outcome = ledger
            .apply_fill(&exit, &fill_event("f-2", 100, dec!(30.3)), None)
            .unwrap();

        let FillOutcome::Reduced { closed_lot_ids, .. } = outcome else {
            panic!("expected reduction");
        };
        assert_eq!(closed_lot_ids, vec![lot_id]);
        assert_eq!(ledger.lot(lot_id).unwrap().status, LotStatus::Closed);
        assert_eq!(ledger.open_quantity(LotRole::Trading), 0);
    }

    #[test]
    fn lowest_cost_basis_first_selection() {
        let mut ledger = LotLedger::new("SOXL");
        let expensive = make_core_lot(&mut ledger, "a", 10, dec!(100));
        let mid = make_core_lot(&mut ledger, "b", 10, dec!(98));
        let cheap = make_core_lot(&mut ledger, "c", 10, dec!(95));

        // Quantity covering two lots: the two cheapest are consumed
        let selection = ledger.select_lowest_cost(LotRole::Core, 20);
        assert_eq!(selection, vec![(cheap, 10), (mid, 10)]);
        assert!(!selection.iter().any(|(id, _)| *id == expensive));
    }

    #[test]
    fn selection_splits_the_last_lot() {
        let mut ledger = LotLedger::new("SOXL");
        let cheap = make_core_lot(&mut ledger, "a", 10, dec!(95));
        let mid = make_core_lot(&mut ledger, "b", 10, dec!(98));

        let selection = ledger.select_lowest_cost(LotRole::Core, 15);
        assert_eq!(selection, vec![(cheap, 10), (mid, 5)]);

        // Apply the unwind: the split lot stays open, partially closed
        let lots: Vec<Uuid> = selection.iter().map(|(id, _)| *id).collect();
        let unwind = filled_sell(OrderKind::CoreUnwind, 15, dec!(99), lots);
        ledger
            .apply_fill(&unwind, &fill_event("f-u", 15, dec!(99)), None)
            .unwrap();
        assert_eq!(ledger.lot(cheap).unwrap().status, LotStatus::Closed);
        assert_eq!(ledger.lot(mid).unwrap().status, LotStatus::PartiallyClosed);
        assert_eq!(ledger.lot(mid).unwrap().quantity, 5);
        assert_eq!(ledger.open_quantity(LotRole::Core), 5);
    }

    #[test]
    fn core_trim_retags_remainder() {
        let mut ledger = LotLedger::new("SOXL");
        let lot_id = open_lot(&mut ledger, "f-1", 40, dec!(25));

        let trim = filled_sell(OrderKind::CoreBuildTrim, 30, dec!(25.25), vec![lot_id]);
        let outcome = ledger
            .apply_fill(&trim, &fill_event("f-2", 30, dec!(25.25)), None)
            .unwrap();

        let FillOutcome::Reduced {
            retagged_to_core, ..
        } = outcome
        else {
            panic!("expected reduction");
        };
        assert_eq!(retagged_to_core, Some(lot_id));

        let lot = ledger.lot(lot_id).unwrap();
        assert_eq!(lot.role, LotRole::Core);
        assert_eq!(lot.quantity, 10);
        assert_eq!(lot.profit_target_price, None);
        assert_eq!(ledger.core_lot_count(), 1);
        assert_eq!(ledger.open_quantity(LotRole::Core), 10);
    }

    #[test]
    fn weighted_average_cost() {
        let mut ledger = LotLedger::new("SOXL");
        open_lot(&mut ledger, "a", 100, dec!(30));
        open_lot(&mut ledger, "b", 100, dec!(32));
        assert_eq!(ledger.weighted_avg_cost(LotRole::Trading), Some(dec!(31)));
        assert_eq!(ledger.weighted_avg_cost(LotRole::Core), None);
    }

    #[test]
    fn reconciliation_halts_and_resumes() {
        let mut ledger = LotLedger::new("SOXL");
        open_lot(&mut ledger, "a", 100, dec!(30));

        assert!(ledger.reconcile(100, 0).is_ok());
        assert!(ledger.halt_reason().is_none());

        assert!(ledger.reconcile(90, 5).is_err());
        assert!(ledger.halt_reason().is_some());

        ledger.mark_reconciled();
        assert!(ledger.halt_reason().is_none());
    }

    #[test]
    fn closed_lots_are_retained() {
        let mut ledger = LotLedger::new("SOXL");
        let lot_id = open_lot(&mut ledger, "f-1", 100, dec!(30));
        let exit = filled_sell(OrderKind::Exit, 100, dec!(31), vec![lot_id]);
        ledger
            .apply_fill(&exit, &fill_event("f-2", 100, dec!(31)), None)
            .unwrap();
        // Still queryable for cost-basis history
        let lot = ledger.lot(lot_id).unwrap();
        assert_eq!(lot.status, LotStatus::Closed);
        assert_eq!(lot.cost_basis_per_share, dec!(30));
        assert_eq!(lot.original_quantity, 100);
    }
}
