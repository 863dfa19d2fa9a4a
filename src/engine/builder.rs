//! Core position builder.
//!
//! Drives the bounded buy/trim/retain cycle per symbol: buy 1% of equity,
//! sell 75% of the fill at +1%, keep the remaining 25% as permanent core.
//! Progress is derived from CORE-tagged lots in the ledger, never from an
//! independent counter, so a restart mid-cycle resumes from ledger state.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::domain::{LotRole, OrderKind, OrderRequest};

use super::ledger::LotLedger;

/// Derived build progress; recomputed from the ledger on demand
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreBuildProgress {
    pub symbol: String,
    pub target_percent: Decimal,
    pub accumulated_percent: Decimal,
    pub cycles_completed: usize,
}

impl CoreBuildProgress {
    pub fn is_complete(&self) -> bool {
        self.accumulated_percent >= self.target_percent
    }
}

/// Where the current cycle stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildPhase {
    Idle,
    BuyPending { correlation_key: Uuid },
    TrimPending { correlation_key: Uuid, lot_id: Uuid },
}

pub struct CorePositionBuilder {
    symbol: String,
    target_percent: Decimal,
    order_size_percent: Decimal,
    retain_percent: Decimal,
    profit_target_percent: Decimal,
    retain_step: Decimal,
    phase: BuildPhase,
}

impl CorePositionBuilder {
    pub fn new(symbol: impl Into<String>, target_percent: Decimal, limits: &LimitsConfig) -> Self {
        Self {
            symbol: symbol.into(),
            target_percent,
            order_size_percent: limits.order_size_percent,
            retain_percent: limits.retain_percent,
            profit_target_percent: limits.profit_target_percent,
            retain_step: limits.retain_step(),
            phase: BuildPhase::Idle,
        }
    }

    /// Progress derived from CORE lots: each completed cycle retained one
    /// step (0.25% of equity at the moment of the retain).
    pub fn progress(&self, ledger: &LotLedger) -> CoreBuildProgress {
        let cycles_completed = ledger.core_lot_count();
        CoreBuildProgress {
            symbol: self.symbol.clone(),
            target_percent: self.target_percent,
            accumulated_percent: self.retain_step * Decimal::from(cycles_completed as u64),
            cycles_completed,
        }
    }

    pub fn is_complete(&self, ledger: &LotLedger) -> bool {
        self.progress(ledger).is_complete()
    }

    pub fn cycle_in_flight(&self) -> bool {
        self.phase != BuildPhase::Idle
    }

    /// Start the next cycle if none is in flight and the target is not
    /// reached: a buy of 1% of equity, rounded down so the 75/25 split
    /// stays whole-share exact.
    pub fn next_buy(&mut self, ledger: &LotLedger, equity: Decimal, price: Decimal) -> Option<OrderRequest> {
        if self.phase != BuildPhase::Idle || self.is_complete(ledger) || price <= Decimal::ZERO {
            return None;
        }

        let raw = (equity * self.order_size_percent / price)
            .floor()
            .to_u64()
            .unwrap_or(0);
        let quantity = raw - raw % 4;
        if quantity == 0 {
            debug!(symbol = %self.symbol, "cycle buy would be zero shares at {price}");
            return None;
        }

        let request = OrderRequest::buy(self.symbol.clone(), OrderKind::CoreBuild, quantity, price);
        self.phase = BuildPhase::BuyPending {
            correlation_key: request.correlation_key,
        };
        Some(request)
    }

    /// The cycle buy filled: arm the trim sell for 75% of the filled
    /// quantity at the profit target.
    pub fn on_buy_filled(
        &mut self,
        correlation_key: Uuid,
        lot_id: Uuid,
        filled_quantity: u64,
        fill_price: Decimal,
    ) -> Option<OrderRequest> {
        match self.phase {
            BuildPhase::BuyPending { correlation_key: pending } if pending == correlation_key => {}
            _ => return None,
        }

        let trim_quantity = filled_quantity
            - (Decimal::from(filled_quantity) * self.retain_percent)
                .floor()
                .to_u64()
                .unwrap_or(0);
        let target_price = fill_price * (Decimal::ONE + self.profit_target_percent);
        let request = OrderRequest::sell(
            self.symbol.clone(),
            OrderKind::CoreBuildTrim,
            trim_quantity,
            target_price,
            vec![lot_id],
        );
        self.phase = BuildPhase::TrimPending {
            correlation_key: request.correlation_key,
            lot_id,
        };
        Some(request)
    }

    /// The trim sell completed; the ledger has re-tagged the remainder
    pub fn on_trim_filled(&mut self, correlation_key: Uuid, ledger: &LotLedger) {
        if let BuildPhase::TrimPending { correlation_key: pending, .. } = self.phase {
            if pending == correlation_key {
                self.phase = BuildPhase::Idle;
                let progress = self.progress(ledger);
                info!(
                    symbol = %self.symbol,
                    "core cycle {} complete: {}% of {}%",
                    progress.cycles_completed,
                    progress.accumulated_percent * Decimal::from(100),
                    progress.target_percent * Decimal::from(100)
                );
            }
        }
    }

    /// An in-flight cycle order died (cancelled or rejected); release the
    /// phase so the next opportunity can retry.
    pub fn on_order_failed(&mut self, correlation_key: Uuid) {
        let matches = match self.phase {
            BuildPhase::BuyPending { correlation_key: k } => k == correlation_key,
            BuildPhase::TrimPending { correlation_key: k, .. } => k == correlation_key,
            BuildPhase::Idle => false,
        };
        if matches {
            self.phase = BuildPhase::Idle;
        }
    }

    /// Crash recovery: re-arm the trim for a cycle the ledger shows
    /// mid-flight (an open TRADING lot carrying a profit target that no
    /// in-flight order is already working).
    pub fn resume_from_ledger(
        &mut self,
        ledger: &LotLedger,
        excluded_lots: &[Uuid],
    ) -> Option<OrderRequest> {
        if self.phase != BuildPhase::Idle {
            return None;
        }
        let lot = ledger
            .open_lots(LotRole::Trading)
            .find(|l| l.profit_target_price.is_some() && !excluded_lots.contains(&l.id))?;
        let retain_target = (Decimal::from(lot.original_quantity) * self.retain_percent)
            .floor()
            .to_u64()
            .unwrap_or(0);
        let trim_quantity = lot.quantity.saturating_sub(retain_target);
        if trim_quantity == 0 {
            return None;
        }
        let target_price = lot
            .profit_target_price
            .unwrap_or(lot.cost_basis_per_share * (Decimal::ONE + self.profit_target_percent));
        let request = OrderRequest::sell(
            self.symbol.clone(),
            OrderKind::CoreBuildTrim,
            trim_quantity,
            target_price,
            vec![lot.id],
        );
        self.phase = BuildPhase::TrimPending {
            correlation_key: request.correlation_key,
            lot_id: lot.id,
        };
        info!(
            symbol = %self.symbol,
            "resuming mid-cycle trim of {trim_quantity} from ledger"
        );
        Some(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::{Fill, Order};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn builder(target: Decimal) -> CorePositionBuilder {
        let limits = AppConfig::default_config().limits;
        CorePositionBuilder::new("SOXL", target, &limits)
    }

    fn fill_for(order: &Order, fill_id: &str) -> Fill {
        Fill {
            broker_order_id: "b".to_string(),
            fill_id: fill_id.to_string(),
            symbol: order.symbol.clone(),
            price: order.limit_price,
            quantity: order.quantity,
            timestamp: Utc::now(),
        }
    }

    /// Run one full cycle against the real ledger
    fn run_cycle(builder: &mut CorePositionBuilder, ledger: &mut LotLedger, cycle: usize) {
        let buy = builder
            .next_buy(ledger, dec!(100000), dec!(25))
            .expect("cycle buy");
        assert_eq!(buy.quantity, 40); // 1% of 100k at $25
        let mut order = Order::from_request(&buy);
        order.record_fill(buy.quantity, buy.limit_price);
        let fill = fill_for(&order, &format!("c{cycle}-buy"));
        let outcome = ledger.apply_fill(&order, &fill, Some(dec!(25.25))).unwrap();
        let super::super::ledger::FillOutcome::Opened { lot_id } = outcome else {
            panic!("expected lot open");
        };

        let trim = builder
            .on_buy_filled(buy.correlation_key, lot_id, buy.quantity, buy.limit_price)
            .expect("trim request");
        assert_eq!(trim.quantity, 30); // 75% of the fill
        assert_eq!(trim.limit_price, dec!(25.25)); // +1%
        let mut trim_order = Order::from_request(&trim);
        trim_order.record_fill(trim.quantity, trim.limit_price);
        let fill = fill_for(&trim_order, &format!("c{cycle}-trim"));
        ledger.apply_fill(&trim_order, &fill, None).unwrap();
        builder.on_trim_filled(trim.correlation_key, ledger);
    }

    #[test]
    fn cycle_retains_quarter_percent() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));

        run_cycle(&mut builder, &mut ledger, 0);

        let progress = builder.progress(&ledger);
        assert_eq!(progress.cycles_completed, 1);
        assert_eq!(progress.accumulated_percent, dec!(0.0025));
        assert!(!progress.is_complete());
        assert_eq!(ledger.open_quantity(LotRole::Core), 10);
    }

    #[test]
    fn accumulation_is_linear_in_cycles() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));
        for cycle in 0..8 {
            run_cycle(&mut builder, &mut ledger, cycle);
        }
        let progress = builder.progress(&ledger);
        assert_eq!(progress.cycles_completed, 8);
        // N cycles -> N x 0.25%
        assert_eq!(progress.accumulated_percent, dec!(0.02));
    }

    #[test]
    fn building_halts_at_target() {
        let mut ledger = LotLedger::new("SOXL");
        // 1% target completes after exactly 4 cycles
        let mut builder = builder(dec!(0.01));
        for cycle in 0..4 {
            run_cycle(&mut builder, &mut ledger, cycle);
        }
        assert!(builder.is_complete(&ledger));
        assert!(builder.next_buy(&ledger, dec!(100000), dec!(25)).is_none());
    }

    #[test]
    fn one_cycle_in_flight_at_a_time() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));
        let first = builder.next_buy(&ledger, dec!(100000), dec!(25));
        assert!(first.is_some());
        assert!(builder.next_buy(&ledger, dec!(100000), dec!(25)).is_none());
    }

    #[test]
    fn failed_buy_releases_the_cycle() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));
        let buy = builder.next_buy(&ledger, dec!(100000), dec!(25)).unwrap();
        builder.on_order_failed(buy.correlation_key);
        assert!(builder.next_buy(&ledger, dec!(100000), dec!(25)).is_some());
    }

    #[test]
    fn quantity_rounds_down_to_whole_split() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));
        // 1% of 100k at $27 = 37.03 -> 37 -> 36 (multiple of 4)
        let buy = builder.next_buy(&mut ledger, dec!(100000), dec!(27)).unwrap();
        assert_eq!(buy.quantity, 36);
    }

    #[test]
    fn resume_rearms_trim_from_ledger() {
        let mut ledger = LotLedger::new("SOXL");
        let mut builder = builder(dec!(0.05));

        // Cycle buy filled, then a crash: fresh builder, same ledger
        let buy = builder.next_buy(&ledger, dec!(100000), dec!(25)).unwrap();
        let mut order = Order::from_request(&buy);
        order.record_fill(buy.quantity, buy.limit_price);
        ledger
            .apply_fill(&order, &fill_for(&order, "f-buy"), Some(dec!(25.25)))
            .unwrap();

        let mut recovered = super::CorePositionBuilder::new(
            "SOXL",
            dec!(0.05),
            &AppConfig::default_config().limits,
        );
        let trim = recovered
            .resume_from_ledger(&ledger, &[])
            .expect("resumed trim");
        assert_eq!(trim.quantity, 30);
        assert_eq!(trim.limit_price, dec!(25.25));
        assert!(recovered.cycle_in_flight());
    }
}
