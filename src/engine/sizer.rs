//! Account aggregates and capital limit enforcement.
//!
//! All symbol workers share one `AccountState` behind a single lock;
//! check-and-reserve happens under one write guard so two symbols cannot
//! jointly approve orders that together violate the cash or invested
//! limits. Violations reject the order with a structured reason; size is
//! never silently clipped.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::domain::{OrderRequest, OrderSide};
use crate::error::{LimitKind, RiskError};

/// Shared account-wide aggregates.
///
/// Cash and exposure move on reservation and fill; equity is their sum.
#[derive(Debug)]
pub struct AccountState {
    cash: Decimal,
    /// Market value held per symbol (at cost until repriced)
    exposure: HashMap<String, Decimal>,
    /// Outstanding buy reservations by correlation key, at limit price
    reserved: HashMap<Uuid, Reservation>,
}

#[derive(Debug, Clone)]
struct Reservation {
    symbol: String,
    /// Limit price the reservation was taken at
    limit_price: Decimal,
    /// Shares not yet filled or released
    remaining: u64,
}

impl AccountState {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cash: starting_cash,
            exposure: HashMap::new(),
            reserved: HashMap::new(),
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn invested(&self) -> Decimal {
        self.exposure.values().copied().sum()
    }

    pub fn equity(&self) -> Decimal {
        self.cash + self.invested()
    }

    pub fn exposure(&self, symbol: &str) -> Decimal {
        self.exposure.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    fn add_exposure(&mut self, symbol: &str, delta: Decimal) {
        let entry = self
            .exposure
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO);
        *entry = (*entry + delta).max(Decimal::ZERO);
    }

    /// Take the buy reservation after a passed limit check
    fn reserve(&mut self, request: &OrderRequest) {
        let notional = request.value();
        self.cash -= notional;
        self.add_exposure(&request.symbol, notional);
        self.reserved.insert(
            request.correlation_key,
            Reservation {
                symbol: request.symbol.clone(),
                limit_price: request.limit_price,
                remaining: request.quantity,
            },
        );
    }

    /// Convert the reserved portion into actuals when a buy fills,
    /// refunding the limit-vs-fill price difference.
    pub fn on_buy_fill(&mut self, correlation_key: Uuid, quantity: u64, fill_price: Decimal) {
        let Some(reservation) = self.reserved.get_mut(&correlation_key) else {
            return;
        };
        let covered = reservation.remaining.min(quantity);
        reservation.remaining -= covered;
        let limit_price = reservation.limit_price;
        let symbol = reservation.symbol.clone();
        if reservation.remaining == 0 {
            self.reserved.remove(&correlation_key);
        }

        let refund = (limit_price - fill_price) * Decimal::from(covered);
        self.cash += refund;
        self.add_exposure(&symbol, -refund);
    }

    /// Release whatever remains of a reservation (cancel / reject)
    pub fn release(&mut self, correlation_key: Uuid) {
        if let Some(reservation) = self.reserved.remove(&correlation_key) {
            let notional = reservation.limit_price * Decimal::from(reservation.remaining);
            self.cash += notional;
            self.add_exposure(&reservation.symbol, -notional);
            debug!(
                symbol = %reservation.symbol,
                "released {} reserved for {correlation_key}",
                notional
            );
        }
    }

    /// Record a sell fill: cash in, exposure out
    pub fn on_sell_fill(&mut self, symbol: &str, quantity: u64, fill_price: Decimal) {
        let proceeds = fill_price * Decimal::from(quantity);
        self.cash += proceeds;
        self.add_exposure(symbol, -proceeds);
    }
}

/// Pre-trade capital limit checks
pub struct PositionSizer {
    limits: LimitsConfig,
}

impl PositionSizer {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    /// Validate the projected post-fill position and, if every limit
    /// passes, take the buy reservation atomically. Boundary-equal
    /// projections are accepted; crossing ones are rejected with which
    /// limit failed and by how much.
    pub fn check_and_reserve(
        &self,
        account: &mut AccountState,
        request: &OrderRequest,
        core_target: Decimal,
    ) -> Result<(), RiskError> {
        if request.side == OrderSide::Sell {
            // Sells only raise cash; nothing to check or reserve
            return Ok(());
        }

        let equity = account.equity();
        let notional = request.value();

        let projected_exposure = account.exposure(&request.symbol) + notional;
        let allowed_exposure = (core_target + self.limits.position_buffer_percent) * equity;
        if projected_exposure > allowed_exposure {
            return Err(RiskError::LimitBreach {
                limit: LimitKind::SymbolExposure,
                allowed: allowed_exposure,
                projected: projected_exposure,
                excess: projected_exposure - allowed_exposure,
            });
        }

        let projected_cash = account.cash() - notional;
        let min_cash = self.limits.min_cash_percent * equity;
        if projected_cash < min_cash {
            return Err(RiskError::LimitBreach {
                limit: LimitKind::CashReserve,
                allowed: min_cash,
                projected: projected_cash,
                excess: min_cash - projected_cash,
            });
        }

        let projected_invested = account.invested() + notional;
        let max_invested = self.limits.max_invested_percent * equity;
        if projected_invested > max_invested {
            return Err(RiskError::LimitBreach {
                limit: LimitKind::TotalInvested,
                allowed: max_invested,
                projected: projected_invested,
                excess: projected_invested - max_invested,
            });
        }

        account.reserve(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::domain::OrderKind;
    use rust_decimal_macros::dec;

    fn sizer() -> PositionSizer {
        PositionSizer::new(AppConfig::default_config().limits)
    }

    fn buy(quantity: u64, price: Decimal) -> OrderRequest {
        OrderRequest::buy("SOXL", OrderKind::Entry, quantity, price)
    }

    #[test]
    fn boundary_equal_cash_is_accepted() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        // Exactly 80% spent leaves exactly 20% cash: accepted
        let request = buy(800, dec!(100));
        assert!(sizer
            .check_and_reserve(&mut account, &request, dec!(0.95))
            .is_ok());
        assert_eq!(account.cash(), dec!(20000));
    }

    #[test]
    fn boundary_crossing_cash_is_rejected() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        let request = buy(801, dec!(100));
        let err = sizer
            .check_and_reserve(&mut account, &request, dec!(0.95))
            .unwrap_err();
        match err {
            RiskError::LimitBreach { limit, excess, .. } => {
                assert_eq!(limit, LimitKind::CashReserve);
                assert_eq!(excess, dec!(100));
            }
            other => panic!("unexpected error {other}"),
        }
        // Nothing reserved on rejection
        assert_eq!(account.cash(), dec!(100000));
    }

    #[test]
    fn symbol_exposure_cap_is_core_target_plus_buffer() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        // Core target 5% + 5% buffer = 10% of equity = 10_000
        let at_cap = buy(100, dec!(100));
        assert!(sizer
            .check_and_reserve(&mut account, &at_cap, dec!(0.05))
            .is_ok());

        let over = buy(1, dec!(100));
        let err = sizer
            .check_and_reserve(&mut account, &over, dec!(0.05))
            .unwrap_err();
        assert!(matches!(
            err,
            RiskError::LimitBreach {
                limit: LimitKind::SymbolExposure,
                ..
            }
        ));
    }

    #[test]
    fn invested_cap_spans_symbols() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        // Two symbols can reach the 80% cap jointly, not exceed it
        let a = OrderRequest::buy("SOXL", OrderKind::Entry, 400, dec!(100));
        let b = OrderRequest::buy("TQQQ", OrderKind::Entry, 400, dec!(100));
        assert!(sizer.check_and_reserve(&mut account, &a, dec!(0.50)).is_ok());
        assert!(sizer.check_and_reserve(&mut account, &b, dec!(0.50)).is_ok());

        let c = OrderRequest::buy("UPRO", OrderKind::Entry, 1, dec!(100));
        assert!(sizer.check_and_reserve(&mut account, &c, dec!(0.50)).is_err());
    }

    #[test]
    fn sells_pass_without_reservation() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(1000));
        let request = OrderRequest::sell("SOXL", OrderKind::Exit, 1000, dec!(100), vec![]);
        assert!(sizer
            .check_and_reserve(&mut account, &request, dec!(0.05))
            .is_ok());
        assert_eq!(account.cash(), dec!(1000));
    }

    #[test]
    fn release_restores_reservation() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        let request = buy(100, dec!(100));
        sizer
            .check_and_reserve(&mut account, &request, dec!(0.95))
            .unwrap();
        assert_eq!(account.cash(), dec!(90000));
        assert_eq!(account.exposure("SOXL"), dec!(10000));

        account.release(request.correlation_key);
        assert_eq!(account.cash(), dec!(100000));
        assert_eq!(account.exposure("SOXL"), dec!(0));
    }

    #[test]
    fn buy_fill_refunds_price_improvement() {
        let sizer = sizer();
        let mut account = AccountState::new(dec!(100000));
        let request = buy(100, dec!(100));
        sizer
            .check_and_reserve(&mut account, &request, dec!(0.95))
            .unwrap();

        // Filled a dollar under the limit: the difference comes back
        account.on_buy_fill(request.correlation_key, 100, dec!(99));
        assert_eq!(account.cash(), dec!(90100));
        assert_eq!(account.exposure("SOXL"), dec!(9900));
        assert_eq!(account.equity(), dec!(100000));
    }

    #[test]
    fn sell_fill_moves_value_back_to_cash() {
        let mut account = AccountState::new(dec!(100000));
        let request = buy(100, dec!(100));
        let sizer = sizer();
        sizer
            .check_and_reserve(&mut account, &request, dec!(0.95))
            .unwrap();
        account.on_buy_fill(request.correlation_key, 100, dec!(100));

        account.on_sell_fill("SOXL", 100, dec!(101));
        assert_eq!(account.cash(), dec!(100100));
        assert_eq!(account.exposure("SOXL"), dec!(0));
    }
}
