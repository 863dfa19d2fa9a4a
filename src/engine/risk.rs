//! Per-symbol risk state machine.
//!
//! RISK_ON is the initial state. Any of weekly RSI > threshold, a new
//! 52-week high, or a new all-time high flips the symbol to RISK_OFF and
//! arms the core unwind schedule. Recovery to RISK_ON requires weekly RSI
//! closed back under the risk-off threshold AND daily RSI closed under the
//! recovery threshold; while either condition fails the machine refuses
//! the transition, so the state is monotone with respect to its triggers.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::{LimitsConfig, SignalConfig};
use crate::domain::SignalKind;

/// Risk state for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskState {
    RiskOn,
    RiskOff,
}

impl std::fmt::Display for RiskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskState::RiskOn => write!(f, "RISK_ON"),
            RiskState::RiskOff => write!(f, "RISK_OFF"),
        }
    }
}

/// Why a transition happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionReason {
    WeeklyRsiHigh(Decimal),
    NewYearHigh(Decimal),
    NewAllTimeHigh(Decimal),
    Recovered { weekly: Decimal, daily: Decimal },
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionReason::WeeklyRsiHigh(v) => write!(f, "weekly RSI {v} above threshold"),
            TransitionReason::NewYearHigh(p) => write!(f, "new 52-week high at {p}"),
            TransitionReason::NewAllTimeHigh(p) => write!(f, "new all-time high at {p}"),
            TransitionReason::Recovered { weekly, daily } => {
                write!(f, "weekly RSI {weekly} and daily RSI {daily} recovered")
            }
        }
    }
}

/// An applied state transition
#[derive(Debug, Clone)]
pub struct RiskTransition {
    pub symbol: String,
    pub from: RiskState,
    pub to: RiskState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

/// Core unwind schedule armed on entering RISK_OFF: one tranche
/// immediately, one more per further price step over the anchor.
#[derive(Debug, Clone)]
struct UnwindSchedule {
    anchor_price: Decimal,
    base_core_quantity: u64,
    tranche_percent: Decimal,
    price_step: Decimal,
    tranches_sold: u32,
}

impl UnwindSchedule {
    fn tranche_quantity(&self) -> u64 {
        (Decimal::from(self.base_core_quantity) * self.tranche_percent)
            .floor()
            .to_u64()
            .unwrap_or(0)
    }

    /// Tranches whose trigger price is at or under the current price
    fn tranches_reached(&self, price: Decimal) -> u32 {
        if self.anchor_price <= Decimal::ZERO || price < self.anchor_price {
            return 1; // the immediate tranche is always due
        }
        let steps = ((price / self.anchor_price - Decimal::ONE) / self.price_step)
            .floor()
            .to_u32()
            .unwrap_or(0);
        steps + 1
    }
}

pub struct RiskStateMachine {
    symbol: String,
    state: RiskState,
    last_weekly_rsi: Option<Decimal>,
    last_daily_rsi: Option<Decimal>,
    entered_at: DateTime<Utc>,
    risk_off_threshold: Decimal,
    risk_on_daily_threshold: Decimal,
    tranche_percent: Decimal,
    price_step: Decimal,
    unwind: Option<UnwindSchedule>,
}

impl RiskStateMachine {
    pub fn new(symbol: impl Into<String>, signals: &SignalConfig, limits: &LimitsConfig) -> Self {
        Self {
            symbol: symbol.into(),
            state: RiskState::RiskOn,
            last_weekly_rsi: None,
            last_daily_rsi: None,
            entered_at: Utc::now(),
            risk_off_threshold: signals.risk_off_threshold,
            risk_on_daily_threshold: signals.risk_on_daily_threshold,
            tranche_percent: limits.unwind_tranche_percent,
            price_step: limits.unwind_price_step_percent,
            unwind: None,
        }
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn is_risk_on(&self) -> bool {
        self.state == RiskState::RiskOn
    }

    pub fn last_weekly_rsi(&self) -> Option<Decimal> {
        self.last_weekly_rsi
    }

    pub fn last_daily_rsi(&self) -> Option<Decimal> {
        self.last_daily_rsi
    }

    /// When the current state was entered
    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    /// Weekly RSI close
    pub fn on_weekly_rsi(&mut self, value: Decimal) -> Option<RiskTransition> {
        self.last_weekly_rsi = Some(value);
        if self.state == RiskState::RiskOn && value > self.risk_off_threshold {
            return Some(self.enter_risk_off(TransitionReason::WeeklyRsiHigh(value)));
        }
        self.try_recover()
    }

    /// Daily RSI close
    pub fn on_daily_rsi(&mut self, value: Decimal) -> Option<RiskTransition> {
        self.last_daily_rsi = Some(value);
        self.try_recover()
    }

    /// A price-extreme signal (52-week or all-time high)
    pub fn on_price_extreme(&mut self, kind: SignalKind, price: Decimal) -> Option<RiskTransition> {
        if self.state != RiskState::RiskOn {
            return None;
        }
        let reason = match kind {
            SignalKind::Price52wHigh => TransitionReason::NewYearHigh(price),
            SignalKind::AllTimeHigh => TransitionReason::NewAllTimeHigh(price),
            _ => return None,
        };
        Some(self.enter_risk_off(reason))
    }

    fn enter_risk_off(&mut self, reason: TransitionReason) -> RiskTransition {
        let transition = RiskTransition {
            symbol: self.symbol.clone(),
            from: self.state,
            to: RiskState::RiskOff,
            reason,
            at: Utc::now(),
        };
        warn!(symbol = %self.symbol, "risk-off: {}", transition.reason);
        self.state = RiskState::RiskOff;
        self.entered_at = transition.at;
        transition
    }

    /// RISK_OFF -> RISK_ON requires both RSI conditions; refused while any
    /// risk-off trigger condition still holds.
    fn try_recover(&mut self) -> Option<RiskTransition> {
        if self.state != RiskState::RiskOff {
            return None;
        }
        let weekly = self.last_weekly_rsi?;
        let daily = self.last_daily_rsi?;
        if weekly >= self.risk_off_threshold || daily >= self.risk_on_daily_threshold {
            return None;
        }
        let transition = RiskTransition {
            symbol: self.symbol.clone(),
            from: self.state,
            to: RiskState::RiskOn,
            reason: TransitionReason::Recovered { weekly, daily },
            at: Utc::now(),
        };
        info!(symbol = %self.symbol, "risk-on: {}", transition.reason);
        self.state = RiskState::RiskOn;
        self.entered_at = transition.at;
        self.unwind = None;
        Some(transition)
    }

    /// Arm the unwind schedule after entering RISK_OFF. The anchor is the
    /// price at unwind start; tranche size is fixed from the core quantity
    /// at that moment.
    pub fn arm_unwind(&mut self, anchor_price: Decimal, core_quantity: u64) {
        if self.state != RiskState::RiskOff || core_quantity == 0 {
            return;
        }
        self.unwind = Some(UnwindSchedule {
            anchor_price,
            base_core_quantity: core_quantity,
            tranche_percent: self.tranche_percent,
            price_step: self.price_step,
            tranches_sold: 0,
        });
    }

    /// Quantity due for unwinding at the current price; marks the tranches
    /// consumed. Returns 0 when nothing new is due.
    pub fn unwind_due(&mut self, price: Decimal) -> u64 {
        if self.state != RiskState::RiskOff {
            return 0;
        }
        let Some(schedule) = self.unwind.as_mut() else {
            return 0;
        };
        let reached = schedule.tranches_reached(price);
        if reached <= schedule.tranches_sold {
            return 0;
        }
        let pending = reached - schedule.tranches_sold;
        schedule.tranches_sold = reached;
        pending as u64 * schedule.tranche_quantity()
    }
}
