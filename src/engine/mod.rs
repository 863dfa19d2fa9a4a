pub mod builder;
pub mod gap;
pub mod ledger;
pub mod lifecycle;
pub mod risk;
pub mod rsi;
pub mod runtime;
pub mod signals;
pub mod sizer;
pub mod worker;

pub use builder::{CoreBuildProgress, CorePositionBuilder};
pub use gap::{reprice_price, GapDetector};
pub use ledger::{FillOutcome, LotLedger};
pub use lifecycle::{
    ConfirmedFill, DeadlineOutcome, LifecycleConfig, LifecycleOutcome, OrderLifecycleManager,
};
pub use risk::{RiskState, RiskStateMachine, RiskTransition, TransitionReason};
pub use rsi::RsiTracker;
pub use runtime::TradingEngine;
pub use signals::SignalEngine;
pub use sizer::{AccountState, PositionSizer};
pub use worker::{SymbolWorker, WorkerEvent};
